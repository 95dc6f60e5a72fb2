//! Connectors that move linefeed records over the network.
//!
//! ## Available Connectors
//!
//! - **Socket** (enabled by default): TCP stream server and consumer
//!
//! ## Feature Flags
//!
//! - `socket`: Enable the socket connector (default)
//!
//! ## Example
//!
//! ```ignore
//! use linefeed_connectors::socket::{SocketConfig, StreamServer};
//! use linefeed_core::source::SharedRecords;
//! use std::sync::Arc;
//!
//! let server = StreamServer::listen(SocketConfig::server(9009)).await?;
//! let report = server.serve(Arc::new(SharedRecords::new(records))).await?;
//! ```

#[cfg(feature = "socket")]
pub mod socket;
