//! Socket streaming: a TCP server that pushes records to consumers, and the
//! matching client.
//!
//! # Usage
//!
//! ## Stream server
//!
//! Push records to whoever connects:
//!
//! ```bash
//! # Start the server on port 9009, then receive with netcat:
//! nc localhost 9009
//! {"id":0,"message":"message-0"}
//! {"id":1,"message":"message-1"}
//! ```
//!
//! ## Consumer
//!
//! Connect to a server and read framed records until it closes the stream.
//!
//! # Wire format
//!
//! Newline framing writes one record per line with no handshake, which is
//! what line-oriented readers (netcat, Spark's `socketTextStream`) expect.
//! Payloads that may contain newlines need `Framing::LengthPrefixed`.

mod config;
mod connection;
mod consumer;
mod server;
mod session;
mod stats;

pub use config::{ConsumerMode, SocketConfig};
pub use connection::{Connection, ConnectionState, EndReason, StreamSummary};
pub use consumer::SocketConsumer;
pub use server::{ListenHandle, ServeReport, StreamServer};
pub use session::StreamSession;
pub use stats::{ServerStats, StatsSnapshot};
