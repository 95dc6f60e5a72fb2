//! linefeed-core: records, framing and flow control for push-streaming
//! records to TCP consumers.
//!
//! # Architecture
//!
//! - `record`: the `Record` unit of data and the encoded `Frame`
//! - `framing`: newline / length-prefixed encoder and accumulating decoder
//! - `flow`: pacing, bounded queueing and overflow policy for one session
//! - `source`: the `RecordSource` cursor boundary and stock sources
//! - `error`: the error taxonomy shared by all crates
//!
//! The socket server that ties these together lives in
//! `linefeed-connectors`.

pub mod error;
pub mod flow;
pub mod framing;
pub mod record;
pub mod source;

pub use error::{DecodeError, EncodingError, Error, Result};
pub use flow::{FlowConfig, FlowController, OverflowAction, OverflowPolicy};
pub use framing::{FrameDecoder, FrameEncoder, Framing, RecordCodec, DEFAULT_MAX_FRAME_LEN};
pub use record::{Frame, Record};
pub use source::{RecordSource, SourceFactory};
