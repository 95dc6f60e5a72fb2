//! Error types for linefeed.
//!
//! Failures are split by how far they propagate:
//! - Encoding: one record could not be framed (skip it, keep streaming)
//! - Decode: the consumer side saw a malformed or oversized frame
//! - Write / ConnectionClosed: one consumer is gone (end that session only)
//! - Bind: the listening socket could not be created (fatal to startup)
//! - Accept: a transient accept failure (logged, accept loop continues)
//! - Cancelled: shutdown was requested while an operation was suspended

use std::io;
use thiserror::Error;

/// Top-level error type for linefeed operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The bind address is unavailable or could not be resolved.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Accepting a connection failed; the listener itself is still usable.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// A record could not be encoded into a frame.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Incoming bytes could not be decoded into records.
    #[error("decoding error: {0}")]
    Decode(#[from] DecodeError),

    /// Writing a frame to the consumer failed.
    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    /// The consumer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The operation was interrupted by an explicit shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// The record source failed to produce the next record.
    #[error("record source error: {0}")]
    Source(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Other I/O errors (files, stdin).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A single record could not be turned into a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Newline framing cannot carry a payload that contains the delimiter.
    #[error("payload contains a line delimiter at byte {offset}")]
    EmbeddedDelimiter { offset: usize },

    /// Newline framing is a text encoding.
    #[error("payload is not valid UTF-8 (valid up to byte {valid_up_to})")]
    InvalidUtf8 { valid_up_to: usize },

    /// The payload exceeds the configured maximum frame size.
    #[error("frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// A value could not be serialized to JSON.
    #[error("serialization failed: {0}")]
    Serialize(String),
}

impl From<serde_json::Error> for EncodingError {
    fn from(e: serde_json::Error) -> Self {
        EncodingError::Serialize(e.to_string())
    }
}

/// Bytes received from the wire could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A frame grew past the maximum frame size before it was complete.
    #[error("frame of at least {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// The stream ended in the middle of a frame.
    #[error("stream ended with {remaining} bytes of an incomplete frame")]
    Truncated { remaining: usize },

    /// Underlying read failure (only produced when used as a tokio codec).
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Classify a failed socket write: a vanished peer is `ConnectionClosed`,
    /// anything else is `Write`.
    pub fn from_write(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Write(e),
        }
    }

    /// Whether the failing operation can simply be retried or skipped.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Encoding(_) | Error::Accept(_))
    }
}

/// Result type for linefeed operations.
pub type Result<T> = std::result::Result<T, Error>;
