//! Downstream connections and session results.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

/// Lifecycle of a consumer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted and writable.
    Open,
    /// The source is exhausted; queued frames are being flushed.
    Closing,
    /// The socket is gone. Terminal.
    Closed,
}

/// One downstream consumer.
///
/// The socket is owned by the connection until a session takes it, so only
/// one session can ever write to it.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    stream: Option<TcpStream>,
    state: ConnectionState,
}

impl Connection {
    pub(crate) fn new(id: u64, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            stream: Some(stream),
            state: ConnectionState::Open,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Close the socket without streaming anything.
    pub fn close(&mut self) {
        self.stream = None;
        self.state = ConnectionState::Closed;
    }

    pub(crate) fn take_stream(&mut self) -> Option<TcpStream> {
        if self.state != ConnectionState::Open {
            return None;
        }
        self.stream.take()
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Every record was pulled and the queue was flushed.
    SourceExhausted,
    /// The consumer went away (or a write to it failed).
    ConnectionClosed { error: String },
    /// A write or the queue stayed blocked past its timeout.
    Stalled,
    /// The server was shut down.
    Cancelled,
    /// The record source returned an error.
    SourceFailed { error: String },
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::SourceExhausted => write!(f, "source exhausted"),
            EndReason::ConnectionClosed { error } => write!(f, "connection closed: {}", error),
            EndReason::Stalled => write!(f, "consumer stalled"),
            EndReason::Cancelled => write!(f, "cancelled"),
            EndReason::SourceFailed { error } => write!(f, "source failed: {}", error),
        }
    }
}

/// Outcome of one streaming session.
///
/// Every pulled record is accounted for exactly once:
/// `records_pulled == records_sent + records_dropped + records_lost`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    /// Records taken from the source.
    pub records_pulled: u64,
    /// Records whose frame was completely written to the socket.
    pub records_sent: u64,
    /// Records skipped (unencodable, or dropped by the overflow policy).
    pub records_dropped: u64,
    /// Records encoded and queued but never written because the session ended.
    pub records_lost: u64,
    /// Bytes written, framing included.
    pub bytes_sent: u64,
    pub end: EndReason,
    pub elapsed: Duration,
}

impl StreamSummary {
    pub(crate) fn empty(end: EndReason) -> Self {
        Self {
            records_pulled: 0,
            records_sent: 0,
            records_dropped: 0,
            records_lost: 0,
            bytes_sent: 0,
            end,
            elapsed: Duration::ZERO,
        }
    }

    /// Whether the whole source reached the consumer's socket.
    pub fn is_complete(&self) -> bool {
        self.end == EndReason::SourceExhausted && self.records_lost == 0
    }
}

impl fmt::Display for StreamSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent={} dropped={} lost={} bytes={} ({}) in {:.3}s",
            self.records_sent,
            self.records_dropped,
            self.records_lost,
            self.bytes_sent,
            self.end,
            self.elapsed.as_secs_f64()
        )
    }
}
