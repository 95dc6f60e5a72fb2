//! One streaming pass over one connection.
//!
//! The session is split in two halves joined by a bounded queue:
//!
//! ```text
//! source ──pull──> encode ──try_send──> [queue_depth] ──recv──> writer task ──> socket
//!                    │                       │                       │
//!              skip + count            overflow policy          stall timeout
//! ```
//!
//! The writer task is the only owner of the socket, so frames reach the
//! consumer in pull order and are never interleaved.

use super::config::SocketConfig;
use super::connection::{Connection, ConnectionState, EndReason, StreamSummary};
use linefeed_core::{
    flow::SessionCounters, Error, FlowController, Frame, FrameEncoder, OverflowAction,
    RecordSource,
};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How the producer half stopped.
#[derive(Debug)]
enum ProducerEnd {
    Exhausted,
    WriterStopped,
    Stalled,
    Cancelled,
    SourceFailed(String),
}

/// How the writer half stopped.
#[derive(Debug)]
enum WriterEnd {
    Drained,
    Failed(io::Error),
    Stalled,
    Cancelled,
}

#[derive(Debug)]
struct WriterOutcome {
    sent: u64,
    bytes: u64,
    end: WriterEnd,
}

/// Pairs a connection with a source cursor for the duration of one pass.
pub struct StreamSession<'a> {
    connection: &'a mut Connection,
    encoder: FrameEncoder,
    flow: FlowController,
    log_records: bool,
    cancel: CancellationToken,
}

impl<'a> StreamSession<'a> {
    /// `cancel` stops the session (and any in-flight write) when triggered.
    pub fn new(
        connection: &'a mut Connection,
        config: &SocketConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connection,
            encoder: FrameEncoder::new(config.framing, config.max_frame_len),
            flow: FlowController::new(config.flow.clone()),
            log_records: config.log_records,
            cancel,
        }
    }

    /// Drain `source` into the connection.
    ///
    /// Returns when the source is exhausted, the consumer is gone or the
    /// session is cancelled. The connection is `Closed` afterwards.
    pub async fn run(mut self, source: &mut dyn RecordSource) -> StreamSummary {
        let started = Instant::now();
        let peer = self.connection.peer();

        let Some(stream) = self.connection.take_stream() else {
            return StreamSummary::empty(EndReason::ConnectionClosed {
                error: "connection is not open".to_string(),
            });
        };

        info!(peer = %peer, connection = self.connection.id(), "Streaming to consumer");

        // Lets the producer stop the writer without touching the server token.
        let writer_cancel = self.cancel.child_token();
        let (tx, rx) = mpsc::channel::<Frame>(self.flow.config().queue_depth);
        let writer = tokio::spawn(write_frames(
            stream,
            rx,
            self.flow.config().stall_timeout(),
            writer_cancel.clone(),
            peer,
        ));

        let producer_end = self.produce(source, &tx).await;

        match producer_end {
            ProducerEnd::Exhausted | ProducerEnd::SourceFailed(_) => {
                self.connection.set_state(ConnectionState::Closing);
            }
            ProducerEnd::Stalled => writer_cancel.cancel(),
            ProducerEnd::WriterStopped | ProducerEnd::Cancelled => {}
        }
        // Closing the queue lets the writer flush and shut the socket down.
        drop(tx);

        let outcome = match writer.await {
            Ok(outcome) => outcome,
            Err(e) => WriterOutcome {
                sent: 0,
                bytes: 0,
                end: WriterEnd::Failed(io::Error::new(io::ErrorKind::Other, e.to_string())),
            },
        };
        self.connection.set_state(ConnectionState::Closed);

        let end = resolve_end(producer_end, outcome.end);
        let SessionCounters { pulled, dropped } = self.flow.counters();
        let summary = StreamSummary {
            records_pulled: pulled,
            records_sent: outcome.sent,
            records_dropped: dropped,
            records_lost: pulled.saturating_sub(outcome.sent + dropped),
            bytes_sent: outcome.bytes,
            end,
            elapsed: started.elapsed(),
        };

        match summary.end {
            EndReason::SourceExhausted => info!(peer = %peer, "Session finished: {}", summary),
            _ => warn!(peer = %peer, "Session ended early: {}", summary),
        }
        summary
    }

    async fn produce(&mut self, source: &mut dyn RecordSource, tx: &mpsc::Sender<Frame>) -> ProducerEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ProducerEnd::Cancelled,
                _ = tx.closed() => return ProducerEnd::WriterStopped,
                next = source.next_record() => next,
            };

            let record = match next {
                Ok(Some(record)) => record,
                Ok(None) => return ProducerEnd::Exhausted,
                Err(e) => {
                    warn!(error = %e, "Record source failed");
                    return ProducerEnd::SourceFailed(e.to_string());
                }
            };
            self.flow.on_pulled();

            let frame = match self.encoder.encode(&record) {
                Ok(frame) => frame,
                Err(e) => {
                    self.flow.on_encoding_error(&e);
                    continue;
                }
            };

            // Only records that go out are paced.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ProducerEnd::Cancelled,
                _ = tx.closed() => return ProducerEnd::WriterStopped,
                _ = self.flow.pace() => {}
            }
            if self.log_records {
                debug!(
                    record = self.flow.counters().pulled,
                    len = frame.len(),
                    payload = ?record,
                    "Queueing record"
                );
            }

            let frame = match tx.try_send(frame) {
                Ok(()) => continue,
                Err(TrySendError::Closed(_)) => return ProducerEnd::WriterStopped,
                Err(TrySendError::Full(frame)) => frame,
            };

            let send_timeout = self.flow.config().send_timeout();
            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ProducerEnd::Cancelled,
                sent = tokio::time::timeout(send_timeout, tx.send(frame)) => sent,
            };
            match sent {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return ProducerEnd::WriterStopped,
                Err(_) => match self.flow.on_queue_full() {
                    OverflowAction::DropRecord => {}
                    OverflowAction::Stall => return ProducerEnd::Stalled,
                },
            }
        }
    }
}

/// Writer half: the single owner of the socket.
async fn write_frames(
    mut stream: TcpStream,
    mut rx: mpsc::Receiver<Frame>,
    stall_timeout: Duration,
    cancel: CancellationToken,
    peer: SocketAddr,
) -> WriterOutcome {
    let mut outcome = WriterOutcome {
        sent: 0,
        bytes: 0,
        end: WriterEnd::Drained,
    };

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                outcome.end = WriterEnd::Cancelled;
                return outcome;
            }
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else { break };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                outcome.end = WriterEnd::Cancelled;
                return outcome;
            }
            written = tokio::time::timeout(stall_timeout, stream.write_all(frame.as_bytes())) => written,
        };
        match written {
            Ok(Ok(())) => {
                outcome.sent += 1;
                outcome.bytes += frame.len() as u64;
            }
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "Write error");
                outcome.end = WriterEnd::Failed(e);
                return outcome;
            }
            Err(_) => {
                debug!(peer = %peer, timeout_ms = stall_timeout.as_millis() as u64, "Write stalled");
                outcome.end = WriterEnd::Stalled;
                return outcome;
            }
        }
    }

    // Every frame is already in the socket buffer; a failing shutdown means
    // the peer went away while we said goodbye.
    match tokio::time::timeout(stall_timeout, stream.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(peer = %peer, error = %e, "Shutdown error"),
        Err(_) => debug!(peer = %peer, "Shutdown stalled"),
    }
    outcome
}

fn resolve_end(producer: ProducerEnd, writer: WriterEnd) -> EndReason {
    match (producer, writer) {
        (ProducerEnd::Cancelled, _) => EndReason::Cancelled,
        (ProducerEnd::Stalled, _) => EndReason::Stalled,
        (_, WriterEnd::Failed(e)) => EndReason::ConnectionClosed {
            error: Error::from_write(e).to_string(),
        },
        (_, WriterEnd::Stalled) => EndReason::Stalled,
        (_, WriterEnd::Cancelled) => EndReason::Cancelled,
        (ProducerEnd::SourceFailed(error), WriterEnd::Drained) => EndReason::SourceFailed { error },
        (ProducerEnd::Exhausted, WriterEnd::Drained) => EndReason::SourceExhausted,
        (ProducerEnd::WriterStopped, WriterEnd::Drained) => EndReason::ConnectionClosed {
            error: Error::ConnectionClosed.to_string(),
        },
    }
}
