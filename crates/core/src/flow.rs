//! Flow control for one streaming session.
//!
//! A session moves records through a bounded queue into a single writer that
//! owns the socket. The flow controller decides three things:
//! - how long to wait between records (`record_delay_ms`)
//! - what to do when the queue stays full (`overflow`)
//! - how long a single socket write may take before the consumer is
//!   considered stalled (`stall_timeout_ms`)
//!
//! Memory held by a session is bounded by `queue_depth` frames.

use crate::error::{EncodingError, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What to do with a record when the consumer is not keeping up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Hold the record and stop pulling; give up on the consumer if the
    /// queue is still full after the send timeout.
    #[default]
    Backpressure,
    /// Drop the record after the send timeout and keep streaming.
    Drop,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::Backpressure => write!(f, "backpressure"),
            OverflowPolicy::Drop => write!(f, "drop"),
        }
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "backpressure" | "block" => Ok(OverflowPolicy::Backpressure),
            "drop" => Ok(OverflowPolicy::Drop),
            other => Err(format!("unknown overflow policy '{}'", other)),
        }
    }
}

/// Flow control settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Delay between consecutive records in milliseconds (0 = none).
    pub record_delay_ms: u64,
    /// Frames that may wait for the writer.
    ///
    /// `records_sent` counts frames accepted by the kernel, not frames read
    /// by the consumer. When the consumer goes away, at most
    /// `queue_depth + 2` pulled records are lost: the queued frames, the
    /// one being written and the one waiting for room.
    pub queue_depth: usize,
    /// How long to wait for room in a full queue.
    pub send_timeout_ms: u64,
    /// Policy applied when the send timeout expires.
    pub overflow: OverflowPolicy,
    /// Longest a single frame write may take.
    pub stall_timeout_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            record_delay_ms: 0,
            queue_depth: 64,
            send_timeout_ms: 5_000,
            overflow: OverflowPolicy::Backpressure,
            stall_timeout_ms: 30_000,
        }
    }
}

impl FlowConfig {
    /// Set the inter-record delay.
    pub fn with_record_delay(mut self, delay_ms: u64) -> Self {
        self.record_delay_ms = delay_ms;
        self
    }

    /// Set the queue depth.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set the send timeout.
    pub fn with_send_timeout(mut self, timeout_ms: u64) -> Self {
        self.send_timeout_ms = timeout_ms;
        self
    }

    /// Set the overflow policy.
    pub fn with_overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }

    /// Set the stall timeout.
    pub fn with_stall_timeout(mut self, timeout_ms: u64) -> Self {
        self.stall_timeout_ms = timeout_ms;
        self
    }

    pub fn record_delay(&self) -> Option<Duration> {
        (self.record_delay_ms > 0).then(|| Duration::from_millis(self.record_delay_ms))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            return Err(Error::Config("queue_depth must be at least 1".to_string()));
        }
        if self.stall_timeout_ms == 0 {
            return Err(Error::Config("stall_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}

/// Decision taken when the queue stayed full for the whole send timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowAction {
    /// Discard the record and continue with the next one.
    DropRecord,
    /// The consumer is stalled; end the session.
    Stall,
}

/// Per-session record counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    /// Records taken from the source.
    pub pulled: u64,
    /// Records skipped because they could not be encoded or did not fit.
    pub dropped: u64,
}

/// Applies a [`FlowConfig`] to one session.
#[derive(Debug)]
pub struct FlowController {
    config: FlowConfig,
    counters: SessionCounters,
    last_record: Option<Instant>,
}

impl FlowController {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            config,
            counters: SessionCounters::default(),
            last_record: None,
        }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    /// Wait out the inter-record delay, measured from the previous record.
    pub async fn pace(&mut self) {
        if let (Some(delay), Some(last)) = (self.config.record_delay(), self.last_record) {
            tokio::time::sleep_until(last + delay).await;
        }
        self.last_record = Some(Instant::now());
    }

    /// Record taken from the source.
    pub fn on_pulled(&mut self) {
        self.counters.pulled += 1;
    }

    /// The record could not be encoded: it is skipped and counted.
    pub fn on_encoding_error(&mut self, error: &EncodingError) {
        self.counters.dropped += 1;
        warn!(
            record = self.counters.pulled,
            error = %error,
            "Skipping record that cannot be encoded"
        );
    }

    /// The queue stayed full past the send timeout.
    pub fn on_queue_full(&mut self) -> OverflowAction {
        match self.config.overflow {
            OverflowPolicy::Drop => {
                self.counters.dropped += 1;
                debug!(
                    record = self.counters.pulled,
                    dropped = self.counters.dropped,
                    "Consumer lagging, dropping record"
                );
                OverflowAction::DropRecord
            }
            OverflowPolicy::Backpressure => {
                warn!(
                    timeout_ms = self.config.send_timeout_ms,
                    "Consumer stalled, queue still full"
                );
                OverflowAction::Stall
            }
        }
    }
}
