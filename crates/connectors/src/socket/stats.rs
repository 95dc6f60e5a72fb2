//! Server-wide counters.

use super::connection::StreamSummary;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the accept loop and every session task.
#[derive(Debug, Default)]
pub struct ServerStats {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    sessions_completed: AtomicU64,
    records_sent: AtomicU64,
    records_dropped: AtomicU64,
    records_lost: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_session(&self, summary: &StreamSummary) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
        self.records_sent
            .fetch_add(summary.records_sent, Ordering::Relaxed);
        self.records_dropped
            .fetch_add(summary.records_dropped, Ordering::Relaxed);
        self.records_lost
            .fetch_add(summary.records_lost, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add(summary.bytes_sent, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            records_sent: self.records_sent.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            records_lost: self.records_lost.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub sessions_completed: u64,
    pub records_sent: u64,
    pub records_dropped: u64,
    pub records_lost: u64,
    pub bytes_sent: u64,
}
