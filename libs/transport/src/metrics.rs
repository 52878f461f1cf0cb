//! Metrics snapshots for the queue and transport
//!
//! All counters are monotonically non-decreasing and reset only when the
//! owning component is reconstructed. Snapshots are plain values; callers
//! may poll them on whatever cadence suits their diagnostics surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Read-only snapshot of queue activity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueMetrics {
    /// Messages handed to the processor
    pub processed: u64,
    /// Batches delivered (critical bypasses count as batches of one)
    pub batches: u64,
    /// `processed / batches`, 0.0 before the first batch
    pub avg_batch_size: f64,
    /// Messages shed by the capacity policy
    pub dropped: u64,
}

/// Read-only snapshot of connection activity.
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    /// Application messages sent over a live connection
    pub messages_sent: u64,
    /// Application messages received and forwarded to subscribers
    pub messages_received: u64,
    /// When the current connection was established, if connected at least once
    pub connected_at: Option<SystemTime>,
    /// Most recent ping/pong round trip in milliseconds; retained across
    /// missed pongs rather than treated as infinite
    pub latency_ms: u64,
    /// The owned queue's own metrics
    pub queue: QueueMetrics,
    /// Messages currently buffered across all priority tiers
    pub queue_depth: usize,
}

/// Internal atomic counters behind [`QueueMetrics`].
#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    processed: AtomicU64,
    batches: AtomicU64,
    dropped: AtomicU64,
}

impl QueueCounters {
    pub fn record_batch(&self, size: usize) {
        self.processed.fetch_add(size as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: usize) {
        self.dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueMetrics {
        let processed = self.processed.load(Ordering::Relaxed);
        let batches = self.batches.load(Ordering::Relaxed);
        QueueMetrics {
            processed,
            batches,
            avg_batch_size: if batches == 0 {
                0.0
            } else {
                processed as f64 / batches as f64
            },
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Internal atomic counters behind [`ConnectionMetrics`].
#[derive(Debug, Default)]
pub(crate) struct ConnectionCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    latency_ms: AtomicU64,
}

impl ConnectionCounters {
    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, latency_ms: u64) {
        self.latency_ms.store(latency_ms, Ordering::Relaxed);
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency_ms.load(Ordering::Relaxed)
    }
}
