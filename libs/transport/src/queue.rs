//! Priority-aware, time-boxed message batching
//!
//! The queue decouples message production from delivery cadence: bursty
//! producers (cursor moves, typing indicators) are accumulated into batches
//! delivered at most once per `batch_interval`, while `Critical` messages
//! bypass batching and reach the processor immediately. The queue knows
//! nothing about network state; delivery is whatever the registered
//! processor does with a batch.
//!
//! Invariants:
//! - at most one pending flush timer per queue instance
//! - within a batch, descending priority then FIFO within a tier
//! - a message is never both delivered and counted as dropped

use crate::metrics::QueueCounters;
use crate::{MessagePriority, QueueConfig, QueueMetrics, QueuedMessage, TransportError};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Type alias for boxed async processor futures
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Caller-supplied batch handler. Errors are caught and logged per batch;
/// they never stall subsequent flushes.
pub type BatchProcessor =
    Arc<dyn Fn(Vec<QueuedMessage>) -> BoxFuture<'static, Result<(), TransportError>> + Send + Sync>;

/// Buffered messages plus the (at most one) pending flush timer.
struct QueueState {
    /// One FIFO buffer per priority tier, indexed by `MessagePriority`
    buffers: [VecDeque<QueuedMessage>; MessagePriority::COUNT],
    /// Handle of the pending flush task, if any
    flush_timer: Option<JoinHandle<()>>,
}

struct QueueShared {
    config: QueueConfig,
    state: Mutex<QueueState>,
    processor: Mutex<Option<BatchProcessor>>,
    counters: QueueCounters,
    paused: AtomicBool,
    destroyed: AtomicBool,
}

/// Time-boxed batching queue with strict priority ordering per flush.
pub struct PriorityMessageQueue {
    shared: Arc<QueueShared>,
}

impl std::fmt::Debug for PriorityMessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityMessageQueue")
            .field("config", &self.shared.config)
            .field("len", &self.len())
            .field("paused", &self.shared.paused.load(Ordering::Relaxed))
            .field("destroyed", &self.shared.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}

impl PriorityMessageQueue {
    /// Create a queue with an immutable config. The queue lives until
    /// [`destroy`](Self::destroy).
    pub fn new(config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                config,
                state: Mutex::new(QueueState {
                    buffers: Default::default(),
                    flush_timer: None,
                }),
                processor: Mutex::new(None),
                counters: QueueCounters::default(),
                paused: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Register the batch processor. Exactly one is active at a time;
    /// registering again replaces the previous one.
    ///
    /// Enqueue still buffers without a processor; flushes deliver nothing
    /// until one is registered.
    pub fn set_processor<F, Fut>(&self, processor: F)
    where
        F: Fn(Vec<QueuedMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        let boxed: BatchProcessor = Arc::new(move |batch| Box::pin(processor(batch)));
        *self.shared.processor.lock().unwrap() = Some(boxed);

        if self.shared.destroyed.load(Ordering::SeqCst) || self.shared.paused.load(Ordering::Relaxed)
        {
            return;
        }
        // Messages may already be waiting from before registration; start a
        // fresh window for them rather than waiting for the next enqueue.
        let mut state = self.shared.state.lock().unwrap();
        let pending: usize = state.buffers.iter().map(|b| b.len()).sum();
        if pending > 0 && state.flush_timer.is_none() {
            QueueShared::arm_flush_timer(&self.shared, &mut state);
        }
    }

    /// Append a message and return its id. Never fails.
    ///
    /// `Critical` messages bypass batching: the processor is invoked
    /// immediately with a single-element batch, before any timer fires.
    /// Other tiers buffer and ride the flush timer, arming it if absent.
    pub async fn enqueue(
        &self,
        event: impl Into<String>,
        data: serde_json::Value,
        priority: MessagePriority,
    ) -> String {
        let message = QueuedMessage::new(event, data, priority);
        let id = message.id.clone();

        if self.shared.destroyed.load(Ordering::SeqCst) {
            tracing::debug!(id = %id, "enqueue after destroy, discarding");
            return id;
        }

        if priority == MessagePriority::Critical {
            let processor = self.shared.processor.lock().unwrap().clone();
            if let Some(processor) = processor {
                self.shared.counters.record_batch(1);
                if let Err(e) = processor(vec![message]).await {
                    tracing::warn!(error = %e, "critical batch processor failed");
                }
                return id;
            }
            // No processor yet: buffer at the critical tier so it heads the
            // next flush instead of being lost.
        }

        self.buffer(message);
        id
    }

    fn buffer(&self, message: QueuedMessage) {
        let priority = message.priority;
        let mut state = self.shared.state.lock().unwrap();

        if let Some(max) = self.shared.config.max_queue_size {
            if !Self::make_room(&mut state, priority, max, &self.shared.counters) {
                return;
            }
        }

        state.buffers[priority.index()].push_back(message);

        if !self.shared.paused.load(Ordering::Relaxed) && state.flush_timer.is_none() {
            QueueShared::arm_flush_timer(&self.shared, &mut state);
        }
    }

    /// Shed buffered messages until one slot is free, dropping the oldest
    /// message of the lowest tier at or below `incoming` first. Returns
    /// false when everything buffered outranks the incoming message, in
    /// which case the incoming message itself is the drop victim.
    fn make_room(
        state: &mut QueueState,
        incoming: MessagePriority,
        max: usize,
        counters: &QueueCounters,
    ) -> bool {
        loop {
            let total: usize = state.buffers.iter().map(|b| b.len()).sum();
            if total < max {
                return true;
            }

            let victim = (0..=incoming.index()).find_map(|tier| state.buffers[tier].pop_front());
            match victim {
                Some(victim) => {
                    counters.record_dropped(1);
                    tracing::warn!(
                        id = %victim.id,
                        event = %victim.event,
                        priority = ?victim.priority,
                        "queue at capacity, dropping buffered message"
                    );
                }
                None => {
                    counters.record_dropped(1);
                    tracing::warn!(
                        priority = ?incoming,
                        "queue full of higher-priority messages, dropping incoming message"
                    );
                    return false;
                }
            }
        }
    }

    /// Snapshot of cumulative counters.
    pub fn metrics(&self) -> QueueMetrics {
        self.shared.counters.snapshot()
    }

    /// Messages currently buffered across all tiers.
    pub fn len(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap()
            .buffers
            .iter()
            .map(|b| b.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard all buffered messages and cancel the pending flush timer.
    /// The processor is not invoked; cumulative metrics are untouched.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(timer) = state.flush_timer.take() {
            timer.abort();
        }
        for buffer in &mut state.buffers {
            buffer.clear();
        }
    }

    /// Stop flushing. Enqueue keeps buffering (and shedding for capacity)
    /// while paused, but no flush timer is scheduled or fires.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        let mut state = self.shared.state.lock().unwrap();
        if let Some(timer) = state.flush_timer.take() {
            timer.abort();
        }
    }

    /// Resume flushing; if messages are already pending, a fresh
    /// `batch_interval` countdown starts immediately.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.shared.state.lock().unwrap();
        let pending: usize = state.buffers.iter().map(|b| b.len()).sum();
        if pending > 0 && state.flush_timer.is_none() {
            QueueShared::arm_flush_timer(&self.shared, &mut state);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Relaxed)
    }

    /// Cancel timers, drop buffered state, prevent further processing.
    /// Idempotent; terminal.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(timer) = state.flush_timer.take() {
                timer.abort();
            }
            for buffer in &mut state.buffers {
                buffer.clear();
            }
        }
        *self.shared.processor.lock().unwrap() = None;
        tracing::debug!("queue destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Relaxed)
    }
}

impl Drop for PriorityMessageQueue {
    fn drop(&mut self) {
        // Last owner going away; make sure no timer outlives the queue.
        if let Ok(mut state) = self.shared.state.lock() {
            if let Some(timer) = state.flush_timer.take() {
                timer.abort();
            }
        }
    }
}

impl QueueShared {
    /// Schedule a flush after `batch_interval`. Caller must hold the state
    /// lock and have verified no timer is pending.
    fn arm_flush_timer(shared: &Arc<QueueShared>, state: &mut QueueState) {
        debug_assert!(state.flush_timer.is_none());
        let interval = shared.config.batch_interval;
        let task_shared = Arc::clone(shared);
        state.flush_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            QueueShared::flush(&task_shared).await;
        }));
    }

    /// Take up to `max_batch_size` messages (descending priority, FIFO
    /// within a tier), hand them to the processor, and re-arm if a backlog
    /// remains so it drains in successive windows.
    async fn flush(shared: &Arc<QueueShared>) {
        if shared.destroyed.load(Ordering::SeqCst) || shared.paused.load(Ordering::SeqCst) {
            shared.state.lock().unwrap().flush_timer = None;
            return;
        }

        let processor = shared.processor.lock().unwrap().clone();
        let Some(processor) = processor else {
            // Nothing can deliver yet; keep messages buffered. The next
            // enqueue re-arms the timer.
            shared.state.lock().unwrap().flush_timer = None;
            tracing::debug!("flush fired with no processor registered, deferring");
            return;
        };

        let (batch, remaining) = {
            let mut state = shared.state.lock().unwrap();
            state.flush_timer = None;

            let mut batch = Vec::new();
            for tier in (0..MessagePriority::COUNT).rev() {
                while batch.len() < shared.config.max_batch_size {
                    match state.buffers[tier].pop_front() {
                        Some(message) => batch.push(message),
                        None => break,
                    }
                }
            }
            let remaining: usize = state.buffers.iter().map(|b| b.len()).sum();
            (batch, remaining)
        };

        if batch.is_empty() {
            return;
        }

        shared.counters.record_batch(batch.len());
        tracing::debug!(size = batch.len(), remaining, "flushing batch");

        if let Err(e) = processor(batch).await {
            tracing::warn!(error = %e, "batch processor failed, continuing");
        }

        if remaining > 0 {
            let mut state = shared.state.lock().unwrap();
            if !shared.destroyed.load(Ordering::SeqCst)
                && !shared.paused.load(Ordering::SeqCst)
                && state.flush_timer.is_none()
            {
                QueueShared::arm_flush_timer(shared, &mut state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn test_config() -> QueueConfig {
        QueueConfig {
            max_batch_size: 10,
            batch_interval: Duration::from_millis(16),
            max_queue_size: Some(1000),
        }
    }

    fn install_collector(queue: &PriorityMessageQueue) -> Arc<Mutex<Vec<Vec<QueuedMessage>>>> {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        queue.set_processor(move |batch| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(batch);
                Ok(())
            }
        });
        batches
    }

    /// Advance the paused clock past pending timers and let spawned flush
    /// tasks run to completion.
    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_ordering_by_priority() {
        let queue = PriorityMessageQueue::new(test_config());
        let batches = install_collector(&queue);

        queue
            .enqueue("a", json!(1), MessagePriority::Low)
            .await;
        queue
            .enqueue("b", json!(2), MessagePriority::High)
            .await;
        queue
            .enqueue("c", json!(3), MessagePriority::Normal)
            .await;

        advance(20).await;

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let order: Vec<_> = batches[0].iter().map(|m| m.event.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_within_tier() {
        let queue = PriorityMessageQueue::new(test_config());
        let batches = install_collector(&queue);

        for i in 0..5 {
            queue
                .enqueue(format!("n{}", i), json!(i), MessagePriority::Normal)
                .await;
        }

        advance(20).await;

        let batches = batches.lock().unwrap();
        let order: Vec<_> = batches[0].iter().map(|m| m.event.as_str()).collect();
        assert_eq!(order, vec!["n0", "n1", "n2", "n3", "n4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_drains_in_successive_windows() {
        let queue = PriorityMessageQueue::new(test_config());
        let batches = install_collector(&queue);

        for i in 0..15 {
            queue
                .enqueue(format!("m{}", i), json!(i), MessagePriority::Normal)
                .await;
        }

        advance(20).await;
        {
            let batches = batches.lock().unwrap();
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].len(), 10);
        }

        advance(16).await;
        {
            let batches = batches.lock().unwrap();
            assert_eq!(batches.len(), 2);
            assert_eq!(batches[1].len(), 5);
        }

        let metrics = queue.metrics();
        assert_eq!(metrics.processed, 15);
        assert_eq!(metrics.batches, 2);
        assert_eq!(metrics.avg_batch_size, 7.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_bypasses_batching() {
        let queue = PriorityMessageQueue::new(test_config());
        let batches = install_collector(&queue);

        queue
            .enqueue("normal", json!({}), MessagePriority::Normal)
            .await;
        queue
            .enqueue("urgent", json!({"op": "undo"}), MessagePriority::Critical)
            .await;

        // No time has advanced; only the critical bypass may have run.
        {
            let batches = batches.lock().unwrap();
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].len(), 1);
            assert_eq!(batches[0][0].event, "urgent");
        }

        advance(20).await;
        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1][0].event, "normal");
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_drops_oldest_lowest() {
        let config = QueueConfig {
            max_queue_size: Some(5),
            ..test_config()
        };
        let queue = PriorityMessageQueue::new(config);
        let batches = install_collector(&queue);

        for i in 0..8 {
            queue
                .enqueue(format!("m{}", i), json!(i), MessagePriority::Normal)
                .await;
        }

        assert_eq!(queue.metrics().dropped, 3);
        assert_eq!(queue.len(), 5);

        advance(20).await;

        // The oldest three were shed; the survivors flush in FIFO order.
        let batches = batches.lock().unwrap();
        let order: Vec<_> = batches[0].iter().map(|m| m.event.as_str()).collect();
        assert_eq!(order, vec!["m3", "m4", "m5", "m6", "m7"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_prefers_lower_tier_victims() {
        let config = QueueConfig {
            max_queue_size: Some(3),
            ..test_config()
        };
        let queue = PriorityMessageQueue::new(config);
        let batches = install_collector(&queue);

        queue.enqueue("low1", json!(1), MessagePriority::Low).await;
        queue.enqueue("low2", json!(2), MessagePriority::Low).await;
        queue
            .enqueue("high1", json!(3), MessagePriority::High)
            .await;
        // At capacity: the oldest LOW message is shed to admit this one.
        queue
            .enqueue("high2", json!(4), MessagePriority::High)
            .await;

        assert_eq!(queue.metrics().dropped, 1);

        advance(20).await;
        let batches = batches.lock().unwrap();
        let order: Vec<_> = batches[0].iter().map(|m| m.event.as_str()).collect();
        assert_eq!(order, vec!["high1", "high2", "low2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_dropped_when_outranked() {
        let config = QueueConfig {
            max_queue_size: Some(2),
            ..test_config()
        };
        let queue = PriorityMessageQueue::new(config);
        let batches = install_collector(&queue);

        queue
            .enqueue("high1", json!(1), MessagePriority::High)
            .await;
        queue
            .enqueue("high2", json!(2), MessagePriority::High)
            .await;
        // Everything buffered outranks this one; it is the drop victim.
        queue.enqueue("low", json!(3), MessagePriority::Low).await;

        assert_eq!(queue.metrics().dropped, 1);
        assert_eq!(queue.len(), 2);

        advance(20).await;
        let batches = batches.lock().unwrap();
        let order: Vec<_> = batches[0].iter().map(|m| m.event.as_str()).collect();
        assert_eq!(order, vec!["high1", "high2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_quiesces() {
        let queue = PriorityMessageQueue::new(test_config());
        let batches = install_collector(&queue);

        queue
            .enqueue("m", json!({}), MessagePriority::Normal)
            .await;
        queue.clear();

        advance(50).await;

        assert!(batches.lock().unwrap().is_empty());
        assert_eq!(queue.len(), 0);
        // clear() does not reset cumulative counters
        assert_eq!(queue.metrics().processed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_buffers_resume_flushes() {
        let queue = PriorityMessageQueue::new(test_config());
        let batches = install_collector(&queue);

        queue.pause();
        queue
            .enqueue("held", json!({}), MessagePriority::Normal)
            .await;

        advance(100).await;
        assert!(batches.lock().unwrap().is_empty());
        assert_eq!(queue.len(), 1);

        queue.resume();
        advance(20).await;

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].event, "held");
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_stops_processing() {
        let queue = PriorityMessageQueue::new(test_config());
        let batches = install_collector(&queue);

        for i in 0..5 {
            queue
                .enqueue(format!("m{}", i), json!(i), MessagePriority::Normal)
                .await;
        }
        queue.destroy();
        queue.destroy(); // idempotent

        advance(1000).await;

        assert!(batches.lock().unwrap().is_empty());
        assert!(queue.is_destroyed());

        // enqueue after destroy still returns an id but buffers nothing
        let id = queue
            .enqueue("late", json!({}), MessagePriority::Normal)
            .await;
        assert!(id.starts_with("msg_"));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_without_processor_buffers() {
        let queue = PriorityMessageQueue::new(test_config());

        queue
            .enqueue("early", json!({}), MessagePriority::Normal)
            .await;
        advance(20).await;
        // Flush fired with nothing to deliver to; the message is retained.
        assert_eq!(queue.len(), 1);

        let batches = install_collector(&queue);
        queue
            .enqueue("later", json!({}), MessagePriority::Normal)
            .await;
        advance(20).await;

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let order: Vec<_> = batches[0].iter().map(|m| m.event.as_str()).collect();
        assert_eq!(order, vec!["early", "later"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_processor_drains_existing_backlog() {
        let queue = PriorityMessageQueue::new(test_config());

        queue
            .enqueue("early", json!({}), MessagePriority::Normal)
            .await;
        advance(20).await;
        assert_eq!(queue.len(), 1);

        // Registration alone starts a window; no further enqueue needed.
        let batches = install_collector(&queue);
        advance(20).await;

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].event, "early");
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_without_processor_heads_next_flush() {
        let queue = PriorityMessageQueue::new(test_config());

        queue
            .enqueue("normal", json!({}), MessagePriority::Normal)
            .await;
        queue
            .enqueue("urgent", json!({}), MessagePriority::Critical)
            .await;

        let batches = install_collector(&queue);
        advance(20).await;

        let batches = batches.lock().unwrap();
        let order: Vec<_> = batches[0].iter().map(|m| m.event.as_str()).collect();
        assert_eq!(order, vec!["urgent", "normal"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_processor_error_does_not_stall() {
        let queue = PriorityMessageQueue::new(test_config());
        let calls = Arc::new(Mutex::new(0usize));
        let calls_clone = Arc::clone(&calls);

        queue.set_processor(move |_batch| {
            let calls = Arc::clone(&calls_clone);
            async move {
                let mut calls = calls.lock().unwrap();
                *calls += 1;
                if *calls == 1 {
                    Err(TransportError::processor("simulated failure"))
                } else {
                    Ok(())
                }
            }
        });

        queue
            .enqueue("first", json!({}), MessagePriority::Normal)
            .await;
        advance(20).await;

        queue
            .enqueue("second", json!({}), MessagePriority::Normal)
            .await;
        advance(20).await;

        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(queue.metrics().batches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_timer_for_burst() {
        let queue = PriorityMessageQueue::new(test_config());
        let batches = install_collector(&queue);

        // A burst within one window rides a single timer.
        for i in 0..5 {
            queue
                .enqueue(format!("m{}", i), json!(i), MessagePriority::Normal)
                .await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        advance(16).await;

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 5);
    }
}
