//! Resilient WebSocket transport
//!
//! One transport owns one connection and one [`PriorityMessageQueue`]. All
//! outbound traffic funnels through the queue (critical traffic skips it),
//! inbound frames fan out through the event bus, and connection loss is
//! handled by a bounded reconnection loop with linearly growing delays.
//!
//! Every mutating entry point is fire-and-forget: failures are absorbed,
//! logged, and surfaced through the `error` event and metrics rather than
//! returned to the caller.

use crate::connector::{Connection, Connector, WsConnector};
use crate::events::{EventBus, HandlerId};
use crate::message::{epoch_millis, Frame};
use crate::metrics::ConnectionCounters;
use crate::{
    ConnectionMetrics, MessagePriority, PriorityMessageQueue, QueueConfig, QueuedMessage,
    TransportConfig, TransportError,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::task::JoinHandle;

/// Fired with a null payload once a connection is established, including
/// after a reconnect.
pub const CONNECT_EVENT: &str = "connect";
/// Fired with a null payload when an established connection is lost.
pub const DISCONNECT_EVENT: &str = "disconnect";
/// Fired with `{"message": ...}` when reconnection gives up.
pub const ERROR_EVENT: &str = "error";

// Latency probe frames; internal to the wire protocol and never forwarded
// to subscribers or counted as application traffic.
const PING_EVENT: &str = "ping";
const PONG_EVENT: &str = "pong";

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the backoff before the given attempt (1-based)
    Reconnecting(u32),
    /// Reconnection attempts exhausted; only an explicit `connect` restarts
    Failed,
}

impl ConnectionState {
    /// Whether an explicit `connect` call may start dialing from this state.
    pub fn can_connect(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

struct TransportShared<C: Connector> {
    config: TransportConfig,
    connector: C,
    state: Mutex<ConnectionState>,
    conn: tokio::sync::RwLock<Option<Arc<C::Conn>>>,
    queue: PriorityMessageQueue,
    /// Messages captured while offline, replayed once on (re)connect at
    /// their original priority
    pending: Mutex<Vec<(String, Value, MessagePriority)>>,
    events: EventBus,
    counters: ConnectionCounters,
    connected_at: Mutex<Option<SystemTime>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

/// WebSocket transport with automatic reconnection, offline buffering, and
/// priority-batched sends.
pub struct ResilientSocketTransport<C: Connector = WsConnector> {
    shared: Arc<TransportShared<C>>,
}

impl<C: Connector> std::fmt::Debug for ResilientSocketTransport<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientSocketTransport")
            .field("url", &self.shared.config.url)
            .field("state", &self.state())
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl ResilientSocketTransport<WsConnector> {
    /// Create a transport dialing over tokio-tungstenite.
    pub fn new(config: TransportConfig, queue_config: QueueConfig) -> Result<Self, TransportError> {
        Self::with_connector(config, queue_config, WsConnector)
    }
}

impl<C: Connector> ResilientSocketTransport<C> {
    /// Create a transport over a custom [`Connector`].
    pub fn with_connector(
        config: TransportConfig,
        queue_config: QueueConfig,
        connector: C,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        queue_config.validate()?;

        let shared = Arc::new(TransportShared {
            config,
            connector,
            state: Mutex::new(ConnectionState::Disconnected),
            conn: tokio::sync::RwLock::new(None),
            queue: PriorityMessageQueue::new(queue_config),
            pending: Mutex::new(Vec::new()),
            events: EventBus::new(),
            counters: ConnectionCounters::default(),
            connected_at: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            ping_task: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        // The queue holds a weak reference so destroying the transport is
        // not kept alive by its own processor.
        let weak = Arc::downgrade(&shared);
        shared.queue.set_processor(move |batch| {
            let weak = weak.clone();
            async move {
                if let Some(shared) = weak.upgrade() {
                    TransportShared::deliver_batch(&shared, batch).await;
                }
                Ok(())
            }
        });

        Ok(Self { shared })
    }

    /// Start dialing in the background. No-op while already connecting,
    /// connected, or mid-reconnect; a `Failed` transport may be restarted.
    pub fn connect(&self) {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.shared.state.lock().unwrap();
            if !state.can_connect() {
                tracing::debug!(state = ?*state, "connect ignored");
                return;
            }
            *state = ConnectionState::Connecting;
        }

        // One task owns the whole connection lifecycle: dial, read until
        // the connection drops, reconnect, repeat until Failed or destroyed.
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let mut conn = match shared.connector.connect(&shared.config.url).await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    tracing::warn!(url = %shared.config.url, error = %e, "initial connect failed");
                    None
                }
            };
            loop {
                if let Some(conn) = conn.take() {
                    TransportShared::run_connection(&shared, conn).await;
                    if shared.destroyed.load(Ordering::SeqCst) {
                        return;
                    }
                }
                match TransportShared::reconnect_loop(&shared).await {
                    Some(next) => conn = Some(next),
                    None => return,
                }
            }
        });
        self.shared.tasks.lock().unwrap().push(handle);
    }

    /// Send with `Normal` priority. Fire-and-forget.
    pub async fn emit(&self, event: impl Into<String>, data: Value) {
        self.emit_priority(event, data, MessagePriority::Normal)
            .await;
    }

    /// Send with an explicit priority.
    ///
    /// While disconnected the message is buffered for replay on the next
    /// connect, regardless of priority. While connected, `Critical` goes
    /// straight to the socket and everything else rides the queue.
    pub async fn emit_priority(
        &self,
        event: impl Into<String>,
        data: Value,
        priority: MessagePriority,
    ) {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let event = event.into();

        if !self.is_connected() {
            tracing::debug!(event = %event, "offline, buffering for replay");
            self.shared
                .pending
                .lock()
                .unwrap()
                .push((event, data, priority));
            return;
        }

        if priority == MessagePriority::Critical {
            let conn = self.shared.conn.read().await.clone();
            if let Some(conn) = conn {
                let frame = Frame {
                    event: event.clone(),
                    data: data.clone(),
                };
                match conn.send(&frame).await {
                    Ok(()) => {
                        self.shared.counters.record_sent();
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(event = %event, error = %e, "critical send failed, retaining for replay");
                    }
                }
            }
            self.shared
                .pending
                .lock()
                .unwrap()
                .push((event, data, MessagePriority::Critical));
            return;
        }

        self.shared.queue.enqueue(event, data, priority).await;
    }

    /// Subscribe to an inbound event or a lifecycle event
    /// ([`CONNECT_EVENT`], [`DISCONNECT_EVENT`], [`ERROR_EVENT`]).
    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(event, handler)
    }

    /// Remove a subscription. Idempotent.
    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        self.shared.events.unsubscribe(event, id)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The owned queue, for pause/resume/clear of batched traffic.
    pub fn queue(&self) -> &PriorityMessageQueue {
        &self.shared.queue
    }

    /// Messages buffered while offline, awaiting replay.
    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// Combined snapshot of connection and queue activity.
    pub fn metrics(&self) -> ConnectionMetrics {
        ConnectionMetrics {
            messages_sent: self.shared.counters.messages_sent(),
            messages_received: self.shared.counters.messages_received(),
            connected_at: *self.shared.connected_at.lock().unwrap(),
            latency_ms: self.shared.counters.latency_ms(),
            queue: self.shared.queue.metrics(),
            queue_depth: self.shared.queue.len(),
        }
    }

    /// Tear everything down: background tasks, the queue, the connection,
    /// subscriptions, and buffered messages. Idempotent; terminal.
    pub async fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(url = %self.shared.config.url, "destroying transport");

        if let Some(task) = self.shared.ping_task.lock().unwrap().take() {
            task.abort();
        }
        for task in self.shared.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        self.shared.queue.destroy();

        let conn = self.shared.conn.write().await.take();
        if let Some(conn) = conn {
            conn.close().await;
        }

        *self.shared.state.lock().unwrap() = ConnectionState::Disconnected;
        self.shared.pending.lock().unwrap().clear();
        self.shared.events.clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Relaxed)
    }
}

impl<C: Connector> TransportShared<C> {
    /// Send a flushed batch over the live connection. Messages that cannot
    /// be delivered are retained for replay rather than lost.
    async fn deliver_batch(shared: &Arc<Self>, batch: Vec<QueuedMessage>) {
        let conn = shared.conn.read().await.clone();
        let Some(conn) = conn else {
            let mut pending = shared.pending.lock().unwrap();
            pending.extend(batch.into_iter().map(|m| (m.event, m.data, m.priority)));
            return;
        };

        for message in batch {
            let frame = Frame {
                event: message.event.clone(),
                data: message.data.clone(),
            };
            match conn.send(&frame).await {
                Ok(()) => shared.counters.record_sent(),
                Err(e) => {
                    tracing::warn!(event = %message.event, error = %e, "send failed, retaining for replay");
                    shared
                        .pending
                        .lock()
                        .unwrap()
                        .push((message.event, message.data, message.priority));
                }
            }
        }
    }

    /// Adopt a freshly established connection, replay buffered messages,
    /// then read frames until the connection drops; on drop, reconnect.
    async fn run_connection(shared: &Arc<Self>, conn: C::Conn) {
        if shared.destroyed.load(Ordering::SeqCst) {
            conn.close().await;
            return;
        }
        let conn = Arc::new(conn);
        *shared.conn.write().await = Some(Arc::clone(&conn));
        *shared.state.lock().unwrap() = ConnectionState::Connected;
        *shared.connected_at.lock().unwrap() = Some(SystemTime::now());
        tracing::info!(url = %shared.config.url, "connected");
        shared.events.emit(CONNECT_EVENT, &Value::Null);

        // Replay exactly once: the list is taken before re-enqueueing so a
        // drop mid-replay re-captures rather than duplicates.
        let buffered: Vec<_> = std::mem::take(&mut *shared.pending.lock().unwrap());
        if !buffered.is_empty() {
            tracing::info!(count = buffered.len(), "replaying messages buffered while offline");
            for (event, data, priority) in buffered {
                shared.queue.enqueue(event, data, priority).await;
            }
        }

        Self::ensure_ping_task(shared);

        loop {
            match conn.recv().await {
                Some(Ok(frame)) => Self::handle_frame(shared, &conn, frame).await,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "read error");
                    shared
                        .events
                        .emit(ERROR_EVENT, &json!({ "message": e.to_string() }));
                    break;
                }
                None => {
                    tracing::info!("connection closed by peer");
                    break;
                }
            }
        }

        if shared.destroyed.load(Ordering::SeqCst) {
            return;
        }
        *shared.conn.write().await = None;
        // Move straight to Reconnecting before subscribers hear about the
        // loss: a `disconnect` handler calling `connect()` must see a state
        // that refuses it, or a second lifecycle task would race this one.
        *shared.state.lock().unwrap() = ConnectionState::Reconnecting(1);
        shared.events.emit(DISCONNECT_EVENT, &Value::Null);
    }

    async fn handle_frame(shared: &Arc<Self>, conn: &Arc<C::Conn>, frame: Frame) {
        match frame.event.as_str() {
            PONG_EVENT => {
                if let Some(ts) = frame.data.get("ts").and_then(Value::as_u64) {
                    shared
                        .counters
                        .record_latency(epoch_millis().saturating_sub(ts));
                }
            }
            PING_EVENT => {
                // Server-initiated probe; echo the timestamp back.
                let pong = Frame {
                    event: PONG_EVENT.to_string(),
                    data: frame.data,
                };
                if let Err(e) = conn.send(&pong).await {
                    tracing::debug!(error = %e, "pong reply failed");
                }
            }
            _ => {
                shared.counters.record_received();
                shared.events.emit(&frame.event, &frame.data);
            }
        }
    }

    /// Bounded retry with a linearly growing delay: attempt `n` waits
    /// `reconnection_delay × n`. Returns the fresh connection, or `None`
    /// once attempts are exhausted (parking in `Failed` and firing the
    /// `error` event) or the transport is destroyed.
    async fn reconnect_loop(shared: &Arc<Self>) -> Option<C::Conn> {
        let attempts = shared.config.reconnection_attempts;
        for attempt in 1..=attempts {
            if shared.destroyed.load(Ordering::SeqCst) {
                return None;
            }
            *shared.state.lock().unwrap() = ConnectionState::Reconnecting(attempt);
            let delay = shared.config.reconnection_delay * attempt;
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::time::sleep(delay).await;
            if shared.destroyed.load(Ordering::SeqCst) {
                return None;
            }
            match shared.connector.connect(&shared.config.url).await {
                Ok(conn) => return Some(conn),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnection attempt failed");
                }
            }
        }

        *shared.state.lock().unwrap() = ConnectionState::Failed;
        let err = TransportError::ReconnectionExhausted { attempts };
        tracing::error!(attempts, "giving up on reconnection");
        shared
            .events
            .emit(ERROR_EVENT, &json!({ "message": err.to_string() }));
        None
    }

    /// Spawn the latency probe loop if it is not already running. One per
    /// transport; survives reconnects and skips ticks while disconnected.
    fn ensure_ping_task(shared: &Arc<Self>) {
        let mut slot = shared.ping_task.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(shared);
        let interval = shared.config.ping_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { return };
                if shared.destroyed.load(Ordering::SeqCst) {
                    return;
                }
                let conn = shared.conn.read().await.clone();
                if let Some(conn) = conn {
                    let frame = Frame {
                        event: PING_EVENT.to_string(),
                        data: json!({ "ts": epoch_millis() }),
                    };
                    if let Err(e) = conn.send(&frame).await {
                        tracing::debug!(error = %e, "ping send failed");
                    }
                }
            }
        }));
    }
}
