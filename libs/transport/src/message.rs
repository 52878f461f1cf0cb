use crate::TransportError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Process-wide sequence counter for message ids.
static MESSAGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a message id of the form `msg_<epoch-ms>_<seq>`.
///
/// Ids are unique for the lifetime of the process and exist only for
/// external correlation; the queue never deduplicates or acknowledges by id.
pub fn next_message_id() -> String {
    let seq = MESSAGE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("msg_{}_{}", epoch_millis(), seq)
}

/// Delivery urgency tiers. The ordering is total: `Critical > High > Normal > Low`.
///
/// The same order drives both flush ordering inside a batch and the
/// decision to bypass batching entirely (`Critical`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Normal
    }
}

impl MessagePriority {
    pub(crate) const COUNT: usize = 4;

    /// Buffer index for this tier.
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// An application message buffered in the queue.
///
/// Priority is fixed at enqueue time and never changes afterwards.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Correlation id (`msg_<epoch-ms>_<seq>`)
    pub id: String,
    /// Application event name, forwarded verbatim
    pub event: String,
    /// Opaque payload; the queue and transport never interpret it
    pub data: serde_json::Value,
    /// Delivery tier assigned at enqueue
    pub priority: MessagePriority,
    /// Enqueue timestamp in milliseconds since epoch
    pub timestamp_ms: u64,
}

impl QueuedMessage {
    /// Create a new message with a fresh id and timestamp.
    pub fn new(
        event: impl Into<String>,
        data: serde_json::Value,
        priority: MessagePriority,
    ) -> Self {
        Self {
            id: next_message_id(),
            event: event.into(),
            data,
            priority,
            timestamp_ms: epoch_millis(),
        }
    }
}

/// Wire envelope for a single frame: `{"event": <name>, "data": <payload>}`.
///
/// Sent as a WebSocket text frame. Payloads are opaque to this layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Encode to the JSON text representation.
    pub fn to_text(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(TransportError::from)
    }

    /// Decode from the JSON text representation.
    pub fn from_text(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(TransportError::from)
    }
}
