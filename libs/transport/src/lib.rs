//! Real-time message transport for collaborative clients
//!
//! Two cooperating components:
//!
//! - [`PriorityMessageQueue`] batches outbound messages into flushes on a
//!   fixed time window, ordered by priority, with `Critical` traffic
//!   bypassing batching entirely and a capacity policy that sheds the
//!   oldest low-priority messages under backpressure.
//! - [`ResilientSocketTransport`] owns one WebSocket connection and one
//!   queue, reconnects with a bounded, linearly growing backoff, buffers
//!   messages written while offline and replays them once on connect, and
//!   fans inbound frames out through an event bus.
//!
//! All mutating entry points are fire-and-forget; failures surface through
//! the `error` event, `tracing` logs, and metrics snapshots.
//!
//! ```no_run
//! use realtime_transport::{
//!     MessagePriority, QueueConfig, ResilientSocketTransport, TransportConfig,
//! };
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), realtime_transport::TransportError> {
//! let transport = ResilientSocketTransport::new(
//!     TransportConfig::new("wss://collab.example.com/live"),
//!     QueueConfig::cursor_stream(),
//! )?;
//!
//! transport.on("scene:update", |data| {
//!     println!("scene changed: {data}");
//! });
//!
//! transport.connect();
//! transport.emit("cursor:move", json!({"x": 120, "y": 48})).await;
//! transport
//!     .emit_priority("doc:undo", json!({"rev": 7}), MessagePriority::Critical)
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub use config::{QueueConfig, TransportConfig, TransportSettings};
pub use connector::{Connection, Connector, WsConnection, WsConnector};
pub use error::TransportError;
pub use events::{EventBus, EventHandler, HandlerId};
pub use message::{next_message_id, Frame, MessagePriority, QueuedMessage};
pub use metrics::{ConnectionMetrics, QueueMetrics};
pub use queue::{BatchProcessor, BoxFuture, PriorityMessageQueue};
pub use transport::{
    ConnectionState, ResilientSocketTransport, CONNECT_EVENT, DISCONNECT_EVENT, ERROR_EVENT,
};
