//! Configuration for the queue and transport
//!
//! Both components take an immutable config at construction. TOML forms are
//! provided so the host application can keep transport settings in its own
//! config file:
//!
//! ```toml
//! [transport]
//! url = "wss://collab.example.com/live"
//! reconnection_attempts = 5
//! reconnection_delay_ms = 1000
//!
//! [queue]
//! max_batch_size = 10
//! batch_interval_ms = 16
//! max_queue_size = 1000
//! ```

use crate::TransportError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Batching behavior for the priority message queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum messages handed to the processor per flush
    pub max_batch_size: usize,

    /// Time window between flushes
    pub batch_interval: Duration,

    /// Drop threshold for buffered non-critical messages (None = unbounded)
    pub max_queue_size: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            batch_interval: Duration::from_millis(16),
            max_queue_size: Some(1000),
        }
    }
}

impl QueueConfig {
    /// Tuned for high-frequency low-value events such as cursor movement:
    /// larger batches, aggressive shedding.
    pub fn cursor_stream() -> Self {
        Self {
            max_batch_size: 25,
            batch_interval: Duration::from_millis(16),
            max_queue_size: Some(500),
        }
    }

    /// Tuned for sparse interactive events such as comments and annotations.
    pub fn low_latency() -> Self {
        Self {
            max_batch_size: 5,
            batch_interval: Duration::from_millis(8),
            max_queue_size: Some(200),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.max_batch_size == 0 {
            return Err(TransportError::invalid_config(
                "max_batch_size must be greater than 0",
            ));
        }
        if self.batch_interval.is_zero() {
            return Err(TransportError::invalid_config(
                "batch_interval must be greater than 0",
            ));
        }
        if self.max_queue_size == Some(0) {
            return Err(TransportError::invalid_config(
                "max_queue_size must be greater than 0 when set",
            ));
        }
        Ok(())
    }
}

/// Connection behavior for the resilient socket transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// WebSocket endpoint (`ws://` or `wss://`)
    pub url: String,

    /// Reconnection attempts before giving up
    pub reconnection_attempts: u32,

    /// Base delay before the first retry; attempt `n` waits `delay × n`
    pub reconnection_delay: Duration,

    /// Interval between latency probes
    pub ping_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnection_attempts: 5,
            reconnection_delay: Duration::from_millis(1000),
            ping_interval: Duration::from_secs(25),
        }
    }
}

impl TransportConfig {
    /// Create a config for the given endpoint with defaults for the rest.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), TransportError> {
        let parsed = Url::parse(&self.url)
            .map_err(|e| TransportError::invalid_config(format!("invalid url: {}", e)))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(TransportError::invalid_config(format!(
                "unsupported url scheme '{}', expected ws:// or wss://",
                parsed.scheme()
            )));
        }
        if self.reconnection_delay.is_zero() {
            return Err(TransportError::invalid_config(
                "reconnection_delay must be greater than 0",
            ));
        }
        if self.ping_interval.is_zero() {
            return Err(TransportError::invalid_config(
                "ping_interval must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Queue configuration in TOML form.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct QueueConfigToml {
    pub max_batch_size: Option<usize>,
    pub batch_interval_ms: Option<u64>,
    pub max_queue_size: Option<usize>,
}

impl QueueConfigToml {
    /// Convert to a [`QueueConfig`], filling gaps from the defaults.
    pub fn to_queue_config(&self) -> QueueConfig {
        let defaults = QueueConfig::default();
        QueueConfig {
            max_batch_size: self.max_batch_size.unwrap_or(defaults.max_batch_size),
            batch_interval: self
                .batch_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_interval),
            max_queue_size: self.max_queue_size.or(defaults.max_queue_size),
        }
    }
}

/// Transport configuration in TOML form.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TransportConfigToml {
    pub url: String,
    pub reconnection_attempts: Option<u32>,
    pub reconnection_delay_ms: Option<u64>,
    pub ping_interval_ms: Option<u64>,
}

impl TransportConfigToml {
    /// Convert to a [`TransportConfig`], filling gaps from the defaults.
    pub fn to_transport_config(&self) -> TransportConfig {
        let defaults = TransportConfig::default();
        TransportConfig {
            url: self.url.clone(),
            reconnection_attempts: self
                .reconnection_attempts
                .unwrap_or(defaults.reconnection_attempts),
            reconnection_delay: self
                .reconnection_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnection_delay),
            ping_interval: self
                .ping_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.ping_interval),
        }
    }
}

/// Top-level settings section for the transport layer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TransportSettings {
    pub transport: TransportConfigToml,
    pub queue: Option<QueueConfigToml>,
}

impl TransportSettings {
    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, TransportError> {
        toml::from_str(toml_str)
            .map_err(|e| TransportError::invalid_config(format!("failed to parse TOML: {}", e)))
    }

    /// Load from a file path.
    pub fn from_file(path: &std::path::Path) -> Result<Self, TransportError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TransportError::invalid_config(format!("failed to read config file: {}", e))
        })?;
        Self::from_toml(&content)
    }

    /// Resolved transport config.
    pub fn transport_config(&self) -> TransportConfig {
        self.transport.to_transport_config()
    }

    /// Resolved queue config, using defaults when the section is absent.
    pub fn queue_config(&self) -> QueueConfig {
        self.queue
            .as_ref()
            .map(|q| q.to_queue_config())
            .unwrap_or_default()
    }

    /// Validate both resolved configurations.
    pub fn validate(&self) -> Result<(), TransportError> {
        self.transport_config().validate()?;
        self.queue_config().validate()
    }
}
