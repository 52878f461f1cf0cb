/// Errors produced inside the transport layer.
///
/// None of these propagate out of the public mutating methods: `enqueue`,
/// `emit`, `emit_priority` and `connect` are fire-and-forget by contract.
/// Failures are absorbed, logged, and observable only through metrics and
/// the `error` event.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Reconnection attempts exhausted after {attempts} tries")]
    ReconnectionExhausted { attempts: u32 },

    #[error("Batch processor failed: {0}")]
    Processor(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transport destroyed")]
    Destroyed,
}

impl TransportError {
    /// Create a connection failed error
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        TransportError::ConnectionFailed(msg.into())
    }

    /// Create a connection lost error
    pub fn connection_lost(msg: impl Into<String>) -> Self {
        TransportError::ConnectionLost(msg.into())
    }

    /// Create a send failed error
    pub fn send_failed(msg: impl Into<String>) -> Self {
        TransportError::SendFailed(msg.into())
    }

    /// Create a processor error
    pub fn processor(msg: impl Into<String>) -> Self {
        TransportError::Processor(msg.into())
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        TransportError::InvalidConfig(msg.into())
    }

    /// Check if this is a connection-related error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed(_) | TransportError::ConnectionLost(_)
        )
    }

    /// Check if retrying may help
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed(_)
                | TransportError::ConnectionLost(_)
                | TransportError::SendFailed(_)
        )
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}
