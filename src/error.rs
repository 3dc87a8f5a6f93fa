//! Error types for the connectivity layer

use thiserror::Error;

/// Connectivity layer errors
#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("No connection slot can accept {symbol}")]
    CapacityExceeded { symbol: String },

    #[error("Subscription already registered: {0}")]
    DuplicateSubscription(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Transient connection failure: {0}")]
    TransientConnectionFailure(String),

    #[error("Protocol error: {0}")]
    FatalProtocolError(String),

    #[error("Unsupported order type: {0}")]
    UnsupportedOrderType(String),

    #[error("RunLocked called while dispatching an inbound message")]
    ReentrantRunLocked,

    #[error("Order gateway has not been initialized")]
    GatewayNotReady,

    #[error("Component has been disposed")]
    Disposed,

    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("REST API error: {0}")]
    RestApiError(String),

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Max reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,
}

impl MarketDataError {
    /// Errors the subscription manager recovers from by reconnecting
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MarketDataError::TransientConnectionFailure(_)
                | MarketDataError::WebSocketConnection(_)
                | MarketDataError::WebSocketMessage(_)
                | MarketDataError::ConnectionTimeout
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MarketDataError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MarketDataError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for MarketDataError {
    fn from(err: serde_json::Error) -> Self {
        MarketDataError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for MarketDataError {
    fn from(err: reqwest::Error) -> Self {
        MarketDataError::RestApiError(err.to_string())
    }
}

impl From<std::io::Error> for MarketDataError {
    fn from(err: std::io::Error) -> Self {
        MarketDataError::IpcError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MarketDataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MarketDataError::ConnectionTimeout.is_transient());
        assert!(MarketDataError::TransientConnectionFailure("drop".into()).is_transient());
        assert!(!MarketDataError::CapacityExceeded {
            symbol: "BTCUSDT".into()
        }
        .is_transient());
        assert!(!MarketDataError::NotSupported("lookup".into()).is_transient());
    }
}
