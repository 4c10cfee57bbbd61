//! Transport errors

use http::StatusCode;
use thiserror::Error;

/// Errors raised while building the transport or dialing an upgraded stream
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Failed to connect to {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to {0}")]
    Timeout(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] http::Error),

    #[error("Upgrade rejected ({status}): {message}")]
    UpgradeRejected { status: StatusCode, message: String },

    #[error("Upgrade handshake failed: {0}")]
    HandshakeError(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Transport result type
pub type TransportResult<T> = Result<T, TransportError>;
