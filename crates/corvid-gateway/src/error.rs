//! Error types for the gateway layer.

/// Errors raised while opening or running a gateway session.
///
/// Recoverable conditions (reconnect requests, invalidated sessions, missed
/// heartbeat acks) never appear here; the session loop consumes them and
/// surfaces only `disconnect`/`ready` signals.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Websocket-level failure.
    #[error("websocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// A frame could not be encoded or decoded.
    #[error("malformed gateway frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint resolution through the REST dispatcher failed.
    #[error("endpoint resolution failed: {0}")]
    Rest(#[from] corvid_rest::RestError),

    /// The resolved endpoint is not a valid URL.
    #[error("invalid gateway URL: {0}")]
    Url(#[from] url::ParseError),

    /// The server violated the handshake protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
