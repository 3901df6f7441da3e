//! Error taxonomy for the core.
//!
//! Mirrors the kinds enumerated by the error-handling design: every variant
//! here is a *kind*, not a wrapped library error, except where `#[from]`
//! lifts a dependency's error type directly (database, I/O, wire codec).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("stt provider error: {0}")]
    Stt(String),

    #[error("llm provider error: {0}")]
    Llm(String),

    #[error("tts provider error: {0}")]
    Tts(String),

    #[error("diarization provider error: {0}")]
    Diarization(String),

    #[error("audio conversion failed: {0}")]
    AudioConversion(String),

    #[error("audio too short: {0}")]
    AudioTooShort(String),

    #[error("websocket connection closed: {0}")]
    ConnectionClosed(String),

    #[error("websocket send failed: {0}")]
    SendFailed(String),

    #[error("missing configuration: {0}")]
    ConfigMissing(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl CoreError {
    /// Whether this error should be surfaced to the client as a protocol
    /// `error` frame without terminating the session.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            CoreError::Authentication(_) | CoreError::ConnectionClosed(_)
        )
    }
}
