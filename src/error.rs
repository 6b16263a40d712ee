//! Error types for the live bridge

use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the live bridge
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio stream error (output device, stream build/play)
    #[error("audio error: {0}")]
    Audio(String),

    /// Capture device error (permission denied, device unavailable)
    #[error("device error: {0}")]
    Device(String),

    /// Streaming transport error (connect, handshake, send)
    #[error("transport error: {0}")]
    Transport(String),

    /// Inbound payload could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Classified inference service error
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Operation not valid in the current session state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket protocol error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Whether this error originates from the capture device
    #[must_use]
    pub const fn is_device(&self) -> bool {
        matches!(self, Self::Device(_) | Self::Service(ServiceError::Device(_)))
    }
}

/// Message fragments that mark an untyped service failure as retryable
const TRANSIENT_MARKERS: &[&str] = &["429", "resource_exhausted", "quota", "503", "overloaded"];

/// Inference service failure, classified at the transport boundary
///
/// The retry policy of the call queue keys off the variant, never the message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// Rate limit, quota exhaustion, temporary unavailability, overload
    #[error("transient service error: {0}")]
    Transient(String),

    /// Bad request, auth failure, unsupported operation
    #[error("service error: {0}")]
    Permanent(String),

    /// Microphone or output device failure
    #[error("device failure: {0}")]
    Device(String),
}

impl ServiceError {
    /// Classify an HTTP response status and body
    ///
    /// 429 and 503 are transient, as are bodies reporting quota exhaustion or overload
    /// under another status. Everything else is permanent.
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("{status}: {body}");
        if status == 429 || status == 503 {
            return Self::Transient(message);
        }
        Self::classify(message)
    }

    /// Classify an untyped error message
    ///
    /// Fallback for callables that only surface a message string.
    #[must_use]
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker)) {
            Self::Transient(message)
        } else {
            Self::Permanent(message)
        }
    }

    /// Whether the queue may retry after this failure
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// The underlying message
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) | Self::Device(m) => m,
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::from_status(status.as_u16(), &err.to_string()),
            None if err.is_timeout() || err.is_connect() => Self::Transient(err.to_string()),
            None => Self::classify(err.to_string()),
        }
    }
}
