use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API Error: {reason}")]
    Request {
        status: reqwest::StatusCode,
        reason: String,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Push channel is not connected")]
    NotConnected,
}

impl Error {
    /// Builds the generic request failure for a non-success status.
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        Error::Request {
            status,
            reason: status
                .canonical_reason()
                .unwrap_or("Unknown Status")
                .to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
