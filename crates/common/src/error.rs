use thiserror::Error;

use crate::PositionStatus;

#[derive(Debug, Error)]
pub enum Error {
    /// Not enough history, or the provider returned nothing usable.
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Instrument not found: {0}")]
    NotFound(String),

    #[error("Exchange API error: {0}")]
    Exchange(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Invalid levels: {0}")]
    InvalidLevels(String),

    #[error("Invalid position transition {from} -> {to}")]
    InvalidTransition {
        from: PositionStatus,
        to: PositionStatus,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Transient failures worth retrying next cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DataUnavailable(_)
                | Error::Timeout(_)
                | Error::Http(_)
                | Error::Exchange(_)
                | Error::WebSocket(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
