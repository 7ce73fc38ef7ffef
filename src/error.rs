use thiserror::Error;

use crate::grid::GridError;
use crate::market::MarketError;

#[derive(Debug, Error)]
pub enum GridFlexError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Grid error: {0}")]
    Grid(#[from] GridError),

    #[error("Market error: {0}")]
    Market(#[from] MarketError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Classifies an upstream failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorClass {
    /// Retryable within the configured budget (timeouts, 5xx, network).
    Transient,
    /// Not retryable (rejected terms, bad request, authorization).
    Permanent,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "Transient"),
            ErrorClass::Permanent => write!(f, "Permanent"),
        }
    }
}
