//! Error types for the flexibility marketplace client.
//!
//! [`MarketError`] covers the failure shapes of the four protocol steps and
//! classifies each into [`ErrorClass`] so the state machine knows whether a
//! step is worth retrying.

use thiserror::Error;

use crate::error::ErrorClass;

/// Errors from talking to the marketplace.
#[derive(Debug, Error)]
pub enum MarketError {
    /// The marketplace returned a non-success status.
    #[error("marketplace returned status {status}: {message}")]
    ApiError { status: u16, message: String },

    /// A step exceeded its per-step timeout. For confirm, this outcome is
    /// ambiguous — the remote may have booked anyway.
    #[error("request timed out")]
    Timeout,

    /// Underlying network failure (DNS, connection refused).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The response body could not be interpreted.
    #[error("failed to parse marketplace response: {0}")]
    ParseError(String),
}

impl MarketError {
    /// Whether a retry could plausibly succeed.
    pub fn class(&self) -> ErrorClass {
        match self {
            MarketError::Timeout | MarketError::Network(_) => ErrorClass::Transient,
            MarketError::ApiError { status, .. } if *status == 429 || *status >= 500 => {
                ErrorClass::Transient
            }
            MarketError::ApiError { .. } | MarketError::ParseError(_) => ErrorClass::Permanent,
        }
    }
}
