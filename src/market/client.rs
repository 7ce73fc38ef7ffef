use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::error::MarketError;
use super::types::{
    ConfirmRequest, ConfirmResponse, DiscoverRequest, DiscoverResponse, InitRequest, InitResponse,
    SelectRequest, SelectResponse, TransactionStatusResponse,
};

/// HTTP client for the flexibility marketplace.
///
/// One method per protocol step plus the status query. Each call is bounded
/// by the per-step timeout; retry policy lives in the protocol driver, not
/// here.
pub struct MarketClient {
    client: Client,
    base_url: String,
}

impl MarketClient {
    /// Create a client against the given marketplace base URL.
    pub fn new(base_url: String, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(timeout_secs.min(10)))
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("failed to build HTTP client");
        Self { client, base_url }
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, MarketError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MarketError::Timeout
                } else {
                    MarketError::Network(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(MarketError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| MarketError::ParseError(e.to_string()))
    }

    pub async fn discover(&self, req: &DiscoverRequest) -> Result<DiscoverResponse, MarketError> {
        self.post("/discover", req).await
    }

    pub async fn select(&self, req: &SelectRequest) -> Result<SelectResponse, MarketError> {
        self.post("/select", req).await
    }

    pub async fn init(&self, req: &InitRequest) -> Result<InitResponse, MarketError> {
        self.post("/init", req).await
    }

    pub async fn confirm(&self, req: &ConfirmRequest) -> Result<ConfirmResponse, MarketError> {
        self.post("/confirm", req).await
    }

    /// Remote view of a transaction. Used to disambiguate a confirm timeout
    /// before any retry.
    pub async fn transaction_status(
        &self,
        transaction_id: &str,
    ) -> Result<TransactionStatusResponse, MarketError> {
        let response = self
            .client
            .get(format!("{}/transactions/{transaction_id}", self.base_url))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MarketError::Timeout
                } else {
                    MarketError::Network(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(MarketError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<TransactionStatusResponse>()
            .await
            .map_err(|e| MarketError::ParseError(e.to_string()))
    }
}
