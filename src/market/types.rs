//! Wire types for the flexibility marketplace API.
//!
//! One request/response pair per protocol step, plus the status query used to
//! resolve an ambiguous confirm. Every request carries the transaction id so
//! the marketplace can deduplicate repeated calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::revenue::ServiceType;

/// Query for available flexibility windows matching our deferred capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub capacity_mw: f64,
    pub service_type: ServiceType,
    /// Only windows at or below this carbon intensity, if set.
    pub max_carbon_intensity: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub transaction_id: String,
    pub offers: Vec<FlexibilityOffer>,
}

/// One bookable window returned by discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlexibilityOffer {
    pub offer_id: String,
    pub provider_id: String,
    pub service_type: ServiceType,
    pub rate_per_mw_hour: f64,
    pub carbon_intensity: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectRequest {
    pub transaction_id: String,
    pub offer_id: String,
    pub provider_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectResponse {
    pub transaction_id: String,
    pub offer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    pub transaction_id: String,
    pub offer_id: String,
    pub provider_id: String,
    pub capacity_mw: f64,
    pub window_start: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitResponse {
    pub transaction_id: String,
    pub order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub transaction_id: String,
    pub order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmResponse {
    pub transaction_id: String,
    pub order_id: String,
    /// External booking reference issued by the marketplace.
    pub confirmation_ref: String,
}

/// Remote view of a transaction, as reported by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Discovered,
    Selected,
    Initialized,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionStatusResponse {
    pub transaction_id: String,
    pub status: RemoteStatus,
    pub confirmation_ref: Option<String>,
}
