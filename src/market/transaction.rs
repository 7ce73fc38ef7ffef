use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::TransactionState;
use super::types::FlexibilityOffer;
use crate::error::GridFlexError;
use crate::queue::Job;
use crate::revenue::ServiceType;

/// Configuration for retry behavior on market protocol steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries before a step fails the transaction.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms * 2u64.pow(attempt.saturating_sub(1))
    }
}

/// One booking attempt against the flexibility marketplace.
///
/// Created when discovery returns an offer, advanced strictly forward by
/// [`TransactionMachine`](super::state::TransactionMachine), and never reused
/// after reaching a terminal state — the next cycle starts a fresh one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTransaction {
    pub id: String,
    pub state: TransactionState,
    pub state_history: Vec<TransactionState>,
    pub capacity_mw: f64,
    /// Sum of the feeding jobs' energy at discovery time. Checked, never
    /// recomputed, at later protocol steps.
    pub capacity_basis_kwh: f64,
    pub job_ids: Vec<String>,
    pub service_type: ServiceType,
    pub rate_per_mw_hour: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub offer_id: String,
    pub provider_id: String,
    pub order_id: Option<String>,
    pub confirmation_ref: Option<String>,
    pub failure: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MarketTransaction {
    /// Open a transaction from a discovered offer and the jobs backing it.
    pub fn from_offer(transaction_id: String, offer: &FlexibilityOffer, jobs: &[Job]) -> Self {
        let basis_kwh: f64 = jobs.iter().map(|job| job.energy_kwh).sum();
        let now = Utc::now();
        Self {
            id: transaction_id,
            state: TransactionState::Discovered,
            state_history: Vec::new(),
            capacity_mw: basis_kwh / 1000.0,
            capacity_basis_kwh: basis_kwh,
            job_ids: jobs.iter().map(|job| job.id.clone()).collect(),
            service_type: offer.service_type,
            rate_per_mw_hour: offer.rate_per_mw_hour,
            window_start: offer.window_start,
            window_end: offer.window_end,
            offer_id: offer.offer_id.clone(),
            provider_id: offer.provider_id.clone(),
            order_id: None,
            confirmation_ref: None,
            failure: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check the capacity basis against the jobs feeding this transaction.
    /// A mismatch means job state changed under an in-flight transaction,
    /// which is a logic bug.
    pub fn verify_capacity_basis(&self, jobs: &[Job]) -> Result<(), GridFlexError> {
        let current: f64 = jobs.iter().map(|job| job.energy_kwh).sum();
        if (current - self.capacity_basis_kwh).abs() > f64::EPSILON * self.capacity_basis_kwh {
            return Err(GridFlexError::Invariant(format!(
                "transaction {} capacity basis {} kWh no longer matches jobs ({current} kWh)",
                self.id, self.capacity_basis_kwh
            )));
        }
        Ok(())
    }
}
