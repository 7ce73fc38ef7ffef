//! End-to-end protocol driver.
//!
//! [`MarketProtocol::run`] takes a revenue estimate and the deferred jobs
//! backing it through discover → select → init → confirm as one logical
//! operation: the caller gets back either a Confirmed transaction with an
//! external reference, a NoOffer, or a terminal Failed/Abandoned transaction
//! with its reason — partial progress is never dropped on the floor.
//!
//! Retries are bounded per step with exponential backoff. Confirm is the one
//! step never retried blindly: an ambiguous timeout triggers a status
//! re-query first, and a remote Confirmed is adopted rather than re-posted,
//! so capacity is never double-booked.

use tokio::sync::watch;
use tokio::time::sleep;

use super::client::MarketClient;
use super::state::{StepOutcome, TransactionMachine, TransactionState, Transition};
use super::transaction::{MarketTransaction, RetryConfig};
use super::types::{
    ConfirmRequest, DiscoverRequest, FlexibilityOffer, InitRequest, RemoteStatus, SelectRequest,
};
use crate::error::{ErrorClass, GridFlexError};
use crate::queue::Job;
use crate::revenue::RevenueEstimate;

/// Terminal result of one protocol run.
#[derive(Debug, Clone)]
pub enum ProtocolOutcome {
    /// Booking confirmed; the transaction carries the external reference.
    Confirmed(MarketTransaction),
    /// Discovery returned no windows. No transaction was created.
    NoOffer,
    /// The run failed. `transaction` is None when discovery itself failed
    /// before any transaction existed.
    Failed {
        transaction: Option<MarketTransaction>,
        reason: String,
    },
    /// Cancelled mid-protocol; needs manual reconciliation upstream.
    Abandoned(MarketTransaction),
}

/// What a single step loop concluded.
pub(crate) enum StepControl {
    Advanced,
    Failed(String),
    Abandoned,
}

pub struct MarketProtocol<'a> {
    client: &'a MarketClient,
    retry: RetryConfig,
    cancel: watch::Receiver<bool>,
}

impl<'a> MarketProtocol<'a> {
    pub fn new(client: &'a MarketClient, retry: RetryConfig, cancel: watch::Receiver<bool>) -> Self {
        Self {
            client,
            retry,
            cancel,
        }
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn backoff(&self, attempt: u32, step: &str, reason: &str) {
        let delay_ms = self.retry.delay_for_attempt(attempt);
        tracing::warn!(
            "{step} retry {attempt}/{max}: {reason} (waiting {delay_ms}ms)",
            max = self.retry.max_retries
        );
        sleep(std::time::Duration::from_millis(delay_ms)).await;
    }

    /// Run the full journey for the given estimate and its backing jobs.
    ///
    /// `Err` is reserved for invariant violations; environmental failures
    /// come back as `Ok(ProtocolOutcome::Failed { .. })`.
    pub async fn run(
        &self,
        estimate: &RevenueEstimate,
        jobs: &[Job],
    ) -> Result<ProtocolOutcome, GridFlexError> {
        if self.cancelled() {
            return Ok(ProtocolOutcome::Failed {
                transaction: None,
                reason: "cancellation requested before discovery".into(),
            });
        }

        let response = match self.discover(estimate).await {
            Ok(response) => response,
            Err(reason) => {
                return Ok(ProtocolOutcome::Failed {
                    transaction: None,
                    reason,
                });
            }
        };

        let Some(offer) = best_offer(&response.offers) else {
            tracing::info!("discover returned no offers for {:.2} MW", estimate.capacity_mw);
            return Ok(ProtocolOutcome::NoOffer);
        };

        tracing::info!(
            "discovered {} offers, selected {} ({:.0} gCO2/kWh, £{:.2}/MW/h)",
            response.offers.len(),
            offer.offer_id,
            offer.carbon_intensity,
            offer.rate_per_mw_hour
        );

        let mut tx = MarketTransaction::from_offer(response.transaction_id, offer, jobs);

        match self.select_step(&mut tx).await {
            StepControl::Advanced => {}
            StepControl::Failed(reason) => {
                return Ok(ProtocolOutcome::Failed {
                    transaction: Some(tx),
                    reason,
                });
            }
            StepControl::Abandoned => return Ok(ProtocolOutcome::Abandoned(tx)),
        }

        // The capacity offered must still be exactly what discovery priced.
        tx.verify_capacity_basis(jobs)?;

        match self.init_step(&mut tx).await {
            StepControl::Advanced => {}
            StepControl::Failed(reason) => {
                return Ok(ProtocolOutcome::Failed {
                    transaction: Some(tx),
                    reason,
                });
            }
            StepControl::Abandoned => return Ok(ProtocolOutcome::Abandoned(tx)),
        }

        match self.confirm_step(&mut tx).await {
            StepControl::Advanced => {}
            StepControl::Failed(reason) => {
                return Ok(ProtocolOutcome::Failed {
                    transaction: Some(tx),
                    reason,
                });
            }
            StepControl::Abandoned => return Ok(ProtocolOutcome::Abandoned(tx)),
        }

        tracing::info!(
            "transaction {} confirmed, ref {}",
            tx.id,
            tx.confirmation_ref.as_deref().unwrap_or("-")
        );
        Ok(ProtocolOutcome::Confirmed(tx))
    }

    /// Discovery happens before any transaction exists, so it carries its own
    /// bounded retry loop instead of going through the state machine.
    async fn discover(
        &self,
        estimate: &RevenueEstimate,
    ) -> Result<super::types::DiscoverResponse, String> {
        let request = DiscoverRequest {
            capacity_mw: estimate.capacity_mw,
            service_type: estimate.service_type,
            max_carbon_intensity: None,
        };

        let mut attempt = 0u32;
        loop {
            match self.client.discover(&request).await {
                Ok(response) => return Ok(response),
                Err(e) => match e.class() {
                    ErrorClass::Permanent => return Err(format!("discover: {e}")),
                    ErrorClass::Transient => {
                        attempt += 1;
                        if attempt > self.retry.max_retries {
                            return Err(format!("discover: retry budget exhausted: {e}"));
                        }
                        self.backoff(attempt, "discover", &e.to_string()).await;
                    }
                },
            }
        }
    }

    /// Select the discovered window. Idempotent: a transaction already at or
    /// past Selected is left as it is and no duplicate request is sent.
    pub(crate) async fn select_step(&self, tx: &mut MarketTransaction) -> StepControl {
        if tx.state != TransactionState::Discovered {
            return StepControl::Advanced;
        }
        let request = SelectRequest {
            transaction_id: tx.id.clone(),
            offer_id: tx.offer_id.clone(),
            provider_id: tx.provider_id.clone(),
        };

        loop {
            if self.cancelled() {
                TransactionMachine::abandon(tx, "cancelled during select");
                return StepControl::Abandoned;
            }
            let outcome = match self.client.select(&request).await {
                Ok(_) => StepOutcome::Success,
                Err(e) => StepOutcome::Failure {
                    class: e.class(),
                    reason: format!("select: {e}"),
                },
            };
            match TransactionMachine::next(tx, &self.retry, outcome) {
                Transition::Next(_) | Transition::Complete(_) => return StepControl::Advanced,
                Transition::Retry { reason } => {
                    self.backoff(tx.retry_count, "select", &reason).await;
                }
                Transition::Fail { reason } => return StepControl::Failed(reason),
            }
        }
    }

    /// Initialize the order. The marketplace validates that the capacity is
    /// still available and the window still in the future; a rejection is
    /// Permanent and fails the transaction with the remote reason.
    async fn init_step(&self, tx: &mut MarketTransaction) -> StepControl {
        if tx.state != TransactionState::Selected {
            return StepControl::Advanced;
        }
        let request = InitRequest {
            transaction_id: tx.id.clone(),
            offer_id: tx.offer_id.clone(),
            provider_id: tx.provider_id.clone(),
            capacity_mw: tx.capacity_mw,
            window_start: tx.window_start,
        };

        loop {
            if self.cancelled() {
                TransactionMachine::abandon(tx, "cancelled during init");
                return StepControl::Abandoned;
            }
            let outcome = match self.client.init(&request).await {
                Ok(response) => {
                    tx.order_id = Some(response.order_id);
                    StepOutcome::Success
                }
                Err(e) => StepOutcome::Failure {
                    class: e.class(),
                    reason: format!("init: {e}"),
                },
            };
            match TransactionMachine::next(tx, &self.retry, outcome) {
                Transition::Next(_) | Transition::Complete(_) => return StepControl::Advanced,
                Transition::Retry { reason } => {
                    self.backoff(tx.retry_count, "init", &reason).await;
                }
                Transition::Fail { reason } => return StepControl::Failed(reason),
            }
        }
    }

    /// Confirm the booking. A timeout here is ambiguous — the remote may have
    /// booked — so the transaction status is re-queried before any retry and
    /// a remote Confirmed is adopted as-is.
    async fn confirm_step(&self, tx: &mut MarketTransaction) -> StepControl {
        if tx.state != TransactionState::Initialized {
            return StepControl::Advanced;
        }
        let request = ConfirmRequest {
            transaction_id: tx.id.clone(),
            order_id: tx.order_id.clone().unwrap_or_default(),
        };

        loop {
            if self.cancelled() {
                TransactionMachine::abandon(tx, "cancelled during confirm");
                return StepControl::Abandoned;
            }
            let outcome = match self.client.confirm(&request).await {
                Ok(response) => {
                    tx.confirmation_ref = Some(response.confirmation_ref);
                    StepOutcome::Success
                }
                Err(super::MarketError::Timeout) => self.resolve_ambiguous_confirm(tx).await,
                Err(e) => StepOutcome::Failure {
                    class: e.class(),
                    reason: format!("confirm: {e}"),
                },
            };
            match TransactionMachine::next(tx, &self.retry, outcome) {
                Transition::Next(_) | Transition::Complete(_) => return StepControl::Advanced,
                Transition::Retry { reason } => {
                    self.backoff(tx.retry_count, "confirm", &reason).await;
                }
                Transition::Fail { reason } => return StepControl::Failed(reason),
            }
        }
    }

    async fn resolve_ambiguous_confirm(&self, tx: &mut MarketTransaction) -> StepOutcome {
        tracing::warn!("confirm timed out for {}, re-querying remote status", tx.id);
        match self.client.transaction_status(&tx.id).await {
            Ok(status) if status.status == RemoteStatus::Confirmed => {
                tx.confirmation_ref = status.confirmation_ref;
                StepOutcome::Success
            }
            Ok(status) => StepOutcome::Failure {
                class: ErrorClass::Transient,
                reason: format!("confirm timed out; remote reports {:?}", status.status),
            },
            Err(e) => StepOutcome::Failure {
                class: ErrorClass::Transient,
                reason: format!("confirm timed out; status query failed: {e}"),
            },
        }
    }
}

/// The lowest-carbon window wins.
fn best_offer(offers: &[FlexibilityOffer]) -> Option<&FlexibilityOffer> {
    offers
        .iter()
        .min_by(|a, b| a.carbon_intensity.total_cmp(&b.carbon_intensity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateTable;
    use crate::queue::WorkloadType;
    use crate::revenue::{RevenueCalculator, ServiceType};
    use chrono::Utc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn jobs() -> Vec<Job> {
        vec![
            Job::new(WorkloadType::LlmTraining, 700.0, false, 8).unwrap(),
            Job::new(WorkloadType::InferenceBatch, 500.0, false, 12).unwrap(),
        ]
    }

    fn estimate(jobs: &[Job]) -> RevenueEstimate {
        let snapshot = crate::grid::GridSnapshot {
            carbon_intensity_g_per_kwh: 210.0,
            price_per_kwh: 0.10,
            renewable_percentage: 40.0,
            peak_demand: true,
            captured_at: Utc::now(),
            forecast_next_hour: None,
        };
        RevenueCalculator::estimate(jobs, &snapshot, &RateTable::default())
    }

    fn retry_fast(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 10,
        }
    }

    fn discover_body(offers: serde_json::Value) -> String {
        serde_json::json!({
            "transaction_id": "txn_1",
            "offers": offers
        })
        .to_string()
    }

    fn offer_json(offer_id: &str, carbon: f64) -> serde_json::Value {
        serde_json::json!({
            "offer_id": offer_id,
            "provider_id": "prov_1",
            "service_type": "dynamic_moderation",
            "rate_per_mw_hour": 17.5,
            "carbon_intensity": carbon,
            "window_start": "2025-11-25T02:00:00Z",
            "window_end": "2025-11-25T06:00:00Z"
        })
    }

    async fn mount_happy_tail(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/select"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"transaction_id":"txn_1","offer_id":"offer_low"}"#,
                "application/json",
            ))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/init"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"transaction_id":"txn_1","order_id":"ord_7"}"#,
                "application/json",
            ))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/confirm"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"transaction_id":"txn_1","order_id":"ord_7","confirmation_ref":"ref_42"}"#,
                "application/json",
            ))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn full_journey_confirms_lowest_carbon_offer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/discover"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                discover_body(serde_json::json!([
                    offer_json("offer_high", 180.0),
                    offer_json("offer_low", 90.0)
                ])),
                "application/json",
            ))
            .mount(&server)
            .await;
        mount_happy_tail(&server).await;

        let client = MarketClient::new(server.uri(), 5);
        let (_tx_cancel, cancel) = watch::channel(false);
        let protocol = MarketProtocol::new(&client, retry_fast(3), cancel);
        let jobs = jobs();
        let outcome = protocol.run(&estimate(&jobs), &jobs).await.unwrap();

        match outcome {
            ProtocolOutcome::Confirmed(tx) => {
                assert_eq!(tx.state, TransactionState::Confirmed);
                assert_eq!(tx.offer_id, "offer_low");
                assert_eq!(tx.order_id.as_deref(), Some("ord_7"));
                assert_eq!(tx.confirmation_ref.as_deref(), Some("ref_42"));
                assert_eq!(tx.capacity_basis_kwh, 1200.0);
                assert_eq!(
                    tx.state_history,
                    vec![
                        TransactionState::Discovered,
                        TransactionState::Selected,
                        TransactionState::Initialized
                    ]
                );
            }
            other => panic!("expected Confirmed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_discovery_is_no_offer_not_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/discover"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                discover_body(serde_json::json!([])),
                "application/json",
            ))
            .mount(&server)
            .await;

        let client = MarketClient::new(server.uri(), 5);
        let (_tx_cancel, cancel) = watch::channel(false);
        let protocol = MarketProtocol::new(&client, retry_fast(3), cancel);
        let jobs = jobs();
        let outcome = protocol.run(&estimate(&jobs), &jobs).await.unwrap();

        assert!(matches!(outcome, ProtocolOutcome::NoOffer));
    }

    #[tokio::test]
    async fn transient_select_failure_retries_to_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/discover"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                discover_body(serde_json::json!([offer_json("offer_low", 90.0)])),
                "application/json",
            ))
            .mount(&server)
            .await;
        // First select attempt fails with a 503, the retry succeeds.
        Mock::given(method("POST"))
            .and(path("/select"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_happy_tail(&server).await;

        let client = MarketClient::new(server.uri(), 5);
        let (_tx_cancel, cancel) = watch::channel(false);
        let protocol = MarketProtocol::new(&client, retry_fast(3), cancel);
        let jobs = jobs();
        let outcome = protocol.run(&estimate(&jobs), &jobs).await.unwrap();

        assert!(matches!(outcome, ProtocolOutcome::Confirmed(_)));
    }

    #[tokio::test]
    async fn init_rejection_fails_with_remote_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/discover"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                discover_body(serde_json::json!([offer_json("offer_low", 90.0)])),
                "application/json",
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/select"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"transaction_id":"txn_1","offer_id":"offer_low"}"#,
                "application/json",
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/init"))
            .respond_with(ResponseTemplate::new(409).set_body_string("window no longer in future"))
            .mount(&server)
            .await;

        let client = MarketClient::new(server.uri(), 5);
        let (_tx_cancel, cancel) = watch::channel(false);
        let protocol = MarketProtocol::new(&client, retry_fast(3), cancel);
        let jobs = jobs();
        let outcome = protocol.run(&estimate(&jobs), &jobs).await.unwrap();

        match outcome {
            ProtocolOutcome::Failed {
                transaction: Some(tx),
                reason,
            } => {
                assert_eq!(tx.state, TransactionState::Failed);
                assert!(reason.contains("window no longer in future"));
            }
            other => panic!("expected Failed with transaction, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn discover_failure_exhausts_budget_without_transaction() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/discover"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = MarketClient::new(server.uri(), 5);
        let (_tx_cancel, cancel) = watch::channel(false);
        let protocol = MarketProtocol::new(&client, retry_fast(1), cancel);
        let jobs = jobs();
        let outcome = protocol.run(&estimate(&jobs), &jobs).await.unwrap();

        match outcome {
            ProtocolOutcome::Failed {
                transaction,
                reason,
            } => {
                assert!(transaction.is_none());
                assert!(reason.contains("retry budget exhausted"));
            }
            other => panic!("expected Failed without transaction, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ambiguous_confirm_adopts_remote_confirmation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/discover"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                discover_body(serde_json::json!([offer_json("offer_low", 90.0)])),
                "application/json",
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/select"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"transaction_id":"txn_1","offer_id":"offer_low"}"#,
                "application/json",
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/init"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"transaction_id":"txn_1","order_id":"ord_7"}"#,
                "application/json",
            ))
            .mount(&server)
            .await;
        // Confirm hangs past the client timeout; the remote booked anyway.
        Mock::given(method("POST"))
            .and(path("/confirm"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(std::time::Duration::from_secs(3))
                    .set_body_raw(
                        r#"{"transaction_id":"txn_1","order_id":"ord_7","confirmation_ref":"ref_slow"}"#,
                        "application/json",
                    ),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/transactions/txn_1"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"transaction_id":"txn_1","status":"confirmed","confirmation_ref":"ref_remote"}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let client = MarketClient::new(server.uri(), 1);
        let (_tx_cancel, cancel) = watch::channel(false);
        let protocol = MarketProtocol::new(&client, retry_fast(3), cancel);
        let jobs = jobs();
        let outcome = protocol.run(&estimate(&jobs), &jobs).await.unwrap();

        match outcome {
            ProtocolOutcome::Confirmed(tx) => {
                // Adopted from the status query, not a blind confirm retry.
                assert_eq!(tx.confirmation_ref.as_deref(), Some("ref_remote"));
            }
            other => panic!("expected Confirmed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn select_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/select"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"transaction_id":"txn_1","offer_id":"offer_1"}"#,
                "application/json",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = MarketClient::new(server.uri(), 5);
        let (_tx_cancel, cancel) = watch::channel(false);
        let protocol = MarketProtocol::new(&client, retry_fast(3), cancel);

        let offer = FlexibilityOffer {
            offer_id: "offer_1".into(),
            provider_id: "prov_1".into(),
            service_type: ServiceType::DynamicContainment,
            rate_per_mw_hour: 9.50,
            carbon_intensity: 140.0,
            window_start: Utc::now(),
            window_end: Utc::now() + chrono::Duration::hours(1),
        };
        let jobs = jobs();
        let mut tx = MarketTransaction::from_offer("txn_1".into(), &offer, &jobs);

        assert!(matches!(
            protocol.select_step(&mut tx).await,
            StepControl::Advanced
        ));
        assert_eq!(tx.state, TransactionState::Selected);
        let id_after_first = tx.id.clone();

        // Second select is a no-op: same transaction, no second HTTP call
        // (the mock's expect(1) enforces that on drop).
        assert!(matches!(
            protocol.select_step(&mut tx).await,
            StepControl::Advanced
        ));
        assert_eq!(tx.state, TransactionState::Selected);
        assert_eq!(tx.id, id_after_first);
    }

    #[tokio::test]
    async fn cancellation_mid_protocol_abandons_explicitly() {
        let server = MockServer::start().await;
        let client = MarketClient::new(server.uri(), 5);
        let (tx_cancel, cancel) = watch::channel(false);
        let protocol = MarketProtocol::new(&client, retry_fast(3), cancel);

        let offer = FlexibilityOffer {
            offer_id: "offer_1".into(),
            provider_id: "prov_1".into(),
            service_type: ServiceType::DynamicContainment,
            rate_per_mw_hour: 9.50,
            carbon_intensity: 140.0,
            window_start: Utc::now(),
            window_end: Utc::now() + chrono::Duration::hours(1),
        };
        let jobs = jobs();
        let mut tx = MarketTransaction::from_offer("txn_1".into(), &offer, &jobs);

        tx_cancel.send(true).unwrap();
        match protocol.select_step(&mut tx).await {
            StepControl::Abandoned => {
                assert_eq!(tx.state, TransactionState::Abandoned);
                assert!(tx.failure.as_deref().unwrap().contains("cancelled"));
            }
            _ => panic!("expected Abandoned"),
        }
    }
}
