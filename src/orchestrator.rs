//! The scheduling loop.
//!
//! One cycle: fetch a grid snapshot, run the policy engine over every
//! eligible job, commit the decisions to the queue as a single batch, and —
//! when enough capacity sits deferred — value it and take it to market.
//! Grid and market failures degrade the cycle and are recorded; they never
//! crash the loop. Shutdown is a cooperative watch signal checked between
//! cycles, never a hard kill mid-decision.

use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::audit::{AuditEntry, DecisionAuditLog, MarketOutcomeKind};
use crate::config::GridFlexConfig;
use crate::grid::{GridProvider, GridSnapshot};
use crate::market::{MarketClient, MarketProtocol, ProtocolOutcome};
use crate::policy::{Decision, DecisionAction, PolicyEngine};
use crate::queue::{Job, JobQueue};
use crate::revenue::{RevenueCalculator, RevenueEstimate};

/// What the dashboard needs to distinguish: no data yet, last cycle failed,
/// or connected and healthy.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CycleHealth {
    NoDataYet,
    Healthy {
        last_success: DateTime<Utc>,
    },
    Degraded {
        last_error: String,
        last_success: Option<DateTime<Utc>>,
    },
}

/// Aggregated scheduler metrics for the monitoring surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemMetrics {
    pub cycles_run: u64,
    pub cycles_skipped: u64,
    pub decisions_total: u64,
    pub decisions_per_cycle: f64,
    pub avg_cycle_latency_ms: f64,
    pub jobs_executed_immediately: u64,
    pub jobs_deferred: u64,
    pub total_cost_saved_gbp: f64,
    pub total_carbon_reduced_g: f64,
    pub transactions_confirmed: u64,
    pub transactions_failed: u64,
    pub transactions_abandoned: u64,
    pub no_offer_count: u64,
    pub invariant_violations: u64,
}

/// Everything one cycle produced, for callers that render progress.
#[derive(Debug)]
pub struct CycleReport {
    pub snapshot: Option<GridSnapshot>,
    pub decisions: Vec<Decision>,
    pub estimate: Option<RevenueEstimate>,
    pub market: Option<ProtocolOutcome>,
}

/// Owns the queue, the audit log, and the cycle loop. The one component with
/// mutable state; everything it calls is pure or a bounded external call.
pub struct Orchestrator<G> {
    provider: G,
    /// Optional marketplace client — without one, deferred capacity is held
    /// but never offered.
    market: Option<MarketClient>,
    config: GridFlexConfig,
    queue: JobQueue,
    audit: DecisionAuditLog,
    metrics: SystemMetrics,
    health: CycleHealth,
    shutdown: watch::Receiver<bool>,
}

impl<G: GridProvider> Orchestrator<G> {
    pub fn new(
        provider: G,
        market: Option<MarketClient>,
        config: GridFlexConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            provider,
            market,
            config,
            queue: JobQueue::new(),
            audit: DecisionAuditLog::new(),
            metrics: SystemMetrics::default(),
            health: CycleHealth::NoDataYet,
            shutdown,
        }
    }

    // -- inbound surface -----------------------------------------------------

    pub fn submit_job(&mut self, job: Job) -> String {
        tracing::info!(
            "job {} submitted: {:.1} kWh, critical: {}, window: {}h",
            job.id,
            job.energy_kwh,
            job.critical,
            job.max_deferral_hours
        );
        self.queue.submit(job)
    }

    /// Committed job states only — never a mid-decision view.
    pub fn queue_snapshot(&self) -> Vec<Job> {
        self.queue.snapshot()
    }

    pub fn recent_decisions(&self, n: usize) -> Vec<Decision> {
        self.audit.recent_decisions(n)
    }

    pub fn audit_log(&self) -> &DecisionAuditLog {
        &self.audit
    }

    pub fn system_metrics(&self) -> SystemMetrics {
        let mut metrics = self.metrics.clone();
        if metrics.cycles_run > 0 {
            metrics.decisions_per_cycle =
                metrics.decisions_total as f64 / metrics.cycles_run as f64;
        }
        metrics
    }

    pub fn cycle_health(&self) -> CycleHealth {
        self.health.clone()
    }

    /// Fill the queue with simulated workloads (demo mode).
    pub fn populate_demo_queue(&mut self, count: usize) {
        for _ in 0..count {
            let job = Job::simulated();
            self.submit_job(job);
        }
    }

    // -- the loop ------------------------------------------------------------

    /// Run cycles until shutdown, or until `max_cycles` completes.
    pub async fn run(&mut self, max_cycles: Option<u64>) -> Result<()> {
        tracing::info!(
            "scheduler starting: {}s interval, carbon threshold {} gCO2/kWh, min offer {} MW",
            self.config.cycle_interval_secs,
            self.config.carbon_threshold_g_per_kwh,
            self.config.min_offer_capacity_mw
        );

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.cycle_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut completed = 0u64;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.changed() => {}
            }
            if *self.shutdown.borrow() {
                tracing::info!("shutdown requested, stopping between cycles");
                break;
            }

            let report = self.run_cycle().await;
            completed += 1;
            tracing::debug!(
                "cycle {completed}: {} decisions, deferred pool {} jobs",
                report.decisions.len(),
                self.queue.deferred().len()
            );

            if let Some(max) = max_cycles
                && completed >= max
            {
                break;
            }
        }
        Ok(())
    }

    /// One pass: snapshot → decide → commit → value → market → record.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let started = Instant::now();

        // Step 1: acquire the snapshot. Failure is transient — skip the
        // cycle, mark health degraded, leave every job for the next pass.
        let snapshot = match self.provider.fetch_current().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("grid fetch failed, skipping cycle: {e}");
                self.metrics.cycles_skipped += 1;
                let last_success = match &self.health {
                    CycleHealth::Healthy { last_success } => Some(*last_success),
                    CycleHealth::Degraded { last_success, .. } => *last_success,
                    CycleHealth::NoDataYet => None,
                };
                self.health = CycleHealth::Degraded {
                    last_error: e.to_string(),
                    last_success,
                };
                self.audit.append(AuditEntry::CycleError {
                    timestamp: Utc::now(),
                    error: format!("grid fetch failed: {e}"),
                });
                return CycleReport {
                    snapshot: None,
                    decisions: Vec::new(),
                    estimate: None,
                    market: None,
                };
            }
        };

        tracing::info!(
            "grid: {:.0} gCO2/kWh, £{:.4}/kWh, {:.0}% renewable, peak: {}",
            snapshot.carbon_intensity_g_per_kwh,
            snapshot.price_per_kwh,
            snapshot.renewable_percentage,
            snapshot.peak_demand
        );

        // Step 2: pure per-job mapping, then one atomic batch commit.
        let now = Utc::now();
        let eligible = self.queue.eligible(now);
        let mut decisions = Vec::with_capacity(eligible.len());
        for job in &eligible {
            let decision = PolicyEngine::decide(job, &snapshot, &self.config, now);
            if job.critical && decision.action == DecisionAction::Defer {
                // A deferred critical job is a policy bug. Loud, fatal for
                // this job only, never for the cycle.
                tracing::error!(
                    "invariant violation: policy deferred critical job {}",
                    job.id
                );
                self.metrics.invariant_violations += 1;
                self.audit.append(AuditEntry::CycleError {
                    timestamp: now,
                    error: format!("invariant violation: critical job {} deferred", job.id),
                });
                continue;
            }
            decisions.push(decision);
        }

        if let Err(e) = self.queue.apply(&decisions) {
            tracing::error!("decision batch rejected: {e}");
            self.metrics.invariant_violations += 1;
            self.audit.append(AuditEntry::CycleError {
                timestamp: now,
                error: format!("decision batch rejected: {e}"),
            });
            return CycleReport {
                snapshot: Some(snapshot),
                decisions: Vec::new(),
                estimate: None,
                market: None,
            };
        }

        for decision in &decisions {
            match decision.action {
                DecisionAction::ExecuteNow => self.metrics.jobs_executed_immediately += 1,
                DecisionAction::Defer => self.metrics.jobs_deferred += 1,
            }
            self.metrics.total_cost_saved_gbp += decision.estimated_cost_savings_gbp;
            self.metrics.total_carbon_reduced_g += decision.estimated_carbon_reduction_g;
            self.metrics.decisions_total += 1;
            tracing::info!(
                "decision {}: {} job {} ({})",
                decision.id,
                decision.action,
                decision.job_id,
                decision.reasoning
            );
            self.audit.append(AuditEntry::Decision(decision.clone()));
        }

        // Step 3: value the deferred pool and take it to market once it
        // clears the minimum offer size.
        let deferred = self.queue.deferred();
        let capacity_mw = deferred.iter().map(|job| job.energy_kwh).sum::<f64>() / 1000.0;

        let mut estimate = None;
        let mut market_result = None;
        if capacity_mw > 0.0 && capacity_mw >= self.config.min_offer_capacity_mw {
            let valued = RevenueCalculator::estimate(&deferred, &snapshot, &self.config.rates);
            tracing::info!(
                "flexibility value: {:.2} MW as {} at £{:.2}/MW/h = £{:.2}/h",
                valued.capacity_mw,
                valued.service_type,
                valued.rate_per_mw_hour,
                valued.revenue_per_hour
            );
            if let Some(client) = &self.market {
                let protocol =
                    MarketProtocol::new(client, self.config.retry(), self.shutdown.clone());
                market_result = Some(protocol.run(&valued, &deferred).await);
            } else {
                tracing::debug!("no market client configured; capacity held, not offered");
            }
            estimate = Some(valued);
        } else if capacity_mw > 0.0 {
            tracing::debug!(
                "deferred capacity {capacity_mw:.2} MW below offer minimum {} MW",
                self.config.min_offer_capacity_mw
            );
        }

        // Step 4: record the outcome, tagged with this cycle's snapshot.
        let market_outcome = match market_result {
            Some(Ok(outcome)) => {
                self.record_market_outcome(
                    &outcome,
                    estimate.clone().expect("estimate exists when protocol ran"),
                    &snapshot,
                );
                Some(outcome)
            }
            Some(Err(e)) => {
                tracing::error!("market protocol invariant failure: {e}");
                self.metrics.invariant_violations += 1;
                self.audit.append(AuditEntry::CycleError {
                    timestamp: Utc::now(),
                    error: e.to_string(),
                });
                None
            }
            None => None,
        };

        // Step 5 happens in `run`: sleep until the next tick.
        self.metrics.cycles_run += 1;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let n = self.metrics.cycles_run as f64;
        self.metrics.avg_cycle_latency_ms =
            (self.metrics.avg_cycle_latency_ms * (n - 1.0) + latency_ms) / n;
        self.health = CycleHealth::Healthy {
            last_success: Utc::now(),
        };

        CycleReport {
            snapshot: Some(snapshot),
            decisions,
            estimate,
            market: market_outcome,
        }
    }

    fn record_market_outcome(
        &mut self,
        outcome: &ProtocolOutcome,
        estimate: RevenueEstimate,
        snapshot: &GridSnapshot,
    ) {
        let (kind, transaction, reason) = match outcome {
            ProtocolOutcome::Confirmed(tx) => {
                self.metrics.transactions_confirmed += 1;
                (MarketOutcomeKind::Confirmed, Some(tx.clone()), None)
            }
            ProtocolOutcome::NoOffer => {
                self.metrics.no_offer_count += 1;
                (MarketOutcomeKind::NoOffer, None, None)
            }
            ProtocolOutcome::Failed {
                transaction,
                reason,
            } => {
                self.metrics.transactions_failed += 1;
                tracing::warn!("market transaction failed: {reason}");
                (
                    MarketOutcomeKind::Failed,
                    transaction.clone(),
                    Some(reason.clone()),
                )
            }
            ProtocolOutcome::Abandoned(tx) => {
                self.metrics.transactions_abandoned += 1;
                tracing::warn!(
                    "market transaction {} abandoned, manual reconciliation required",
                    tx.id
                );
                (MarketOutcomeKind::Abandoned, Some(tx.clone()), None)
            }
        };

        self.audit.append(AuditEntry::Market {
            timestamp: Utc::now(),
            outcome: kind,
            estimate,
            transaction,
            reason,
            snapshot: snapshot.clone(),
        });
    }
}
