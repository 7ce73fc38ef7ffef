//! The decision engine.
//!
//! [`PolicyEngine::decide`] maps one (job, grid snapshot) pair to a
//! [`Decision`] by walking an ordered rule list — first match wins. The rules
//! encode, in priority order: the SLA guarantee for critical jobs, the
//! deadline override for expired deferral windows, carbon-driven deferral,
//! and the execute-by-default fallthrough. Pure function: no I/O, no state;
//! the orchestrator applies the returned decision.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::GridFlexConfig;
use crate::grid::GridSnapshot;
use crate::queue::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    ExecuteNow,
    Defer,
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionAction::ExecuteNow => write!(f, "EXECUTE_NOW"),
            DecisionAction::Defer => write!(f, "DEFER"),
        }
    }
}

/// Which rule fired. Recorded so audit entries are reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRationale {
    SlaCritical,
    DeadlineOverride,
    CarbonAboveThreshold,
    FavorableConditions,
}

/// One scheduling decision. Immutable once appended to the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: DecisionAction,
    pub rationale: DecisionRationale,
    /// Derived from the fired rule and the numbers compared, so two runs
    /// over the same inputs produce the same text.
    pub reasoning: String,
    pub carbon_at_decision: f64,
    pub price_at_decision: f64,
    pub defer_until: Option<DateTime<Utc>>,
    pub estimated_cost_savings_gbp: f64,
    pub estimated_carbon_reduction_g: f64,
}

impl Decision {
    #[cfg(test)]
    pub(crate) fn for_test(
        job_id: &str,
        action: DecisionAction,
        defer_until: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: format!("dec_{}", Uuid::new_v4().simple()),
            job_id: job_id.to_string(),
            timestamp: Utc::now(),
            action,
            rationale: match action {
                DecisionAction::ExecuteNow => DecisionRationale::FavorableConditions,
                DecisionAction::Defer => DecisionRationale::CarbonAboveThreshold,
            },
            reasoning: String::new(),
            carbon_at_decision: 0.0,
            price_at_decision: 0.0,
            defer_until,
            estimated_cost_savings_gbp: 0.0,
            estimated_carbon_reduction_g: 0.0,
        }
    }
}

struct RuleContext<'a> {
    job: &'a Job,
    snapshot: &'a GridSnapshot,
    config: &'a GridFlexConfig,
    now: DateTime<Utc>,
}

/// One entry in the ordered rule list. Reordering or adding rules is a data
/// change to [`RULES`], not new branching logic.
struct PolicyRule {
    rationale: DecisionRationale,
    action: DecisionAction,
    applies: fn(&RuleContext<'_>) -> bool,
}

/// Evaluated top to bottom; the final rule is a catch-all.
const RULES: &[PolicyRule] = &[
    PolicyRule {
        rationale: DecisionRationale::SlaCritical,
        action: DecisionAction::ExecuteNow,
        applies: |ctx| ctx.job.critical,
    },
    PolicyRule {
        rationale: DecisionRationale::DeadlineOverride,
        action: DecisionAction::ExecuteNow,
        applies: |ctx| ctx.job.remaining_deferral(ctx.now) <= Duration::zero(),
    },
    PolicyRule {
        rationale: DecisionRationale::CarbonAboveThreshold,
        action: DecisionAction::Defer,
        applies: |ctx| {
            ctx.snapshot.carbon_intensity_g_per_kwh > ctx.config.carbon_threshold_g_per_kwh
        },
    },
    PolicyRule {
        rationale: DecisionRationale::FavorableConditions,
        action: DecisionAction::ExecuteNow,
        applies: |_| true,
    },
];

pub struct PolicyEngine;

impl PolicyEngine {
    /// Decide what to do with one job under the given grid conditions.
    pub fn decide(
        job: &Job,
        snapshot: &GridSnapshot,
        config: &GridFlexConfig,
        now: DateTime<Utc>,
    ) -> Decision {
        let ctx = RuleContext {
            job,
            snapshot,
            config,
            now,
        };
        let rule = RULES
            .iter()
            .find(|rule| (rule.applies)(&ctx))
            .expect("final rule is a catch-all");

        let carbon = snapshot.carbon_intensity_g_per_kwh;
        let price = snapshot.price_per_kwh;
        let threshold = config.carbon_threshold_g_per_kwh;

        let (reasoning, defer_until, cost_savings, carbon_reduction) = match rule.rationale {
            DecisionRationale::SlaCritical => (
                "critical job: must execute immediately to meet SLA commitments".to_string(),
                None,
                0.0,
                0.0,
            ),
            DecisionRationale::DeadlineOverride => (
                format!(
                    "deferral window expired: executing now despite carbon at {carbon:.0} gCO2/kWh"
                ),
                None,
                0.0,
                0.0,
            ),
            DecisionRationale::CarbonAboveThreshold => {
                // Estimate the window we are deferring into. With no forecast,
                // assume off-peak clears at half the carbon and 70% of the price.
                let optimal_carbon = snapshot
                    .forecast_next_hour
                    .map(|f| f.carbon_intensity_g_per_kwh)
                    .unwrap_or(carbon * 0.5);
                let optimal_price = snapshot
                    .forecast_next_hour
                    .map(|f| f.price_per_kwh)
                    .unwrap_or(price * 0.7);

                let hold = Duration::hours(config.defer_horizon_hours)
                    .min(job.remaining_deferral(now));
                let savings = (job.energy_kwh * (price - optimal_price)).max(0.0);
                let reduction = (job.energy_kwh * (carbon - optimal_carbon)).max(0.0);

                (
                    format!(
                        "carbon above threshold: {carbon:.0} gCO2/kWh > {threshold:.0} gCO2/kWh, \
                         deferring toward an estimated {optimal_carbon:.0} gCO2/kWh window"
                    ),
                    Some(now + hold),
                    (savings * 100.0).round() / 100.0,
                    (reduction * 100.0).round() / 100.0,
                )
            }
            DecisionRationale::FavorableConditions => (
                format!(
                    "favorable conditions: carbon {carbon:.0} gCO2/kWh within threshold \
                     {threshold:.0} gCO2/kWh"
                ),
                None,
                0.0,
                0.0,
            ),
        };

        Decision {
            id: format!("dec_{}", Uuid::new_v4().simple()),
            job_id: job.id.clone(),
            timestamp: now,
            action: rule.action,
            rationale: rule.rationale,
            reasoning,
            carbon_at_decision: carbon,
            price_at_decision: price,
            defer_until,
            estimated_cost_savings_gbp: cost_savings,
            estimated_carbon_reduction_g: carbon_reduction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridForecast;
    use crate::queue::WorkloadType;
    use rand::Rng;

    fn snapshot(carbon: f64, price: f64) -> GridSnapshot {
        GridSnapshot {
            carbon_intensity_g_per_kwh: carbon,
            price_per_kwh: price,
            renewable_percentage: 40.0,
            peak_demand: false,
            captured_at: Utc::now(),
            forecast_next_hour: None,
        }
    }

    fn job(critical: bool, deferral_hours: i64) -> Job {
        Job::new(
            if critical {
                WorkloadType::InferenceRealtime
            } else {
                WorkloadType::LlmTraining
            },
            150.0,
            critical,
            deferral_hours,
        )
        .unwrap()
    }

    #[test]
    fn critical_jobs_never_defer() {
        let config = GridFlexConfig::default();
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let carbon = rng.gen_range(0.0..1000.0);
            let price = rng.gen_range(0.0..1.0);
            let decision =
                PolicyEngine::decide(&job(true, 0), &snapshot(carbon, price), &config, Utc::now());
            assert_eq!(decision.action, DecisionAction::ExecuteNow);
            assert_eq!(decision.rationale, DecisionRationale::SlaCritical);
        }
    }

    #[test]
    fn expired_window_forces_execution_regardless_of_carbon() {
        let config = GridFlexConfig::default();
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let carbon = rng.gen_range(0.0..1000.0);
            let mut j = job(false, 2);
            j.submitted_at = Utc::now() - Duration::hours(3);
            let decision = PolicyEngine::decide(&j, &snapshot(carbon, 0.10), &config, Utc::now());
            assert_eq!(decision.action, DecisionAction::ExecuteNow);
            assert_eq!(decision.rationale, DecisionRationale::DeadlineOverride);
        }
    }

    #[test]
    fn high_carbon_defers_within_window() {
        // Scenario: carbon 180 > threshold 150, 4h window left.
        let config = GridFlexConfig::default();
        let now = Utc::now();
        let decision = PolicyEngine::decide(&job(false, 4), &snapshot(180.0, 0.10), &config, now);
        assert_eq!(decision.action, DecisionAction::Defer);
        assert!(decision.reasoning.contains("carbon above threshold"));
        assert!(decision.reasoning.contains("180"));
        // Hold is bounded by the remaining window (4h < 6h horizon).
        let until = decision.defer_until.unwrap();
        assert!(until <= now + Duration::hours(4) + Duration::seconds(1));
        assert!(until > now);
    }

    #[test]
    fn critical_executes_even_below_threshold() {
        // Scenario: carbon 90 < threshold, critical job still executes now.
        let config = GridFlexConfig::default();
        let decision =
            PolicyEngine::decide(&job(true, 0), &snapshot(90.0, 0.05), &config, Utc::now());
        assert_eq!(decision.action, DecisionAction::ExecuteNow);
        assert_eq!(decision.rationale, DecisionRationale::SlaCritical);
    }

    #[test]
    fn low_carbon_executes_with_favorable_rationale() {
        let config = GridFlexConfig::default();
        let decision =
            PolicyEngine::decide(&job(false, 8), &snapshot(120.0, 0.08), &config, Utc::now());
        assert_eq!(decision.action, DecisionAction::ExecuteNow);
        assert_eq!(decision.rationale, DecisionRationale::FavorableConditions);
        assert!(decision.reasoning.contains("120"));
    }

    #[test]
    fn defer_hold_capped_by_horizon() {
        let config = GridFlexConfig::default();
        let now = Utc::now();
        let decision = PolicyEngine::decide(&job(false, 24), &snapshot(200.0, 0.10), &config, now);
        let until = decision.defer_until.unwrap();
        assert_eq!(until, now + Duration::hours(config.defer_horizon_hours));
    }

    #[test]
    fn savings_estimated_from_forecast() {
        let config = GridFlexConfig::default();
        let mut snap = snapshot(250.0, 0.10);
        snap.forecast_next_hour = Some(GridForecast {
            carbon_intensity_g_per_kwh: 100.0,
            price_per_kwh: 0.06,
        });
        let decision = PolicyEngine::decide(&job(false, 8), &snap, &config, Utc::now());
        assert_eq!(decision.action, DecisionAction::Defer);
        // 150 kWh * (250 - 100) gCO2/kWh
        assert_eq!(decision.estimated_carbon_reduction_g, 22500.0);
        // 150 kWh * £0.04/kWh
        assert_eq!(decision.estimated_cost_savings_gbp, 6.0);
    }

    #[test]
    fn reasoning_is_deterministic() {
        let config = GridFlexConfig::default();
        let now = Utc::now();
        let j = job(false, 8);
        let a = PolicyEngine::decide(&j, &snapshot(180.0, 0.10), &config, now);
        let b = PolicyEngine::decide(&j, &snapshot(180.0, 0.10), &config, now);
        assert_eq!(a.reasoning, b.reasoning);
        assert_eq!(a.defer_until, b.defer_until);
    }

    #[test]
    fn decision_serialization_roundtrip() {
        let config = GridFlexConfig::default();
        let decision =
            PolicyEngine::decide(&job(false, 8), &snapshot(180.0, 0.10), &config, Utc::now());
        let json = serde_json::to_string(&decision).unwrap();
        let back: Decision = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, decision.id);
        assert_eq!(back.action, DecisionAction::Defer);
        assert_eq!(back.rationale, DecisionRationale::CarbonAboveThreshold);
    }
}
