//! Flexibility-market valuation of deferred capacity.
//!
//! Maps the aggregate deferred load to one of three flexibility services and
//! prices it with the injected [`RateTable`](crate::config::RateTable).
//! Service selection is a data-driven ordered rule table — exactly one rule
//! fires for any (carbon, peak) input, first match wins. Pure function.

use serde::{Deserialize, Serialize};

use crate::config::RateTable;
use crate::grid::GridSnapshot;
use crate::queue::Job;

/// Flexibility service products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    /// Reduce demand during grid stress peaks.
    DynamicModeration,
    /// Standby fast frequency response.
    DynamicContainment,
    /// Absorb excess renewable generation.
    DemandTurnUp,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::DynamicModeration => write!(f, "Dynamic Moderation"),
            ServiceType::DynamicContainment => write!(f, "Dynamic Containment"),
            ServiceType::DemandTurnUp => write!(f, "Demand Turn Up"),
        }
    }
}

/// Priced offer of deferred capacity for a one-hour window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueEstimate {
    pub capacity_mw: f64,
    pub service_type: ServiceType,
    pub rate_per_mw_hour: f64,
    pub revenue_per_hour: f64,
    pub carbon_intensity: f64,
    pub deferred_jobs: usize,
}

/// One row of the service selection table.
struct ServiceRule {
    service: ServiceType,
    applies: fn(carbon: f64, peak_demand: bool) -> bool,
}

/// Evaluated top to bottom. High carbon during a demand peak means the grid
/// wants load shed; low carbon means it wants load absorbed; anything else
/// is standby containment capacity.
const SERVICE_RULES: &[ServiceRule] = &[
    ServiceRule {
        service: ServiceType::DynamicModeration,
        applies: |carbon, peak| carbon > 200.0 && peak,
    },
    ServiceRule {
        service: ServiceType::DemandTurnUp,
        applies: |carbon, _| carbon < 100.0,
    },
    ServiceRule {
        service: ServiceType::DynamicContainment,
        applies: |_, _| true,
    },
];

pub struct RevenueCalculator;

impl RevenueCalculator {
    /// Which service the deferred capacity qualifies for.
    pub fn select_service(carbon_intensity: f64, peak_demand: bool) -> ServiceType {
        SERVICE_RULES
            .iter()
            .find(|rule| (rule.applies)(carbon_intensity, peak_demand))
            .expect("final rule is a catch-all")
            .service
    }

    /// Value the deferred jobs under current conditions.
    ///
    /// An empty slice yields a zero-capacity estimate, not an error — callers
    /// check `capacity_mw` against the offer threshold before going to market.
    pub fn estimate(
        deferred: &[Job],
        snapshot: &GridSnapshot,
        rates: &RateTable,
    ) -> RevenueEstimate {
        let capacity_mw = deferred.iter().map(|job| job.energy_kwh).sum::<f64>() / 1000.0;
        let service_type =
            Self::select_service(snapshot.carbon_intensity_g_per_kwh, snapshot.peak_demand);
        let rate = rates.rate_for(service_type);

        RevenueEstimate {
            capacity_mw: (capacity_mw * 100.0).round() / 100.0,
            service_type,
            rate_per_mw_hour: rate,
            revenue_per_hour: (capacity_mw * rate * 100.0).round() / 100.0,
            carbon_intensity: snapshot.carbon_intensity_g_per_kwh,
            deferred_jobs: deferred.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::WorkloadType;
    use chrono::Utc;

    fn snapshot(carbon: f64, peak_demand: bool) -> GridSnapshot {
        GridSnapshot {
            carbon_intensity_g_per_kwh: carbon,
            price_per_kwh: 0.10,
            renewable_percentage: 40.0,
            peak_demand,
            captured_at: Utc::now(),
            forecast_next_hour: None,
        }
    }

    fn job(energy_kwh: f64) -> Job {
        Job::new(WorkloadType::LlmTraining, energy_kwh, false, 8).unwrap()
    }

    #[test]
    fn empty_queue_yields_zero_capacity() {
        let rates = RateTable::default();
        for carbon in [50.0, 150.0, 250.0] {
            let estimate = RevenueCalculator::estimate(&[], &snapshot(carbon, true), &rates);
            assert_eq!(estimate.capacity_mw, 0.0);
            assert_eq!(estimate.revenue_per_hour, 0.0);
            assert_eq!(estimate.deferred_jobs, 0);
        }
    }

    #[test]
    fn exactly_one_rule_fires_at_boundaries() {
        for carbon in [99.0, 100.0, 101.0, 199.0, 200.0, 201.0] {
            for peak in [false, true] {
                let fired: Vec<_> = SERVICE_RULES
                    .iter()
                    .filter(|rule| (rule.applies)(carbon, peak))
                    .collect();
                // The catch-all always fires; the first match is the winner.
                assert!(!fired.is_empty());
                let selected = RevenueCalculator::select_service(carbon, peak);
                assert_eq!(selected, fired[0].service, "carbon={carbon} peak={peak}");
            }
        }
    }

    #[test]
    fn service_boundaries() {
        // Moderation needs BOTH high carbon and a peak.
        assert_eq!(
            RevenueCalculator::select_service(201.0, true),
            ServiceType::DynamicModeration
        );
        assert_eq!(
            RevenueCalculator::select_service(201.0, false),
            ServiceType::DynamicContainment
        );
        // 200 exactly is not "above 200".
        assert_eq!(
            RevenueCalculator::select_service(200.0, true),
            ServiceType::DynamicContainment
        );
        // Turn-up below 100 exclusive.
        assert_eq!(
            RevenueCalculator::select_service(99.0, false),
            ServiceType::DemandTurnUp
        );
        assert_eq!(
            RevenueCalculator::select_service(100.0, false),
            ServiceType::DynamicContainment
        );
        assert_eq!(
            RevenueCalculator::select_service(101.0, false),
            ServiceType::DynamicContainment
        );
        assert_eq!(
            RevenueCalculator::select_service(199.0, true),
            ServiceType::DynamicContainment
        );
    }

    #[test]
    fn peak_moderation_revenue() {
        // 5 deferred jobs totalling 1200 kWh at carbon 210 during a peak:
        // 1.2 MW of Dynamic Moderation at £17.50 = £21.00/h.
        let rates = RateTable::default();
        let jobs = vec![job(400.0), job(300.0), job(250.0), job(150.0), job(100.0)];
        let estimate = RevenueCalculator::estimate(&jobs, &snapshot(210.0, true), &rates);

        assert_eq!(estimate.capacity_mw, 1.2);
        assert_eq!(estimate.service_type, ServiceType::DynamicModeration);
        assert_eq!(estimate.rate_per_mw_hour, 17.50);
        assert_eq!(estimate.revenue_per_hour, 21.00);
        assert_eq!(estimate.deferred_jobs, 5);
    }

    #[test]
    fn rates_are_injected_not_hard_coded() {
        let rates = RateTable {
            dynamic_moderation: 25.0,
            dynamic_containment: 5.0,
            demand_turn_up: 8.0,
        };
        let jobs = vec![job(500.0), job(500.0)];
        let estimate = RevenueCalculator::estimate(&jobs, &snapshot(210.0, true), &rates);
        assert_eq!(estimate.revenue_per_hour, 25.0);

        let estimate = RevenueCalculator::estimate(&jobs, &snapshot(80.0, false), &rates);
        assert_eq!(estimate.service_type, ServiceType::DemandTurnUp);
        assert_eq!(estimate.revenue_per_hour, 8.0);
    }
}
