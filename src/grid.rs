//! Grid signal acquisition.
//!
//! Defines [`GridSnapshot`], the immutable per-cycle view of grid conditions,
//! and the [`GridProvider`] seam the orchestrator consumes. Two providers are
//! included: [`CarbonIntensityApi`] fetches live data from the UK carbon
//! intensity API (wholesale price and the peak-demand flag are derived from
//! time-of-day bands, since the upstream feed carries neither), and
//! [`SimulatedGrid`] synthesizes plausible conditions for demos and tests.

use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from a grid snapshot fetch. All are treated as transient by the
/// orchestrator: the cycle is skipped and retried on the next tick.
#[derive(Debug, Error)]
pub enum GridError {
    /// Upstream unreachable or returned a non-success status.
    #[error("grid data unavailable: {0}")]
    Unavailable(String),

    /// Upstream responded but the payload could not be interpreted.
    #[error("malformed grid data: {0}")]
    Malformed(String),
}

/// Short-horizon forecast attached to a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridForecast {
    pub carbon_intensity_g_per_kwh: f64,
    pub price_per_kwh: f64,
}

/// Immutable view of grid conditions for one decision cycle.
///
/// Replaced wholesale on every refresh; nothing mutates a snapshot in place.
/// `peak_demand` is an externally supplied signal — providers fill it, the
/// revenue calculator only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub carbon_intensity_g_per_kwh: f64,
    pub price_per_kwh: f64,
    pub renewable_percentage: f64,
    pub peak_demand: bool,
    pub captured_at: DateTime<Utc>,
    pub forecast_next_hour: Option<GridForecast>,
}

/// Source of grid snapshots. The orchestrator only ever calls
/// `fetch_current`; everything else about a provider is its own business.
pub trait GridProvider {
    async fn fetch_current(&self) -> Result<GridSnapshot, GridError>;
}

/// UK demand peaks: morning and evening ramps.
pub(crate) fn is_peak_hour(hour: u32) -> bool {
    (7..=9).contains(&hour) || (17..=20).contains(&hour)
}

/// Simulated UK wholesale price for the given hour, in £/kWh.
///
/// Night hours clear lowest, the two demand ramps highest. Production would
/// read day-ahead prices from an exchange feed instead.
fn simulate_price(hour: u32) -> f64 {
    let mut rng = rand::thread_rng();
    let price: f64 = if is_peak_hour(hour) {
        rng.gen_range(0.08..0.15)
    } else if hour <= 5 {
        rng.gen_range(0.03..0.06)
    } else {
        rng.gen_range(0.05..0.09)
    };
    (price * 10_000.0).round() / 10_000.0
}

// ---------------------------------------------------------------------------
// Live provider
// ---------------------------------------------------------------------------

/// Wire format of the carbon intensity API (`/intensity`, `/intensity/date`).
#[derive(Debug, Deserialize)]
struct IntensityResponse {
    data: Vec<IntensitySlot>,
}

#[derive(Debug, Deserialize)]
struct IntensitySlot {
    intensity: IntensityReading,
    #[serde(default)]
    generationmix: Vec<FuelShare>,
}

#[derive(Debug, Deserialize)]
struct IntensityReading {
    forecast: Option<f64>,
    actual: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FuelShare {
    fuel: String,
    perc: f64,
}

const RENEWABLE_FUELS: &[&str] = &["wind", "solar", "hydro", "biomass"];

fn renewable_share(mix: &[FuelShare]) -> f64 {
    mix.iter()
        .filter(|f| RENEWABLE_FUELS.contains(&f.fuel.as_str()))
        .map(|f| f.perc)
        .sum()
}

/// Live provider backed by the UK carbon intensity API.
pub struct CarbonIntensityApi {
    client: Client,
    base_url: String,
}

impl CarbonIntensityApi {
    pub fn new(base_url: String, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(timeout_secs))
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("failed to build HTTP client");
        Self { client, base_url }
    }

    async fn get_intensity(&self, path: &str) -> Result<IntensityResponse, GridError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GridError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GridError::Unavailable(format!("{url} returned {status}")));
        }

        response
            .json::<IntensityResponse>()
            .await
            .map_err(|e| GridError::Malformed(e.to_string()))
    }

    /// Forecast for the next half-hour settlement slot, if published.
    async fn fetch_forecast(&self) -> Option<f64> {
        match self.get_intensity("/intensity/date").await {
            Ok(body) => body.data.get(1).and_then(|slot| slot.intensity.forecast),
            Err(e) => {
                tracing::warn!("carbon forecast unavailable: {e}");
                None
            }
        }
    }
}

impl GridProvider for CarbonIntensityApi {
    async fn fetch_current(&self) -> Result<GridSnapshot, GridError> {
        let body = self.get_intensity("/intensity").await?;
        let slot = body
            .data
            .first()
            .ok_or_else(|| GridError::Malformed("empty intensity data".into()))?;

        let carbon = slot
            .intensity
            .actual
            .or(slot.intensity.forecast)
            .ok_or_else(|| GridError::Malformed("intensity slot has no reading".into()))?;

        let forecast_carbon = self.fetch_forecast().await;

        let now = Utc::now();
        let hour = chrono::Local::now().hour();
        let price = simulate_price(hour);

        Ok(GridSnapshot {
            carbon_intensity_g_per_kwh: carbon,
            price_per_kwh: price,
            renewable_percentage: renewable_share(&slot.generationmix),
            peak_demand: is_peak_hour(hour),
            captured_at: now,
            forecast_next_hour: forecast_carbon.map(|c| GridForecast {
                carbon_intensity_g_per_kwh: c,
                // Off-peak slots clear roughly 30% below current.
                price_per_kwh: price * 0.7,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Simulated provider
// ---------------------------------------------------------------------------

/// Offline provider producing plausible UK grid conditions, banded by
/// time of day. Used by `gridflex demo` and the test suite.
pub struct SimulatedGrid;

impl GridProvider for SimulatedGrid {
    async fn fetch_current(&self) -> Result<GridSnapshot, GridError> {
        let hour = chrono::Local::now().hour();
        let mut rng = rand::thread_rng();

        let carbon = if is_peak_hour(hour) {
            rng.gen_range(180.0..320.0)
        } else if hour <= 6 {
            rng.gen_range(60.0..140.0)
        } else {
            rng.gen_range(100.0..220.0)
        };

        let forecast_factor = rng.gen_range(0.6..1.1);
        let price = simulate_price(hour);

        Ok(GridSnapshot {
            carbon_intensity_g_per_kwh: (carbon * 10.0_f64).round() / 10.0,
            price_per_kwh: price,
            renewable_percentage: (rng.gen_range(20.0..70.0) * 10.0_f64).round() / 10.0,
            peak_demand: is_peak_hour(hour),
            captured_at: Utc::now(),
            forecast_next_hour: Some(GridForecast {
                carbon_intensity_g_per_kwh: (carbon * forecast_factor * 10.0).round() / 10.0,
                price_per_kwh: price * 0.7,
            }),
        })
    }
}
