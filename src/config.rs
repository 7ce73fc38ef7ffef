//! GridFlex configuration loaded from `gridflex.toml`.
//!
//! The [`GridFlexConfig`] struct holds every tunable the scheduler reads:
//! decision thresholds, the flexibility-market rate table, retry budget,
//! per-step timeouts, and upstream endpoint URLs. Values missing from the
//! file fall back to sensible defaults. The `GRIDFLEX_GRID_URL` and
//! `GRIDFLEX_MARKET_URL` environment variables take precedence over the file.

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

use crate::market::RetryConfig;
use crate::revenue::ServiceType;

/// Top-level configuration loaded from `gridflex.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct GridFlexConfig {
    /// Carbon intensity above which non-critical jobs are deferred.
    #[serde(default = "default_carbon_threshold")]
    pub carbon_threshold_g_per_kwh: f64,

    /// Price ceiling used for cost-savings estimates in decision records.
    #[serde(default = "default_price_threshold")]
    pub price_threshold_gbp_per_kwh: f64,

    /// Minimum aggregate deferred capacity before an offer is taken to market.
    #[serde(default = "default_min_offer_capacity")]
    pub min_offer_capacity_mw: f64,

    /// Longest span a single deferral pushes a job into the future.
    #[serde(default = "default_defer_horizon_hours")]
    pub defer_horizon_hours: i64,

    /// Seconds between scheduling cycles.
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,

    /// Maximum retries per market protocol step.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Timeout per market protocol step, in seconds.
    #[serde(default = "default_market_timeout_secs")]
    pub market_timeout_secs: u64,

    /// Timeout for a grid snapshot fetch, in seconds.
    #[serde(default = "default_grid_timeout_secs")]
    pub grid_timeout_secs: u64,

    /// Carbon intensity API base URL.
    #[serde(default = "default_grid_api_url")]
    pub grid_api_url: String,

    /// Flexibility marketplace base URL. Empty disables the market client.
    #[serde(default)]
    pub market_api_url: String,

    /// Per-service clearing rates (£/MW/h).
    #[serde(default)]
    pub rates: RateTable,
}

/// Clearing rates per flexibility service, injected into the revenue
/// calculator so tariff changes are a config edit, not a code change.
#[derive(Debug, Clone, Deserialize)]
pub struct RateTable {
    #[serde(default = "default_dynamic_moderation_rate")]
    pub dynamic_moderation: f64,

    #[serde(default = "default_dynamic_containment_rate")]
    pub dynamic_containment: f64,

    #[serde(default = "default_demand_turn_up_rate")]
    pub demand_turn_up: f64,
}

impl RateTable {
    pub fn rate_for(&self, service: ServiceType) -> f64 {
        match service {
            ServiceType::DynamicModeration => self.dynamic_moderation,
            ServiceType::DynamicContainment => self.dynamic_containment,
            ServiceType::DemandTurnUp => self.demand_turn_up,
        }
    }
}

// Default carbon threshold: 150 gCO2/kWh.
fn default_carbon_threshold() -> f64 {
    150.0
}

// Default price threshold: £0.12/kWh, typical UK wholesale ceiling.
fn default_price_threshold() -> f64 {
    0.12
}

// Default minimum offer: 0.5 MW.
fn default_min_offer_capacity() -> f64 {
    0.5
}

// Default deferral horizon: 6 hours.
fn default_defer_horizon_hours() -> i64 {
    6
}

// Default cycle interval: 5 minutes, rate-limit friendly for the carbon API.
fn default_cycle_interval_secs() -> u64 {
    300
}

// Default maximum retries: 3.
fn default_max_retries() -> u32 {
    3
}

// Default backoff base delay: 1000ms.
fn default_base_delay_ms() -> u64 {
    1000
}

fn default_market_timeout_secs() -> u64 {
    30
}

fn default_grid_timeout_secs() -> u64 {
    5
}

fn default_grid_api_url() -> String {
    "https://api.carbonintensity.org.uk".to_string()
}

// Typical clearing prices: DM £17.50, DC £9.50, DTU £12.00 per MW/h.
fn default_dynamic_moderation_rate() -> f64 {
    17.50
}

fn default_dynamic_containment_rate() -> f64 {
    9.50
}

fn default_demand_turn_up_rate() -> f64 {
    12.00
}

impl Default for RateTable {
    fn default() -> Self {
        Self {
            dynamic_moderation: default_dynamic_moderation_rate(),
            dynamic_containment: default_dynamic_containment_rate(),
            demand_turn_up: default_demand_turn_up_rate(),
        }
    }
}

impl Default for GridFlexConfig {
    fn default() -> Self {
        Self {
            carbon_threshold_g_per_kwh: default_carbon_threshold(),
            price_threshold_gbp_per_kwh: default_price_threshold(),
            min_offer_capacity_mw: default_min_offer_capacity(),
            defer_horizon_hours: default_defer_horizon_hours(),
            cycle_interval_secs: default_cycle_interval_secs(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            market_timeout_secs: default_market_timeout_secs(),
            grid_timeout_secs: default_grid_timeout_secs(),
            grid_api_url: default_grid_api_url(),
            market_api_url: String::new(),
            rates: RateTable::default(),
        }
    }
}

impl GridFlexConfig {
    /// Loads configuration from the given path, or from `gridflex.toml` in
    /// the current directory. Missing file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new("gridflex.toml"));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<GridFlexConfig>(&contents)?
        } else {
            Self::default()
        };

        // Environment takes precedence over the file for endpoint URLs.
        if let Ok(url) = std::env::var("GRIDFLEX_GRID_URL")
            && !url.is_empty()
        {
            config.grid_api_url = url;
        }
        if let Ok(url) = std::env::var("GRIDFLEX_MARKET_URL")
            && !url.is_empty()
        {
            config.market_api_url = url;
        }

        Ok(config)
    }

    /// Retry settings for market protocol steps.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        }
    }
}
