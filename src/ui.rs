//! Terminal surface — spinner and colored cycle output.
//!
//! Uses `indicatif` for the cycle spinner and `console` for styling.
//! [`CycleProgress`] renders one scheduling cycle as it unfolds: grid
//! conditions, per-job decisions, the revenue estimate, and the market
//! outcome.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::grid::GridSnapshot;
use crate::market::ProtocolOutcome;
use crate::orchestrator::SystemMetrics;
use crate::policy::{Decision, DecisionAction};
use crate::revenue::RevenueEstimate;

/// Visual progress for one scheduling cycle.
pub struct CycleProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    cyan: Style,
}

impl CycleProgress {
    pub fn start(message: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .expect("invalid template"),
        );
        pb.set_message(message.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            cyan: Style::new().cyan(),
        }
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }

    pub fn print_snapshot(&self, snapshot: &GridSnapshot) {
        self.pb.println(format!(
            "  {} carbon {:.0} gCO2/kWh · £{:.4}/kWh · {:.0}% renewable{}",
            self.cyan.apply_to("▣"),
            snapshot.carbon_intensity_g_per_kwh,
            snapshot.price_per_kwh,
            snapshot.renewable_percentage,
            if snapshot.peak_demand { " · peak" } else { "" },
        ));
    }

    pub fn print_decision(&self, decision: &Decision) {
        let (icon, style) = match decision.action {
            DecisionAction::ExecuteNow => ("▶", &self.green),
            DecisionAction::Defer => ("⏸", &self.yellow),
        };
        self.pb.println(format!(
            "  {} {} {} — {}",
            style.apply_to(icon),
            decision.action,
            decision.job_id,
            decision.reasoning
        ));
    }

    pub fn print_estimate(&self, estimate: &RevenueEstimate) {
        self.pb.println(format!(
            "  {} {:.2} MW as {} at £{:.2}/MW/h = {}",
            self.cyan.apply_to("£"),
            estimate.capacity_mw,
            estimate.service_type,
            estimate.rate_per_mw_hour,
            self.green
                .apply_to(format!("£{:.2}/hour", estimate.revenue_per_hour)),
        ));
    }

    pub fn print_market(&self, outcome: &ProtocolOutcome) {
        match outcome {
            ProtocolOutcome::Confirmed(tx) => {
                self.pb.println(format!(
                    "  {} booking confirmed: {} (ref {})",
                    self.green.apply_to("✓"),
                    tx.id,
                    tx.confirmation_ref.as_deref().unwrap_or("-"),
                ));
            }
            ProtocolOutcome::NoOffer => {
                self.pb.println(format!(
                    "  {} no flexibility windows on offer",
                    self.yellow.apply_to("∅")
                ));
            }
            ProtocolOutcome::Failed { reason, .. } => {
                self.pb.println(format!(
                    "  {} market transaction failed: {reason}",
                    self.red.apply_to("✗")
                ));
            }
            ProtocolOutcome::Abandoned(tx) => {
                self.pb.println(format!(
                    "  {} transaction {} abandoned — reconcile manually",
                    self.red.apply_to("!"),
                    tx.id
                ));
            }
        }
    }

    /// Print the aggregated metrics as pretty JSON.
    pub fn print_metrics(&self, metrics: &SystemMetrics) {
        println!();
        println!("{}", self.cyan.apply_to("─── System Metrics ───"));
        println!(
            "{}",
            serde_json::to_string_pretty(metrics).unwrap_or_default()
        );
    }
}
