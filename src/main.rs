mod audit;
mod cli;
mod config;
mod error;
mod grid;
mod market;
mod orchestrator;
mod policy;
mod queue;
mod revenue;
mod ui;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use config::GridFlexConfig;
use grid::{CarbonIntensityApi, GridProvider, SimulatedGrid};
use market::MarketClient;
use orchestrator::Orchestrator;
use ui::CycleProgress;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "gridflex=debug"
    } else {
        "gridflex=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = GridFlexConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { cycles, simulate } => {
            let market = market_client(&config);
            let shutdown = shutdown_signal();
            if simulate {
                let orch = Orchestrator::new(SimulatedGrid, market, config, shutdown);
                run_scheduler(orch, cycles).await
            } else {
                let provider =
                    CarbonIntensityApi::new(config.grid_api_url.clone(), config.grid_timeout_secs);
                let orch = Orchestrator::new(provider, market, config, shutdown);
                run_scheduler(orch, cycles).await
            }
        }
        Command::Demo { jobs } => run_demo(config, jobs).await,
    }
}

fn market_client(config: &GridFlexConfig) -> Option<MarketClient> {
    if config.market_api_url.is_empty() {
        tracing::warn!("no market_api_url configured; deferred capacity will not be offered");
        None
    } else {
        Some(MarketClient::new(
            config.market_api_url.clone(),
            config.market_timeout_secs,
        ))
    }
}

/// Translate ctrl-c into the cooperative shutdown signal the loop checks
/// between cycles.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, requesting shutdown");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn run_scheduler<G: GridProvider>(
    mut orch: Orchestrator<G>,
    cycles: Option<u64>,
) -> Result<()> {
    orch.run(cycles).await?;

    let metrics = orch.system_metrics();
    tracing::info!(
        "scheduler stopped: {} cycles, {} decisions, {} confirmed bookings, {} audit entries",
        metrics.cycles_run,
        metrics.decisions_total,
        metrics.transactions_confirmed,
        orch.audit_log().len()
    );
    if let orchestrator::CycleHealth::Degraded { last_error, .. } = orch.cycle_health() {
        tracing::warn!("stopped while degraded: {last_error}");
    }
    for decision in orch.recent_decisions(5) {
        tracing::debug!(
            "recent decision {}: {} {} — {}",
            decision.id,
            decision.action,
            decision.job_id,
            decision.reasoning
        );
    }
    Ok(())
}

async fn run_demo(config: GridFlexConfig, jobs: usize) -> Result<()> {
    let market = market_client(&config);
    let (_shutdown_tx, shutdown) = watch::channel(false);
    let mut orch = Orchestrator::new(SimulatedGrid, market, config, shutdown);
    orch.populate_demo_queue(jobs);

    let progress = CycleProgress::start(&format!("scheduling {jobs} simulated jobs"));
    let report = orch.run_cycle().await;

    if let Some(snapshot) = &report.snapshot {
        progress.print_snapshot(snapshot);
    }
    for decision in &report.decisions {
        progress.print_decision(decision);
    }
    if let Some(estimate) = &report.estimate {
        progress.print_estimate(estimate);
    }
    if let Some(outcome) = &report.market {
        progress.print_market(outcome);
    }
    progress.finish();

    let queue = orch.queue_snapshot();
    let deferred = queue
        .iter()
        .filter(|j| j.status == queue::JobStatus::Deferred)
        .count();
    let running = queue
        .iter()
        .filter(|j| j.status == queue::JobStatus::Running)
        .count();
    println!(
        "\n{} jobs: {running} running, {deferred} deferred",
        queue.len()
    );
    progress.print_metrics(&orch.system_metrics());

    Ok(())
}
