//! GridFlex command-line interface, built on clap.
//!
//! Defines the [`Cli`] struct with the [`Command`] subcommands (run, demo)
//! and global flags (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// GridFlex — carbon-aware compute scheduling and flexibility monetization.
#[derive(Debug, Parser)]
#[command(name = "gridflex", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file (default: ./gridflex.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose (debug-level) logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scheduling loop against the configured endpoints.
    Run {
        /// Stop after this many cycles (runs until ctrl-c if omitted).
        #[arg(long)]
        cycles: Option<u64>,

        /// Use the simulated grid provider instead of the live API.
        #[arg(long, default_value_t = false)]
        simulate: bool,
    },

    /// Populate the queue with simulated jobs and run one cycle offline.
    Demo {
        /// Number of simulated jobs to generate.
        #[arg(long, default_value_t = 10)]
        jobs: usize,
    },
}
