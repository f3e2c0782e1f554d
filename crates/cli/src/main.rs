//! Job Shield operator CLI
//!
//! Read-only inspection of violation logs, job state caches and the
//! configured alerts.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{alerts, cache, history, log};
use shield_core::throttle::FIRST_WARNING_VIOLATION;
use shield_core::ShieldConfig;
use std::path::PathBuf;

/// Job Shield CLI
#[derive(Parser)]
#[command(name = "jds")]
#[command(author, version, about = "Inspect Job Shield idle GPU enforcement state", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./config.yaml when present)
    #[arg(long, env = "JDS_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show which days users were emailed for a violation
    History {
        /// Violation name
        #[arg(long, default_value = FIRST_WARNING_VIOLATION)]
        violation: String,

        /// Number of days to show, ending today
        #[arg(long, default_value_t = 30)]
        days: u32,
    },

    /// Show the violation records of one user
    Log {
        user: String,

        /// Only this violation
        #[arg(long)]
        violation: Option<String>,
    },

    /// Count emails sent per user within an alert's scope
    Sent {
        /// Alert name
        alert: String,
    },

    /// List the job state cache of an alert
    Cache {
        /// Alert name
        alert: String,
    },

    /// List configured alerts
    Alerts,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ShieldConfig::load(cli.config_file.as_deref())?;

    match cli.command {
        Commands::History { violation, days } => {
            history::show_history(&config, &violation, days, cli.format)?;
        }
        Commands::Log { user, violation } => {
            log::show_log(&config, &user, violation.as_deref(), cli.format)?;
        }
        Commands::Sent { alert } => {
            history::show_sent(&config, &alert, cli.format)?;
        }
        Commands::Cache { alert } => {
            cache::show_cache(&config, &alert, cli.format)?;
        }
        Commands::Alerts => {
            alerts::show_alerts(&config, cli.format)?;
        }
    }

    Ok(())
}
