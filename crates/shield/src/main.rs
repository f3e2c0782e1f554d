//! Job Shield - idle GPU enforcement for Slurm clusters
//!
//! Runs one cycle over every configured alert and exits. Intended to be
//! invoked from cron once per sampling period.

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use shield_core::{
    observability::ShieldMetrics,
    pipeline::{IdleGpuPipeline, RunContext},
    ShieldConfig,
};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod services;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

/// Warn about and cancel Slurm jobs that hold idle GPUs
#[derive(Debug, Parser)]
#[command(name = "job-shield", version, about)]
struct Args {
    /// Configuration file (defaults to ./config.yaml when present)
    #[arg(long, env = "JDS_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Only run the named alert (repeatable)
    #[arg(long = "alert", value_name = "NAME")]
    alerts: Vec<String>,

    /// Deliver emails, record violations and cancel jobs. Without this flag
    /// the run reports what it would do.
    #[arg(long)]
    email: bool,

    /// Do not email users
    #[arg(long)]
    no_emails_to_users: bool,

    /// Do not copy administrators
    #[arg(long)]
    no_emails_to_admins: bool,

    /// Never cancel jobs, whatever the alert configuration says
    #[arg(long)]
    dry_run: bool,

    #[arg(long, value_enum, default_value = "json")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!(version = VERSION, email = args.email, "Starting job-shield");

    let config = ShieldConfig::load(args.config_file.as_deref())?;
    config.ensure_violation_logs_path()?;

    for name in &args.alerts {
        if config.alert(name).is_none() {
            bail!("no valid alert named {:?} in configuration", name);
        }
    }
    let selected: Vec<_> = config
        .alerts
        .iter()
        .filter(|a| args.alerts.is_empty() || args.alerts.contains(&a.name))
        .collect();
    if selected.is_empty() {
        warn!(rejected = config.rejected.len(), "No alerts to run");
    }

    let services = services::build(&config);
    let context = RunContext {
        violation_logs_path: config.violation_logs_path.clone(),
        email_files_path: config.email_files_path.clone(),
        addresses: services::address_book(&config),
        admin_emails: config.admin_emails.clone(),
        deliver: args.email,
        emails_to_users: !args.no_emails_to_users,
        emails_to_admins: !args.no_emails_to_admins,
        dry_run: args.dry_run,
        query_timeout: std::time::Duration::from_secs(config.telemetry.timeout_secs),
    };
    let metrics = ShieldMetrics::new()?;

    let mut failed = 0usize;
    for alert in selected {
        match IdleGpuPipeline::new(alert, &context, &services, Some(&metrics))
            .run()
            .await
        {
            Ok(report) => info!(
                alert = %report.alert,
                jobs_in_scope = report.in_scope,
                verdicts = report.verdicts.len(),
                sent = report.enforcement.sent.len(),
                suppressed = report.enforcement.suppressed.len(),
                planned = report.enforcement.report_only.len(),
                cancelled = report.enforcement.cancelled.len(),
                "Alert finished"
            ),
            Err(e) => {
                failed += 1;
                error!(alert = %alert.name, error = %format!("{e:#}"), "Alert cycle failed");
            }
        }
    }

    if let Some(path) = &config.metrics_textfile {
        if let Err(e) = metrics.write_textfile(path) {
            error!(path = %path.display(), error = %format!("{e:#}"), "Failed to write metrics textfile");
        }
    }

    if failed > 0 {
        bail!("{failed} alert cycle(s) failed");
    }
    Ok(())
}
