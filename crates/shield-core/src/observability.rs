//! Observability infrastructure for the enforcement pipeline
//!
//! Provides:
//! - Prometheus metrics (cycle latency, telemetry queries, cache hits, notifications, cancellations)
//! - Structured JSON logging with tracing

use crate::persist::write_atomic;
use anyhow::{Context, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::path::Path;
use tracing::{error, info, warn};

/// Histogram buckets for cycle duration (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0];

/// Pipeline metrics, kept in a private registry and exported as a
/// node-exporter textfile after each run.
#[derive(Clone)]
pub struct ShieldMetrics {
    registry: Registry,
    cycles: IntCounterVec,
    cycle_duration_seconds: HistogramVec,
    jobs_in_scope: IntGaugeVec,
    telemetry_queries: IntCounterVec,
    cache_hits: IntCounterVec,
    scan_budget_exhausted: IntCounterVec,
    notifications: IntCounterVec,
    cancellations: IntCounterVec,
}

impl ShieldMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let cycles = IntCounterVec::new(
            Opts::new("job_shield_cycles_total", "Completed enforcement cycles"),
            &["alert"],
        )?;
        let cycle_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "job_shield_cycle_duration_seconds",
                "Wall-clock time of one enforcement cycle",
            )
            .buckets(CYCLE_BUCKETS.to_vec()),
            &["alert"],
        )?;
        let jobs_in_scope = IntGaugeVec::new(
            Opts::new("job_shield_jobs_in_scope", "Running GPU jobs in the alert scope"),
            &["alert"],
        )?;
        let telemetry_queries = IntCounterVec::new(
            Opts::new("job_shield_telemetry_queries_total", "Telemetry queries issued"),
            &["alert", "outcome"],
        )?;
        let cache_hits = IntCounterVec::new(
            Opts::new(
                "job_shield_cache_hits_total",
                "Jobs whose cached state made a telemetry query unnecessary",
            ),
            &["alert"],
        )?;
        let scan_budget_exhausted = IntCounterVec::new(
            Opts::new(
                "job_shield_scan_budget_exhausted_total",
                "Cycles that stopped scanning early",
            ),
            &["alert"],
        )?;
        let notifications = IntCounterVec::new(
            Opts::new("job_shield_notifications_total", "User notifications by outcome"),
            &["alert", "stage", "outcome"],
        )?;
        let cancellations = IntCounterVec::new(
            Opts::new("job_shield_cancellations_total", "Job terminations by outcome"),
            &["alert", "outcome"],
        )?;

        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(cycle_duration_seconds.clone()))?;
        registry.register(Box::new(jobs_in_scope.clone()))?;
        registry.register(Box::new(telemetry_queries.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(scan_budget_exhausted.clone()))?;
        registry.register(Box::new(notifications.clone()))?;
        registry.register(Box::new(cancellations.clone()))?;

        Ok(Self {
            registry,
            cycles,
            cycle_duration_seconds,
            jobs_in_scope,
            telemetry_queries,
            cache_hits,
            scan_budget_exhausted,
            notifications,
            cancellations,
        })
    }

    pub fn observe_cycle(&self, alert: &str, duration_secs: f64) {
        self.cycles.with_label_values(&[alert]).inc();
        self.cycle_duration_seconds
            .with_label_values(&[alert])
            .observe(duration_secs);
    }

    pub fn set_jobs_in_scope(&self, alert: &str, count: i64) {
        self.jobs_in_scope.with_label_values(&[alert]).set(count);
    }

    pub fn add_telemetry_queries(&self, alert: &str, ok: u64, failed: u64) {
        self.telemetry_queries
            .with_label_values(&[alert, "ok"])
            .inc_by(ok);
        self.telemetry_queries
            .with_label_values(&[alert, "error"])
            .inc_by(failed);
    }

    pub fn add_cache_hits(&self, alert: &str, hits: u64) {
        self.cache_hits.with_label_values(&[alert]).inc_by(hits);
    }

    pub fn inc_scan_budget_exhausted(&self, alert: &str) {
        self.scan_budget_exhausted.with_label_values(&[alert]).inc();
    }

    /// `outcome` is one of `sent`, `suppressed`, `failed`, `report_only`
    pub fn inc_notification(&self, alert: &str, stage: &str, outcome: &str) {
        self.notifications
            .with_label_values(&[alert, stage, outcome])
            .inc();
    }

    pub fn inc_cancellation(&self, alert: &str, succeeded: bool) {
        let outcome = if succeeded { "ok" } else { "failed" };
        self.cancellations.with_label_values(&[alert, outcome]).inc();
    }

    /// Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output is not UTF-8")
    }

    /// Atomically replace a textfile-collector file
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.render()?.as_bytes())
    }
}

/// Structured logger for enforcement events
///
/// Every record carries an `event` field so log pipelines can filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    alert: String,
}

impl StructuredLogger {
    pub fn new(alert: impl Into<String>) -> Self {
        Self {
            alert: alert.into(),
        }
    }

    pub fn log_cycle_started(&self, cluster: &str, partitions: &str, policy: &str) {
        info!(
            event = "cycle_started",
            alert = %self.alert,
            cluster = %cluster,
            partitions = %partitions,
            policy = %policy,
            "Starting enforcement cycle"
        );
    }

    pub fn log_warning_sent(&self, user: &str, stage: &str, jobs: usize) {
        info!(
            event = "warning_sent",
            alert = %self.alert,
            user = %user,
            stage = %stage,
            jobs = jobs,
            "Sent idle GPU warning"
        );
    }

    pub fn log_notification_suppressed(&self, user: &str, stage: &str, jobs: usize) {
        info!(
            event = "notification_suppressed",
            alert = %self.alert,
            user = %user,
            stage = %stage,
            jobs = jobs,
            "Warning suppressed by throttle"
        );
    }

    pub fn log_notification_failed(&self, user: &str, stage: &str, error: &str) {
        warn!(
            event = "notification_failed",
            alert = %self.alert,
            user = %user,
            stage = %stage,
            error = %error,
            "Failed to deliver notification"
        );
    }

    pub fn log_job_cancelled(&self, jobid: &str, user: &str, idle_gpus: u32, hours: f64) {
        warn!(
            event = "job_cancelled",
            alert = %self.alert,
            jobid = %jobid,
            user = %user,
            idle_gpus = idle_gpus,
            elapsed_hours = hours,
            "Cancelled job with idle GPUs"
        );
    }

    pub fn log_termination_failed(&self, jobid: &str, user: &str, error: &str) {
        error!(
            event = "termination_failed",
            alert = %self.alert,
            jobid = %jobid,
            user = %user,
            error = %error,
            "Failed to cancel job"
        );
    }

    pub fn log_scan_budget_exhausted(&self, processed: usize, total: usize) {
        warn!(
            event = "scan_budget_exhausted",
            alert = %self.alert,
            processed = processed,
            total = total,
            "Scan budget exhausted before all jobs were checked"
        );
    }

    pub fn log_cycle_finished(
        &self,
        in_scope: usize,
        queried: usize,
        cache_hits: usize,
        verdicts: usize,
        elapsed_ms: u128,
    ) {
        info!(
            event = "cycle_finished",
            alert = %self.alert,
            jobs_in_scope = in_scope,
            telemetry_queries = queried,
            cache_hits = cache_hits,
            verdicts = verdicts,
            elapsed_ms = elapsed_ms,
            "Enforcement cycle complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_metrics_instances_are_independent() {
        let first = ShieldMetrics::new().unwrap();
        let second = ShieldMetrics::new().unwrap();

        first.inc_cancellation("gpu", true);
        assert!(first.render().unwrap().contains("job_shield_cancellations_total"));
        assert!(!second.render().unwrap().contains("job_shield_cancellations_total{"));
    }

    #[test]
    fn test_render_contains_labels() {
        let metrics = ShieldMetrics::new().unwrap();
        metrics.inc_notification("gpu", "first_warning", "sent");
        metrics.observe_cycle("gpu", 1.5);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"stage="first_warning""#));
        assert!(text.contains("job_shield_cycles_total{alert=\"gpu\"} 1"));
    }

    #[test]
    fn test_write_textfile() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job_shield.prom");
        let metrics = ShieldMetrics::new().unwrap();
        metrics.set_jobs_in_scope("gpu", 7);

        metrics.write_textfile(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("job_shield_jobs_in_scope{alert=\"gpu\"} 7"));
    }

    #[test]
    fn test_structured_logger() {
        let logger = StructuredLogger::new("gpu");
        logger.log_cycle_started("della", "gpu", "fixed");
        logger.log_warning_sent("alice", "first_warning", 2);
        logger.log_job_cancelled("42", "alice", 1, 2.5);
        logger.log_cycle_finished(10, 3, 7, 1, 12);
    }
}
