//! Time-budgeted telemetry scanning
//!
//! Issues telemetry queries one at a time in ascending job id order and
//! stops as soon as the cycle's wall-clock budget is spent. Jobs left
//! unscanned keep their cached state and are picked up next cycle.

use crate::clock::Clock;
use crate::evaluator::Probe;
use crate::models::Job;
use crate::telemetry::{TelemetryError, TelemetrySource};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for a scan
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Wall-clock budget for the whole scan
    pub budget: Duration,
    /// Upper bound on a single telemetry query
    pub query_timeout: Duration,
    /// GPUs at or below this utilization count as idle
    pub max_idle_utilization: f64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(300),
            query_timeout: Duration::from_secs(30),
            max_idle_utilization: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub job: Job,
    pub probe: Probe,
    pub lookback: Duration,
}

#[derive(Debug, Clone)]
pub struct Observation {
    pub request: ScanRequest,
    /// Zero when the query failed
    pub idle_gpus: u32,
    pub error: Option<TelemetryError>,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub observations: Vec<Observation>,
    pub total: usize,
    pub budget_exhausted: bool,
    pub failures: usize,
    pub elapsed: Duration,
}

impl ScanReport {
    pub fn processed(&self) -> usize {
        self.observations.len()
    }

    pub fn remaining(&self) -> usize {
        self.total - self.observations.len()
    }
}

pub struct BudgetedScanner {
    telemetry: Arc<dyn TelemetrySource>,
    clock: Arc<dyn Clock>,
    config: ScanConfig,
}

impl BudgetedScanner {
    pub fn new(
        telemetry: Arc<dyn TelemetrySource>,
        clock: Arc<dyn Clock>,
        config: ScanConfig,
    ) -> Self {
        Self {
            telemetry,
            clock,
            config,
        }
    }

    fn elapsed_since(&self, start: DateTime<Utc>) -> Duration {
        (self.clock.now() - start).to_std().unwrap_or_default()
    }

    pub async fn scan(&self, mut requests: Vec<ScanRequest>) -> ScanReport {
        requests.sort_by(|a, b| a.job.jobid.cmp(&b.job.jobid));

        let start = self.clock.now();
        let mut report = ScanReport {
            total: requests.len(),
            ..Default::default()
        };

        debug!(
            requests = report.total,
            budget_secs = self.config.budget.as_secs(),
            "Starting telemetry scan"
        );

        for request in requests {
            let result = tokio::time::timeout(
                self.config.query_timeout,
                self.telemetry
                    .query(&request.job.jobid, &request.job.cluster, request.lookback),
            )
            .await
            .unwrap_or(Err(TelemetryError::Timeout(self.config.query_timeout)));

            let (idle_gpus, error) = match result {
                Ok(sample) => (sample.idle_gpu_count(self.config.max_idle_utilization), None),
                Err(e) => {
                    warn!(
                        jobid = %request.job.jobid,
                        error = %e,
                        "Telemetry query failed, treating job as not idle"
                    );
                    report.failures += 1;
                    (0, Some(e))
                }
            };

            report.observations.push(Observation {
                request,
                idle_gpus,
                error,
            });

            if self.elapsed_since(start) > self.config.budget {
                report.budget_exhausted = report.remaining() > 0;
                break;
            }
        }

        report.elapsed = self.elapsed_since(start);
        if report.budget_exhausted {
            info!(
                processed = report.processed(),
                total = report.total,
                elapsed_secs = report.elapsed.as_secs(),
                "Scan budget exhausted, deferring remaining jobs"
            );
        }
        report
    }
}
