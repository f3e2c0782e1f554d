//! GPU telemetry boundary
//!
//! A telemetry source answers one question: per-GPU utilization for a job
//! over a lookback interval. The decision code never talks to a metrics
//! backend directly; it only sees `UtilizationSample`.

mod command;
mod sample;

pub use command::{CommandTelemetry, CommandTelemetryConfig};
pub use sample::UtilizationSample;

use crate::models::JobId;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TelemetryError {
    #[error("telemetry response is missing key '{0}'")]
    MissingKey(String),

    #[error("malformed telemetry response: {0}")]
    Malformed(String),

    #[error("telemetry query timed out after {0:?}")]
    Timeout(Duration),

    #[error("telemetry unavailable: {0}")]
    Unavailable(String),
}

/// Source of per-job GPU utilization samples
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Utilization of every GPU of `jobid` averaged over the last `lookback`
    async fn query(
        &self,
        jobid: &JobId,
        cluster: &str,
        lookback: Duration,
    ) -> Result<UtilizationSample, TelemetryError>;
}
