use super::{TelemetryError, TelemetrySource, UtilizationSample};
use crate::models::JobId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// External helper invocation used to fetch GPU utilization.
///
/// Arguments may contain `{jobid}`, `{cluster}` and `{seconds}`, replaced per
/// query. The helper must print the sample JSON on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTelemetryConfig {
    #[serde(default = "default_program")]
    pub program: PathBuf,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_program() -> PathBuf {
    PathBuf::from("/usr/local/bin/jobstats")
}

fn default_args() -> Vec<String> {
    vec![
        "--json".to_string(),
        "--cluster".to_string(),
        "{cluster}".to_string(),
        "--interval".to_string(),
        "{seconds}".to_string(),
        "{jobid}".to_string(),
    ]
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for CommandTelemetryConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

pub struct CommandTelemetry {
    config: CommandTelemetryConfig,
}

impl CommandTelemetry {
    pub fn new(config: CommandTelemetryConfig) -> Self {
        Self { config }
    }

    fn render_args(&self, jobid: &JobId, cluster: &str, lookback: Duration) -> Vec<String> {
        let seconds = lookback.as_secs().to_string();
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{jobid}", jobid.as_str())
                    .replace("{cluster}", cluster)
                    .replace("{seconds}", &seconds)
            })
            .collect()
    }
}

#[async_trait]
impl TelemetrySource for CommandTelemetry {
    async fn query(
        &self,
        jobid: &JobId,
        cluster: &str,
        lookback: Duration,
    ) -> Result<UtilizationSample, TelemetryError> {
        let args = self.render_args(jobid, cluster, lookback);
        let timeout = Duration::from_secs(self.config.timeout_secs);
        debug!(program = %self.config.program.display(), ?args, "Querying telemetry");

        let output = tokio::time::timeout(
            timeout,
            Command::new(&self.config.program)
                .args(&args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| TelemetryError::Timeout(timeout))?
        .map_err(|e| {
            TelemetryError::Unavailable(format!(
                "failed to run {}: {}",
                self.config.program.display(),
                e
            ))
        })?;

        if !output.status.success() {
            return Err(TelemetryError::Unavailable(format!(
                "{} exited with {}: {}",
                self.config.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let value: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| TelemetryError::Malformed(e.to_string()))?;
        UtilizationSample::from_json(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_args_substitutes_placeholders() {
        let telemetry = CommandTelemetry::new(CommandTelemetryConfig::default());
        let args = telemetry.render_args(&JobId::from("55_3"), "della", Duration::from_secs(3600));
        assert_eq!(
            args,
            vec!["--json", "--cluster", "della", "--interval", "3600", "55_3"]
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let telemetry = CommandTelemetry::new(CommandTelemetryConfig {
            program: PathBuf::from("/nonexistent/jobstats-helper"),
            args: vec![],
            timeout_secs: 5,
        });

        let result = telemetry
            .query(&JobId::from("1"), "della", Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(TelemetryError::Unavailable(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_parses_helper_stdout() {
        let telemetry = CommandTelemetry::new(CommandTelemetryConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".to_string(),
                r#"echo '{"nodes":{"n1":{"gpu_utilization":{"0":0,"1":50}}}}'"#.to_string(),
            ],
            timeout_secs: 5,
        });

        let sample = telemetry
            .query(&JobId::from("1"), "della", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(sample.idle_gpu_count(0.0), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_helper_times_out() {
        let telemetry = CommandTelemetry::new(CommandTelemetryConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "sleep 5".to_string()],
            timeout_secs: 1,
        });

        let result = telemetry
            .query(&JobId::from("1"), "della", Duration::from_secs(60))
            .await;
        assert_eq!(result, Err(TelemetryError::Timeout(Duration::from_secs(1))));
    }
}
