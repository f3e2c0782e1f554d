use super::AccountingSource;
use crate::models::{Job, JobId, JobState, Scope, TimeLimit};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Field order requested from `sacct -o`. `jobname` is last because it may contain `|`.
pub const SACCT_FIELDS: &str =
    "jobid,user,cluster,partition,state,elapsedraw,alloctres,timelimitraw,jobname";

const FIELD_COUNT: usize = 9;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SacctParseError {
    #[error("expected 9 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid {field} value '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("job spans multiple partitions: {0}")]
    MultiPartition(String),
}

/// Parse one line of `sacct -P -n` output in `SACCT_FIELDS` order
pub fn parse_sacct_line(
    line: &str,
    renamings: &HashMap<String, String>,
) -> Result<Job, SacctParseError> {
    let fields: Vec<&str> = line.splitn(FIELD_COUNT, '|').collect();
    if fields.len() != FIELD_COUNT {
        return Err(SacctParseError::FieldCount(fields.len()));
    }

    let partition = fields[3].trim();
    if partition.contains(',') {
        return Err(SacctParseError::MultiPartition(partition.to_string()));
    }
    let partition = renamings
        .get(partition)
        .cloned()
        .unwrap_or_else(|| partition.to_string());

    let elapsed_secs = fields[5]
        .trim()
        .parse::<u64>()
        .map_err(|_| SacctParseError::InvalidField {
            field: "elapsedraw",
            value: fields[5].to_string(),
        })?;

    Ok(Job {
        jobid: JobId::from(fields[0].trim()),
        user: fields[1].trim().to_string(),
        cluster: fields[2].trim().to_string(),
        partition,
        state: JobState::parse(fields[4]),
        name: fields[8].to_string(),
        elapsed_secs,
        gpus: gpus_from_tres(fields[6]),
        time_limit: parse_time_limit(fields[7])?,
    })
}

/// Parse full `sacct` output, skipping malformed lines
pub fn parse_sacct_output(output: &str, renamings: &HashMap<String, String>) -> Vec<Job> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match parse_sacct_line(line, renamings) {
            Ok(job) => Some(job),
            Err(e) => {
                debug!(line = %line, error = %e, "Skipping sacct line");
                None
            }
        })
        .collect()
}

/// GPU count from an AllocTRES string such as `cpu=8,mem=64G,node=1,gres/gpu=2`
fn gpus_from_tres(tres: &str) -> u32 {
    tres.split(',')
        .find_map(|item| item.trim().strip_prefix("gres/gpu="))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn parse_time_limit(s: &str) -> Result<TimeLimit, SacctParseError> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("unlimited") || s.eq_ignore_ascii_case("partition_limit") {
        return Ok(TimeLimit::Unlimited);
    }
    s.parse::<u64>()
        .map(TimeLimit::Minutes)
        .map_err(|_| SacctParseError::InvalidField {
            field: "timelimitraw",
            value: s.to_string(),
        })
}

/// Running jobs via `sacct`
pub struct SacctAccounting {
    sacct_path: PathBuf,
    timeout: Duration,
    partition_renamings: HashMap<String, String>,
}

impl SacctAccounting {
    pub fn new(
        sacct_path: impl Into<PathBuf>,
        timeout: Duration,
        partition_renamings: HashMap<String, String>,
    ) -> Self {
        Self {
            sacct_path: sacct_path.into(),
            timeout,
            partition_renamings,
        }
    }

    fn args(scope: &Scope) -> Vec<String> {
        vec![
            "-a".to_string(),
            "-X".to_string(),
            "-P".to_string(),
            "-n".to_string(),
            "-s".to_string(),
            "R".to_string(),
            "-M".to_string(),
            scope.cluster.clone(),
            "-r".to_string(),
            scope.partition_key(),
            "-o".to_string(),
            SACCT_FIELDS.to_string(),
        ]
    }
}

#[async_trait]
impl AccountingSource for SacctAccounting {
    async fn running_jobs(&self, scope: &Scope) -> Result<Vec<Job>> {
        let args = Self::args(scope);
        debug!(sacct = %self.sacct_path.display(), ?args, "Querying running jobs");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.sacct_path)
                .args(&args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .with_context(|| format!("sacct timed out after {:?}", self.timeout))?
        .with_context(|| format!("Failed to run {}", self.sacct_path.display()))?;

        if !output.status.success() {
            bail!(
                "sacct exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let jobs = parse_sacct_output(&stdout, &self.partition_renamings);
        if jobs.is_empty() && !stdout.trim().is_empty() {
            warn!("sacct returned output but no job could be parsed");
        }
        Ok(jobs)
    }
}
