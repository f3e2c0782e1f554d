//! Core data models for the idle GPU pipeline

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

pub const SECONDS_PER_MINUTE: u64 = 60;
pub const SECONDS_PER_HOUR: u64 = 3600;
pub const MINUTES_PER_HOUR: u64 = 60;
pub const HOURS_PER_DAY: u64 = 24;

/// Slurm job identifier, kept as the exact string the scheduler reports.
///
/// Array tasks (`55_3`) and heterogeneous components (`55+1`) share a numeric
/// prefix with their parent, so the id is never parsed into an integer for
/// storage. Ordering is numeric on the base id and task index, falling back
/// to the raw string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn sort_key(&self) -> (Option<u64>, Option<u64>) {
        let (base, task) = match self.0.find(['_', '+']) {
            Some(idx) => (&self.0[..idx], Some(&self.0[idx + 1..])),
            None => (self.0.as_str(), None),
        };
        (
            base.parse().ok(),
            task.and_then(|t| t.parse().ok()),
        )
    }
}

impl Ord for JobId {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a_base, a_task) = self.sort_key();
        let (b_base, b_task) = other.sort_key();

        match (a_base, b_base) {
            (Some(a), Some(b)) => a
                .cmp(&b)
                .then_with(|| a_task.cmp(&b_task))
                .then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for JobId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Scheduler job state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Running,
    Pending,
    Completed,
    Cancelled,
    Other(String),
}

impl JobState {
    /// Parse a Slurm state string. All `CANCELLED by <uid>` variants unify to `Cancelled`.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.contains("CANCEL") {
            return JobState::Cancelled;
        }
        match s {
            "RUNNING" | "R" => JobState::Running,
            "PENDING" | "PD" => JobState::Pending,
            "COMPLETED" | "COM" => JobState::Completed,
            other => JobState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Running => write!(f, "RUNNING"),
            JobState::Pending => write!(f, "PENDING"),
            JobState::Completed => write!(f, "COMPLETED"),
            JobState::Cancelled => write!(f, "CANCELLED"),
            JobState::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Job time limit. Slurm reports `UNLIMITED` for jobs without a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeLimit {
    Minutes(u64),
    Unlimited,
}

impl TimeLimit {
    pub fn minutes(&self) -> Option<u64> {
        match self {
            TimeLimit::Minutes(m) => Some(*m),
            TimeLimit::Unlimited => None,
        }
    }
}

/// One currently running allocation as reported by the accounting source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub jobid: JobId,
    pub user: String,
    pub cluster: String,
    pub partition: String,
    pub state: JobState,
    pub name: String,
    pub elapsed_secs: u64,
    pub gpus: u32,
    pub time_limit: TimeLimit,
}

impl Job {
    pub fn elapsed_hours(&self) -> f64 {
        self.elapsed_secs as f64 / SECONDS_PER_HOUR as f64
    }
}

/// The cluster and partition set an alert instance covers.
///
/// Cache files and violation-log keys are derived from the scope, so two
/// alerts with different partition sets never share state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub cluster: String,
    pub partitions: BTreeSet<String>,
}

impl Scope {
    pub fn new<I, S>(cluster: impl Into<String>, partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cluster: cluster.into(),
            partitions: partitions.into_iter().map(Into::into).collect(),
        }
    }

    /// Sorted, de-duplicated, comma-joined partition list
    pub fn partition_key(&self) -> String {
        self.partitions
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Filesystem-safe tag identifying this scope
    pub fn file_tag(&self) -> String {
        let raw = format!(
            "{}_{}",
            self.cluster,
            self.partitions
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join("+")
        );
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '+' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    pub fn contains(&self, job: &Job) -> bool {
        job.cluster == self.cluster && self.partitions.contains(&job.partition)
    }
}
