//! Email rendering: per-stage templates with `<TAG>` substitution

use crate::evaluator::{Action, Verdict};
use crate::models::{Scope, MINUTES_PER_HOUR};
use crate::policy::AlertPolicy;
use crate::throttle::{
    CANCEL_VIOLATION, FIRST_WARNING_VIOLATION, SECOND_WARNING_VIOLATION,
    SLIDING_WARNING_VIOLATION,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tabled::{settings::Style, Table, Tabled};
use tracing::warn;

const INDENT: &str = "    ";

/// Notification stage; each has its own template and violation ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Stage {
    FirstWarning,
    SecondWarning,
    SlidingWarning,
    Cancel,
}

impl Stage {
    pub fn for_action(action: Action) -> Self {
        match action {
            Action::FirstWarning => Stage::FirstWarning,
            Action::SecondWarning => Stage::SecondWarning,
            Action::SlidingWarning => Stage::SlidingWarning,
            Action::FixedCancel | Action::SlidingCancel => Stage::Cancel,
        }
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, Stage::Cancel)
    }

    /// Warnings are rate limited, cancellation notices never are
    pub fn is_throttled(&self) -> bool {
        !self.is_cancel()
    }

    pub fn violation(&self) -> &'static str {
        match self {
            Stage::FirstWarning => FIRST_WARNING_VIOLATION,
            Stage::SecondWarning => SECOND_WARNING_VIOLATION,
            Stage::SlidingWarning => SLIDING_WARNING_VIOLATION,
            Stage::Cancel => CANCEL_VIOLATION,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::FirstWarning => "first_warning",
            Stage::SecondWarning => "second_warning",
            Stage::SlidingWarning => "sliding_warning",
            Stage::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// Template file names relative to the email files directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateFiles {
    #[serde(default)]
    pub first_warning: Option<String>,
    #[serde(default)]
    pub second_warning: Option<String>,
    #[serde(default)]
    pub sliding_warning: Option<String>,
    #[serde(default)]
    pub cancel: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TemplateSet {
    first_warning: String,
    second_warning: String,
    sliding_warning: String,
    cancel: String,
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self {
            first_warning: DEFAULT_FIRST_WARNING.to_string(),
            second_warning: DEFAULT_SECOND_WARNING.to_string(),
            sliding_warning: DEFAULT_SLIDING_WARNING.to_string(),
            cancel: DEFAULT_CANCEL.to_string(),
        }
    }
}

impl TemplateSet {
    /// Read configured templates, keeping the built-in text for any that is
    /// not configured or cannot be read.
    pub fn load(dir: Option<&Path>, files: &TemplateFiles) -> Self {
        let mut set = Self::default();
        let read = |name: &Option<String>, slot: &mut String| {
            let (Some(dir), Some(name)) = (dir, name) else {
                return;
            };
            let path = dir.join(name);
            match std::fs::read_to_string(&path) {
                Ok(text) => *slot = text,
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Cannot read email template, using built-in text"
                ),
            }
        };
        read(&files.first_warning, &mut set.first_warning);
        read(&files.second_warning, &mut set.second_warning);
        read(&files.sliding_warning, &mut set.sliding_warning);
        read(&files.cancel, &mut set.cancel);
        set
    }

    pub fn for_stage(&self, stage: Stage) -> &str {
        match stage {
            Stage::FirstWarning => &self.first_warning,
            Stage::SecondWarning => &self.second_warning,
            Stage::SlidingWarning => &self.sliding_warning,
            Stage::Cancel => &self.cancel,
        }
    }
}

#[derive(Tabled)]
struct WarningRow {
    #[tabled(rename = "JobID")]
    jobid: String,
    #[tabled(rename = "Cluster")]
    cluster: String,
    #[tabled(rename = "Partition")]
    partition: String,
    #[tabled(rename = "GPUs-Allocated")]
    gpus: u32,
    #[tabled(rename = "GPUs-Unused")]
    unused: u32,
    #[tabled(rename = "Hours")]
    hours: String,
}

#[derive(Tabled)]
struct CancelRow {
    #[tabled(rename = "JobID")]
    jobid: String,
    #[tabled(rename = "Cluster")]
    cluster: String,
    #[tabled(rename = "Partition")]
    partition: String,
    #[tabled(rename = "State")]
    state: &'static str,
    #[tabled(rename = "GPUs-Allocated")]
    gpus: u32,
    #[tabled(rename = "GPU-Util")]
    util: &'static str,
    #[tabled(rename = "Hours")]
    hours: String,
}

/// Indented job table for the email body
pub fn job_table(stage: Stage, verdicts: &[Verdict]) -> String {
    let table = if stage.is_cancel() {
        Table::new(verdicts.iter().map(|v| CancelRow {
            jobid: v.job.jobid.to_string(),
            cluster: v.job.cluster.clone(),
            partition: v.job.partition.clone(),
            state: "CANCELLED",
            gpus: v.job.gpus,
            util: "0%",
            hours: format!("{:.1}", v.job.elapsed_hours()),
        }))
        .with(Style::blank())
        .to_string()
    } else {
        Table::new(verdicts.iter().map(|v| WarningRow {
            jobid: v.job.jobid.to_string(),
            cluster: v.job.cluster.clone(),
            partition: v.job.partition.clone(),
            gpus: v.job.gpus,
            unused: v.idle_gpus,
            hours: format!("{:.1}", v.job.elapsed_hours()),
        }))
        .with(Style::blank())
        .to_string()
    };

    table
        .lines()
        .map(|line| format!("{INDENT}{}", line.trim_end()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render the email body for one user and stage
pub fn compose(
    stage: Stage,
    template: &str,
    greeting: &str,
    scope: &Scope,
    policy: &AlertPolicy,
    verdicts: &[Verdict],
) -> String {
    let mut tags: BTreeMap<&str, String> = BTreeMap::new();
    tags.insert("<GREETING>", greeting.to_string());
    tags.insert("<CLUSTER>", scope.cluster.clone());
    tags.insert("<PARTITIONS>", scope.partition_key());
    tags.insert("<SAMPLING>", policy.sampling_period_minutes.to_string());

    if let Some(fixed) = policy.window.fixed() {
        tags.insert("<CANCEL-MIN>", fixed.cancel_minutes.to_string());
        tags.insert("<CANCEL-HRS>", hours(fixed.cancel_minutes));
        if let Some(first) = fixed.first_warning_minutes {
            tags.insert("<MINUTES-1ST>", first.to_string());
            tags.insert("<HOURS-1ST>", hours(first));
        }
        if let Some(second) = fixed.second_warning_minutes {
            tags.insert("<MINUTES-2ND>", second.to_string());
        }
    }
    if let Some(sliding) = policy.window.sliding() {
        tags.insert("<SLIDING-WARNING-MIN>", sliding.warning_minutes.to_string());
        tags.insert("<SLIDING-CANCEL-MIN>", sliding.cancel_minutes.to_string());
        tags.entry("<CANCEL-MIN>")
            .or_insert_with(|| sliding.cancel_minutes.to_string());
        tags.entry("<CANCEL-HRS>")
            .or_insert_with(|| hours(sliding.cancel_minutes));
    }

    tags.insert("<TABLE>", job_table(stage, verdicts));
    if let Some(first) = verdicts.first() {
        tags.insert("<JOBSTATS>", format!("{INDENT}$ jobstats {}", first.job.jobid));
        tags.insert("<SCANCEL>", format!("{INDENT}$ scancel {}", first.job.jobid));
    }

    tags.iter()
        .fold(template.to_string(), |body, (tag, value)| body.replace(tag, value))
}

fn hours(minutes: u64) -> String {
    ((minutes as f64) / MINUTES_PER_HOUR as f64).round().to_string()
}

const DEFAULT_FIRST_WARNING: &str = "\
<GREETING>

You have GPU job(s) that have been running for nearly <HOURS-1ST> hour(s) but
appear to not be using the GPU(s):

<TABLE>

Your jobs will be AUTOMATICALLY CANCELLED if they are found to not be using the
GPUs for <CANCEL-MIN> minutes.

Please consider cancelling the job(s) listed above with the \"scancel\" command:

<SCANCEL>

Check the utilization of a job with:

<JOBSTATS>
";

const DEFAULT_SECOND_WARNING: &str = "\
<GREETING>

This is a second warning. The job(s) below are still not using the GPU(s) after
<MINUTES-2ND> minutes:

<TABLE>

Your jobs will be AUTOMATICALLY CANCELLED if they are found to not be using the
GPUs for <CANCEL-MIN> minutes.

Please cancel the job(s) listed above with the \"scancel\" command:

<SCANCEL>
";

const DEFAULT_SLIDING_WARNING: &str = "\
<GREETING>

The job(s) below have not used their GPU(s) during the last <SLIDING-WARNING-MIN>
minutes:

<TABLE>

Jobs whose GPUs stay idle for <SLIDING-CANCEL-MIN> minutes are AUTOMATICALLY
CANCELLED on <CLUSTER>.

Please cancel idle job(s) with the \"scancel\" command:

<SCANCEL>
";

const DEFAULT_CANCEL: &str = "\
<GREETING>

The job(s) below have been cancelled because their GPU(s) were idle:

<TABLE>

GPU jobs on <CLUSTER> (<PARTITIONS>) are cancelled automatically when they do not
use the allocated GPUs. For more information about a job:

<JOBSTATS>
";
