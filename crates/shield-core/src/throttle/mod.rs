//! Per-user notification throttling backed by append-only violation logs
//!
//! Layout: `<violation-logs-path>/<violation>/<user>.jsonl`, one JSON record
//! per notification sent. Records are only ever appended; duplicates are
//! collapsed on read.

mod log;

pub use log::{ViolationJob, ViolationLog, ViolationRecord};

use crate::clock::Clock;
use crate::models::{Scope, HOURS_PER_DAY, SECONDS_PER_HOUR};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Violation names: the first three are throttled, cancellations are recorded only
pub const FIRST_WARNING_VIOLATION: &str = "zero_gpu_first_warning";
pub const SECOND_WARNING_VIOLATION: &str = "zero_gpu_second_warning";
pub const SLIDING_WARNING_VIOLATION: &str = "zero_gpu_sliding_warning";
pub const CANCEL_VIOLATION: &str = "cancel_zero_gpu_jobs";

pub const ALL_VIOLATIONS: [&str; 4] = [
    FIRST_WARNING_VIOLATION,
    SECOND_WARNING_VIOLATION,
    SLIDING_WARNING_VIOLATION,
    CANCEL_VIOLATION,
];

/// How many notifications a user received for a scope and how long ago the last one was
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentSummary {
    pub count: usize,
    pub days_since_last: Option<i64>,
}

impl fmt::Display for SentSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.days_since_last {
            Some(days) => write!(f, "{} ({})", self.count, days),
            None => write!(f, "{} (-)", self.count),
        }
    }
}

pub struct NotificationThrottle {
    log: ViolationLog,
    min_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl NotificationThrottle {
    pub fn new(log: ViolationLog, days_between_emails: u64, clock: Arc<dyn Clock>) -> Self {
        let secs = days_between_emails * HOURS_PER_DAY * SECONDS_PER_HOUR;
        Self {
            log,
            min_interval: Duration::seconds(secs as i64),
            clock,
        }
    }

    pub fn violation(&self) -> &str {
        self.log.violation()
    }

    fn scoped(&self, user: &str, scope: &Scope) -> Result<Vec<ViolationRecord>> {
        let key = scope.partition_key();
        Ok(self
            .log
            .read_user(user)?
            .into_iter()
            .filter(|r| r.cluster == scope.cluster && r.alert_partitions == key)
            .collect())
    }

    pub fn last_sent(&self, user: &str, scope: &Scope) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .scoped(user, scope)?
            .into_iter()
            .map(|r| r.email_sent)
            .max())
    }

    /// True when no notification was sent within the interval. Reading has no side effects.
    pub fn should_notify(&self, user: &str, scope: &Scope) -> Result<bool> {
        let Some(last) = self.last_sent(user, scope)? else {
            return Ok(true);
        };
        let since = self.clock.now() - last;
        debug!(
            user,
            violation = self.violation(),
            seconds_since_last = since.num_seconds(),
            "Checked notification throttle"
        );
        Ok(since >= self.min_interval)
    }

    /// Append a record stamped with the current time
    pub fn record(
        &self,
        user: &str,
        scope: &Scope,
        jobs: Vec<ViolationJob>,
    ) -> Result<ViolationRecord> {
        let record = ViolationRecord {
            user: user.to_string(),
            cluster: scope.cluster.clone(),
            alert_partitions: scope.partition_key(),
            email_sent: self.clock.now(),
            jobs,
        };
        self.log.append(&record)?;
        Ok(record)
    }

    pub fn sent_summary(&self, user: &str, scope: &Scope) -> Result<SentSummary> {
        let sent: BTreeSet<DateTime<Utc>> = self
            .scoped(user, scope)?
            .into_iter()
            .map(|r| r.email_sent)
            .collect();

        let days_since_last = sent.iter().next_back().map(|last| {
            let secs = (self.clock.now() - *last).num_seconds() as f64;
            (secs / (HOURS_PER_DAY * SECONDS_PER_HOUR) as f64).round() as i64
        });

        Ok(SentSummary {
            count: sent.len(),
            days_since_last,
        })
    }
}
