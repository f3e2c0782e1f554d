//! Window evaluation
//!
//! Classifies running jobs into lifetime bands, chooses which telemetry
//! probe (if any) each job needs given its cached state, and turns probe
//! results into warning or cancellation verdicts.


use crate::cache::CacheEntry;
use crate::models::{Job, JobState, Scope, SECONDS_PER_MINUTE};
use crate::policy::AlertPolicy;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Fixed-threshold band a job currently falls in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FixedBand {
    FirstWarning,
    SecondWarning,
    Cancel,
}

/// Where a job landed during classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    /// Not running, no GPUs, or another cluster/partition
    OutOfScope,
    /// Excluded user or short interactive session
    Exempt,
    /// Younger than every threshold
    TooNew,
    Fixed(FixedBand),
    Sliding,
    /// Between bands or past the fixed window with no sliding policy
    Unbanded,
}

#[derive(Debug, Default)]
pub struct Classification {
    pub fixed: Vec<(Job, FixedBand)>,
    pub sliding: Vec<Job>,
    pub too_new: Vec<Job>,
    pub exempt: Vec<Job>,
    pub unbanded: Vec<Job>,
    pub out_of_scope: usize,
}

impl Classification {
    /// Every job running in the scope, regardless of bucket
    pub fn in_scope(&self) -> impl Iterator<Item = &Job> {
        self.fixed
            .iter()
            .map(|(job, _)| job)
            .chain(self.sliding.iter())
            .chain(self.too_new.iter())
            .chain(self.exempt.iter())
            .chain(self.unbanded.iter())
    }
}

/// The telemetry question asked about one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Probe {
    /// Utilization over the job's whole lifetime
    Fixed(FixedBand),
    /// Utilization over the sliding warning window
    SlidingWarning,
    /// Utilization over the sliding cancel window
    SlidingCancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Action {
    FirstWarning,
    SecondWarning,
    SlidingWarning,
    FixedCancel,
    SlidingCancel,
}

impl Action {
    pub fn is_cancel(&self) -> bool {
        matches!(self, Action::FixedCancel | Action::SlidingCancel)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::FirstWarning => "first_warning",
            Action::SecondWarning => "second_warning",
            Action::SlidingWarning => "sliding_warning",
            Action::FixedCancel => "fixed_cancel",
            Action::SlidingCancel => "sliding_cancel",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub job: Job,
    pub action: Action,
    pub idle_gpus: u32,
}

pub struct WindowEvaluator<'a> {
    scope: &'a Scope,
    policy: &'a AlertPolicy,
}

impl<'a> WindowEvaluator<'a> {
    pub fn new(scope: &'a Scope, policy: &'a AlertPolicy) -> Self {
        Self { scope, policy }
    }

    pub fn classify_job(&self, job: &Job) -> Bucket {
        if job.state != JobState::Running || job.gpus == 0 || !self.scope.contains(job) {
            return Bucket::OutOfScope;
        }
        if self.policy.excluded_users.contains(&job.user)
            || self
                .policy
                .interactive
                .as_ref()
                .map(|e| e.exempts(job))
                .unwrap_or(false)
        {
            return Bucket::Exempt;
        }

        let elapsed = job.elapsed_secs;
        let period = self.policy.sampling_period().as_secs();

        if let Some(fixed) = self.policy.window.fixed() {
            let in_band = |minutes: u64| {
                let start = minutes * SECONDS_PER_MINUTE;
                elapsed >= start && elapsed < start + period
            };
            if in_band(fixed.cancel_minutes) {
                return Bucket::Fixed(FixedBand::Cancel);
            }
            if fixed.second_warning_minutes.map(in_band).unwrap_or(false) {
                return Bucket::Fixed(FixedBand::SecondWarning);
            }
            if fixed.first_warning_minutes.map(in_band).unwrap_or(false) {
                return Bucket::Fixed(FixedBand::FirstWarning);
            }
        }

        let sliding_start = self.policy.sliding_start().map(|d| d.as_secs());
        if let Some(start) = sliding_start {
            if elapsed >= start {
                return Bucket::Sliding;
            }
        }

        let earliest = self
            .policy
            .window
            .fixed()
            .map(|f| f.earliest_minutes() * SECONDS_PER_MINUTE)
            .into_iter()
            .chain(sliding_start)
            .min()
            .unwrap_or(0);
        if elapsed < earliest {
            Bucket::TooNew
        } else {
            Bucket::Unbanded
        }
    }

    /// Partition jobs into disjoint buckets. Exemptions are decided here,
    /// before any telemetry is requested.
    pub fn classify(&self, jobs: &[Job]) -> Classification {
        let mut out = Classification::default();
        for job in jobs {
            match self.classify_job(job) {
                Bucket::OutOfScope => out.out_of_scope += 1,
                Bucket::Exempt => out.exempt.push(job.clone()),
                Bucket::TooNew => out.too_new.push(job.clone()),
                Bucket::Fixed(band) => out.fixed.push((job.clone(), band)),
                Bucket::Sliding => out.sliding.push(job.clone()),
                Bucket::Unbanded => out.unbanded.push(job.clone()),
            }
        }
        out
    }

    /// Fixed path: a fresh active entry pre-approves the job, anything else is re-sampled
    pub fn fixed_probe(
        &self,
        band: FixedBand,
        entry: Option<&CacheEntry>,
        now: DateTime<Utc>,
    ) -> Option<Probe> {
        let recheck = self.policy.fixed_recheck();
        match entry {
            Some(entry) if entry.is_fresh(now, &recheck) => None,
            _ => Some(Probe::Fixed(band)),
        }
    }

    /// Sliding path: skip fresh entries, escalate a due idle entry to the
    /// cancel window, otherwise look at the warning window.
    pub fn sliding_probe(
        &self,
        job: &Job,
        entry: Option<&CacheEntry>,
        now: DateTime<Utc>,
    ) -> Option<Probe> {
        let recheck = self.policy.sliding_recheck()?;
        match entry {
            None => Some(Probe::SlidingWarning),
            Some(entry) if entry.is_fresh(now, &recheck) => None,
            Some(entry) if self.policy.is_flagged(job, entry.idle_gpu_count) => {
                Some(Probe::SlidingCancel)
            }
            Some(_) => Some(Probe::SlidingWarning),
        }
    }

    pub fn lookback(&self, job: &Job, probe: Probe) -> Duration {
        match probe {
            Probe::Fixed(_) => Duration::from_secs(job.elapsed_secs),
            Probe::SlidingWarning => self
                .policy
                .window
                .sliding()
                .map(|s| s.warning())
                .unwrap_or_default(),
            Probe::SlidingCancel => self
                .policy
                .window
                .sliding()
                .map(|s| s.cancel())
                .unwrap_or_default(),
        }
    }

    /// Verdict for a probe result, `None` when the job is not flagged
    pub fn decide(&self, job: &Job, probe: Probe, idle_gpus: u32) -> Option<Verdict> {
        if !self.policy.is_flagged(job, idle_gpus) {
            return None;
        }
        let action = match probe {
            Probe::Fixed(FixedBand::FirstWarning) => Action::FirstWarning,
            Probe::Fixed(FixedBand::SecondWarning) => Action::SecondWarning,
            Probe::Fixed(FixedBand::Cancel) => Action::FixedCancel,
            Probe::SlidingWarning => Action::SlidingWarning,
            Probe::SlidingCancel => Action::SlidingCancel,
        };
        Some(Verdict {
            job: job.clone(),
            action,
            idle_gpus,
        })
    }
}
