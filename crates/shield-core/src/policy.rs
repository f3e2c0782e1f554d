//! Alert policy: window thresholds, recheck intervals and exemptions

use crate::models::{Job, SECONDS_PER_MINUTE};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("sampling period must be greater than zero")]
    ZeroSamplingPeriod,

    #[error("alert defines neither a fixed cancel threshold nor a sliding window")]
    NoWindow,

    #[error("sliding window needs both warning and cancel durations")]
    IncompleteSliding,

    #[error("warning thresholds require a cancel threshold")]
    WarningWithoutCancel,

    #[error("second warning requires a first warning")]
    SecondWithoutFirst,

    #[error("fixed thresholds must be strictly increasing (first={first:?}, second={second:?}, cancel={cancel})")]
    FixedOutOfOrder {
        first: Option<u64>,
        second: Option<u64>,
        cancel: u64,
    },

    #[error("sliding warning ({warning} min) must be positive and shorter than sliding cancel ({cancel} min)")]
    SlidingOutOfOrder { warning: u64, cancel: u64 },

    #[error("{name} must be in (0, 1], got {value}")]
    FractionOutOfRange { name: &'static str, value: f64 },

    #[error("max idle utilization must be in [0, 100], got {0}")]
    UtilizationOutOfRange(f64),

    #[error("gpu fraction threshold must be in (0, 1], got {0}")]
    GpuFractionOutOfRange(f64),
}

/// Thresholds on total job lifetime (minutes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow {
    pub first_warning_minutes: Option<u64>,
    pub second_warning_minutes: Option<u64>,
    pub cancel_minutes: u64,
}

impl FixedWindow {
    /// Lowest threshold; jobs younger than this are not checked on the fixed path
    pub fn earliest_minutes(&self) -> u64 {
        self.first_warning_minutes.unwrap_or(self.cancel_minutes)
    }

    fn validate(&self) -> Result<(), PolicyError> {
        let out_of_order = PolicyError::FixedOutOfOrder {
            first: self.first_warning_minutes,
            second: self.second_warning_minutes,
            cancel: self.cancel_minutes,
        };

        if self.cancel_minutes == 0 {
            return Err(out_of_order);
        }
        match (self.first_warning_minutes, self.second_warning_minutes) {
            (None, Some(_)) => Err(PolicyError::SecondWithoutFirst),
            (Some(first), None) if first >= self.cancel_minutes => Err(out_of_order),
            (Some(first), Some(second)) if first >= second || second >= self.cancel_minutes => {
                Err(out_of_order)
            }
            _ => Ok(()),
        }
    }
}

/// Idle duration within the most recent interval, independent of job age
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindow {
    pub warning_minutes: u64,
    pub cancel_minutes: u64,
}

impl SlidingWindow {
    pub fn warning(&self) -> Duration {
        minutes(self.warning_minutes)
    }

    pub fn cancel(&self) -> Duration {
        minutes(self.cancel_minutes)
    }

    fn validate(&self) -> Result<(), PolicyError> {
        if self.warning_minutes == 0 || self.warning_minutes >= self.cancel_minutes {
            return Err(PolicyError::SlidingOutOfOrder {
                warning: self.warning_minutes,
                cancel: self.cancel_minutes,
            });
        }
        Ok(())
    }
}

/// Which window rules an alert applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPolicy {
    FixedOnly(FixedWindow),
    SlidingOnly(SlidingWindow),
    Both {
        fixed: FixedWindow,
        sliding: SlidingWindow,
    },
}

impl WindowPolicy {
    pub fn fixed(&self) -> Option<&FixedWindow> {
        match self {
            WindowPolicy::FixedOnly(fixed) | WindowPolicy::Both { fixed, .. } => Some(fixed),
            WindowPolicy::SlidingOnly(_) => None,
        }
    }

    pub fn sliding(&self) -> Option<&SlidingWindow> {
        match self {
            WindowPolicy::SlidingOnly(sliding) | WindowPolicy::Both { sliding, .. } => {
                Some(sliding)
            }
            WindowPolicy::FixedOnly(_) => None,
        }
    }

    /// The policy with its sliding branch removed, if anything remains
    pub fn without_sliding(&self) -> Option<WindowPolicy> {
        self.fixed().copied().map(WindowPolicy::FixedOnly)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WindowPolicy::FixedOnly(_) => "fixed",
            WindowPolicy::SlidingOnly(_) => "sliding",
            WindowPolicy::Both { .. } => "fixed+sliding",
        }
    }
}

/// Short interactive sessions are never warned or cancelled
#[derive(Debug, Clone, PartialEq)]
pub struct InteractiveExemption {
    pub prefixes: Vec<String>,
    pub max_gpus: u32,
    pub max_hours: u64,
}

impl InteractiveExemption {
    pub fn exempts(&self, job: &Job) -> bool {
        let interactive_name = self.prefixes.iter().any(|p| job.name.starts_with(p));
        let short_limit = job
            .time_limit
            .minutes()
            .map(|m| m <= self.max_hours * 60)
            .unwrap_or(false);
        interactive_name && job.gpus <= self.max_gpus && short_limit
    }
}

/// How long a cached verdict stays valid. `None` means never re-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecheckPolicy {
    pub active: Option<Duration>,
    pub idle: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertPolicy {
    pub window: WindowPolicy,
    pub sampling_period_minutes: u64,
    /// A GPU whose utilization is at or below this value counts as idle
    pub max_idle_utilization: f64,
    /// Flag a job when its used fraction of GPUs is below this value
    pub gpu_frac_threshold: f64,
    pub active_recheck_fraction: f64,
    pub fixed_recheck_minutes: Option<u64>,
    pub scan_budget_fraction: f64,
    pub interactive: Option<InteractiveExemption>,
    pub excluded_users: BTreeSet<String>,
}

impl AlertPolicy {
    pub fn new(window: WindowPolicy, sampling_period_minutes: u64) -> Self {
        Self {
            window,
            sampling_period_minutes,
            max_idle_utilization: 0.0,
            gpu_frac_threshold: 1.0,
            active_recheck_fraction: 0.5,
            fixed_recheck_minutes: None,
            scan_budget_fraction: 0.5,
            interactive: None,
            excluded_users: BTreeSet::new(),
        }
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.sampling_period_minutes == 0 {
            return Err(PolicyError::ZeroSamplingPeriod);
        }
        if let Some(fixed) = self.window.fixed() {
            fixed.validate()?;
        }
        if let Some(sliding) = self.window.sliding() {
            sliding.validate()?;
        }
        check_fraction("active_recheck_fraction", self.active_recheck_fraction)?;
        check_fraction("scan_budget_fraction", self.scan_budget_fraction)?;
        if !(0.0..=100.0).contains(&self.max_idle_utilization) {
            return Err(PolicyError::UtilizationOutOfRange(self.max_idle_utilization));
        }
        if !(self.gpu_frac_threshold > 0.0 && self.gpu_frac_threshold <= 1.0) {
            return Err(PolicyError::GpuFractionOutOfRange(self.gpu_frac_threshold));
        }
        Ok(())
    }

    pub fn sampling_period(&self) -> Duration {
        minutes(self.sampling_period_minutes)
    }

    /// Wall-clock share of one sampling period the scanner may spend
    pub fn scan_budget(&self) -> Duration {
        self.sampling_period().mul_f64(self.scan_budget_fraction)
    }

    /// Minimum elapsed lifetime before a job enters the sliding path.
    ///
    /// With both policies the sliding path starts only after the fixed cancel
    /// band has closed plus one full sliding warning window.
    pub fn sliding_start(&self) -> Option<Duration> {
        match &self.window {
            WindowPolicy::FixedOnly(_) => None,
            WindowPolicy::SlidingOnly(sliding) => Some(sliding.warning()),
            WindowPolicy::Both { fixed, sliding } => Some(
                minutes(fixed.cancel_minutes) + sliding.warning() + self.sampling_period(),
            ),
        }
    }

    /// Fixed path: active jobs are pre-approved until the optional fixed
    /// recheck interval, idle jobs are re-sampled every cycle.
    pub fn fixed_recheck(&self) -> RecheckPolicy {
        RecheckPolicy {
            active: self.fixed_recheck_minutes.map(minutes),
            idle: Duration::ZERO,
        }
    }

    /// Sliding path: active entries expire faster than idle ones so a job
    /// that goes idle is noticed within a fraction of the warning window.
    pub fn sliding_recheck(&self) -> Option<RecheckPolicy> {
        self.window.sliding().map(|sliding| RecheckPolicy {
            active: Some(sliding.warning().mul_f64(self.active_recheck_fraction)),
            idle: sliding.cancel().saturating_sub(sliding.warning()),
        })
    }

    /// True when the used share of the job's GPUs falls below the threshold
    pub fn is_flagged(&self, job: &Job, idle_gpus: u32) -> bool {
        if job.gpus == 0 || idle_gpus == 0 {
            return false;
        }
        let idle = idle_gpus.min(job.gpus);
        let used_fraction = (job.gpus - idle) as f64 / job.gpus as f64;
        used_fraction < self.gpu_frac_threshold
    }
}

fn check_fraction(name: &'static str, value: f64) -> Result<(), PolicyError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(PolicyError::FractionOutOfRange { name, value })
    }
}

pub(crate) fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * SECONDS_PER_MINUTE)
}
