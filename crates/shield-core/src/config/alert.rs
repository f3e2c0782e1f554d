use crate::enforcement::TemplateFiles;
use crate::models::Scope;
use crate::policy::{
    AlertPolicy, FixedWindow, InteractiveExemption, PolicyError, SlidingWindow, WindowPolicy,
};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            OneOrMany::Many(v) => v,
        }
    }
}

/// One `cancel_zero_gpu_jobs` block as written in the config file
#[derive(Debug, Clone, Deserialize)]
pub struct RawAlertConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub cluster: String,
    partitions: OneOrMany,
    pub sampling_period_minutes: u64,

    #[serde(default)]
    pub first_warning_minutes: Option<u64>,
    #[serde(default)]
    pub second_warning_minutes: Option<u64>,
    #[serde(default)]
    pub cancel_minutes: Option<u64>,

    #[serde(default)]
    pub sliding_warning_minutes: Option<u64>,
    #[serde(default)]
    pub sliding_cancel_minutes: Option<u64>,

    #[serde(default = "default_active_recheck_fraction")]
    pub active_recheck_fraction: f64,
    /// Re-check jobs known active under the fixed window after this long; never when unset
    #[serde(default)]
    pub fixed_recheck_minutes: Option<u64>,

    #[serde(default)]
    pub max_idle_utilization: f64,
    #[serde(default = "default_gpu_frac_threshold")]
    pub gpu_frac_threshold: f64,
    #[serde(default = "default_scan_budget_fraction")]
    pub scan_budget_fraction: f64,

    #[serde(default)]
    pub jobid_cache_path: Option<PathBuf>,

    #[serde(default)]
    pub max_interactive_hours: Option<u64>,
    #[serde(default)]
    pub max_interactive_gpus: Option<u32>,
    #[serde(default = "default_interactive_prefixes")]
    pub interactive_prefixes: Vec<String>,

    #[serde(default)]
    pub excluded_users: Vec<String>,

    #[serde(default = "default_days_between_emails")]
    pub days_between_emails: u64,
    #[serde(default)]
    pub do_not_cancel: bool,
    #[serde(default)]
    pub warnings_to_admin: bool,
    #[serde(default = "default_email_subject")]
    pub email_subject: String,

    #[serde(default)]
    pub email_file_first_warning: Option<String>,
    #[serde(default)]
    pub email_file_second_warning: Option<String>,
    #[serde(default)]
    pub email_file_sliding_warning: Option<String>,
    #[serde(default)]
    pub email_file_cancel: Option<String>,
}

fn default_active_recheck_fraction() -> f64 {
    0.5
}

fn default_gpu_frac_threshold() -> f64 {
    1.0
}

fn default_scan_budget_fraction() -> f64 {
    0.5
}

fn default_interactive_prefixes() -> Vec<String> {
    vec!["sys/dashboard".to_string(), "interactive".to_string()]
}

fn default_days_between_emails() -> u64 {
    1
}

fn default_email_subject() -> String {
    "Jobs with Zero GPU Utilization".to_string()
}

/// Immutable, validated settings for one alert instance
#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub name: String,
    pub scope: Scope,
    pub policy: AlertPolicy,
    pub cache_dir: Option<PathBuf>,
    pub days_between_emails: u64,
    pub do_not_cancel: bool,
    pub warnings_to_admin: bool,
    pub email_subject: String,
    pub templates: TemplateFiles,
}

impl RawAlertConfig {
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("cancel_zero_gpu_jobs[{index}]"))
    }

    fn window(&self) -> Result<WindowPolicy, PolicyError> {
        let fixed = match self.cancel_minutes {
            Some(cancel_minutes) => Some(FixedWindow {
                first_warning_minutes: self.first_warning_minutes,
                second_warning_minutes: self.second_warning_minutes,
                cancel_minutes,
            }),
            None if self.first_warning_minutes.is_some()
                || self.second_warning_minutes.is_some() =>
            {
                return Err(PolicyError::WarningWithoutCancel);
            }
            None => None,
        };

        let sliding = match (self.sliding_warning_minutes, self.sliding_cancel_minutes) {
            (Some(warning_minutes), Some(cancel_minutes)) => Some(SlidingWindow {
                warning_minutes,
                cancel_minutes,
            }),
            (None, None) => None,
            _ => return Err(PolicyError::IncompleteSliding),
        };

        match (fixed, sliding) {
            (Some(fixed), Some(sliding)) => Ok(WindowPolicy::Both { fixed, sliding }),
            (Some(fixed), None) => Ok(WindowPolicy::FixedOnly(fixed)),
            (None, Some(sliding)) => Ok(WindowPolicy::SlidingOnly(sliding)),
            (None, None) => Err(PolicyError::NoWindow),
        }
    }

    pub fn into_settings(self, index: usize) -> Result<AlertSettings, PolicyError> {
        let name = self.display_name(index);
        let window = self.window()?;

        let interactive = match (self.max_interactive_hours, self.max_interactive_gpus) {
            (Some(max_hours), Some(max_gpus)) => Some(InteractiveExemption {
                prefixes: self.interactive_prefixes.clone(),
                max_gpus,
                max_hours,
            }),
            _ => None,
        };

        let policy = AlertPolicy {
            window,
            sampling_period_minutes: self.sampling_period_minutes,
            max_idle_utilization: self.max_idle_utilization,
            gpu_frac_threshold: self.gpu_frac_threshold,
            active_recheck_fraction: self.active_recheck_fraction,
            fixed_recheck_minutes: self.fixed_recheck_minutes,
            scan_budget_fraction: self.scan_budget_fraction,
            interactive,
            excluded_users: self.excluded_users.iter().cloned().collect(),
        };
        policy.validate()?;

        Ok(AlertSettings {
            name,
            scope: Scope::new(self.cluster, self.partitions.into_vec()),
            policy,
            cache_dir: self.jobid_cache_path,
            days_between_emails: self.days_between_emails,
            do_not_cancel: self.do_not_cancel,
            warnings_to_admin: self.warnings_to_admin,
            email_subject: self.email_subject,
            templates: TemplateFiles {
                first_warning: self.email_file_first_warning,
                second_warning: self.email_file_second_warning,
                sliding_warning: self.email_file_sliding_warning,
                cancel: self.email_file_cancel,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawAlertConfig {
        serde_json::from_value(serde_json::json!({
            "cluster": "della",
            "partitions": "gpu, mig",
            "sampling_period_minutes": 10,
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let mut block = raw();
        block.cancel_minutes = Some(120);
        let settings = block.into_settings(0).unwrap();

        assert_eq!(settings.name, "cancel_zero_gpu_jobs[0]");
        assert_eq!(settings.scope.partition_key(), "gpu,mig");
        assert_eq!(settings.days_between_emails, 1);
        assert_eq!(settings.policy.active_recheck_fraction, 0.5);
        assert_eq!(settings.policy.scan_budget_fraction, 0.5);
        assert_eq!(settings.policy.fixed_recheck_minutes, None);
        assert!(!settings.do_not_cancel);
    }

    #[test]
    fn test_both_windows() {
        let mut block = raw();
        block.cancel_minutes = Some(120);
        block.sliding_warning_minutes = Some(60);
        block.sliding_cancel_minutes = Some(120);
        let settings = block.into_settings(0).unwrap();
        assert!(matches!(settings.policy.window, WindowPolicy::Both { .. }));
    }

    #[test]
    fn test_rejects_missing_window() {
        assert_eq!(raw().into_settings(0).unwrap_err(), PolicyError::NoWindow);
    }

    #[test]
    fn test_rejects_half_sliding_pair() {
        let mut block = raw();
        block.sliding_warning_minutes = Some(60);
        assert_eq!(
            block.into_settings(0).unwrap_err(),
            PolicyError::IncompleteSliding
        );
    }

    #[test]
    fn test_rejects_warning_without_cancel() {
        let mut block = raw();
        block.first_warning_minutes = Some(60);
        assert_eq!(
            block.into_settings(0).unwrap_err(),
            PolicyError::WarningWithoutCancel
        );
    }

    #[test]
    fn test_rejects_invalid_fraction() {
        let mut block = raw();
        block.cancel_minutes = Some(120);
        block.scan_budget_fraction = 1.5;
        assert!(matches!(
            block.into_settings(0),
            Err(PolicyError::FractionOutOfRange { .. })
        ));
    }
}
