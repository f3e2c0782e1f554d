//! Configured alert listing

use anyhow::Result;
use serde::Serialize;
use shield_core::policy::WindowPolicy;
use shield_core::{AlertSettings, ShieldConfig};
use tabled::Tabled;

use crate::output::{print_table, print_warning, OutputFormat};

#[derive(Tabled, Serialize)]
struct AlertRow {
    #[tabled(rename = "Alert")]
    name: String,
    #[tabled(rename = "Cluster")]
    cluster: String,
    #[tabled(rename = "Partitions")]
    partitions: String,
    #[tabled(rename = "Policy")]
    policy: String,
    #[tabled(rename = "Sampling")]
    sampling_minutes: u64,
    #[tabled(rename = "Thresholds (min)")]
    thresholds: String,
    #[tabled(rename = "Cache")]
    cache: String,
}

fn thresholds(window: &WindowPolicy) -> String {
    let mut parts = Vec::new();
    if let Some(fixed) = window.fixed() {
        let mut fixed_parts = Vec::new();
        if let Some(first) = fixed.first_warning_minutes {
            fixed_parts.push(format!("1st {first}"));
        }
        if let Some(second) = fixed.second_warning_minutes {
            fixed_parts.push(format!("2nd {second}"));
        }
        fixed_parts.push(format!("cancel {}", fixed.cancel_minutes));
        parts.push(fixed_parts.join(", "));
    }
    if let Some(sliding) = window.sliding() {
        parts.push(format!(
            "sliding {} -> {}",
            sliding.warning_minutes, sliding.cancel_minutes
        ));
    }
    parts.join("; ")
}

fn row(alert: &AlertSettings) -> AlertRow {
    AlertRow {
        name: alert.name.clone(),
        cluster: alert.scope.cluster.clone(),
        partitions: alert.scope.partition_key(),
        policy: alert.policy.window.kind().to_string(),
        sampling_minutes: alert.policy.sampling_period_minutes,
        thresholds: thresholds(&alert.policy.window),
        cache: alert
            .cache_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string()),
    }
}

/// Show every valid alert and report the rejected ones
pub fn show_alerts(config: &ShieldConfig, format: OutputFormat) -> Result<()> {
    let rows: Vec<AlertRow> = config.alerts.iter().map(row).collect();
    print_table(&rows, format);

    for rejected in &config.rejected {
        print_warning(&format!("{} rejected: {}", rejected.name, rejected.reason));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shield_core::policy::{FixedWindow, SlidingWindow};

    #[test]
    fn test_thresholds_for_both_windows() {
        let window = WindowPolicy::Both {
            fixed: FixedWindow {
                first_warning_minutes: Some(60),
                second_warning_minutes: None,
                cancel_minutes: 120,
            },
            sliding: SlidingWindow {
                warning_minutes: 60,
                cancel_minutes: 180,
            },
        };
        assert_eq!(thresholds(&window), "1st 60, cancel 120; sliding 60 -> 180");
    }
}
