//! Per-user violation records

use anyhow::Result;
use chrono::Local;
use serde::Serialize;
use shield_core::throttle::{ViolationLog, ALL_VIOLATIONS};
use shield_core::ShieldConfig;
use tabled::Tabled;

use super::history::check_violation;
use crate::output::{print_table, OutputFormat};

#[derive(Tabled, Serialize)]
struct RecordRow {
    #[tabled(rename = "Violation")]
    violation: String,
    #[tabled(rename = "Cluster")]
    cluster: String,
    #[tabled(rename = "Partitions")]
    partitions: String,
    #[tabled(rename = "Sent")]
    sent: String,
    #[tabled(rename = "Jobs")]
    jobs: String,
}

/// Show every notification recorded for `user`, oldest first
pub fn show_log(
    config: &ShieldConfig,
    user: &str,
    violation: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let violations: Vec<&str> = match violation {
        Some(v) => {
            check_violation(v)?;
            vec![v]
        }
        None => ALL_VIOLATIONS.to_vec(),
    };

    let mut records = Vec::new();
    for violation in violations {
        let log = ViolationLog::new(&config.violation_logs_path, violation);
        for record in log.read_user(user)? {
            records.push((violation, record));
        }
    }
    records.sort_by_key(|(_, r)| r.email_sent);

    let rows: Vec<RecordRow> = records
        .into_iter()
        .map(|(violation, record)| RecordRow {
            violation: violation.to_string(),
            cluster: record.cluster,
            partitions: record.alert_partitions,
            sent: record
                .email_sent
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M")
                .to_string(),
            jobs: record
                .jobs
                .iter()
                .map(|j| j.jobid.as_str())
                .collect::<Vec<_>>()
                .join(","),
        })
        .collect();

    print_table(&rows, format);
    Ok(())
}
