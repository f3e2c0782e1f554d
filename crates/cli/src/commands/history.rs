//! Email history grid and per-user send counts

use anyhow::{bail, Result};
use chrono::{Datelike, Duration, Local, NaiveDate, Weekday};
use colored::Colorize;
use serde::Serialize;
use shield_core::clock::SystemClock;
use shield_core::throttle::{NotificationThrottle, ViolationLog, ALL_VIOLATIONS};
use shield_core::ShieldConfig;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tabled::Tabled;

use crate::output::{print_json, print_table, OutputFormat};

pub(crate) fn check_violation(violation: &str) -> Result<()> {
    if !ALL_VIOLATIONS.contains(&violation) {
        bail!(
            "unknown violation {:?}, expected one of {}",
            violation,
            ALL_VIOLATIONS.join(", ")
        );
    }
    Ok(())
}

#[derive(Debug, Serialize, PartialEq)]
pub struct GridRow {
    pub user: String,
    /// One character per day, oldest first
    pub marks: String,
    pub sent: usize,
}

#[derive(Debug, Serialize)]
pub struct Grid {
    pub first_day: NaiveDate,
    pub last_day: NaiveDate,
    pub rows: Vec<GridRow>,
    pub total_marks: usize,
    pub users: usize,
}

/// `X` on days a notification was sent, blank on weekends, `_` otherwise
pub fn build_grid(sent: &BTreeMap<String, BTreeSet<NaiveDate>>, today: NaiveDate, days: u32) -> Grid {
    let first_day = today - Duration::days(i64::from(days.max(1)) - 1);
    let span: Vec<NaiveDate> = first_day.iter_days().take_while(|d| *d <= today).collect();

    let rows: Vec<GridRow> = sent
        .iter()
        .filter_map(|(user, dates)| {
            let marks: String = span
                .iter()
                .map(|day| {
                    if dates.contains(day) {
                        'X'
                    } else if matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                        ' '
                    } else {
                        '_'
                    }
                })
                .collect();
            let sent = marks.chars().filter(|c| *c == 'X').count();
            (sent > 0).then(|| GridRow {
                user: user.clone(),
                marks,
                sent,
            })
        })
        .collect();

    Grid {
        first_day,
        last_day: today,
        total_marks: rows.iter().map(|r| r.sent).sum(),
        users: rows.len(),
        rows,
    }
}

/// Show which days each user was emailed for one violation
pub fn show_history(
    config: &ShieldConfig,
    violation: &str,
    days: u32,
    format: OutputFormat,
) -> Result<()> {
    check_violation(violation)?;
    let log = ViolationLog::new(&config.violation_logs_path, violation);

    let mut sent: BTreeMap<String, BTreeSet<NaiveDate>> = BTreeMap::new();
    for record in log.read_all()? {
        sent.entry(record.user)
            .or_default()
            .insert(record.email_sent.with_timezone(&Local).date_naive());
    }
    let grid = build_grid(&sent, Local::now().date_naive(), days);

    match format {
        OutputFormat::Json => print_json(&grid),
        OutputFormat::Table => {
            println!("{}", violation.bold());
            println!("{} .. {}", grid.first_day, grid.last_day);
            let width = grid.rows.iter().map(|r| r.user.len()).max().unwrap_or(4).max(4);
            for row in &grid.rows {
                println!("{:<width$}  {}", row.user, row.marks, width = width);
            }
            println!();
            println!("Number of X: {}", grid.total_marks);
            println!("Number of users: {}", grid.users);
        }
    }
    Ok(())
}

#[derive(Tabled, Serialize)]
struct SentRow {
    #[tabled(rename = "User")]
    user: String,
    #[tabled(rename = "First warning")]
    first_warning: String,
    #[tabled(rename = "Second warning")]
    second_warning: String,
    #[tabled(rename = "Sliding warning")]
    sliding_warning: String,
    #[tabled(rename = "Cancelled")]
    cancelled: String,
}

/// Emails sent per user within one alert's scope, as `count (days since last)`
pub fn show_sent(config: &ShieldConfig, alert: &str, format: OutputFormat) -> Result<()> {
    let Some(settings) = config.alert(alert) else {
        bail!("no valid alert named {:?}", alert);
    };
    let clock = Arc::new(SystemClock);
    let throttles: Vec<NotificationThrottle> = ALL_VIOLATIONS
        .iter()
        .map(|violation| {
            NotificationThrottle::new(
                ViolationLog::new(&config.violation_logs_path, violation),
                settings.days_between_emails,
                clock.clone(),
            )
        })
        .collect();

    let mut users = BTreeSet::new();
    for violation in ALL_VIOLATIONS {
        users.extend(ViolationLog::new(&config.violation_logs_path, violation).users()?);
    }

    let mut rows = Vec::new();
    for user in users {
        let mut summaries = Vec::with_capacity(throttles.len());
        for throttle in &throttles {
            summaries.push(throttle.sent_summary(&user, &settings.scope)?);
        }
        if summaries.iter().all(|s| s.count == 0) {
            continue;
        }
        let [first, second, sliding, cancel] = [0, 1, 2, 3].map(|i| summaries[i].to_string());
        rows.push(SentRow {
            user,
            first_warning: first,
            second_warning: second,
            sliding_warning: sliding,
            cancelled: cancel,
        });
    }

    print_table(&rows, format);
    Ok(())
}
