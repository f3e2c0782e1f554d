//! Job state cache inspection

use anyhow::{bail, Result};
use chrono::{Local, TimeZone, Utc};
use serde::Serialize;
use shield_core::cache::JobStateCache;
use shield_core::ShieldConfig;
use tabled::Tabled;

use crate::output::{color_status, format_age, print_info, print_json, print_table, OutputFormat};

#[derive(Tabled, Serialize)]
struct CacheRow {
    #[tabled(rename = "Job ID")]
    jobid: String,
    #[tabled(rename = "Last checked")]
    last_checked: String,
    #[tabled(rename = "Age")]
    age: String,
    #[tabled(rename = "Status")]
    status: String,
}

/// List the cached verdicts of one alert. Deleting the file is always safe;
/// the next cycle simply re-queries every job.
pub fn show_cache(config: &ShieldConfig, alert: &str, format: OutputFormat) -> Result<()> {
    let Some(settings) = config.alert(alert) else {
        bail!("no valid alert named {:?}", alert);
    };
    let Some(dir) = &settings.cache_dir else {
        bail!("alert {:?} has no jobid_cache_path", alert);
    };

    let cache = JobStateCache::open(dir, &settings.scope)?;
    let now = Utc::now();
    let rows: Vec<CacheRow> = cache
        .entries()
        .map(|entry| {
            let checked = Local
                .timestamp_opt(entry.last_checked, 0)
                .single()
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| entry.last_checked.to_string());
            let status = if entry.is_idle() {
                format!("idle ({})", entry.idle_gpu_count)
            } else {
                "active".to_string()
            };
            CacheRow {
                jobid: entry.jobid.to_string(),
                last_checked: checked,
                age: format_age(entry.age(now)),
                status,
            }
        })
        .collect();

    match format {
        OutputFormat::Json => print_json(&rows),
        OutputFormat::Table => {
            if let Some(path) = cache.path() {
                print_info(&path.display().to_string());
            }
            let rows: Vec<CacheRow> = rows
                .into_iter()
                .map(|r| CacheRow {
                    status: color_status(&r.status),
                    ..r
                })
                .collect();
            print_table(&rows, format);
        }
    }
    Ok(())
}
