//! CLI integration tests

use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn jds(config: Option<&Path>, args: &[&str]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_jds"));
    cmd.env_remove("JDS_CONFIG_FILE");
    if let Some(config) = config {
        cmd.arg("--config-file").arg(config);
    }
    cmd.args(args).output().expect("Failed to execute jds")
}

/// Temp directory with a config file, a violation log and a cache
fn fixture() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    std::fs::write(
        root.join("config.yaml"),
        format!(
            r#"
violation_logs_path: {root}/violations
cancel_zero_gpu_jobs:
  - name: della-gpu
    cluster: della
    partitions: [gpu]
    sampling_period_minutes: 10
    first_warning_minutes: 60
    cancel_minutes: 120
    jobid_cache_path: {root}/cache
  - name: broken
    cluster: della
    partitions: [gpu]
    sampling_period_minutes: 10
"#,
            root = root.display()
        ),
    )
    .unwrap();

    let warnings = root.join("violations/zero_gpu_first_warning");
    std::fs::create_dir_all(&warnings).unwrap();
    let sent = chrono::Utc::now().to_rfc3339();
    std::fs::write(
        warnings.join("alice.jsonl"),
        format!(
            concat!(
                r#"{{"user":"alice","cluster":"della","alert_partitions":"gpu","email_sent":"{sent}","#,
                r#""jobs":[{{"jobid":"4123","partition":"gpu","gpus_allocated":2,"gpus_unused":2,"hours":1.1}}]}}"#,
                "\n"
            ),
            sent = sent
        ),
    )
    .unwrap();

    let cache = root.join("cache");
    std::fs::create_dir_all(&cache).unwrap();
    std::fs::write(
        cache.join(".idle_gpu_cache_della_gpu.jsonl"),
        concat!(
            r#"{"schema":"job-shield/idle-gpu-cache","version":1,"cluster":"della","partitions":"gpu"}"#,
            "\n",
            r#"{"jobid":"4123","last_checked":1718000000,"idle_gpu_count":2}"#,
            "\n",
            r#"{"jobid":"4124","last_checked":1718000000,"idle_gpu_count":0}"#,
            "\n"
        ),
    )
    .unwrap();

    dir
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = jds(None, &["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("history"), "Should show history command");
    assert!(stdout.contains("log"), "Should show log command");
    assert!(stdout.contains("sent"), "Should show sent command");
    assert!(stdout.contains("cache"), "Should show cache command");
    assert!(stdout.contains("alerts"), "Should show alerts command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = jds(None, &["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("jds"), "Should show binary name");
}

#[test]
fn test_alerts_lists_valid_and_rejected() {
    let dir = fixture();
    let output = jds(Some(&dir.path().join("config.yaml")), &["alerts"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(output.status.success(), "alerts failed: {stderr}");
    assert!(stdout.contains("della-gpu"));
    assert!(stdout.contains("cancel 120"));
    assert!(stderr.contains("broken rejected"));
}

#[test]
fn test_history_counts_marks() {
    let dir = fixture();
    let output = jds(Some(&dir.path().join("config.yaml")), &["history", "--days", "7"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("alice"));
    assert!(stdout.contains("Number of X: 1"));
    assert!(stdout.contains("Number of users: 1"));
}

#[test]
fn test_history_rejects_unknown_violation() {
    let dir = fixture();
    let output = jds(
        Some(&dir.path().join("config.yaml")),
        &["history", "--violation", "bogus"],
    );
    assert!(!output.status.success());
}

#[test]
fn test_log_json() {
    let dir = fixture();
    let output = jds(
        Some(&dir.path().join("config.yaml")),
        &["--format", "json", "log", "alice"],
    );
    assert!(output.status.success());

    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rows.as_array().unwrap().len(), 1);
    assert_eq!(rows[0]["violation"], "zero_gpu_first_warning");
    assert_eq!(rows[0]["jobs"], "4123");
}

#[test]
fn test_sent_summary() {
    let dir = fixture();
    let output = jds(Some(&dir.path().join("config.yaml")), &["sent", "della-gpu"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("alice"));
    assert!(stdout.contains("1 (0)"));
    assert!(stdout.contains("0 (-)"));
}

#[test]
fn test_cache_listing() {
    let dir = fixture();
    let output = jds(
        Some(&dir.path().join("config.yaml")),
        &["--format", "json", "cache", "della-gpu"],
    );
    assert!(output.status.success());

    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rows[0]["jobid"], "4123");
    assert_eq!(rows[0]["status"], "idle (2)");
    assert_eq!(rows[1]["status"], "active");
}
