//! job-shield binary integration tests

use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn job_shield() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_job-shield"));
    cmd.env_remove("JDS_CONFIG_FILE").env("RUST_LOG", "info");
    cmd
}

#[cfg(unix)]
fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Test that the binary shows help
#[test]
fn test_help() {
    let output = job_shield().arg("--help").output().expect("Failed to execute job-shield");
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "help should succeed");
    assert!(stdout.contains("--config-file"), "Should show config option");
    assert!(stdout.contains("--email"), "Should show email option");
    assert!(stdout.contains("--dry-run"), "Should show dry-run option");
}

/// Test that the binary shows its version
#[test]
fn test_version() {
    let output = job_shield().arg("--version").output().expect("Failed to execute job-shield");
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("job-shield"));
}

#[test]
fn test_missing_config_file_fails() {
    let dir = TempDir::new().unwrap();
    let output = job_shield()
        .arg("--config-file")
        .arg(dir.path().join("absent.yaml"))
        .output()
        .expect("Failed to execute job-shield");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not found"));
}

#[test]
fn test_unknown_alert_fails() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.yaml");
    std::fs::write(
        &config,
        format!("violation_logs_path: {}\n", dir.path().join("violations").display()),
    )
    .unwrap();

    let output = job_shield()
        .arg("--config-file")
        .arg(&config)
        .args(["--alert", "nope"])
        .output()
        .expect("Failed to execute job-shield");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("nope"));
}

/// One report-only cycle against fake sacct, telemetry and scancel commands
#[cfg(unix)]
#[test]
fn test_report_only_cycle() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let cache_dir = root.join("cache");
    std::fs::create_dir(&cache_dir).unwrap();

    write_script(
        &root.join("sacct"),
        "echo '12345|alice|della|gpu|RUNNING|3900|billing=4,cpu=4,gres/gpu=1,mem=16G,node=1|600|train'",
    );
    write_script(
        &root.join("jobstats"),
        r#"echo '{"nodes": {"della-l01g1": {"gpu_utilization": {"0": 0}}}}'"#,
    );
    write_script(&root.join("scancel"), "touch \"$(dirname \"$0\")/scancel-called\"");

    let config = root.join("config.yaml");
    std::fs::write(
        &config,
        format!(
            r#"
violation_logs_path: {root}/violations
email_domain_name: princeton.edu
sacct_path: {root}/sacct
scancel_path: {root}/scancel
sendmail_path: /nonexistent/sendmail
metrics_textfile: {root}/job_shield.prom
telemetry:
  program: {root}/jobstats
  args: ["{{jobid}}"]
cancel_zero_gpu_jobs:
  - name: della-gpu
    cluster: della
    partitions: [gpu]
    sampling_period_minutes: 10
    first_warning_minutes: 60
    cancel_minutes: 120
    jobid_cache_path: {root}/cache
"#,
            root = root.display()
        ),
    )
    .unwrap();

    let output = job_shield()
        .arg("--config-file")
        .arg(&config)
        .args(["--log-format", "text"])
        .output()
        .expect("Failed to execute job-shield");
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(output.status.success(), "cycle failed: {stderr}");
    assert!(stderr.contains("notification_planned"));
    assert!(!root.join("scancel-called").exists());
    assert!(!root.join("violations/zero_gpu_first_warning").exists());

    let cache = std::fs::read_to_string(cache_dir.join(".idle_gpu_cache_della_gpu.jsonl")).unwrap();
    assert!(cache.contains("12345"));

    let metrics = std::fs::read_to_string(root.join("job_shield.prom")).unwrap();
    assert!(metrics.contains("job_shield_cycles_total{alert=\"della-gpu\"} 1"));
}
