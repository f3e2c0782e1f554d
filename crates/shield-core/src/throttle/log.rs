use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Per-job details captured when a notification is sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationJob {
    pub jobid: String,
    pub partition: String,
    pub gpus_allocated: u32,
    pub gpus_unused: u32,
    pub hours: f64,
}

/// One row per notification sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub user: String,
    pub cluster: String,
    pub alert_partitions: String,
    pub email_sent: DateTime<Utc>,
    #[serde(default)]
    pub jobs: Vec<ViolationJob>,
}

#[derive(Debug, Clone)]
pub struct ViolationLog {
    dir: PathBuf,
    violation: String,
}

impl ViolationLog {
    pub fn new(base: &Path, violation: &str) -> Self {
        Self {
            dir: base.join(violation),
            violation: violation.to_string(),
        }
    }

    pub fn violation(&self) -> &str {
        &self.violation
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn user_path(&self, user: &str) -> PathBuf {
        let safe: String = user
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    /// All records for a user, in file order, duplicates removed
    pub fn read_user(&self, user: &str) -> Result<Vec<ViolationRecord>> {
        read_records(&self.user_path(user))
    }

    pub fn append(&self, record: &ViolationRecord) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create violation directory {:?}", self.dir))?;

        let mut line = serde_json::to_vec(record).context("Failed to serialize violation record")?;
        line.push(b'\n');

        let path = self.user_path(&record.user);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open violation log {:?}", path))?;
        if ends_with_partial_line(&mut file)
            .with_context(|| format!("Failed to inspect violation log {:?}", path))?
        {
            line.insert(0, b'\n');
        }
        // Single write so concurrent appenders never interleave within a line
        file.write_all(&line)
            .with_context(|| format!("Failed to append to violation log {:?}", path))?;
        Ok(())
    }

    /// Users with a log file for this violation, sorted
    pub fn users(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {:?}", self.dir));
            }
        };

        let mut users: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    return None;
                }
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
            })
            .collect();
        users.sort();
        Ok(users)
    }

    pub fn read_all(&self) -> Result<Vec<ViolationRecord>> {
        let mut records = Vec::new();
        for user in self.users()? {
            records.extend(self.read_user(&user)?);
        }
        Ok(records)
    }
}

/// True when the file has content whose last byte is not a newline
fn ends_with_partial_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn read_records(path: &Path) -> Result<Vec<ViolationRecord>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
    };

    let mut records: Vec<ViolationRecord> = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ViolationRecord>(line) {
            Ok(record) => {
                if !records.contains(&record) {
                    records.push(record);
                }
            }
            Err(e) => {
                // A concurrent writer may leave a partial trailing line
                warn!(path = %path.display(), line = lineno + 1, error = %e, "Skipping violation record");
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn record(user: &str, secs: i64) -> ViolationRecord {
        ViolationRecord {
            user: user.to_string(),
            cluster: "della".to_string(),
            alert_partitions: "gpu".to_string(),
            email_sent: Utc.timestamp_opt(secs, 0).unwrap(),
            jobs: vec![ViolationJob {
                jobid: "42".to_string(),
                partition: "gpu".to_string(),
                gpus_allocated: 2,
                gpus_unused: 2,
                hours: 1.5,
            }],
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let log = ViolationLog::new(dir.path(), "zero_gpu_first_warning");

        log.append(&record("alice", 100)).unwrap();
        log.append(&record("alice", 200)).unwrap();

        let records = log.read_user("alice").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].email_sent.timestamp(), 200);
        assert!(log.user_path("alice").starts_with(dir.path().join("zero_gpu_first_warning")));
    }

    #[test]
    fn test_duplicates_collapse_on_read() {
        let dir = TempDir::new().unwrap();
        let log = ViolationLog::new(dir.path(), "v");

        log.append(&record("alice", 100)).unwrap();
        log.append(&record("alice", 100)).unwrap();

        assert_eq!(log.read_user("alice").unwrap().len(), 1);
    }

    #[test]
    fn test_partial_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let log = ViolationLog::new(dir.path(), "v");
        log.append(&record("alice", 100)).unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(log.user_path("alice"))
            .unwrap();
        file.write_all(b"{\"user\":\"alice\",\"clus").unwrap();

        assert_eq!(log.read_user("alice").unwrap().len(), 1);
    }

    #[test]
    fn test_append_after_partial_line_starts_new_line() {
        let dir = TempDir::new().unwrap();
        let log = ViolationLog::new(dir.path(), "v");
        std::fs::create_dir_all(log.dir()).unwrap();
        std::fs::write(log.user_path("alice"), b"{\"user\":\"alice\",\"clus").unwrap();

        log.append(&record("alice", 100)).unwrap();
        log.append(&record("alice", 200)).unwrap();

        let records = log.read_user("alice").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].email_sent.timestamp(), 100);
        let contents = std::fs::read_to_string(log.user_path("alice")).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn test_users_listing() {
        let dir = TempDir::new().unwrap();
        let log = ViolationLog::new(dir.path(), "v");
        assert!(log.users().unwrap().is_empty());

        log.append(&record("bob", 1)).unwrap();
        log.append(&record("alice", 1)).unwrap();

        assert_eq!(log.users().unwrap(), vec!["alice", "bob"]);
        assert_eq!(log.read_all().unwrap().len(), 2);
    }
}
