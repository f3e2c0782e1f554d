use super::Terminator;
use crate::models::JobId;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

/// Cancels jobs with `scancel`. Requires operator privileges.
pub struct ScancelTerminator {
    scancel_path: PathBuf,
    timeout: Duration,
}

impl ScancelTerminator {
    pub fn new(scancel_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            scancel_path: scancel_path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Terminator for ScancelTerminator {
    async fn terminate(&self, jobid: &JobId) -> Result<()> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.scancel_path)
                .arg(jobid.as_str())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .with_context(|| format!("scancel {} timed out after {:?}", jobid, self.timeout))?
        .with_context(|| format!("Failed to run {}", self.scancel_path.display()))?;

        if !output.status.success() {
            bail!(
                "scancel {} exited with {}: {}",
                jobid,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let terminator = ScancelTerminator::new("/bin/false", Duration::from_secs(5));
        assert!(terminator.terminate(&JobId::from("1")).await.is_err());
    }

    #[tokio::test]
    async fn test_success() {
        let terminator = ScancelTerminator::new("/bin/true", Duration::from_secs(5));
        assert!(terminator.terminate(&JobId::from("1")).await.is_ok());
    }
}
