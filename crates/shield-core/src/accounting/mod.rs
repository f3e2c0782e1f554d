//! Scheduler accounting boundary

mod sacct;

pub use sacct::{parse_sacct_line, parse_sacct_output, SacctAccounting, SacctParseError, SACCT_FIELDS};

use crate::models::{Job, Scope};
use anyhow::Result;
use async_trait::async_trait;

/// Source of currently running jobs
#[async_trait]
pub trait AccountingSource: Send + Sync {
    /// Running jobs in the scope's cluster and partitions
    async fn running_jobs(&self, scope: &Scope) -> Result<Vec<Job>>;
}
