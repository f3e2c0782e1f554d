//! Notification delivery and job termination
//!
//! The coordinator turns verdicts into per-user notifications and a
//! termination list. Delivery and termination sit behind traits so the
//! pipeline can be driven by in-memory fakes.

mod coordinator;
mod email;
mod greeting;
mod scancel;
mod sendmail;

#[cfg(test)]
mod tests;

pub use coordinator::{EnforcementCoordinator, EnforcementReport, EnforcementSettings, Throttles};
pub use email::{compose, job_table, Stage, TemplateFiles, TemplateSet};
pub use greeting::{
    resolver_for, BasicGreeting, CustomGreeting, DirectoryGreeting, GreetingMethod, NameResolver,
};
pub use scancel::ScancelTerminator;
pub use sendmail::{AddressBook, SendmailNotifier};

use crate::models::JobId;
use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    /// Plain text; adapters decide how to wrap it
    pub body: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

#[async_trait]
pub trait Terminator: Send + Sync {
    async fn terminate(&self, jobid: &JobId) -> Result<()>;
}
