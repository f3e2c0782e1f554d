//! Configuration loading
//!
//! Sources, in order: the YAML file given on the command line (or
//! `./config.yaml` if present), then `JDS__*` environment variables. Raw
//! deserialized values are validated once into immutable settings.

mod alert;

pub use alert::{AlertSettings, RawAlertConfig};

use crate::enforcement::GreetingMethod;
use crate::telemetry::CommandTelemetryConfig;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::error;

pub const ENV_PREFIX: &str = "JDS";

#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    pub violation_logs_path: PathBuf,

    #[serde(default)]
    pub email_files_path: Option<PathBuf>,

    #[serde(default = "default_sender")]
    pub sender: String,

    #[serde(default)]
    pub reply_to: Option<String>,

    #[serde(default)]
    pub email_domain_name: Option<String>,

    /// Users whose address is not `<user>@<email_domain_name>`
    #[serde(default)]
    pub external_emails: HashMap<String, String>,

    #[serde(default)]
    pub admin_emails: Vec<String>,

    #[serde(default)]
    pub greeting_method: GreetingMethod,

    #[serde(default)]
    pub custom_greeting: Option<String>,

    #[serde(default = "default_sendmail_path")]
    pub sendmail_path: PathBuf,

    #[serde(default)]
    pub telemetry: CommandTelemetryConfig,

    #[serde(default = "default_sacct_path")]
    pub sacct_path: PathBuf,

    #[serde(default = "default_scancel_path")]
    pub scancel_path: PathBuf,

    /// Timeout for sacct, scancel and sendmail
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default)]
    pub partition_renamings: HashMap<String, String>,

    #[serde(default)]
    pub metrics_textfile: Option<PathBuf>,

    #[serde(default)]
    pub cancel_zero_gpu_jobs: Vec<RawAlertConfig>,
}

fn default_sender() -> String {
    "job-shield@localhost".to_string()
}

fn default_sendmail_path() -> PathBuf {
    PathBuf::from("/usr/sbin/sendmail")
}

fn default_sacct_path() -> PathBuf {
    PathBuf::from("sacct")
}

fn default_scancel_path() -> PathBuf {
    PathBuf::from("scancel")
}

fn default_command_timeout() -> u64 {
    10
}

/// An alert block that failed validation
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedAlert {
    pub name: String,
    pub reason: String,
}

/// Validated configuration for one invocation
#[derive(Debug, Clone)]
pub struct ShieldConfig {
    pub violation_logs_path: PathBuf,
    pub email_files_path: Option<PathBuf>,
    pub sender: String,
    pub reply_to: Option<String>,
    pub email_domain_name: Option<String>,
    pub external_emails: HashMap<String, String>,
    pub admin_emails: Vec<String>,
    pub greeting_method: GreetingMethod,
    pub custom_greeting: Option<String>,
    pub sendmail_path: PathBuf,
    pub telemetry: CommandTelemetryConfig,
    pub sacct_path: PathBuf,
    pub scancel_path: PathBuf,
    pub command_timeout_secs: u64,
    pub partition_renamings: HashMap<String, String>,
    pub metrics_textfile: Option<PathBuf>,
    pub alerts: Vec<AlertSettings>,
    pub rejected: Vec<RejectedAlert>,
}

impl ShieldConfig {
    /// Load from `path`, or from `./config.yaml` when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        match path {
            Some(path) => {
                if !path.is_file() {
                    bail!("configuration file {:?} not found", path);
                }
                builder = builder.add_source(config::File::from(path));
            }
            None => {
                builder = builder.add_source(config::File::with_name("config").required(false));
            }
        }

        let raw: RawConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        Ok(Self::from_raw(raw))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let raw: RawConfig = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .context("Failed to parse configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        Ok(Self::from_raw(raw))
    }

    /// Validate every alert block. Invalid blocks are logged and skipped.
    pub fn from_raw(raw: RawConfig) -> Self {
        let mut alerts = Vec::new();
        let mut rejected = Vec::new();

        for (index, block) in raw.cancel_zero_gpu_jobs.into_iter().enumerate() {
            let name = block.display_name(index);
            match block.into_settings(index) {
                Ok(settings) => alerts.push(settings),
                Err(e) => {
                    error!(alert = %name, error = %e, "Skipping invalid alert configuration");
                    rejected.push(RejectedAlert {
                        name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Self {
            violation_logs_path: raw.violation_logs_path,
            email_files_path: raw.email_files_path,
            sender: raw.sender,
            reply_to: raw.reply_to,
            email_domain_name: raw.email_domain_name,
            external_emails: raw.external_emails,
            admin_emails: raw.admin_emails,
            greeting_method: raw.greeting_method,
            custom_greeting: raw.custom_greeting,
            sendmail_path: raw.sendmail_path,
            telemetry: raw.telemetry,
            sacct_path: raw.sacct_path,
            scancel_path: raw.scancel_path,
            command_timeout_secs: raw.command_timeout_secs,
            partition_renamings: raw.partition_renamings,
            metrics_textfile: raw.metrics_textfile,
            alerts,
            rejected,
        }
    }

    pub fn ensure_violation_logs_path(&self) -> Result<()> {
        std::fs::create_dir_all(&self.violation_logs_path).with_context(|| {
            format!(
                "Failed to create violation logs directory {:?}",
                self.violation_logs_path
            )
        })
    }

    pub fn alert(&self, name: &str) -> Option<&AlertSettings> {
        self.alerts.iter().find(|a| a.name == name)
    }
}
