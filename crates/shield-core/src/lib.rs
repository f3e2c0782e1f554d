//! Core library for idle GPU enforcement on Slurm clusters
//!
//! This crate provides:
//! - Window evaluation of running GPU jobs (fixed lifetime bands and sliding idle windows)
//! - A persistent per-scope job state cache that limits telemetry queries
//! - A time-budgeted telemetry scanner
//! - Per-user notification throttling backed by violation logs
//! - Notification delivery and job termination
//! - Metrics and structured logging

pub mod accounting;
pub mod cache;
pub mod clock;
pub mod config;
pub mod enforcement;
pub mod evaluator;
pub mod models;
pub mod observability;
pub mod persist;
pub mod pipeline;
pub mod policy;
pub mod scanner;
pub mod telemetry;
pub mod throttle;

pub use config::{AlertSettings, ShieldConfig};
pub use models::*;
pub use observability::{ShieldMetrics, StructuredLogger};
pub use pipeline::{CycleReport, IdleGpuPipeline, RunContext, Services};
