//! One enforcement cycle for one alert instance
//!
//! accounting -> classify -> cache-aware probe selection -> budgeted scan ->
//! verdicts -> cache flush -> notifications and terminations.


use crate::accounting::AccountingSource;
use crate::cache::JobStateCache;
use crate::clock::Clock;
use crate::config::AlertSettings;
use crate::enforcement::{
    AddressBook, EnforcementCoordinator, EnforcementReport, EnforcementSettings, NameResolver,
    Notifier, TemplateSet, Terminator, Throttles,
};
use crate::evaluator::{Verdict, WindowEvaluator};
use crate::observability::{ShieldMetrics, StructuredLogger};
use crate::policy::AlertPolicy;
use crate::scanner::{BudgetedScanner, ScanConfig, ScanRequest};
use crate::telemetry::TelemetrySource;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// External collaborators shared by every alert in a run
#[derive(Clone)]
pub struct Services {
    pub accounting: Arc<dyn AccountingSource>,
    pub telemetry: Arc<dyn TelemetrySource>,
    pub notifier: Arc<dyn Notifier>,
    pub terminator: Arc<dyn Terminator>,
    pub names: Arc<dyn NameResolver>,
    pub clock: Arc<dyn Clock>,
}

/// Settings that apply to every alert in a run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub violation_logs_path: PathBuf,
    pub email_files_path: Option<PathBuf>,
    pub addresses: AddressBook,
    pub admin_emails: Vec<String>,
    /// `--email`: deliver, record and cancel
    pub deliver: bool,
    pub emails_to_users: bool,
    pub emails_to_admins: bool,
    /// Leave every job running regardless of per-alert settings
    pub dry_run: bool,
    pub query_timeout: Duration,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub alert: String,
    pub jobs_seen: usize,
    pub in_scope: usize,
    pub exempt: usize,
    pub too_new: usize,
    pub cache_hits: usize,
    pub requests: usize,
    pub queried: usize,
    pub telemetry_failures: usize,
    pub budget_exhausted: bool,
    pub sliding_disabled: bool,
    pub verdicts: Vec<Verdict>,
    pub enforcement: EnforcementReport,
}

pub struct IdleGpuPipeline<'a> {
    alert: &'a AlertSettings,
    context: &'a RunContext,
    services: &'a Services,
    metrics: Option<&'a ShieldMetrics>,
    logger: StructuredLogger,
}

impl<'a> IdleGpuPipeline<'a> {
    pub fn new(
        alert: &'a AlertSettings,
        context: &'a RunContext,
        services: &'a Services,
        metrics: Option<&'a ShieldMetrics>,
    ) -> Self {
        Self {
            alert,
            context,
            services,
            metrics,
            logger: StructuredLogger::new(alert.name.clone()),
        }
    }

    /// Open the scope's cache. A sliding policy without a usable cache
    /// directory loses its sliding branch for this cycle.
    fn open_cache(&self) -> (JobStateCache, Option<AlertPolicy>, bool) {
        let policy = &self.alert.policy;
        let opened = match &self.alert.cache_dir {
            Some(dir) => JobStateCache::open(dir, &self.alert.scope),
            None if policy.window.sliding().is_some() => {
                Err(anyhow::anyhow!("sliding window requires jobid_cache_path"))
            }
            None => return (JobStateCache::ephemeral(), Some(policy.clone()), false),
        };

        match opened {
            Ok(cache) => (cache, Some(policy.clone()), false),
            Err(e) if policy.window.sliding().is_some() => {
                error!(
                    alert = %self.alert.name,
                    error = %format!("{e:#}"),
                    "Job state cache unavailable, sliding-window policy disabled for this cycle"
                );
                let degraded = policy.window.without_sliding().map(|window| AlertPolicy {
                    window,
                    ..policy.clone()
                });
                (JobStateCache::ephemeral(), degraded, true)
            }
            Err(e) => {
                error!(
                    alert = %self.alert.name,
                    error = %format!("{e:#}"),
                    "Job state cache unavailable, every fixed-window job will be sampled"
                );
                (JobStateCache::ephemeral(), Some(policy.clone()), false)
            }
        }
    }

    fn enforcement_settings(&self) -> EnforcementSettings {
        EnforcementSettings {
            deliver: self.context.deliver,
            emails_to_users: self.context.emails_to_users,
            emails_to_admins: self.context.emails_to_admins,
            admin_emails: self.context.admin_emails.clone(),
            warnings_to_admin: self.alert.warnings_to_admin,
            do_not_cancel: self.alert.do_not_cancel || self.context.dry_run,
            subject: self.alert.email_subject.clone(),
        }
    }

    pub async fn run(&self) -> Result<CycleReport> {
        let timer = Instant::now();
        let scope = &self.alert.scope;
        let mut report = CycleReport {
            alert: self.alert.name.clone(),
            ..Default::default()
        };

        self.logger.log_cycle_started(
            &scope.cluster,
            &scope.partition_key(),
            self.alert.policy.window.kind(),
        );

        let jobs = self
            .services
            .accounting
            .running_jobs(scope)
            .await
            .with_context(|| format!("Failed to list running jobs for {}", self.alert.name))?;
        report.jobs_seen = jobs.len();

        let (mut cache, policy, sliding_disabled) = self.open_cache();
        report.sliding_disabled = sliding_disabled;
        let Some(policy) = policy else {
            warn!(alert = %self.alert.name, "No window policy left to evaluate");
            return Ok(report);
        };

        let evaluator = WindowEvaluator::new(scope, &policy);
        let classification = evaluator.classify(&jobs);
        report.in_scope = classification.in_scope().count();
        report.exempt = classification.exempt.len();
        report.too_new = classification.too_new.len();

        let now = self.services.clock.now();
        let mut requests = Vec::new();
        for (job, band) in &classification.fixed {
            match evaluator.fixed_probe(*band, cache.lookup(&job.jobid), now) {
                Some(probe) => requests.push(ScanRequest {
                    job: job.clone(),
                    probe,
                    lookback: evaluator.lookback(job, probe),
                }),
                None => report.cache_hits += 1,
            }
        }
        for job in &classification.sliding {
            match evaluator.sliding_probe(job, cache.lookup(&job.jobid), now) {
                Some(probe) => requests.push(ScanRequest {
                    job: job.clone(),
                    probe,
                    lookback: evaluator.lookback(job, probe),
                }),
                None => report.cache_hits += 1,
            }
        }
        report.requests = requests.len();

        let scanner = BudgetedScanner::new(
            self.services.telemetry.clone(),
            self.services.clock.clone(),
            ScanConfig {
                budget: policy.scan_budget(),
                query_timeout: self.context.query_timeout,
                max_idle_utilization: policy.max_idle_utilization,
            },
        );
        let scan = scanner.scan(requests).await;
        report.queried = scan.processed();
        report.telemetry_failures = scan.failures;
        report.budget_exhausted = scan.budget_exhausted;
        if scan.budget_exhausted {
            self.logger
                .log_scan_budget_exhausted(scan.processed(), scan.total);
        }

        for observation in &scan.observations {
            let job = &observation.request.job;
            cache.record(&job.jobid, now, observation.idle_gpus);
            if let Some(verdict) =
                evaluator.decide(job, observation.request.probe, observation.idle_gpus)
            {
                report.verdicts.push(verdict);
            }
        }

        cache.retain_running(classification.in_scope().map(|job| &job.jobid));
        if let Err(e) = cache.flush() {
            error!(alert = %self.alert.name, error = %format!("{e:#}"), "Failed to persist job state cache");
        }

        let throttles = Throttles::new(
            &self.context.violation_logs_path,
            self.alert.days_between_emails,
            self.services.clock.clone(),
        );
        let templates = TemplateSet::load(
            self.context.email_files_path.as_deref(),
            &self.alert.templates,
        );
        let settings = self.enforcement_settings();
        let coordinator = EnforcementCoordinator {
            alert: &self.alert.name,
            scope,
            policy: &policy,
            settings: &settings,
            templates: &templates,
            addresses: &self.context.addresses,
            throttles: &throttles,
            notifier: self.services.notifier.as_ref(),
            terminator: self.services.terminator.as_ref(),
            names: self.services.names.as_ref(),
            logger: &self.logger,
            metrics: self.metrics,
        };
        report.enforcement = coordinator.enforce(report.verdicts.clone()).await;

        if let Some(metrics) = self.metrics {
            let name = &self.alert.name;
            metrics.set_jobs_in_scope(name, report.in_scope as i64);
            metrics.add_cache_hits(name, report.cache_hits as u64);
            metrics.add_telemetry_queries(
                name,
                (report.queried - report.telemetry_failures) as u64,
                report.telemetry_failures as u64,
            );
            if report.budget_exhausted {
                metrics.inc_scan_budget_exhausted(name);
            }
            metrics.observe_cycle(name, timer.elapsed().as_secs_f64());
        }

        self.logger.log_cycle_finished(
            report.in_scope,
            report.queried,
            report.cache_hits,
            report.verdicts.len(),
            timer.elapsed().as_millis(),
        );
        Ok(report)
    }
}
