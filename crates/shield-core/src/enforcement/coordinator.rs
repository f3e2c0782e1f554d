use super::email::{compose, Stage, TemplateSet};
use super::greeting::NameResolver;
use super::sendmail::AddressBook;
use super::{Notification, Notifier, Terminator};
use crate::clock::Clock;
use crate::evaluator::Verdict;
use crate::models::{JobId, Scope};
use crate::observability::{ShieldMetrics, StructuredLogger};
use crate::policy::AlertPolicy;
use crate::throttle::{NotificationThrottle, ViolationJob, ViolationLog};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Delivery and termination switches for one alert
#[derive(Debug, Clone)]
pub struct EnforcementSettings {
    /// Without this nothing is delivered, recorded or cancelled
    pub deliver: bool,
    pub emails_to_users: bool,
    pub emails_to_admins: bool,
    pub admin_emails: Vec<String>,
    pub warnings_to_admin: bool,
    /// Send cancellation notices but leave the jobs running
    pub do_not_cancel: bool,
    pub subject: String,
}

impl Default for EnforcementSettings {
    fn default() -> Self {
        Self {
            deliver: false,
            emails_to_users: true,
            emails_to_admins: true,
            admin_emails: Vec::new(),
            warnings_to_admin: false,
            do_not_cancel: false,
            subject: "Jobs with Zero GPU Utilization".to_string(),
        }
    }
}

/// One violation ledger per stage so graduated warnings do not throttle each other
pub struct Throttles {
    first_warning: NotificationThrottle,
    second_warning: NotificationThrottle,
    sliding_warning: NotificationThrottle,
    cancel: NotificationThrottle,
}

impl Throttles {
    pub fn new(violation_logs_path: &Path, days_between_emails: u64, clock: Arc<dyn Clock>) -> Self {
        let throttle = |stage: Stage| {
            NotificationThrottle::new(
                ViolationLog::new(violation_logs_path, stage.violation()),
                days_between_emails,
                clock.clone(),
            )
        };
        Self {
            first_warning: throttle(Stage::FirstWarning),
            second_warning: throttle(Stage::SecondWarning),
            sliding_warning: throttle(Stage::SlidingWarning),
            cancel: throttle(Stage::Cancel),
        }
    }

    pub fn for_stage(&self, stage: Stage) -> &NotificationThrottle {
        match stage {
            Stage::FirstWarning => &self.first_warning,
            Stage::SecondWarning => &self.second_warning,
            Stage::SlidingWarning => &self.sliding_warning,
            Stage::Cancel => &self.cancel,
        }
    }
}

#[derive(Debug, Default)]
pub struct EnforcementReport {
    pub sent: Vec<(String, Stage)>,
    pub suppressed: Vec<(String, Stage)>,
    /// Notifications composed but not delivered because delivery is off
    pub report_only: Vec<(String, Stage)>,
    pub failed_deliveries: usize,
    pub cancelled: Vec<JobId>,
    pub termination_failures: Vec<JobId>,
    /// Cancel verdicts left running (report-only or do-not-cancel)
    pub not_terminated: Vec<JobId>,
}

pub struct EnforcementCoordinator<'a> {
    pub alert: &'a str,
    pub scope: &'a Scope,
    pub policy: &'a AlertPolicy,
    pub settings: &'a EnforcementSettings,
    pub templates: &'a TemplateSet,
    pub addresses: &'a AddressBook,
    pub throttles: &'a Throttles,
    pub notifier: &'a dyn Notifier,
    pub terminator: &'a dyn Terminator,
    pub names: &'a dyn NameResolver,
    pub logger: &'a StructuredLogger,
    pub metrics: Option<&'a ShieldMetrics>,
}

impl EnforcementCoordinator<'_> {
    pub async fn enforce(&self, verdicts: Vec<Verdict>) -> EnforcementReport {
        let mut report = EnforcementReport::default();

        let mut by_user: BTreeMap<String, BTreeMap<Stage, Vec<Verdict>>> = BTreeMap::new();
        for verdict in verdicts {
            by_user
                .entry(verdict.job.user.clone())
                .or_default()
                .entry(Stage::for_action(verdict.action))
                .or_default()
                .push(verdict);
        }

        let mut to_terminate: Vec<&Verdict> = Vec::new();
        for (user, stages) in &by_user {
            let greeting = self.names.greeting(user).await;
            for (stage, verdicts) in stages {
                if stage.is_cancel() {
                    to_terminate.extend(verdicts.iter());
                }
                self.notify(user, *stage, &greeting, verdicts, &mut report)
                    .await;
            }
        }

        self.terminate(&to_terminate, &mut report).await;
        report
    }

    fn count(&self, stage: Stage, outcome: &str) {
        if let Some(metrics) = self.metrics {
            metrics.inc_notification(self.alert, &stage.to_string(), outcome);
        }
    }

    async fn notify(
        &self,
        user: &str,
        stage: Stage,
        greeting: &str,
        verdicts: &[Verdict],
        report: &mut EnforcementReport,
    ) {
        let stage_name = stage.to_string();
        let throttle = self.throttles.for_stage(stage);

        if stage.is_throttled() {
            match throttle.should_notify(user, self.scope) {
                Ok(true) => {}
                Ok(false) => {
                    self.logger
                        .log_notification_suppressed(user, &stage_name, verdicts.len());
                    self.count(stage, "suppressed");
                    report.suppressed.push((user.to_string(), stage));
                    return;
                }
                Err(e) => {
                    error!(user, stage = %stage_name, error = %e, "Cannot read violation log, not sending warning");
                    self.count(stage, "suppressed");
                    report.suppressed.push((user.to_string(), stage));
                    return;
                }
            }
        }

        let body = compose(
            stage,
            self.templates.for_stage(stage),
            greeting,
            self.scope,
            self.policy,
            verdicts,
        );

        if !self.settings.deliver {
            info!(
                event = "notification_planned",
                alert = %self.alert,
                user,
                stage = %stage_name,
                jobs = verdicts.len(),
                "Delivery disabled, not sending"
            );
            self.count(stage, "report_only");
            report.report_only.push((user.to_string(), stage));
            return;
        }

        let mut delivered_to_user = false;
        if self.settings.emails_to_users {
            match self.addresses.address_for(user) {
                Some(to) => {
                    let notification = Notification {
                        to,
                        subject: self.settings.subject.clone(),
                        body: body.clone(),
                    };
                    match self.notifier.deliver(&notification).await {
                        Ok(()) => delivered_to_user = true,
                        Err(e) => {
                            self.logger
                                .log_notification_failed(user, &stage_name, &format!("{e:#}"));
                            report.failed_deliveries += 1;
                            self.count(stage, "failed");
                        }
                    }
                }
                None => {
                    self.logger.log_notification_failed(
                        user,
                        &stage_name,
                        "no email address for user",
                    );
                    report.failed_deliveries += 1;
                    self.count(stage, "failed");
                }
            }
        }

        if self.settings.emails_to_admins && (stage.is_cancel() || self.settings.warnings_to_admin) {
            for admin in &self.settings.admin_emails {
                let notification = Notification {
                    to: admin.clone(),
                    subject: self.settings.subject.clone(),
                    body: body.clone(),
                };
                if let Err(e) = self.notifier.deliver(&notification).await {
                    warn!(admin = %admin, user, stage = %stage_name, error = %format!("{e:#}"), "Failed to copy notification to admin");
                    report.failed_deliveries += 1;
                }
            }
        }

        if delivered_to_user {
            let jobs = verdicts
                .iter()
                .map(|v| ViolationJob {
                    jobid: v.job.jobid.to_string(),
                    partition: v.job.partition.clone(),
                    gpus_allocated: v.job.gpus,
                    gpus_unused: v.idle_gpus,
                    hours: (v.job.elapsed_hours() * 10.0).round() / 10.0,
                })
                .collect();
            if let Err(e) = throttle.record(user, self.scope, jobs) {
                error!(user, stage = %stage_name, error = %format!("{e:#}"), "Failed to record violation");
            }
            self.logger.log_warning_sent(user, &stage_name, verdicts.len());
            self.count(stage, "sent");
            report.sent.push((user.to_string(), stage));
        }
    }

    async fn terminate(&self, verdicts: &[&Verdict], report: &mut EnforcementReport) {
        if verdicts.is_empty() {
            return;
        }
        if !self.settings.deliver || self.settings.do_not_cancel {
            for verdict in verdicts {
                info!(
                    event = "cancellation_skipped",
                    alert = %self.alert,
                    jobid = %verdict.job.jobid,
                    user = %verdict.job.user,
                    do_not_cancel = self.settings.do_not_cancel,
                    "Leaving job running"
                );
                report.not_terminated.push(verdict.job.jobid.clone());
            }
            return;
        }

        for verdict in verdicts {
            let jobid = &verdict.job.jobid;
            match self.terminator.terminate(jobid).await {
                Ok(()) => {
                    self.logger.log_job_cancelled(
                        jobid.as_str(),
                        &verdict.job.user,
                        verdict.idle_gpus,
                        verdict.job.elapsed_hours(),
                    );
                    report.cancelled.push(jobid.clone());
                    if let Some(metrics) = self.metrics {
                        metrics.inc_cancellation(self.alert, true);
                    }
                }
                Err(e) => {
                    self.logger.log_termination_failed(
                        jobid.as_str(),
                        &verdict.job.user,
                        &format!("{e:#}"),
                    );
                    report.termination_failures.push(jobid.clone());
                    if let Some(metrics) = self.metrics {
                        metrics.inc_cancellation(self.alert, false);
                    }
                }
            }
        }
    }
}
