use super::*;
use crate::clock::ManualClock;
use crate::evaluator::{Action, Verdict};
use crate::models::{Job, JobState, Scope, TimeLimit};
use crate::observability::{ShieldMetrics, StructuredLogger};
use crate::policy::{AlertPolicy, FixedWindow, WindowPolicy};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing_recipients: Vec<String>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        if self.failing_recipients.contains(&notification.to) {
            anyhow::bail!("mail server rejected {}", notification.to);
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingTerminator {
    terminated: Mutex<Vec<JobId>>,
    failing: Vec<JobId>,
}

#[async_trait]
impl Terminator for RecordingTerminator {
    async fn terminate(&self, jobid: &JobId) -> Result<()> {
        if self.failing.contains(jobid) {
            anyhow::bail!("Invalid job id specified");
        }
        self.terminated.lock().unwrap().push(jobid.clone());
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    clock: Arc<ManualClock>,
    scope: Scope,
    policy: AlertPolicy,
    settings: EnforcementSettings,
    templates: TemplateSet,
    addresses: AddressBook,
    throttles: Throttles,
    notifier: RecordingNotifier,
    terminator: RecordingTerminator,
    logger: StructuredLogger,
    metrics: ShieldMetrics,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::at_epoch(1_700_000_000));
        let throttles = Throttles::new(dir.path(), 1, clock.clone());
        Self {
            _dir: dir,
            clock,
            scope: Scope::new("della", ["gpu"]),
            policy: AlertPolicy::new(
                WindowPolicy::FixedOnly(FixedWindow {
                    first_warning_minutes: Some(60),
                    second_warning_minutes: Some(120),
                    cancel_minutes: 180,
                }),
                10,
            ),
            settings: EnforcementSettings {
                deliver: true,
                admin_emails: vec!["admin@princeton.edu".to_string()],
                ..Default::default()
            },
            templates: TemplateSet::default(),
            addresses: AddressBook::new(Some("princeton.edu".to_string()), HashMap::new()),
            throttles,
            notifier: RecordingNotifier::default(),
            terminator: RecordingTerminator::default(),
            logger: StructuredLogger::new("test"),
            metrics: ShieldMetrics::new().unwrap(),
        }
    }

    fn coordinator(&self) -> EnforcementCoordinator<'_> {
        EnforcementCoordinator {
            alert: "test",
            scope: &self.scope,
            policy: &self.policy,
            settings: &self.settings,
            templates: &self.templates,
            addresses: &self.addresses,
            throttles: &self.throttles,
            notifier: &self.notifier,
            terminator: &self.terminator,
            names: &BasicGreeting,
            logger: &self.logger,
            metrics: Some(&self.metrics),
        }
    }

    fn recipients(&self) -> Vec<String> {
        self.notifier
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.to.clone())
            .collect()
    }
}

fn verdict(id: &str, user: &str, action: Action) -> Verdict {
    Verdict {
        job: Job {
            jobid: JobId::from(id),
            user: user.to_string(),
            cluster: "della".to_string(),
            partition: "gpu".to_string(),
            state: JobState::Running,
            name: "train".to_string(),
            elapsed_secs: 3600,
            gpus: 1,
            time_limit: TimeLimit::Minutes(600),
        },
        action,
        idle_gpus: 1,
    }
}

#[tokio::test]
async fn test_second_warning_within_a_day_is_suppressed() {
    let h = Harness::new();

    let report = h
        .coordinator()
        .enforce(vec![verdict("1", "alice", Action::FirstWarning)])
        .await;
    assert_eq!(report.sent, vec![("alice".to_string(), Stage::FirstWarning)]);

    h.clock.advance_secs(3600);
    let report = h
        .coordinator()
        .enforce(vec![verdict("1", "alice", Action::FirstWarning)])
        .await;
    assert!(report.sent.is_empty());
    assert_eq!(
        report.suppressed,
        vec![("alice".to_string(), Stage::FirstWarning)]
    );
    assert_eq!(h.recipients(), vec!["alice@princeton.edu"]);
}

#[tokio::test]
async fn test_stages_are_throttled_independently() {
    let h = Harness::new();
    h.coordinator()
        .enforce(vec![verdict("1", "alice", Action::FirstWarning)])
        .await;

    h.clock.advance_secs(3600);
    let report = h
        .coordinator()
        .enforce(vec![verdict("1", "alice", Action::SecondWarning)])
        .await;
    assert_eq!(report.sent, vec![("alice".to_string(), Stage::SecondWarning)]);
}

#[tokio::test]
async fn test_cancellations_bypass_throttle_and_copy_admins() {
    let h = Harness::new();

    for _ in 0..2 {
        let report = h
            .coordinator()
            .enforce(vec![verdict("9", "alice", Action::FixedCancel)])
            .await;
        assert_eq!(report.sent, vec![("alice".to_string(), Stage::Cancel)]);
        h.clock.advance_secs(60);
    }

    assert_eq!(
        h.recipients(),
        vec![
            "alice@princeton.edu",
            "admin@princeton.edu",
            "alice@princeton.edu",
            "admin@princeton.edu"
        ]
    );
    let records = h
        .throttles
        .for_stage(Stage::Cancel)
        .sent_summary("alice", &h.scope)
        .unwrap();
    assert_eq!(records.count, 2);
}

#[tokio::test]
async fn test_warnings_copied_to_admin_only_when_enabled() {
    let mut h = Harness::new();
    h.coordinator()
        .enforce(vec![verdict("1", "alice", Action::FirstWarning)])
        .await;
    assert_eq!(h.recipients(), vec!["alice@princeton.edu"]);

    h.settings.warnings_to_admin = true;
    h.coordinator()
        .enforce(vec![verdict("2", "bob", Action::SlidingWarning)])
        .await;
    assert_eq!(
        h.recipients(),
        vec!["alice@princeton.edu", "bob@princeton.edu", "admin@princeton.edu"]
    );
}

#[tokio::test]
async fn test_termination_failures_are_isolated() {
    let mut h = Harness::new();
    h.terminator.failing = vec![JobId::from("2")];

    let report = h
        .coordinator()
        .enforce(vec![
            verdict("1", "alice", Action::FixedCancel),
            verdict("2", "alice", Action::SlidingCancel),
            verdict("3", "bob", Action::FixedCancel),
        ])
        .await;

    assert_eq!(report.termination_failures, vec![JobId::from("2")]);
    assert_eq!(report.cancelled, vec![JobId::from("1"), JobId::from("3")]);
    assert_eq!(
        *h.terminator.terminated.lock().unwrap(),
        vec![JobId::from("1"), JobId::from("3")]
    );
}

#[tokio::test]
async fn test_delivery_failure_does_not_block_others() {
    let mut h = Harness::new();
    h.notifier.failing_recipients = vec!["alice@princeton.edu".to_string()];

    let report = h
        .coordinator()
        .enforce(vec![
            verdict("1", "alice", Action::FixedCancel),
            verdict("2", "bob", Action::FirstWarning),
        ])
        .await;

    assert_eq!(report.failed_deliveries, 1);
    assert_eq!(report.sent, vec![("bob".to_string(), Stage::FirstWarning)]);
    assert_eq!(report.cancelled, vec![JobId::from("1")]);

    // failed delivery is not recorded, so the next cycle may warn again
    let throttle = h.throttles.for_stage(Stage::Cancel);
    assert_eq!(throttle.sent_summary("alice", &h.scope).unwrap().count, 0);
}

#[tokio::test]
async fn test_report_only_mode_sends_nothing() {
    let mut h = Harness::new();
    h.settings.deliver = false;

    let report = h
        .coordinator()
        .enforce(vec![
            verdict("1", "alice", Action::FirstWarning),
            verdict("2", "alice", Action::FixedCancel),
        ])
        .await;

    assert!(h.recipients().is_empty());
    assert!(h.terminator.terminated.lock().unwrap().is_empty());
    assert_eq!(report.report_only.len(), 2);
    assert_eq!(report.not_terminated, vec![JobId::from("2")]);
    assert!(h
        .throttles
        .for_stage(Stage::FirstWarning)
        .should_notify("alice", &h.scope)
        .unwrap());
}

#[tokio::test]
async fn test_do_not_cancel_still_notifies() {
    let mut h = Harness::new();
    h.settings.do_not_cancel = true;

    let report = h
        .coordinator()
        .enforce(vec![verdict("5", "alice", Action::FixedCancel)])
        .await;

    assert_eq!(report.sent, vec![("alice".to_string(), Stage::Cancel)]);
    assert!(report.cancelled.is_empty());
    assert_eq!(report.not_terminated, vec![JobId::from("5")]);
    assert!(h.terminator.terminated.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_one_email_per_user_and_stage() {
    let h = Harness::new();
    let report = h
        .coordinator()
        .enforce(vec![
            verdict("1", "alice", Action::FirstWarning),
            verdict("2", "alice", Action::FirstWarning),
        ])
        .await;

    assert_eq!(report.sent.len(), 1);
    let sent = h.notifier.sent.lock().unwrap();
    assert!(sent[0].body.contains("$ scancel 1"));
    assert!(sent[0].body.contains("2"));
}

#[tokio::test]
async fn test_users_without_address_are_counted_as_failures() {
    let mut h = Harness::new();
    h.addresses = AddressBook::new(None, HashMap::new());

    let report = h
        .coordinator()
        .enforce(vec![verdict("1", "alice", Action::FirstWarning)])
        .await;
    assert_eq!(report.failed_deliveries, 1);
    assert!(report.sent.is_empty());
}
