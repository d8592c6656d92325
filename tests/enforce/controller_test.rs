//! Tests for the enforcement controller: verdicts in, stops and
//! notifications out.

use std::sync::Arc;
use std::time::Duration;

use cosign_gate::enforce::notifier::NotificationPublisher;
use cosign_gate::enforce::terminator::TaskTerminator;
use cosign_gate::enforce::{
    EnforcementController, EnforcementOutcome, EnforcementSettings, InvocationReport, StepResult,
};
use cosign_gate::event::TaskEvent;
use cosign_gate::verify::{
    FailureKind, ImageVerification, VerificationFailure, VerificationVerdict,
};
use tokio::time::Instant;

use crate::support::{
    app_image, event_json, task_event, unverified, RecordingPublisher, RecordingTerminator, ScriptedVerifier,
    TestSigner, TASK_ARN,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    verifier: Arc<ScriptedVerifier>,
    terminator: Arc<RecordingTerminator>,
    publisher: Arc<RecordingPublisher>,
    controller: EnforcementController,
}

fn harness(
    verifier: ScriptedVerifier,
    terminator: RecordingTerminator,
    publisher: RecordingPublisher,
    settings: EnforcementSettings,
) -> Harness {
    let verifier = Arc::new(verifier);
    let terminator = Arc::new(terminator);
    let publisher = Arc::new(publisher);
    let controller = EnforcementController::new(
        Arc::clone(&verifier) as Arc<dyn ImageVerification>,
        Arc::clone(&terminator) as Arc<dyn TaskTerminator>,
        Arc::clone(&publisher) as Arc<dyn NotificationPublisher>,
        settings,
    );
    Harness {
        verifier,
        terminator,
        publisher,
        controller,
    }
}

fn deadline_in(secs: u64) -> Instant {
    Instant::now()
        .checked_add(Duration::from_secs(secs))
        .expect("instant in range")
}

async fn run(harness: &Harness, images: &[&str]) -> InvocationReport {
    let key = TestSigner::generate().verification_key();
    harness
        .controller
        .enforce(&task_event(images), &key, deadline_in(60))
        .await
}

fn registry_error() -> VerificationVerdict {
    VerificationVerdict::VerificationError(VerificationFailure {
        kind: FailureKind::Registry,
        reason: "registry unreachable".to_owned(),
        retryable: true,
    })
}

// ---------------------------------------------------------------------------
// Verdict handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn verified_task_is_left_alone() {
    let h = harness(
        ScriptedVerifier::new(),
        RecordingTerminator::new(),
        RecordingPublisher::new(),
        EnforcementSettings::default(),
    );
    let report = run(&h, &[&app_image("1.0")]).await;

    assert!(report.enforcement.is_none());
    assert_eq!(report.images.len(), 1);
    assert_eq!(report.images[0].outcome, EnforcementOutcome::NoAction);
    assert!(report.images[0].verdict.is_verified());
    assert!(h.terminator.stopped().is_empty());
    assert!(h.publisher.published().is_empty());
}

#[tokio::test]
async fn unverified_images_stop_the_task_exactly_once() {
    let bad = app_image("bad");
    let sidecar = app_image("sidecar");
    let good = app_image("1.0");
    let h = harness(
        ScriptedVerifier::new()
            .verdict(&bad, unverified())
            .verdict(&sidecar, unverified()),
        RecordingTerminator::new(),
        RecordingPublisher::new(),
        EnforcementSettings::default(),
    );
    let report = run(&h, &[&bad, &good, &sidecar]).await;

    assert_eq!(h.verifier.calls(), 3, "every container is evaluated");
    assert_eq!(h.terminator.stopped().len(), 1);
    let published = h.publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].task_arn, TASK_ARN);
    assert!(published[0].message.contains(&bad));
    assert!(published[0].message.contains(&sidecar));
    assert!(!published[0].message.contains(&good));

    let outcomes: Vec<_> = report.images.iter().map(|i| i.outcome).collect();
    assert_eq!(
        outcomes,
        [
            EnforcementOutcome::Terminated,
            EnforcementOutcome::NoAction,
            EnforcementOutcome::Terminated
        ]
    );
}

#[tokio::test]
async fn repeated_image_is_named_once() {
    let bad = app_image("bad");
    let h = harness(
        ScriptedVerifier::new().verdict(&bad, unverified()),
        RecordingTerminator::new(),
        RecordingPublisher::new(),
        EnforcementSettings::default(),
    );
    let report = run(&h, &[&bad, &bad]).await;
    let enforcement = report.enforcement.expect("task enforced");
    assert_eq!(enforcement.unsigned_images, vec![bad]);
}

#[tokio::test]
async fn stop_reason_reaches_the_orchestrator() {
    let bad = app_image("bad");
    let h = harness(
        ScriptedVerifier::new().verdict(&bad, unverified()),
        RecordingTerminator::new(),
        RecordingPublisher::new(),
        EnforcementSettings {
            stop_reason: "unsigned image".to_owned(),
            ..EnforcementSettings::default()
        },
    );
    run(&h, &[&bad]).await;
    assert_eq!(
        h.terminator.stopped(),
        vec![(TASK_ARN.to_owned(), "unsigned image".to_owned())]
    );
}

#[tokio::test]
async fn verification_error_never_stops_the_task() {
    let flaky = app_image("1.0");
    let h = harness(
        ScriptedVerifier::new().verdict(&flaky, registry_error()),
        RecordingTerminator::new(),
        RecordingPublisher::new(),
        EnforcementSettings::default(),
    );
    let report = run(&h, &[&flaky]).await;

    assert!(h.terminator.stopped().is_empty());
    assert!(h.publisher.published().is_empty());
    assert_eq!(report.images[0].outcome, EnforcementOutcome::NoAction);
    assert_eq!(report.verification_errors(), 1);
    assert!(report.has_unresolved_errors());
    assert!(report.should_redeliver());
}

#[tokio::test]
async fn unverified_sibling_resolves_a_verification_error() {
    let flaky = app_image("flaky");
    let bad = app_image("bad");
    let h = harness(
        ScriptedVerifier::new()
            .verdict(&flaky, registry_error())
            .verdict(&bad, unverified()),
        RecordingTerminator::new(),
        RecordingPublisher::new(),
        EnforcementSettings::default(),
    );
    let report = run(&h, &[&flaky, &bad]).await;

    assert_eq!(h.terminator.stopped().len(), 1);
    assert!(report.termination_attempted());
    assert!(!report.has_unresolved_errors());
    assert_eq!(report.images[0].outcome, EnforcementOutcome::NoAction);
    assert_eq!(report.images[1].outcome, EnforcementOutcome::Terminated);
}

// ---------------------------------------------------------------------------
// Independent side effects
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_stop_still_notifies() {
    let bad = app_image("bad");
    let h = harness(
        ScriptedVerifier::new().verdict(&bad, unverified()),
        RecordingTerminator::failing(),
        RecordingPublisher::new(),
        EnforcementSettings::default(),
    );
    let report = run(&h, &[&bad]).await;

    assert_eq!(h.publisher.published().len(), 1);
    let enforcement = report.enforcement.expect("task enforced");
    assert!(matches!(enforcement.termination, StepResult::Failed { .. }));
    assert_eq!(enforcement.notification, StepResult::Succeeded);
    assert_eq!(report.images[0].outcome, EnforcementOutcome::TerminationFailed);
}

#[tokio::test]
async fn failed_notification_keeps_the_stop() {
    let bad = app_image("bad");
    let h = harness(
        ScriptedVerifier::new().verdict(&bad, unverified()),
        RecordingTerminator::new(),
        RecordingPublisher::failing(),
        EnforcementSettings::default(),
    );
    let report = run(&h, &[&bad]).await;

    assert_eq!(h.terminator.stopped().len(), 1);
    let enforcement = report.enforcement.expect("task enforced");
    assert_eq!(enforcement.termination, StepResult::Succeeded);
    assert!(matches!(enforcement.notification, StepResult::Failed { .. }));
    assert_eq!(report.images[0].outcome, EnforcementOutcome::NotificationFailed);
}

#[tokio::test]
async fn service_is_scaled_down_only_when_enabled() {
    let bad = app_image("bad");

    let enabled = harness(
        ScriptedVerifier::new().verdict(&bad, unverified()),
        RecordingTerminator::new(),
        RecordingPublisher::new(),
        EnforcementSettings {
            scale_down_service: true,
            ..EnforcementSettings::default()
        },
    );
    let report = run(&enabled, &[&bad]).await;
    assert_eq!(enabled.terminator.scaled(), vec!["web".to_owned()]);
    assert_eq!(
        report.enforcement.and_then(|e| e.service_scale_down),
        Some(StepResult::Succeeded)
    );

    let disabled = harness(
        ScriptedVerifier::new().verdict(&bad, unverified()),
        RecordingTerminator::new(),
        RecordingPublisher::new(),
        EnforcementSettings::default(),
    );
    run(&disabled, &[&bad]).await;
    assert!(disabled.terminator.scaled().is_empty());
}

// ---------------------------------------------------------------------------
// Deadline and repeatability
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn slow_verification_is_cut_off_by_the_deadline() {
    let h = harness(
        ScriptedVerifier::new().delayed(Duration::from_secs(120)),
        RecordingTerminator::new(),
        RecordingPublisher::new(),
        EnforcementSettings::default(),
    );
    let key = TestSigner::generate().verification_key();
    let image = app_image("1.0");
    let report = h
        .controller
        .enforce(&task_event(&[&image]), &key, deadline_in(30))
        .await;

    match &report.images[0].verdict {
        VerificationVerdict::VerificationError(failure) => {
            assert_eq!(failure.kind, FailureKind::Deadline);
        }
        other => panic!("expected deadline error, got {other:?}"),
    }
    assert!(h.terminator.stopped().is_empty());
}

#[tokio::test]
async fn same_event_twice_gives_the_same_report() {
    let bad = app_image("bad");
    let h = harness(
        ScriptedVerifier::new().verdict(&bad, unverified()),
        RecordingTerminator::new(),
        RecordingPublisher::new(),
        EnforcementSettings::default(),
    );
    let first = run(&h, &[&bad, &app_image("1.0")]).await;
    let second = run(&h, &[&bad, &app_image("1.0")]).await;

    assert_eq!(first, second);
    assert_eq!(h.terminator.stopped().len(), 2, "one stop per invocation");
}

#[test]
fn report_serializes_for_operators() {
    let report = InvocationReport {
        task: crate::support::task_handle(),
        images: Vec::new(),
        enforcement: None,
        skipped: None,
    };
    let json = serde_json::to_value(&report).expect("serializable");
    assert_eq!(json["task"]["taskArn"], TASK_ARN);
    assert!(json.get("enforcement").is_none());
}

// ---------------------------------------------------------------------------
// Tasks already going away
// ---------------------------------------------------------------------------

fn event_with_status(images: &[&str], last: &str, desired: &str) -> TaskEvent {
    let mut value = event_json(images);
    value["detail"]["lastStatus"] = serde_json::json!(last);
    value["detail"]["desiredStatus"] = serde_json::json!(desired);
    TaskEvent::from_value(value).expect("fixture event parses")
}

async fn run_event(harness: &Harness, event: &TaskEvent) -> InvocationReport {
    let key = TestSigner::generate().verification_key();
    harness.controller.enforce(event, &key, deadline_in(60)).await
}

#[tokio::test]
async fn stopped_task_is_not_enforced_again() {
    let bad = app_image("bad");
    let h = harness(
        ScriptedVerifier::new().verdict(&bad, unverified()),
        RecordingTerminator::new(),
        RecordingPublisher::new(),
        EnforcementSettings::default(),
    );
    let report = run_event(&h, &event_with_status(&[&bad], "STOPPED", "STOPPED")).await;

    assert_eq!(h.verifier.calls(), 0);
    assert!(h.terminator.stopped().is_empty());
    assert!(h.publisher.published().is_empty());
    assert!(report.images.is_empty());
    assert!(report.enforcement.is_none());
    let reason = report.skipped.expect("skip reason recorded");
    assert!(reason.contains("STOPPED"), "{reason}");
}

#[tokio::test]
async fn task_being_stopped_gets_no_second_notification() {
    let bad = app_image("bad");
    let h = harness(
        ScriptedVerifier::new().verdict(&bad, unverified()),
        RecordingTerminator::new(),
        RecordingPublisher::new(),
        EnforcementSettings::default(),
    );

    let first = run(&h, &[&bad]).await;
    assert!(first.termination_attempted());

    // Events that follow the stop: desired status flips first, then the
    // last status walks through the shutdown states.
    for (last, desired) in [
        ("RUNNING", "STOPPED"),
        ("DEACTIVATING", "STOPPED"),
        ("DEPROVISIONING", "STOPPED"),
        ("STOPPED", "STOPPED"),
    ] {
        let report = run_event(&h, &event_with_status(&[&bad], last, desired)).await;
        assert!(report.skipped.is_some(), "{last}/{desired} was evaluated");
        assert!(!report.should_redeliver());
    }

    assert_eq!(h.terminator.stopped().len(), 1);
    assert_eq!(h.publisher.published().len(), 1);
}

// ---------------------------------------------------------------------------
// Redelivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn permanent_errors_do_not_ask_for_redelivery() {
    let broken = app_image("broken");
    let h = harness(
        ScriptedVerifier::new().verdict(
            &broken,
            VerificationVerdict::VerificationError(VerificationFailure {
                kind: FailureKind::Registry,
                reason: "registry rejected credentials".to_owned(),
                retryable: false,
            }),
        ),
        RecordingTerminator::new(),
        RecordingPublisher::new(),
        EnforcementSettings::default(),
    );
    let report = run(&h, &[&broken]).await;
    assert!(report.has_unresolved_errors());
    assert!(!report.should_redeliver());

    let flaky = app_image("flaky");
    let h = harness(
        ScriptedVerifier::new()
            .verdict(&broken, VerificationVerdict::VerificationError(VerificationFailure {
                kind: FailureKind::Parse,
                reason: "bad reference".to_owned(),
                retryable: false,
            }))
            .verdict(&flaky, registry_error()),
        RecordingTerminator::new(),
        RecordingPublisher::new(),
        EnforcementSettings::default(),
    );
    let report = run(&h, &[&broken, &flaky]).await;
    assert!(report.should_redeliver(), "one transient error is enough");
}
