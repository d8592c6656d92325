//! Enforcement: from verdicts to task termination and notification.
//!
//! The [`EnforcementController`] verifies every container of one task, then
//! acts at most once per task: if any image is unverified the task is
//! stopped once and operators are notified once, whatever the number of
//! unverified images. Verification errors never stop a task; they are
//! reported so the invocation can fail and be redelivered.
//!
//! Termination and notification are independent steps. A failed stop still
//! gets a notification attempt, and a failed notification never turns a
//! successful stop into a failure.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::event::{ContainerImage, TaskEvent, TaskHandle};
use crate::keys::VerificationKey;
use crate::verify::{ImageVerification, VerificationFailure, VerificationVerdict};

pub mod notifier;
pub mod terminator;

use notifier::{NotificationMessage, NotificationPublisher};
use terminator::TaskTerminator;

/// Stop reason recorded on terminated tasks unless configured otherwise.
pub const DEFAULT_STOP_REASON: &str = "image signature verification failed";

/// Default time budget for each outbound call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Recorded result of acting on one image's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementOutcome {
    /// Nothing was done (verified image, or verification could not complete).
    NoAction,
    /// The task was stopped and operators were notified.
    Terminated,
    /// The stop request failed. A notification was still attempted.
    TerminationFailed,
    /// The task was stopped but the notification failed.
    NotificationFailed,
}

/// Result of one side-effecting call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepResult {
    /// The call succeeded.
    Succeeded,
    /// The call failed or timed out.
    Failed {
        /// Error text.
        reason: String,
    },
}

impl StepResult {
    /// Whether the call succeeded.
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// What was done to a task found running unverified images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskEnforcement {
    /// Unverified images, deduplicated, in container order.
    pub unsigned_images: Vec<String>,
    /// The stop request.
    pub termination: StepResult,
    /// The service scale-down, when enabled and the task belongs to a service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_scale_down: Option<StepResult>,
    /// The operator notification.
    pub notification: StepResult,
}

impl TaskEnforcement {
    /// Outcome recorded for each unverified image of the task.
    pub fn outcome(&self) -> EnforcementOutcome {
        if !self.termination.succeeded() {
            EnforcementOutcome::TerminationFailed
        } else if !self.notification.succeeded() {
            EnforcementOutcome::NotificationFailed
        } else {
            EnforcementOutcome::Terminated
        }
    }
}

/// Verdict and outcome for one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageReport {
    /// Container name.
    pub container: String,
    /// Image reference as listed in the event.
    pub image: String,
    /// Verification verdict.
    pub verdict: VerificationVerdict,
    /// What was done about it.
    pub outcome: EnforcementOutcome,
}

/// Everything one invocation decided and did for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationReport {
    /// The task evaluated.
    pub task: TaskHandle,
    /// Per-container results, in event order.
    pub images: Vec<ImageReport>,
    /// Task-level action, present only when some image was unverified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enforcement: Option<TaskEnforcement>,
    /// Why the task was not evaluated at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

impl InvocationReport {
    /// Report for a task that is not evaluated because it is already on its
    /// way down. Nothing is verified, stopped or published for it.
    pub fn already_stopping(event: &TaskEvent) -> Self {
        Self {
            task: event.task.clone(),
            images: Vec::new(),
            enforcement: None,
            skipped: Some(format!(
                "task is already stopping (lastStatus {}, desiredStatus {})",
                event.last_status.as_deref().unwrap_or("unknown"),
                event.desired_status.as_deref().unwrap_or("unknown"),
            )),
        }
    }

    /// Number of images whose verification could not complete.
    pub fn verification_errors(&self) -> usize {
        self.images
            .iter()
            .filter(|image| matches!(image.verdict, VerificationVerdict::VerificationError(_)))
            .count()
    }

    /// Whether a stop was attempted for the task.
    pub fn termination_attempted(&self) -> bool {
        self.enforcement.is_some()
    }

    /// Verification errors left the trust decision open: some image could
    /// not be checked and the task was not stopped for another image.
    pub fn has_unresolved_errors(&self) -> bool {
        self.verification_errors() > 0 && !self.termination_attempted()
    }

    /// Unresolved errors of which at least one could clear on a later
    /// attempt. Permanent failures alone never warrant redelivery.
    pub fn should_redeliver(&self) -> bool {
        self.has_unresolved_errors()
            && self.images.iter().any(|image| {
                matches!(&image.verdict, VerificationVerdict::VerificationError(f) if f.retryable)
            })
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Tunables for the enforcement steps.
#[derive(Debug, Clone)]
pub struct EnforcementSettings {
    /// Reason recorded on the stopped task.
    pub stop_reason: String,
    /// Also scale the owning service to zero.
    pub scale_down_service: bool,
    /// Budget for each stop, scale-down and publish call.
    pub call_timeout: Duration,
}

impl EnforcementSettings {
    /// Number of bounded calls made once a stop is warranted.
    pub fn enforcement_steps(&self) -> u32 {
        if self.scale_down_service {
            3
        } else {
            2
        }
    }

    /// Time kept back from verification so the stop, optional scale-down
    /// and notification can each use their full call timeout.
    pub fn reserved_time(&self) -> Duration {
        self.call_timeout
            .checked_mul(self.enforcement_steps())
            .unwrap_or(Duration::MAX)
    }
}

impl Default for EnforcementSettings {
    fn default() -> Self {
        Self {
            stop_reason: DEFAULT_STOP_REASON.to_owned(),
            scale_down_service: false,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Verifies a task's images and enforces the result.
pub struct EnforcementController {
    verifier: Arc<dyn ImageVerification>,
    terminator: Arc<dyn TaskTerminator>,
    publisher: Arc<dyn NotificationPublisher>,
    settings: EnforcementSettings,
}

impl EnforcementController {
    /// Wire a controller from its collaborators.
    pub fn new(
        verifier: Arc<dyn ImageVerification>,
        terminator: Arc<dyn TaskTerminator>,
        publisher: Arc<dyn NotificationPublisher>,
        settings: EnforcementSettings,
    ) -> Self {
        Self {
            verifier,
            terminator,
            publisher,
            settings,
        }
    }

    /// Verify every container of `event` and act on the verdicts.
    ///
    /// Tasks that are already stopping or stopped are left alone: they were
    /// either stopped by an earlier invocation or are going away anyway.
    ///
    /// Verification is bounded by `deadline`; images still being checked
    /// when it passes get a deadline [`VerificationVerdict::VerificationError`].
    /// Once a stop is warranted, the stop and the notification both run,
    /// each bounded by the configured call timeout.
    pub async fn enforce(
        &self,
        event: &TaskEvent,
        key: &VerificationKey,
        deadline: Instant,
    ) -> InvocationReport {
        if event.is_stopping() {
            info!(
                task_arn = %event.task.task_arn,
                last_status = event.last_status.as_deref().unwrap_or_default(),
                desired_status = event.desired_status.as_deref().unwrap_or_default(),
                "task already stopping, nothing to enforce"
            );
            return InvocationReport::already_stopping(event);
        }

        let verdicts = self.verify_all(&event.containers, key, deadline).await;

        let mut unsigned_images: Vec<String> = Vec::new();
        for (container, verdict) in event.containers.iter().zip(&verdicts) {
            if verdict.is_unverified() && !unsigned_images.contains(&container.image) {
                unsigned_images.push(container.image.clone());
            }
        }

        let enforcement = if unsigned_images.is_empty() {
            None
        } else {
            Some(self.act(event, unsigned_images).await)
        };
        let unverified_outcome = enforcement
            .as_ref()
            .map_or(EnforcementOutcome::NoAction, TaskEnforcement::outcome);

        let images = event
            .containers
            .iter()
            .zip(verdicts)
            .map(|(container, verdict)| ImageReport {
                container: container.name.clone(),
                image: container.image.clone(),
                outcome: if verdict.is_unverified() {
                    unverified_outcome
                } else {
                    EnforcementOutcome::NoAction
                },
                verdict,
            })
            .collect();

        let report = InvocationReport {
            task: event.task.clone(),
            images,
            enforcement,
            skipped: None,
        };
        info!(
            task_arn = %report.task.task_arn,
            images = report.images.len(),
            verification_errors = report.verification_errors(),
            terminated = report.termination_attempted(),
            "task evaluated"
        );
        report
    }

    /// Verify containers concurrently, returning verdicts in container order.
    pub async fn verify_all(
        &self,
        containers: &[ContainerImage],
        key: &VerificationKey,
        deadline: Instant,
    ) -> Vec<VerificationVerdict> {
        let mut checks = JoinSet::new();
        for (index, container) in containers.iter().cloned().enumerate() {
            let verifier = Arc::clone(&self.verifier);
            let key = key.clone();
            checks.spawn(async move {
                let verdict =
                    match tokio::time::timeout_at(deadline, verifier.verify(&container, &key))
                        .await
                    {
                        Ok(verdict) => verdict,
                        Err(_) => {
                            warn!(image = %container.image, "verification cut off by deadline");
                            VerificationVerdict::VerificationError(VerificationFailure::deadline())
                        }
                    };
                (index, verdict)
            });
        }

        let mut slots: Vec<Option<VerificationVerdict>> = vec![None; containers.len()];
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok((index, verdict)) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(verdict);
                    }
                }
                Err(e) => error!(error = %e, "verification task did not complete"),
            }
        }
        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    VerificationVerdict::VerificationError(VerificationFailure::aborted(
                        "verification task did not complete",
                    ))
                })
            })
            .collect()
    }

    async fn act(&self, event: &TaskEvent, unsigned_images: Vec<String>) -> TaskEnforcement {
        let task = &event.task;
        let limit = self.settings.call_timeout;
        warn!(
            task_arn = %task.task_arn,
            cluster_arn = %task.cluster_arn,
            images = ?unsigned_images,
            "unsigned images found, stopping task"
        );

        let termination = bounded(
            "stop task",
            limit,
            self.terminator.terminate(task, &self.settings.stop_reason),
        )
        .await;

        let service_scale_down = match (self.settings.scale_down_service, event.service_name()) {
            (true, Some(service)) => Some(
                bounded(
                    "scale down service",
                    limit,
                    self.terminator.scale_down_service(task, service),
                )
                .await,
            ),
            _ => None,
        };

        let message = NotificationMessage::unsigned_image(task, &unsigned_images);
        let notification =
            bounded("publish notification", limit, self.publisher.publish(&message)).await;

        TaskEnforcement {
            unsigned_images,
            termination,
            service_scale_down,
            notification,
        }
    }
}

/// Run one side-effecting call under `limit`, logging failures.
async fn bounded<F, E>(step: &'static str, limit: Duration, call: F) -> StepResult
where
    F: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(())) => StepResult::Succeeded,
        Ok(Err(e)) => {
            error!(step, error = %e, "enforcement step failed");
            StepResult::Failed {
                reason: e.to_string(),
            }
        }
        Err(_) => {
            error!(step, timeout_ms = limit.as_millis(), "enforcement step timed out");
            StepResult::Failed {
                reason: format!("{step} timed out after {}ms", limit.as_millis()),
            }
        }
    }
}
