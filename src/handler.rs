//! One invocation of the gate.
//!
//! [`Gate`] owns the validated configuration and the clients for one
//! invocation. Handling an event resolves the trusted key once, runs the
//! [`EnforcementController`] under the invocation deadline, and turns
//! unresolved verification errors into an invocation failure so the runtime
//! redelivers the event.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aws::{load_sdk_config, AccountScope};
use crate::config::GateConfig;
use crate::enforce::notifier::{NotificationPublisher, SnsPublisher};
use crate::enforce::terminator::{EcsTaskTerminator, TaskTerminator};
use crate::enforce::{EnforcementController, EnforcementSettings, InvocationReport};
use crate::event::{ContainerImage, EventError, TaskEvent};
use crate::keys::kms::KmsKeyManagement;
use crate::keys::{KeyError, KeyManagement, KeyResolver, VerificationKey};
use crate::registry::ecr::EcrCredentialHelper;
use crate::registry::oci::OciRegistryClient;
use crate::registry::RegistryError;
use crate::verify::{ImageVerification, ImageVerifier, VerificationFailure, VerificationVerdict};

/// Why an invocation failed as a whole.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    /// The event payload cannot be processed.
    #[error(transparent)]
    Event(#[from] EventError),
    /// The trusted key could not be resolved.
    #[error("signing key unavailable: {0}")]
    Key(#[from] KeyError),
    /// The deadline passed before `stage` finished.
    #[error("invocation deadline reached during {stage}")]
    Deadline {
        /// Pipeline stage that was cut off.
        stage: &'static str,
    },
    /// A client could not be constructed.
    #[error("client setup failed: {0}")]
    Setup(#[from] RegistryError),
    /// Some images could not be verified and the task was left running.
    #[error(
        "{} image(s) of task {} could not be verified",
        .report.verification_errors(),
        .report.task.task_arn
    )]
    Unresolved {
        /// What was decided and done before failing.
        report: Box<InvocationReport>,
    },
}

/// Clients used by one invocation.
pub struct Collaborators {
    /// Key-management lookups.
    pub kms: Arc<dyn KeyManagement>,
    /// Image verification.
    pub verifier: Arc<dyn ImageVerification>,
    /// Task control.
    pub terminator: Arc<dyn TaskTerminator>,
    /// Operator notifications.
    pub publisher: Arc<dyn NotificationPublisher>,
}

impl Collaborators {
    /// Build AWS- and registry-backed clients from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`InvocationError::Setup`] if the HTTP client cannot be built.
    pub async fn aws(config: &GateConfig) -> Result<Self, InvocationError> {
        let sdk = load_sdk_config(config.call_timeout).await;
        let store = OciRegistryClient::new(config.call_timeout)?;
        let credentials = EcrCredentialHelper::new(&sdk);
        let verifier = ImageVerifier::new(Arc::new(credentials), Arc::new(store))
            .with_expected_repository(config.repository_name.clone());
        Ok(Self {
            kms: Arc::new(KmsKeyManagement::new(&sdk)),
            verifier: Arc::new(verifier),
            terminator: Arc::new(EcsTaskTerminator::new(&sdk)),
            publisher: Arc::new(SnsPublisher::new(&sdk, config.notification_topic.clone())),
        })
    }
}

/// Configuration plus clients for one invocation.
pub struct Gate {
    config: GateConfig,
    clients: Collaborators,
}

impl Gate {
    /// Assemble a gate from explicit collaborators.
    pub fn new(config: GateConfig, clients: Collaborators) -> Self {
        Self { config, clients }
    }

    /// Assemble a gate with AWS-backed collaborators.
    ///
    /// # Errors
    ///
    /// See [`Collaborators::aws`].
    pub async fn connect(config: GateConfig) -> Result<Self, InvocationError> {
        let clients = Collaborators::aws(&config).await?;
        Ok(Self::new(config, clients))
    }

    /// The configuration this gate runs with.
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Parse `payload` and handle it.
    ///
    /// # Errors
    ///
    /// Returns [`InvocationError::Event`] for unusable payloads, otherwise
    /// see [`Gate::handle`].
    pub async fn handle_payload(
        &self,
        payload: &[u8],
        deadline: Instant,
    ) -> Result<InvocationReport, InvocationError> {
        let event = TaskEvent::from_slice(payload)?;
        self.handle(&event, deadline).await
    }

    /// Verify the task's images and enforce the result.
    ///
    /// # Errors
    ///
    /// Returns [`InvocationError`] when the key cannot be resolved before the
    /// deadline, or when retryable verification errors leave the task
    /// unresolved and `FAIL_ON_VERIFICATION_ERROR` is set. In every error
    /// case no stop was requested, or the stop and its notification already
    /// ran. Tasks already stopping are reported as skipped.
    pub async fn handle(
        &self,
        event: &TaskEvent,
        deadline: Instant,
    ) -> Result<InvocationReport, InvocationError> {
        let span = info_span!(
            "invocation",
            id = %Uuid::new_v4(),
            cluster_arn = %event.task.cluster_arn,
            task_arn = %event.task.task_arn,
        );
        self.run(event, deadline).instrument(span).await
    }

    async fn run(
        &self,
        event: &TaskEvent,
        deadline: Instant,
    ) -> Result<InvocationReport, InvocationError> {
        info!(
            event_id = event.event_id.as_deref().unwrap_or_default(),
            event_time = event.time.map(|t| t.to_rfc3339()).unwrap_or_default(),
            containers = event.containers.len(),
            last_status = event.last_status.as_deref().unwrap_or_default(),
            key_source = self.config.key.kind(),
            "evaluating task"
        );

        if event.is_stopping() {
            info!(
                desired_status = event.desired_status.as_deref().unwrap_or_default(),
                "task already stopping, nothing to enforce"
            );
            return Ok(InvocationReport::already_stopping(event));
        }

        let settings = self.config.enforcement_settings();
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining <= settings.reserved_time() {
            error!(
                remaining_ms = remaining.as_millis(),
                reserved_ms = settings.reserved_time().as_millis(),
                "invocation deadline leaves no room for the enforcement reserve, \
                 splitting the remaining time"
            );
        }
        let verify_until = verification_deadline(deadline, &settings);
        let key = self.resolve_key(event.scope.as_ref(), verify_until).await?;

        let controller = EnforcementController::new(
            Arc::clone(&self.clients.verifier),
            Arc::clone(&self.clients.terminator),
            Arc::clone(&self.clients.publisher),
            settings,
        );
        let report = controller.enforce(event, &key, verify_until).await;

        if report.should_redeliver() && self.config.fail_on_verification_error {
            error!(
                verification_errors = report.verification_errors(),
                "verification incomplete, failing invocation for redelivery"
            );
            return Err(InvocationError::Unresolved {
                report: Box::new(report),
            });
        }
        if report.should_redeliver() {
            warn!(
                verification_errors = report.verification_errors(),
                "verification incomplete, task left running"
            );
        } else if report.has_unresolved_errors() {
            error!(
                verification_errors = report.verification_errors(),
                "verification failed permanently, task left running"
            );
        }
        Ok(report)
    }

    /// Verify one image without enforcing anything.
    ///
    /// # Errors
    ///
    /// Returns [`InvocationError`] when the key cannot be resolved before the
    /// deadline.
    pub async fn verify_image(
        &self,
        container: &ContainerImage,
        scope: Option<&AccountScope>,
        deadline: Instant,
    ) -> Result<VerificationVerdict, InvocationError> {
        let key = self.resolve_key(scope, deadline).await?;
        let check = self.clients.verifier.verify(container, &key);
        let verdict = tokio::time::timeout_at(deadline, check)
            .await
            .unwrap_or_else(|_| {
                VerificationVerdict::VerificationError(VerificationFailure::deadline())
            });
        Ok(verdict)
    }

    async fn resolve_key(
        &self,
        scope: Option<&AccountScope>,
        deadline: Instant,
    ) -> Result<VerificationKey, InvocationError> {
        let resolver = KeyResolver::new(self.clients.kms.as_ref());
        match tokio::time::timeout_at(deadline, resolver.resolve(&self.config.key, scope)).await {
            Ok(Ok(key)) => {
                info!(
                    key_id = key.key_id(),
                    fingerprint = key.fingerprint(),
                    "signing key resolved"
                );
                Ok(key)
            }
            Ok(Err(e)) => {
                error!(error = %e, "signing key resolution failed");
                Err(e.into())
            }
            Err(_) => {
                error!("signing key resolution hit the deadline");
                Err(InvocationError::Deadline {
                    stage: "key resolution",
                })
            }
        }
    }
}

/// Latest instant verification may run until, leaving room for the stop,
/// optional scale-down and notification calls before `deadline`.
///
/// Verification never gets less than an equal share of the time left next
/// to each enforcement step, so a deadline shorter than the reserve still
/// lets images be checked.
pub fn verification_deadline(deadline: Instant, settings: &EnforcementSettings) -> Instant {
    let now = Instant::now();
    let remaining = deadline.saturating_duration_since(now);
    let share = remaining
        .checked_div(settings.enforcement_steps().saturating_add(1))
        .unwrap_or_default();
    let budget = remaining
        .checked_sub(settings.reserved_time())
        .map_or(share, |budget| budget.max(share));
    now.checked_add(budget).unwrap_or(deadline)
}

/// Convert a runtime deadline in epoch milliseconds to an [`Instant`],
/// capped at `fallback` from now.
pub fn deadline_from_epoch_millis(deadline_ms: u64, fallback: Duration) -> Instant {
    let now_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
    let remaining = Duration::from_millis(deadline_ms.saturating_sub(now_ms)).min(fallback);
    let now = Instant::now();
    now.checked_add(remaining).unwrap_or(now)
}
