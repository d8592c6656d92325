//! Inbound task state-change events.
//!
//! Only the handful of fields the gate acts on are modelled; everything else
//! in the EventBridge envelope is ignored. A payload that does not carry them
//! is rejected as a whole, never partially processed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aws::AccountScope;

/// The EventBridge detail type emitted for ECS task lifecycle changes.
pub const TASK_STATE_CHANGE: &str = "ECS Task State Change";

/// Errors for payloads that cannot be processed at all.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The payload is not valid JSON or does not match the envelope shape.
    #[error("malformed task event: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The envelope carries a different detail type.
    #[error("unexpected detail type {0:?}")]
    UnexpectedType(String),
    /// A required identifier is present but empty.
    #[error("task event field {0} is empty")]
    EmptyField(&'static str),
    /// The task lists no containers.
    #[error("task event lists no containers")]
    NoContainers,
}

/// Orchestrator identifiers for the task being evaluated. Passed through
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHandle {
    /// Cluster ARN.
    pub cluster_arn: String,
    /// Task ARN.
    pub task_arn: String,
    /// Task definition ARN.
    pub task_definition_arn: String,
}

/// One container of the task and the image it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerImage {
    /// Container name from the task definition.
    #[serde(default)]
    pub name: String,
    /// Image reference as written in the task definition.
    pub image: String,
    /// Digest of the image actually pulled, once the agent reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
}

/// A validated task state-change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    /// EventBridge event id, when present.
    pub event_id: Option<String>,
    /// Emission time, when present.
    pub time: Option<DateTime<Utc>>,
    /// Account and region the event came from.
    pub scope: Option<AccountScope>,
    /// Task identifiers.
    pub task: TaskHandle,
    /// Containers in task-definition order.
    pub containers: Vec<ContainerImage>,
    /// Last observed task status (`PROVISIONING`, `RUNNING`, ...).
    pub last_status: Option<String>,
    /// Status the scheduler is driving towards.
    pub desired_status: Option<String>,
    /// Task group, `service:<name>` for service-managed tasks.
    pub group: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Envelope {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    detail_type: Option<String>,
    #[serde(default)]
    account: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    time: Option<DateTime<Utc>>,
    detail: Detail,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Detail {
    cluster_arn: String,
    task_arn: String,
    task_definition_arn: String,
    #[serde(default)]
    containers: Vec<ContainerImage>,
    #[serde(default)]
    last_status: Option<String>,
    #[serde(default)]
    desired_status: Option<String>,
    #[serde(default)]
    group: Option<String>,
}

impl TaskEvent {
    /// Parse an event from raw JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] when the payload is malformed, of the wrong
    /// detail type, missing identifiers, or lists no containers.
    pub fn from_slice(payload: &[u8]) -> Result<Self, EventError> {
        let envelope: Envelope = serde_json::from_slice(payload)?;
        Self::from_envelope(envelope)
    }

    /// Parse an event from an already-decoded JSON value.
    ///
    /// # Errors
    ///
    /// Same as [`TaskEvent::from_slice`].
    pub fn from_value(payload: serde_json::Value) -> Result<Self, EventError> {
        let envelope: Envelope = serde_json::from_value(payload)?;
        Self::from_envelope(envelope)
    }

    fn from_envelope(envelope: Envelope) -> Result<Self, EventError> {
        if let Some(detail_type) = envelope.detail_type.as_deref() {
            if detail_type != TASK_STATE_CHANGE {
                return Err(EventError::UnexpectedType(detail_type.to_owned()));
            }
        }

        let detail = envelope.detail;
        for (field, value) in [
            ("detail.clusterArn", &detail.cluster_arn),
            ("detail.taskArn", &detail.task_arn),
            ("detail.taskDefinitionArn", &detail.task_definition_arn),
        ] {
            if value.trim().is_empty() {
                return Err(EventError::EmptyField(field));
            }
        }
        if detail.containers.is_empty() {
            return Err(EventError::NoContainers);
        }

        let scope = match (non_empty(envelope.account), non_empty(envelope.region)) {
            (Some(account), Some(region)) => Some(AccountScope::new(account, region)),
            _ => None,
        };

        Ok(Self {
            event_id: envelope.id,
            time: envelope.time,
            scope,
            task: TaskHandle {
                cluster_arn: detail.cluster_arn,
                task_arn: detail.task_arn,
                task_definition_arn: detail.task_definition_arn,
            },
            containers: detail.containers,
            last_status: detail.last_status,
            desired_status: detail.desired_status,
            group: detail.group,
        })
    }

    /// Service name for service-managed tasks (`group` = `service:<name>`).
    pub fn service_name(&self) -> Option<&str> {
        self.group
            .as_deref()
            .and_then(|group| group.strip_prefix("service:"))
            .filter(|name| !name.is_empty())
    }

    /// Whether the task is on its way down or already stopped.
    pub fn is_stopping(&self) -> bool {
        self.desired_status.as_deref() == Some("STOPPED")
            || matches!(
                self.last_status.as_deref(),
                Some("DEACTIVATING" | "STOPPING" | "DEPROVISIONING" | "STOPPED")
            )
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
