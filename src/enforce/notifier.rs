//! Operator notifications over SNS.

use async_trait::async_trait;
use aws_config::SdkConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aws::{classify, ServiceFault};
use crate::event::TaskHandle;

/// Subject line of every notification.
pub const NOTIFICATION_SUBJECT: &str = "Issues with Container image in Cluster";

/// Message published once per terminated task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    /// Human-readable summary.
    pub message: String,
    /// Cluster ARN.
    pub cluster_arn: String,
    /// Task definition ARN.
    pub task_definition_arn: String,
    /// Task ARN.
    pub task_arn: String,
}

impl NotificationMessage {
    /// Message for a task that ran the given unsigned images.
    pub fn unsigned_image<S: AsRef<str>>(task: &TaskHandle, images: &[S]) -> Self {
        let images = images.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(", ");
        Self {
            message: format!(
                "Task {} attempted to run an unsigned container image: {images}",
                task.task_arn
            ),
            cluster_arn: task.cluster_arn.clone(),
            task_definition_arn: task.task_definition_arn.clone(),
            task_arn: task.task_arn.clone(),
        }
    }
}

/// A notification could not be published.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The message could not be serialized.
    #[error("failed to serialize notification: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The publish call failed.
    #[error("publish to {topic} failed: {fault}")]
    Service {
        /// Destination topic.
        topic: String,
        /// Classified service failure.
        fault: ServiceFault,
    },
}

/// Message-bus publish operation.
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    /// Publish `message`. Fire-and-forget: no delivery confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] when the message cannot be sent.
    async fn publish(&self, message: &NotificationMessage) -> Result<(), PublishError>;
}

/// [`NotificationPublisher`] for one SNS topic.
#[derive(Debug, Clone)]
pub struct SnsPublisher {
    client: aws_sdk_sns::Client,
    topic_arn: String,
}

impl SnsPublisher {
    /// Build a publisher for `topic_arn`.
    pub fn new(config: &SdkConfig, topic_arn: impl Into<String>) -> Self {
        Self {
            client: aws_sdk_sns::Client::new(config),
            topic_arn: topic_arn.into(),
        }
    }
}

#[async_trait]
impl NotificationPublisher for SnsPublisher {
    async fn publish(&self, message: &NotificationMessage) -> Result<(), PublishError> {
        let body = serde_json::to_string(message)?;
        let output = self
            .client
            .publish()
            .topic_arn(&self.topic_arn)
            .subject(NOTIFICATION_SUBJECT)
            .message(body)
            .send()
            .await
            .map_err(|e| PublishError::Service {
                topic: self.topic_arn.clone(),
                fault: classify("sns:Publish", &e),
            })?;
        info!(
            topic = %self.topic_arn,
            message_id = output.message_id().unwrap_or_default(),
            task_arn = %message.task_arn,
            "notification published"
        );
        Ok(())
    }
}
