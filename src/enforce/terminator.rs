//! Task termination through the ECS control plane.

use async_trait::async_trait;
use aws_config::SdkConfig;
use tracing::info;

use crate::aws::{classify, ServiceFault};
use crate::event::TaskHandle;

/// Longest reason ECS accepts on `StopTask`.
pub const MAX_STOP_REASON_CHARS: usize = 255;

/// An orchestrator call failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} for task {task_arn} failed: {fault}")]
pub struct OrchestratorError {
    /// What was attempted (`stop task`, `scale down service`).
    pub operation: &'static str,
    /// Task the call was made for.
    pub task_arn: String,
    /// Classified service failure.
    pub fault: ServiceFault,
}

/// Orchestrator task-control operations.
#[async_trait]
pub trait TaskTerminator: Send + Sync {
    /// Stop the task with an operator-visible `reason`.
    ///
    /// Stopping a task that is already stopped is not a failure.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when the stop request fails.
    async fn terminate(&self, task: &TaskHandle, reason: &str) -> Result<(), OrchestratorError>;

    /// Set the desired count of `service` (in the task's cluster) to zero.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when the update fails.
    async fn scale_down_service(
        &self,
        task: &TaskHandle,
        service: &str,
    ) -> Result<(), OrchestratorError>;
}

/// Cut `reason` to at most [`MAX_STOP_REASON_CHARS`] characters.
pub fn stop_reason(reason: &str) -> String {
    reason.chars().take(MAX_STOP_REASON_CHARS).collect()
}

/// [`TaskTerminator`] backed by the ECS API.
#[derive(Debug, Clone)]
pub struct EcsTaskTerminator {
    client: aws_sdk_ecs::Client,
}

impl EcsTaskTerminator {
    /// Build the terminator from shared SDK configuration.
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_ecs::Client::new(config),
        }
    }
}

#[async_trait]
impl TaskTerminator for EcsTaskTerminator {
    async fn terminate(&self, task: &TaskHandle, reason: &str) -> Result<(), OrchestratorError> {
        self.client
            .stop_task()
            .cluster(&task.cluster_arn)
            .task(&task.task_arn)
            .reason(stop_reason(reason))
            .send()
            .await
            .map_err(|e| OrchestratorError {
                operation: "stop task",
                task_arn: task.task_arn.clone(),
                fault: classify("ecs:StopTask", &e),
            })?;
        info!(task_arn = %task.task_arn, cluster_arn = %task.cluster_arn, "task stop requested");
        Ok(())
    }

    async fn scale_down_service(
        &self,
        task: &TaskHandle,
        service: &str,
    ) -> Result<(), OrchestratorError> {
        self.client
            .update_service()
            .cluster(&task.cluster_arn)
            .service(service)
            .desired_count(0)
            .send()
            .await
            .map_err(|e| OrchestratorError {
                operation: "scale down service",
                task_arn: task.task_arn.clone(),
                fault: classify("ecs:UpdateService", &e),
            })?;
        info!(service, cluster_arn = %task.cluster_arn, "service scaled to zero");
        Ok(())
    }
}
