//! Shared AWS plumbing: SDK configuration and error classification.
//!
//! Every adapter talks to a different AWS control plane (KMS, ECR, ECS, SNS),
//! and each of them reports failures with its own error-code vocabulary.
//! [`classify`] folds those codes into the small [`FaultKind`] set once, at the
//! adapter boundary, so nothing above the adapters branches on provider codes.

use std::fmt;
use std::time::Duration;

use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_types::error::display::DisplayErrorContext;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use serde::{Deserialize, Serialize};

/// Account and region an event was emitted from.
///
/// Alias key references are only meaningful inside one account and region,
/// so they are resolved against this scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountScope {
    /// AWS partition (`aws`, `aws-cn`, `aws-us-gov`).
    pub partition: String,
    /// Twelve-digit account id.
    pub account: String,
    /// Region code, e.g. `us-east-1`.
    pub region: String,
}

impl AccountScope {
    /// Build a scope in the default `aws` partition, inferring `aws-cn` and
    /// `aws-us-gov` from the region prefix.
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        let region = region.into();
        let partition = if region.starts_with("cn-") {
            "aws-cn"
        } else if region.starts_with("us-gov-") {
            "aws-us-gov"
        } else {
            "aws"
        };
        Self {
            partition: partition.to_owned(),
            account: account.into(),
            region,
        }
    }
}

/// Semantic failure classes for calls to AWS services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The addressed resource (key, cluster, task, topic, repository) does not exist.
    NotFound,
    /// Credentials are missing, expired, or not allowed to perform the call.
    AccessDenied,
    /// The service rejected the call because of request rate.
    Throttled,
    /// The call or one of its dependencies ran out of time.
    Timeout,
    /// The endpoint could not be reached at all.
    Unreachable,
    /// The request was well-formed transport-wise but semantically rejected.
    InvalidRequest,
    /// The service reported an internal failure.
    Unavailable,
    /// Anything not covered above.
    Other,
}

impl FaultKind {
    /// Whether a redelivery of the same event could plausibly succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Throttled | Self::Timeout | Self::Unreachable | Self::Unavailable
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AccessDenied => "access_denied",
            Self::Throttled => "throttled",
            Self::Timeout => "timeout",
            Self::Unreachable => "unreachable",
            Self::InvalidRequest => "invalid_request",
            Self::Unavailable => "unavailable",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure from one AWS call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed ({kind}): {message}")]
pub struct ServiceFault {
    /// The API operation that failed, e.g. `kms:GetPublicKey`.
    pub operation: &'static str,
    /// Semantic failure class.
    pub kind: FaultKind,
    /// Provider error code when the service returned one.
    pub code: Option<String>,
    /// Human-readable detail for logs.
    pub message: String,
}

impl ServiceFault {
    /// Build a fault directly, used by adapters for non-SDK failures.
    pub fn new(operation: &'static str, kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            operation,
            kind,
            code: None,
            message: message.into(),
        }
    }
}

/// Classify an SDK error for `operation` into a [`ServiceFault`].
pub fn classify<E, R>(operation: &'static str, err: &SdkError<E, R>) -> ServiceFault
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: fmt::Debug,
{
    let kind = match err {
        SdkError::TimeoutError(_) => FaultKind::Timeout,
        SdkError::DispatchFailure(failure) if failure.is_timeout() => FaultKind::Timeout,
        SdkError::DispatchFailure(_) => FaultKind::Unreachable,
        SdkError::ServiceError(_) | SdkError::ResponseError(_) => kind_for_code(err.code()),
        _ => FaultKind::Other,
    };
    ServiceFault {
        operation,
        kind,
        code: err.code().map(str::to_owned),
        message: DisplayErrorContext(err).to_string(),
    }
}

/// Map a provider error code onto a [`FaultKind`].
pub fn kind_for_code(code: Option<&str>) -> FaultKind {
    let Some(code) = code else {
        return FaultKind::Other;
    };
    match code {
        "NotFoundException"
        | "NotFound"
        | "ResourceNotFoundException"
        | "ClusterNotFoundException"
        | "ServiceNotFoundException"
        | "RepositoryNotFoundException" => FaultKind::NotFound,
        "AccessDeniedException"
        | "AccessDenied"
        | "AuthorizationError"
        | "UnrecognizedClientException"
        | "InvalidClientTokenId"
        | "ExpiredTokenException" => FaultKind::AccessDenied,
        "ThrottlingException"
        | "Throttling"
        | "Throttled"
        | "TooManyRequestsException"
        | "LimitExceededException" => FaultKind::Throttled,
        "DependencyTimeoutException" | "RequestTimeout" | "RequestTimeoutException" => {
            FaultKind::Timeout
        }
        "KMSInternalException"
        | "InternalException"
        | "InternalErrorException"
        | "InternalFailure"
        | "ServerException"
        | "ServiceUnavailable"
        | "ServiceUnavailableException"
        | "KeyUnavailableException" => FaultKind::Unavailable,
        "InvalidParameterException"
        | "InvalidParameter"
        | "InvalidArnException"
        | "ValidationException"
        | "ClientException"
        | "DisabledException"
        | "KMSInvalidStateException"
        | "InvalidKeyUsageException"
        | "UnsupportedOperationException"
        | "ServiceNotActiveException" => FaultKind::InvalidRequest,
        _ => FaultKind::Other,
    }
}

/// Load the shared SDK configuration for one invocation.
///
/// Retries are disabled: recovery from transient failures belongs to the
/// runtime that redelivers the event. Every operation is capped at
/// `call_timeout`.
pub async fn load_sdk_config(call_timeout: Duration) -> SdkConfig {
    let timeouts = TimeoutConfig::builder()
        .operation_timeout(call_timeout)
        .build();
    aws_config::defaults(BehaviorVersion::latest())
        .retry_config(RetryConfig::disabled())
        .timeout_config(timeouts)
        .load()
        .await
}
