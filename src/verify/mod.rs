//! Image signature verification.
//!
//! [`ImageVerifier`] turns one container image into a three-way
//! [`VerificationVerdict`]. "Unverified" is only ever reached after signature
//! data was actually inspected; anything that prevents inspection (bad
//! reference, credential exchange, registry failure) is a
//! [`VerificationVerdict::VerificationError`] instead.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::event::ContainerImage;
use crate::keys::VerificationKey;
use crate::registry::{
    is_sha256_digest, CredentialError, CredentialHelper, ImageReference, ParseError,
    RegistryError, SignatureArtifact, SignatureStore,
};

pub mod payload;

use payload::{ClaimMismatch, SimpleSigningPayload};

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

/// Which stage kept verification from completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The image reference or running digest is malformed.
    Parse,
    /// Registry credentials could not be obtained.
    Credential,
    /// The registry could not be read.
    Registry,
    /// The invocation deadline passed first.
    Deadline,
    /// The check was cancelled or panicked before producing a verdict.
    Aborted,
}

/// Why verification could not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{kind:?} failure: {reason}")]
pub struct VerificationFailure {
    /// Failing stage.
    pub kind: FailureKind,
    /// Diagnostic detail.
    pub reason: String,
    /// Whether evaluating the same image again later could succeed.
    pub retryable: bool,
}

impl VerificationFailure {
    /// Failure for an invocation deadline that expired mid-check.
    pub fn deadline() -> Self {
        Self {
            kind: FailureKind::Deadline,
            reason: "invocation deadline reached before verification finished".to_owned(),
            retryable: true,
        }
    }

    /// Failure for a check that never reported back.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Aborted,
            reason: reason.into(),
            retryable: true,
        }
    }
}

impl From<ParseError> for VerificationFailure {
    fn from(err: ParseError) -> Self {
        Self {
            kind: FailureKind::Parse,
            reason: err.to_string(),
            retryable: false,
        }
    }
}

impl From<CredentialError> for VerificationFailure {
    fn from(err: CredentialError) -> Self {
        Self {
            kind: FailureKind::Credential,
            reason: err.to_string(),
            retryable: err.is_transient(),
        }
    }
}

impl From<RegistryError> for VerificationFailure {
    fn from(err: RegistryError) -> Self {
        Self {
            kind: FailureKind::Registry,
            reason: err.to_string(),
            retryable: err.is_transient(),
        }
    }
}

/// Outcome of verifying one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum VerificationVerdict {
    /// At least one signature verified under the trusted key and its claims
    /// match the evaluated digest.
    Verified {
        /// Digest that was evaluated.
        digest: String,
    },
    /// Signatures were inspected and none was acceptable.
    Unverified {
        /// Digest that was evaluated.
        digest: String,
        /// Number of signature layers inspected (possibly zero).
        signatures_checked: usize,
    },
    /// The check could not complete.
    VerificationError(VerificationFailure),
}

impl VerificationVerdict {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Verified { .. } => "verified",
            Self::Unverified { .. } => "unverified",
            Self::VerificationError(_) => "verification_error",
        }
    }

    /// Whether this verdict is a positive trust decision.
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }

    /// Whether this verdict is a negative trust decision.
    pub fn is_unverified(&self) -> bool {
        matches!(self, Self::Unverified { .. })
    }
}

// ---------------------------------------------------------------------------
// Per-signature checks
// ---------------------------------------------------------------------------

/// Why one signature layer was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureRejection {
    /// The layer carries no signature annotation.
    #[error("layer has no signature annotation")]
    MissingSignature,
    /// The annotation is not base64.
    #[error("signature is not base64")]
    Undecodable,
    /// The served payload does not hash to the layer digest.
    #[error("payload digest {actual} does not match layer digest {declared}")]
    PayloadDigestMismatch {
        /// Digest from the layer descriptor.
        declared: String,
        /// Digest of the served bytes.
        actual: String,
    },
    /// The signature is not valid under the trusted key.
    #[error("signature does not verify under the trusted key")]
    BadSignature,
    /// The signature is valid but its claims do not cover this image.
    #[error(transparent)]
    Claims(#[from] ClaimMismatch),
}

/// Check one signature layer against the trusted key and the evaluated image.
///
/// # Errors
///
/// Returns the first [`SignatureRejection`] that applies.
pub fn check_signature(
    artifact: &SignatureArtifact,
    image: &ImageReference,
    digest: &str,
    key: &VerificationKey,
) -> Result<(), SignatureRejection> {
    let encoded = artifact
        .signature
        .as_deref()
        .ok_or(SignatureRejection::MissingSignature)?;

    let actual = format!("sha256:{}", hex::encode(Sha256::digest(&artifact.payload)));
    if actual != artifact.layer_digest {
        return Err(SignatureRejection::PayloadDigestMismatch {
            declared: artifact.layer_digest.clone(),
            actual,
        });
    }

    let signature = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| SignatureRejection::Undecodable)?;
    key.verify(&artifact.payload, &signature)
        .map_err(|_| SignatureRejection::BadSignature)?;

    SimpleSigningPayload::parse(&artifact.payload)?.check(image, digest)?;
    Ok(())
}

/// Reduce fetched signatures to a verdict.
pub fn evaluate(
    image: &ImageReference,
    digest: &str,
    artifacts: &[SignatureArtifact],
    key: &VerificationKey,
) -> VerificationVerdict {
    for (index, artifact) in artifacts.iter().enumerate() {
        match check_signature(artifact, image, digest, key) {
            Ok(()) => {
                debug!(image = %image, %digest, index, "signature accepted");
                return VerificationVerdict::Verified {
                    digest: digest.to_owned(),
                };
            }
            Err(rejection) => {
                debug!(image = %image, %digest, index, %rejection, "signature rejected");
            }
        }
    }
    VerificationVerdict::Unverified {
        digest: digest.to_owned(),
        signatures_checked: artifacts.len(),
    }
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

/// Produces a verdict for one container image.
#[async_trait]
pub trait ImageVerification: Send + Sync {
    /// Verify `container`'s image against `key`.
    async fn verify(&self, container: &ContainerImage, key: &VerificationKey)
        -> VerificationVerdict;
}

/// Registry-backed [`ImageVerification`].
pub struct ImageVerifier {
    credentials: Arc<dyn CredentialHelper>,
    store: Arc<dyn SignatureStore>,
    expected_repository: Option<String>,
}

impl ImageVerifier {
    /// Create a verifier over a credential helper and a signature store.
    pub fn new(credentials: Arc<dyn CredentialHelper>, store: Arc<dyn SignatureStore>) -> Self {
        Self {
            credentials,
            store,
            expected_repository: None,
        }
    }

    /// Log a warning for images outside `repository`. Diagnostic only; it
    /// never changes a verdict.
    pub fn with_expected_repository(mut self, repository: Option<String>) -> Self {
        self.expected_repository = repository;
        self
    }

    fn check_repository(&self, image: &ImageReference) {
        if let Some(expected) = self.expected_repository.as_deref() {
            if !image.repository().ends_with(expected) {
                warn!(
                    image = %image,
                    repository = image.repository(),
                    expected,
                    "image is outside the expected repository"
                );
            }
        }
    }

    async fn try_verify(
        &self,
        container: &ContainerImage,
        key: &VerificationKey,
    ) -> Result<VerificationVerdict, VerificationFailure> {
        let image = ImageReference::parse(&container.image)?;
        self.check_repository(&image);

        let auth = self.credentials.credentials(image.api_host()).await?;

        let digest = match container.image_digest.as_deref().filter(|d| !d.is_empty()) {
            Some(running) if is_sha256_digest(running) => running.to_owned(),
            Some(running) => {
                return Err(VerificationFailure {
                    kind: FailureKind::Parse,
                    reason: format!("running image digest {running:?} is not a sha256 digest"),
                    retryable: false,
                });
            }
            None => self.store.resolve_digest(&image, &auth).await?,
        };

        let artifacts = self.store.signatures(&image, &digest, &auth).await?;
        Ok(evaluate(&image, &digest, &artifacts, key))
    }
}

#[async_trait]
impl ImageVerification for ImageVerifier {
    async fn verify(
        &self,
        container: &ContainerImage,
        key: &VerificationKey,
    ) -> VerificationVerdict {
        let verdict = match self.try_verify(container, key).await {
            Ok(verdict) => verdict,
            Err(failure) => VerificationVerdict::VerificationError(failure),
        };
        match &verdict {
            VerificationVerdict::VerificationError(failure) => warn!(
                image = %container.image,
                container = %container.name,
                failure = ?failure.kind,
                reason = %failure.reason,
                retryable = failure.retryable,
                "image verification could not complete"
            ),
            other => info!(
                image = %container.image,
                container = %container.name,
                verdict = other.label(),
                "image verification finished"
            ),
        }
        verdict
    }
}
