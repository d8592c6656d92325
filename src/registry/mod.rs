//! Container registry access for signature discovery.
//!
//! Two seams keep the verifier testable: [`CredentialHelper`] exchanges
//! ambient credentials for registry auth, and [`SignatureStore`] speaks the
//! registry protocol. Signatures follow the cosign convention: for an image
//! digest `sha256:<hex>` they live in the same repository under the tag
//! `sha256-<hex>.sig`.

use std::fmt;

use async_trait::async_trait;
use oci_distribution::Reference;

use crate::aws::ServiceFault;

pub mod ecr;
pub mod oci;

/// Annotation carrying the base64 signature on each cosign signature layer.
pub const SIGNATURE_ANNOTATION: &str = "dev.cosignproject.cosign/signature";

const DEFAULT_TAG: &str = "latest";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// An image reference could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid image reference {reference:?}: {reason}")]
pub struct ParseError {
    /// The rejected input.
    pub reference: String,
    /// Why it was rejected.
    pub reason: String,
}

/// Registry credentials could not be obtained.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialError {
    /// The credential exchange call failed.
    #[error("credential exchange for {registry} failed: {fault}")]
    Exchange {
        /// Registry host.
        registry: String,
        /// Classified service failure.
        fault: ServiceFault,
    },
    /// The exchange succeeded but returned unusable data.
    #[error("credential helper for {registry} returned unusable data: {reason}")]
    Malformed {
        /// Registry host.
        registry: String,
        /// What was wrong.
        reason: String,
    },
}

/// A registry request failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// Transport-level failure (DNS, TLS, connection, timeout).
    #[error("registry {registry} unreachable: {reason}")]
    Unreachable {
        /// Registry host.
        registry: String,
        /// Transport error text.
        reason: String,
    },
    /// The registry refused the credentials.
    #[error("registry {registry} rejected credentials for {repository}")]
    Unauthorized {
        /// Registry host.
        registry: String,
        /// Repository path.
        repository: String,
    },
    /// The image manifest itself does not exist.
    #[error("image manifest {reference} not found")]
    ManifestNotFound {
        /// `repository:tag` or `repository@digest` that was requested.
        reference: String,
    },
    /// Any other non-success status.
    #[error("registry returned status {status} for {url}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Requested URL.
        url: String,
    },
    /// A response body or header did not have the expected shape.
    #[error("malformed registry response: {0}")]
    Malformed(String),
}

impl CredentialError {
    /// Whether retrying the exchange later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Exchange { fault, .. } => fault.kind.is_transient(),
            Self::Malformed { .. } => false,
        }
    }
}

impl RegistryError {
    /// Whether retrying the request later could succeed.
    ///
    /// Transport failures, rate limiting and server errors are transient;
    /// refused credentials, missing manifests and malformed responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Unauthorized { .. } | Self::ManifestNotFound { .. } | Self::Malformed(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Image references
// ---------------------------------------------------------------------------

/// A parsed `registry/repository[:tag][@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    original: String,
    registry: String,
    api_host: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parse and normalise an image reference.
    ///
    /// References with neither tag nor digest default to the `latest` tag.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] for anything the distribution grammar rejects,
    /// and for digests that are not `sha256:<64 hex>`.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let trimmed = raw.trim();
        let fail = |reason: String| ParseError {
            reference: raw.to_owned(),
            reason,
        };
        if trimmed.is_empty() {
            return Err(fail("reference is empty".to_owned()));
        }

        let reference: Reference = trimmed.parse().map_err(|e| fail(format!("{e}")))?;

        let digest = reference.digest().map(str::to_owned);
        if let Some(digest) = digest.as_deref() {
            if !is_sha256_digest(digest) {
                return Err(fail(format!("unsupported digest {digest:?}")));
            }
        }
        let tag = reference
            .tag()
            .map(str::to_owned)
            .or_else(|| digest.is_none().then(|| DEFAULT_TAG.to_owned()));

        Ok(Self {
            original: trimmed.to_owned(),
            registry: reference.registry().to_owned(),
            api_host: reference.resolve_registry().to_owned(),
            repository: reference.repository().to_owned(),
            tag,
            digest,
        })
    }

    /// Registry host as written (after normalisation).
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Host serving the distribution API for this registry.
    pub fn api_host(&self) -> &str {
        &self.api_host
    }

    /// Repository path inside the registry.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Tag, if the reference names one.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Digest, if the reference pins one.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Digest when pinned, otherwise the tag; used in manifest URLs.
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

/// Whether `digest` is `sha256:` followed by 64 lowercase hex characters.
pub fn is_sha256_digest(digest: &str) -> bool {
    digest.strip_prefix("sha256:").is_some_and(|hex| {
        hex.len() == 64 && hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    })
}

/// The cosign signature tag for an image digest.
///
/// # Errors
///
/// Returns [`ParseError`] when `digest` is not a sha256 digest.
pub fn signature_tag(digest: &str) -> Result<String, ParseError> {
    if !is_sha256_digest(digest) {
        return Err(ParseError {
            reference: digest.to_owned(),
            reason: "not a sha256 digest".to_owned(),
        });
    }
    Ok(format!("{}.sig", digest.replacen(':', "-", 1)))
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Credentials to present to a registry.
#[derive(Clone, PartialEq, Eq)]
pub enum RegistryAuth {
    /// No credentials; only public repositories are readable.
    Anonymous,
    /// HTTP basic credentials.
    Basic {
        /// User name.
        username: String,
        /// Password or token.
        password: String,
    },
    /// A bearer token already scoped for the repository.
    Bearer(String),
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::Bearer(_) => f.write_str("Bearer([REDACTED])"),
        }
    }
}

/// Exchanges ambient credentials for registry auth, keyed by registry host.
#[async_trait]
pub trait CredentialHelper: Send + Sync {
    /// Credentials for `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] when the exchange fails. Hosts the helper
    /// has no credentials for yield [`RegistryAuth::Anonymous`], not an error.
    async fn credentials(&self, registry: &str) -> Result<RegistryAuth, CredentialError>;
}

// ---------------------------------------------------------------------------
// Signature store
// ---------------------------------------------------------------------------

/// One signature layer fetched from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureArtifact {
    /// Digest the layer descriptor claims for the payload.
    pub layer_digest: String,
    /// Simple-signing payload bytes as served.
    pub payload: Vec<u8>,
    /// Base64 signature from [`SIGNATURE_ANNOTATION`], when present.
    pub signature: Option<String>,
}

/// Registry operations the verifier needs.
#[async_trait]
pub trait SignatureStore: Send + Sync {
    /// Resolve `image` to the digest of the manifest it currently names.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the manifest cannot be fetched.
    async fn resolve_digest(
        &self,
        image: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<String, RegistryError>;

    /// Fetch all signature layers attached to `digest`.
    ///
    /// A missing signature manifest yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the registry cannot be read.
    async fn signatures(
        &self,
        image: &ImageReference,
        digest: &str,
        auth: &RegistryAuth,
    ) -> Result<Vec<SignatureArtifact>, RegistryError>;
}
