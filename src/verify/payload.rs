//! Cosign simple-signing payloads and their claim checks.
//!
//! The payload is the signed document: it binds a signature to one manifest
//! digest. Checking it is what stops a valid signature for image A from
//! being replayed onto image B.

use serde::Deserialize;

use crate::registry::ImageReference;

/// `critical.type` value cosign writes for container image signatures.
pub const COSIGN_SIGNATURE_TYPE: &str = "cosign container image signature";

/// Why a signed payload does not vouch for the image under evaluation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClaimMismatch {
    /// The payload is not a simple-signing document.
    #[error("payload is not a simple-signing document: {0}")]
    Malformed(String),
    /// The document type is not a cosign image signature.
    #[error("unexpected signature type {0:?}")]
    WrongType(String),
    /// The signed digest differs from the evaluated digest.
    #[error("payload signs {signed}, image is {evaluated}")]
    DigestMismatch {
        /// Digest inside the payload.
        signed: String,
        /// Digest being evaluated.
        evaluated: String,
    },
    /// The signed identity names another repository.
    #[error("payload identity {signed:?} does not name repository {repository:?}")]
    RepositoryMismatch {
        /// `docker-reference` inside the payload.
        signed: String,
        /// Repository of the evaluated image.
        repository: String,
    },
}

/// Simple-signing payload (only the fields that are checked).
#[derive(Debug, Clone, Deserialize)]
pub struct SimpleSigningPayload {
    /// The claims cosign guarantees.
    pub critical: Critical,
}

/// The `critical` section of a simple-signing payload.
#[derive(Debug, Clone, Deserialize)]
pub struct Critical {
    /// Signed identity.
    #[serde(default)]
    pub identity: Identity,
    /// Signed image.
    pub image: ImageClaim,
    /// Document type.
    #[serde(rename = "type")]
    pub kind: String,
}

/// Signed identity claim.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Identity {
    /// Repository reference the signer declared.
    #[serde(rename = "docker-reference", default)]
    pub docker_reference: String,
}

/// Signed image claim.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageClaim {
    /// Manifest digest the signature covers.
    #[serde(rename = "docker-manifest-digest")]
    pub docker_manifest_digest: String,
}

impl SimpleSigningPayload {
    /// Parse payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimMismatch::Malformed`] when the bytes are not a payload.
    pub fn parse(bytes: &[u8]) -> Result<Self, ClaimMismatch> {
        serde_json::from_slice(bytes).map_err(|e| ClaimMismatch::Malformed(e.to_string()))
    }

    /// Check the claims against the image and digest under evaluation.
    ///
    /// # Errors
    ///
    /// Returns the first [`ClaimMismatch`] found.
    pub fn check(&self, image: &ImageReference, digest: &str) -> Result<(), ClaimMismatch> {
        if self.critical.kind != COSIGN_SIGNATURE_TYPE {
            return Err(ClaimMismatch::WrongType(self.critical.kind.clone()));
        }

        let signed = &self.critical.image.docker_manifest_digest;
        if signed != digest {
            return Err(ClaimMismatch::DigestMismatch {
                signed: signed.clone(),
                evaluated: digest.to_owned(),
            });
        }

        let identity = self.critical.identity.docker_reference.trim();
        if !identity.is_empty() && !names_repository(identity, image.repository()) {
            return Err(ClaimMismatch::RepositoryMismatch {
                signed: identity.to_owned(),
                repository: image.repository().to_owned(),
            });
        }
        Ok(())
    }
}

/// Whether a signed `docker-reference` designates `repository`.
///
/// The signer may have written the reference with or without registry host,
/// tag or digest, so only the trailing repository path is compared. Short
/// Docker Hub names (`nginx`) are normalised first (`library/nginx`).
fn names_repository(reference: &str, repository: &str) -> bool {
    let normalised = ImageReference::parse(reference)
        .is_ok_and(|signed| signed.repository() == repository);
    normalised || names_repository_path(reference, repository)
}

fn names_repository_path(reference: &str, repository: &str) -> bool {
    let without_digest = reference.split('@').next().unwrap_or(reference);
    let last_slash = without_digest.rfind('/');
    let without_tag = match without_digest.rfind(':') {
        Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
            &without_digest[..colon]
        }
        _ => without_digest,
    };
    without_tag == repository
        || without_tag
            .strip_suffix(repository)
            .is_some_and(|prefix| prefix.ends_with('/'))
}
