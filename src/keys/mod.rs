//! Trusted signing key resolution.
//!
//! The trusted key is configured in exactly one of three forms (see
//! [`KeyReference`]). Alias and ARN references are looked up through a
//! [`KeyManagement`] service; inline PEM material is parsed locally and never
//! causes a network call. The result is a [`VerificationKey`] bound to
//! SHA-256, owned by the invocation that resolved it.

use std::fmt;

use async_trait::async_trait;
use aws_lc_rs::signature::{
    UnparsedPublicKey, VerificationAlgorithm, ECDSA_P256_SHA256_ASN1, ECDSA_P384_SHA256_ASN1,
    RSA_PKCS1_2048_8192_SHA256,
};
use base64::Engine;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use spki::{ObjectIdentifier, SubjectPublicKeyInfoRef};
use tracing::{debug, info};

use crate::aws::{AccountScope, ServiceFault};

pub mod kms;

const ID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const SECP256R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");
const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

/// Key id recorded for keys configured inline as PEM.
pub const INLINE_KEY_ID: &str = "inline-pem";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while building or resolving the trusted key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    /// An alias or ARN reference is syntactically invalid.
    #[error("invalid key reference: {0}")]
    InvalidReference(String),
    /// Public key bytes could not be decoded or use an unsupported algorithm.
    #[error("invalid public key material: {0}")]
    InvalidKeyMaterial(String),
    /// An alias reference needs an account and region, and none were available.
    #[error("alias {alias:?} cannot be resolved without an account and region")]
    MissingScope {
        /// The configured alias name.
        alias: String,
    },
    /// The key exists but is disabled.
    #[error("key {key_id} is disabled")]
    Disabled {
        /// Key id reported by the key-management service.
        key_id: String,
    },
    /// The key exists but is not a signing key.
    #[error("key {key_id} is not a sign/verify key")]
    NotSigningKey {
        /// Key id reported by the key-management service.
        key_id: String,
    },
    /// The key-management service call failed.
    #[error("key lookup failed: {0}")]
    Lookup(#[from] ServiceFault),
}

/// A signature did not verify under the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("signature does not verify under the trusted key")]
pub struct SignatureMismatch;

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

/// A KMS alias name, stored without the `alias/` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAlias(String);

impl KeyAlias {
    /// Parse an alias given as `name` or `alias/name`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidReference`] for empty names, names outside
    /// `[A-Za-z0-9/_-]`, and AWS-managed (`aws/`) aliases.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let trimmed = raw.trim();
        let name = trimmed.strip_prefix("alias/").unwrap_or(trimmed);
        if name.is_empty() {
            return Err(KeyError::InvalidReference("alias name is empty".to_owned()));
        }
        let allowed = Regex::new(r"^[A-Za-z0-9/_-]+$")
            .map_err(|e| KeyError::InvalidReference(e.to_string()))?;
        if !allowed.is_match(name) {
            return Err(KeyError::InvalidReference(format!(
                "alias {name:?} contains characters outside [A-Za-z0-9/_-]"
            )));
        }
        if name.starts_with("aws/") {
            return Err(KeyError::InvalidReference(format!(
                "alias {name:?} names an AWS-managed key, which cannot sign"
            )));
        }
        Ok(Self(name.to_owned()))
    }

    /// The alias name without the `alias/` prefix.
    pub fn name(&self) -> &str {
        &self.0
    }

    /// The alias ARN inside `scope`.
    pub fn arn_in(&self, scope: &AccountScope) -> KmsKeyArn {
        KmsKeyArn {
            partition: scope.partition.clone(),
            region: scope.region.clone(),
            account: scope.account.clone(),
            resource: format!("alias/{}", self.0),
        }
    }
}

/// A KMS key or alias ARN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsKeyArn {
    partition: String,
    region: String,
    account: String,
    resource: String,
}

impl KmsKeyArn {
    /// Parse `arn:<partition>:kms:<region>:<account>:(key|alias)/<id>`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidReference`] when any component is missing
    /// or the ARN does not belong to KMS.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let invalid = |reason: &str| KeyError::InvalidReference(format!("{raw:?}: {reason}"));
        let parts: Vec<&str> = raw.trim().splitn(6, ':').collect();
        let [prefix, partition, service, region, account, resource] = parts.as_slice() else {
            return Err(invalid("expected six ':'-separated components"));
        };
        if *prefix != "arn" {
            return Err(invalid("does not start with 'arn'"));
        }
        if *service != "kms" {
            return Err(invalid("not a KMS ARN"));
        }
        if partition.is_empty() || region.is_empty() {
            return Err(invalid("partition and region must be set"));
        }
        if account.len() != 12 || !account.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("account must be twelve digits"));
        }
        let id = resource
            .strip_prefix("key/")
            .or_else(|| resource.strip_prefix("alias/"))
            .ok_or_else(|| invalid("resource must be key/<id> or alias/<name>"))?;
        if id.is_empty() {
            return Err(invalid("resource id is empty"));
        }
        Ok(Self {
            partition: (*partition).to_owned(),
            region: (*region).to_owned(),
            account: (*account).to_owned(),
            resource: (*resource).to_owned(),
        })
    }

    /// Region the key lives in.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Whether the ARN addresses an alias rather than a key id.
    pub fn is_alias(&self) -> bool {
        self.resource.starts_with("alias/")
    }
}

impl fmt::Display for KmsKeyArn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "arn:{}:kms:{}:{}:{}",
            self.partition, self.region, self.account, self.resource
        )
    }
}

/// The configured trusted-key reference. Exactly one form is ever active.
#[derive(Debug, Clone)]
pub enum KeyReference {
    /// A KMS alias, resolved against the event's account and region.
    Alias(KeyAlias),
    /// A KMS key or alias ARN, used directly.
    Arn(KmsKeyArn),
    /// Inline public-key material, already parsed.
    Pem(VerificationKey),
}

impl KeyReference {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Alias(_) => "alias",
            Self::Arn(_) => "arn",
            Self::Pem(_) => "pem",
        }
    }
}

// ---------------------------------------------------------------------------
// Verification key
// ---------------------------------------------------------------------------

/// Signature scheme of a trusted key. The digest is always SHA-256.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    /// ECDSA over NIST P-256, ASN.1 DER signatures.
    EcdsaP256Sha256,
    /// ECDSA over NIST P-384, ASN.1 DER signatures, SHA-256 digest.
    EcdsaP384Sha256,
    /// RSA PKCS#1 v1.5, 2048 to 8192 bit moduli.
    RsaPkcs1Sha256,
}

impl KeyAlgorithm {
    fn verification_algorithm(self) -> &'static dyn VerificationAlgorithm {
        match self {
            Self::EcdsaP256Sha256 => &ECDSA_P256_SHA256_ASN1,
            Self::EcdsaP384Sha256 => &ECDSA_P384_SHA256_ASN1,
            Self::RsaPkcs1Sha256 => &RSA_PKCS1_2048_8192_SHA256,
        }
    }
}

/// A resolved public key ready to verify signatures.
#[derive(Clone)]
pub struct VerificationKey {
    algorithm: KeyAlgorithm,
    public_key: Vec<u8>,
    fingerprint: String,
    key_id: String,
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl VerificationKey {
    /// Build a key from DER-encoded `SubjectPublicKeyInfo`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidKeyMaterial`] for malformed DER and for
    /// algorithms other than ECDSA P-256, ECDSA P-384 and RSA.
    pub fn from_spki_der(der: &[u8], key_id: impl Into<String>) -> Result<Self, KeyError> {
        let info = SubjectPublicKeyInfoRef::try_from(der)
            .map_err(|e| KeyError::InvalidKeyMaterial(format!("malformed SPKI: {e}")))?;

        let algorithm = if info.algorithm.oid == ID_EC_PUBLIC_KEY {
            let curve = info.algorithm.parameters_oid().map_err(|e| {
                KeyError::InvalidKeyMaterial(format!("EC key without curve parameter: {e}"))
            })?;
            if curve == SECP256R1 {
                KeyAlgorithm::EcdsaP256Sha256
            } else if curve == SECP384R1 {
                KeyAlgorithm::EcdsaP384Sha256
            } else {
                return Err(KeyError::InvalidKeyMaterial(format!(
                    "unsupported EC curve {curve}"
                )));
            }
        } else if info.algorithm.oid == RSA_ENCRYPTION {
            KeyAlgorithm::RsaPkcs1Sha256
        } else {
            return Err(KeyError::InvalidKeyMaterial(format!(
                "unsupported key algorithm {}",
                info.algorithm.oid
            )));
        };

        let public_key = info
            .subject_public_key
            .as_bytes()
            .ok_or_else(|| {
                KeyError::InvalidKeyMaterial("public key bit string is not byte aligned".to_owned())
            })?
            .to_vec();

        Ok(Self {
            algorithm,
            public_key,
            fingerprint: hex::encode(Sha256::digest(der)),
            key_id: key_id.into(),
        })
    }

    /// Build a key from a PEM `PUBLIC KEY` block.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidKeyMaterial`] when the PEM armor or the
    /// contained key is invalid.
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        let der = pem_to_der(pem)?;
        Self::from_spki_der(&der, INLINE_KEY_ID)
    }

    /// Signature scheme of this key.
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// KMS key id, or [`INLINE_KEY_ID`] for inline keys.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Hex SHA-256 of the SPKI encoding.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Verify `signature` over `message`.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureMismatch`] when the signature is invalid.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), SignatureMismatch> {
        UnparsedPublicKey::new(self.algorithm.verification_algorithm(), &self.public_key)
            .verify(message, signature)
            .map_err(|_| SignatureMismatch)
    }
}

/// Decode the body of a PEM `PUBLIC KEY` block.
///
/// # Errors
///
/// Returns [`KeyError::InvalidKeyMaterial`] when no `PUBLIC KEY` armor is
/// found or the body is not base64.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>, KeyError> {
    let mut body = String::new();
    let mut in_body = false;
    let mut closed = false;

    for line in pem.lines() {
        let trimmed = line.trim();
        if trimmed == "-----BEGIN PUBLIC KEY-----" {
            in_body = true;
            continue;
        }
        if trimmed == "-----END PUBLIC KEY-----" {
            closed = in_body;
            break;
        }
        if in_body {
            body.push_str(trimmed);
        }
    }

    if !closed {
        return Err(KeyError::InvalidKeyMaterial(
            "expected a PEM PUBLIC KEY block".to_owned(),
        ));
    }
    base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| KeyError::InvalidKeyMaterial(format!("PEM body is not base64: {e}")))
}

// ---------------------------------------------------------------------------
// Key management seam
// ---------------------------------------------------------------------------

/// Metadata returned by a describe-key call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescription {
    /// Canonical key id.
    pub key_id: String,
    /// Key ARN, when the service reports one.
    pub arn: Option<String>,
    /// Whether the key is enabled.
    pub enabled: bool,
    /// Whether the key is an asymmetric sign/verify key.
    pub sign_verify: bool,
}

impl KeyDescription {
    /// Whether `id` (bare key id or key ARN) names this key.
    pub fn identifies(&self, id: &str) -> bool {
        id == self.key_id
            || self.arn.as_deref() == Some(id)
            || id
                .strip_suffix(self.key_id.as_str())
                .is_some_and(|prefix| prefix.ends_with(":key/"))
    }
}

/// Public half of an asymmetric key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyMaterial {
    /// Key id the material belongs to.
    pub key_id: String,
    /// DER-encoded `SubjectPublicKeyInfo`.
    pub spki_der: Vec<u8>,
}

/// Key-management service operations used during resolution.
#[async_trait]
pub trait KeyManagement: Send + Sync {
    /// Describe the key addressed by `key_id` (id, ARN, alias name or alias ARN).
    ///
    /// # Errors
    ///
    /// Returns a classified [`ServiceFault`] when the call fails.
    async fn describe_key(&self, key_id: &str) -> Result<KeyDescription, ServiceFault>;

    /// Fetch the public key for `key_id`.
    ///
    /// # Errors
    ///
    /// Returns a classified [`ServiceFault`] when the call fails.
    async fn public_key(&self, key_id: &str) -> Result<PublicKeyMaterial, ServiceFault>;
}

/// Turns a [`KeyReference`] into a [`VerificationKey`].
///
/// Holds no state between calls; every invocation resolves afresh.
pub struct KeyResolver<'a> {
    kms: &'a dyn KeyManagement,
}

impl<'a> KeyResolver<'a> {
    /// Create a resolver over a key-management client.
    pub fn new(kms: &'a dyn KeyManagement) -> Self {
        Self { kms }
    }

    /// Resolve `reference` into a usable key.
    ///
    /// Inline PEM keys resolve without touching the key-management service.
    /// Lookup failures are returned as-is; nothing is retried here.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] when an alias has no scope, the lookup fails, the
    /// key is disabled or not a signing key, or the material is unusable.
    pub async fn resolve(
        &self,
        reference: &KeyReference,
        scope: Option<&AccountScope>,
    ) -> Result<VerificationKey, KeyError> {
        match reference {
            KeyReference::Pem(key) => {
                debug!(fingerprint = %key.fingerprint(), "using inline public key");
                Ok(key.clone())
            }
            KeyReference::Arn(arn) => self.fetch(&arn.to_string()).await,
            KeyReference::Alias(alias) => {
                let scope = scope.ok_or_else(|| KeyError::MissingScope {
                    alias: alias.name().to_owned(),
                })?;
                self.fetch(&alias.arn_in(scope).to_string()).await
            }
        }
    }

    async fn fetch(&self, reference: &str) -> Result<VerificationKey, KeyError> {
        let description = self.kms.describe_key(reference).await?;
        info!(
            reference,
            key_id = %description.key_id,
            "key lookup resolved key id"
        );

        if !description.enabled {
            return Err(KeyError::Disabled {
                key_id: description.key_id,
            });
        }
        if !description.sign_verify {
            return Err(KeyError::NotSigningKey {
                key_id: description.key_id,
            });
        }

        let lookup_id = description.arn.as_deref().unwrap_or(&description.key_id);
        let material = self.kms.public_key(lookup_id).await?;
        if !description.identifies(&material.key_id) {
            return Err(KeyError::InvalidKeyMaterial(format!(
                "public key returned for {}, expected {}",
                material.key_id, description.key_id
            )));
        }
        let key = VerificationKey::from_spki_der(&material.spki_der, description.key_id)?;
        debug!(
            algorithm = ?key.algorithm(),
            fingerprint = %key.fingerprint(),
            "public key loaded"
        );
        Ok(key)
    }
}
