//! OCI distribution client for cosign signature discovery.
//!
//! Talks the plain registry HTTP API: manifest and blob GETs under `/v2/`.
//! Anonymous and basic credentials are sent as-is; a `401` carrying a
//! `Bearer` challenge is answered with one token exchange and one retry.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{
    signature_tag, ImageReference, RegistryAuth, RegistryError, SignatureArtifact, SignatureStore,
    SIGNATURE_ANNOTATION,
};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.docker.distribution.manifest.v2+json";

const SIGNATURE_MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Upper bound on a single signature payload, declared or served.
/// Simple-signing payloads are a few hundred bytes.
pub const MAX_PAYLOAD_BYTES: u64 = 1_048_576;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Manifest of a cosign signature image.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct SignatureManifest {
    /// Signature layers.
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

/// OCI content descriptor.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Layer media type.
    #[serde(default)]
    pub media_type: String,
    /// Content digest.
    pub digest: String,
    /// Declared size in bytes.
    #[serde(default)]
    pub size: Option<u64>,
    /// Descriptor annotations.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// Parse a signature manifest body.
///
/// # Errors
///
/// Returns [`RegistryError::Malformed`] when the body is not a manifest.
#[doc(hidden)]
pub fn parse_signature_manifest(body: &[u8]) -> Result<SignatureManifest, RegistryError> {
    serde_json::from_slice(body)
        .map_err(|e| RegistryError::Malformed(format!("signature manifest: {e}")))
}

/// A parsed `WWW-Authenticate: Bearer ...` challenge.
#[doc(hidden)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    /// Token endpoint.
    pub realm: String,
    /// Service name to request a token for.
    pub service: Option<String>,
    /// Scope suggested by the registry.
    pub scope: Option<String>,
}

impl BearerChallenge {
    /// Parse a challenge header value; `None` for non-bearer schemes.
    #[doc(hidden)]
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let pattern = Regex::new(r#"(\w+)="([^"]*)""#).ok()?;
        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for captures in pattern.captures_iter(params) {
            let value = captures.get(2).map(|m| m.as_str().to_owned());
            match captures.get(1).map(|m| m.as_str()) {
                Some("realm") => realm = value,
                Some("service") => service = value,
                Some("scope") => scope = value,
                _ => {}
            }
        }
        let realm = realm.filter(|r| !r.is_empty())?;
        Some(Self {
            realm,
            service,
            scope,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Base URL for the distribution API on `host`.
///
/// Loopback registries are spoken to over plain HTTP; everything else
/// requires TLS.
#[doc(hidden)]
pub fn api_base(host: &str) -> String {
    let hostname = host.split(':').next().unwrap_or(host);
    if matches!(hostname, "localhost" | "127.0.0.1") {
        format!("http://{host}/v2")
    } else {
        format!("https://{host}/v2")
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Registry client built once per invocation.
#[derive(Debug, Clone)]
pub struct OciRegistryClient {
    http: reqwest::Client,
}

impl OciRegistryClient {
    /// Build a client whose every request is capped at `call_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unreachable`] if the HTTP client cannot be
    /// constructed (TLS backend initialisation).
    pub fn new(call_timeout: Duration) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(call_timeout)
            .user_agent(concat!("cosign-gate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RegistryError::Unreachable {
                registry: "*".to_owned(),
                reason: e.to_string(),
            })?;
        Ok(Self { http })
    }

    async fn send(
        &self,
        image: &ImageReference,
        url: &str,
        accept: &str,
        authorization: Option<String>,
    ) -> Result<Response, RegistryError> {
        let mut request = self.http.get(url).header(ACCEPT, accept);
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }
        request.send().await.map_err(|e| RegistryError::Unreachable {
            registry: image.api_host().to_owned(),
            reason: e.to_string(),
        })
    }

    /// GET `url`, answering a bearer challenge once if the registry asks.
    async fn get(
        &self,
        image: &ImageReference,
        url: &str,
        accept: &str,
        auth: &RegistryAuth,
    ) -> Result<Response, RegistryError> {
        let response = self.send(image, url, accept, header_value(auth)).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let unauthorized = || RegistryError::Unauthorized {
            registry: image.api_host().to_owned(),
            repository: image.repository().to_owned(),
        };
        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(BearerChallenge::parse)
            .ok_or_else(unauthorized)?;

        let token = self.exchange_token(image, &challenge, auth).await?;
        let retried = self
            .send(image, url, accept, Some(format!("Bearer {token}")))
            .await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            return Err(unauthorized());
        }
        Ok(retried)
    }

    async fn exchange_token(
        &self,
        image: &ImageReference,
        challenge: &BearerChallenge,
        auth: &RegistryAuth,
    ) -> Result<String, RegistryError> {
        let realm = url::Url::parse(&challenge.realm).map_err(|e| {
            RegistryError::Malformed(format!("bearer realm {:?}: {e}", challenge.realm))
        })?;
        if !matches!(realm.scheme(), "https" | "http") {
            return Err(RegistryError::Malformed(format!(
                "bearer realm {} uses unsupported scheme",
                challenge.realm
            )));
        }

        let scope = format!("repository:{}:pull", image.repository());
        let mut query = vec![("scope", scope.as_str())];
        if let Some(service) = challenge.service.as_deref() {
            query.push(("service", service));
        }

        let mut request = self.http.get(realm).query(&query);
        match auth {
            RegistryAuth::Basic { username, password } => {
                request = request.basic_auth(username, Some(password));
            }
            RegistryAuth::Bearer(token) => request = request.bearer_auth(token),
            RegistryAuth::Anonymous => {}
        }

        let response = request
            .send()
            .await
            .map_err(|e| RegistryError::Unreachable {
                registry: image.api_host().to_owned(),
                reason: format!("token exchange: {e}"),
            })?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RegistryError::Unauthorized {
                registry: image.api_host().to_owned(),
                repository: image.repository().to_owned(),
            });
        }
        if !status.is_success() {
            return Err(RegistryError::Status {
                status: status.as_u16(),
                url: challenge.realm.clone(),
            });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Malformed(format!("token response: {e}")))?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RegistryError::Malformed("token response carried no token".to_owned()))
    }

    async fn fetch_blob(
        &self,
        image: &ImageReference,
        layer: &Descriptor,
        auth: &RegistryAuth,
    ) -> Result<Vec<u8>, RegistryError> {
        if layer.size.is_some_and(|size| size > MAX_PAYLOAD_BYTES) {
            return Err(RegistryError::Malformed(format!(
                "signature layer {} exceeds {MAX_PAYLOAD_BYTES} bytes",
                layer.digest
            )));
        }
        let url = format!(
            "{}/{}/blobs/{}",
            api_base(image.api_host()),
            image.repository(),
            layer.digest
        );
        let response = self.get(image, &url, "*/*", auth).await?;
        let response = expect_success(response, &url)?;
        let bytes = response.bytes().await.map_err(|e| RegistryError::Unreachable {
            registry: image.api_host().to_owned(),
            reason: e.to_string(),
        })?;
        if !u64::try_from(bytes.len()).is_ok_and(|len| len <= MAX_PAYLOAD_BYTES) {
            return Err(RegistryError::Malformed(format!(
                "signature layer {} body exceeds {MAX_PAYLOAD_BYTES} bytes",
                layer.digest
            )));
        }
        Ok(bytes.to_vec())
    }
}

fn header_value(auth: &RegistryAuth) -> Option<String> {
    use base64::Engine;

    match auth {
        RegistryAuth::Anonymous => None,
        RegistryAuth::Basic { username, password } => {
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
            Some(format!("Basic {encoded}"))
        }
        RegistryAuth::Bearer(token) => Some(format!("Bearer {token}")),
    }
}

fn expect_success(response: Response, url: &str) -> Result<Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(RegistryError::Status {
            status: status.as_u16(),
            url: url.to_owned(),
        })
    }
}

#[async_trait]
impl SignatureStore for OciRegistryClient {
    async fn resolve_digest(
        &self,
        image: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<String, RegistryError> {
        if let Some(digest) = image.digest() {
            return Ok(digest.to_owned());
        }

        let url = format!(
            "{}/{}/manifests/{}",
            api_base(image.api_host()),
            image.repository(),
            image.manifest_reference()
        );
        let response = self.get(image, &url, MANIFEST_ACCEPT, auth).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::ManifestNotFound {
                reference: format!("{}:{}", image.repository(), image.manifest_reference()),
            });
        }
        let response = expect_success(response, &url)?;

        let header_digest = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await.map_err(|e| RegistryError::Unreachable {
            registry: image.api_host().to_owned(),
            reason: e.to_string(),
        })?;
        let computed = format!("sha256:{}", hex::encode(Sha256::digest(&body)));

        if let Some(digest) = header_digest.filter(|d| d.starts_with("sha256:")) {
            if digest != computed {
                return Err(RegistryError::Malformed(format!(
                    "manifest digest header {digest} does not match body {computed}"
                )));
            }
        }
        Ok(computed)
    }

    async fn signatures(
        &self,
        image: &ImageReference,
        digest: &str,
        auth: &RegistryAuth,
    ) -> Result<Vec<SignatureArtifact>, RegistryError> {
        let tag = signature_tag(digest).map_err(|e| RegistryError::Malformed(e.to_string()))?;
        let url = format!(
            "{}/{}/manifests/{tag}",
            api_base(image.api_host()),
            image.repository()
        );

        let response = self.get(image, &url, SIGNATURE_MANIFEST_ACCEPT, auth).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(image = %image, %digest, "no signature manifest");
            return Ok(Vec::new());
        }
        let response = expect_success(response, &url)?;
        let body = response.bytes().await.map_err(|e| RegistryError::Unreachable {
            registry: image.api_host().to_owned(),
            reason: e.to_string(),
        })?;
        let manifest = parse_signature_manifest(&body)?;

        let mut artifacts = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            let signature = layer.annotations.get(SIGNATURE_ANNOTATION).cloned();
            if signature.is_none() {
                warn!(image = %image, layer = %layer.digest, media_type = %layer.media_type,
                    "signature layer without signature annotation");
            }
            let payload = self.fetch_blob(image, layer, auth).await?;
            artifacts.push(SignatureArtifact {
                layer_digest: layer.digest.clone(),
                payload,
                signature,
            });
        }
        debug!(image = %image, count = artifacts.len(), "fetched signature layers");
        Ok(artifacts)
    }
}
