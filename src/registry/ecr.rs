//! ECR credential helper.
//!
//! ECR registries authenticate with short-lived basic credentials obtained
//! from `ecr:GetAuthorizationToken` in the registry's own region. Hosts that
//! are not ECR registries get anonymous access.

use async_trait::async_trait;
use aws_config::{Region, SdkConfig};
use base64::Engine;
use regex::Regex;
use tracing::debug;

use super::{CredentialError, CredentialHelper, RegistryAuth};
use crate::aws::{classify, FaultKind, ServiceFault};

const ECR_HOST_PATTERN: &str =
    r"^(\d{12})\.dkr\.ecr(?:-fips)?\.([a-z0-9-]+)\.amazonaws\.com(?:\.cn)?$";

/// Account and region encoded in an ECR registry host name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcrRegistry {
    /// Registry (account) id.
    pub account: String,
    /// Region of the registry.
    pub region: String,
}

/// Recognise `<account>.dkr.ecr.<region>.amazonaws.com` hosts.
pub fn parse_ecr_host(host: &str) -> Option<EcrRegistry> {
    let pattern = Regex::new(ECR_HOST_PATTERN).ok()?;
    let captures = pattern.captures(host)?;
    Some(EcrRegistry {
        account: captures.get(1)?.as_str().to_owned(),
        region: captures.get(2)?.as_str().to_owned(),
    })
}

/// Decode an ECR authorization token (`base64("AWS:<password>")`).
///
/// # Errors
///
/// Returns [`CredentialError::Malformed`] when the token is not base64 or
/// lacks the `user:password` separator.
pub fn decode_authorization_token(
    registry: &str,
    token: &str,
) -> Result<RegistryAuth, CredentialError> {
    let malformed = |reason: String| CredentialError::Malformed {
        registry: registry.to_owned(),
        reason,
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(token.trim())
        .map_err(|e| malformed(format!("token is not base64: {e}")))?;
    let text = String::from_utf8(decoded).map_err(|_| malformed("token is not UTF-8".to_owned()))?;
    let (username, password) = text
        .split_once(':')
        .ok_or_else(|| malformed("token lacks user:password separator".to_owned()))?;
    if username.is_empty() || password.is_empty() {
        return Err(malformed("token has an empty user or password".to_owned()));
    }
    Ok(RegistryAuth::Basic {
        username: username.to_owned(),
        password: password.to_owned(),
    })
}

/// Credential helper backed by ECR.
#[derive(Debug, Clone)]
pub struct EcrCredentialHelper {
    config: SdkConfig,
}

impl EcrCredentialHelper {
    /// Build the helper from shared SDK configuration.
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn client_for(&self, region: &str) -> aws_sdk_ecr::Client {
        let conf = aws_sdk_ecr::config::Builder::from(&self.config)
            .region(Region::new(region.to_owned()))
            .build();
        aws_sdk_ecr::Client::from_conf(conf)
    }
}

#[async_trait]
impl CredentialHelper for EcrCredentialHelper {
    async fn credentials(&self, registry: &str) -> Result<RegistryAuth, CredentialError> {
        const OP: &str = "ecr:GetAuthorizationToken";
        let Some(ecr) = parse_ecr_host(registry) else {
            debug!(registry, "not an ECR registry, using anonymous access");
            return Ok(RegistryAuth::Anonymous);
        };

        let output = self
            .client_for(&ecr.region)
            .get_authorization_token()
            .send()
            .await
            .map_err(|e| CredentialError::Exchange {
                registry: registry.to_owned(),
                fault: classify(OP, &e),
            })?;

        let token = output
            .authorization_data()
            .iter()
            .find_map(|data| data.authorization_token())
            .ok_or_else(|| CredentialError::Exchange {
                registry: registry.to_owned(),
                fault: ServiceFault::new(OP, FaultKind::Other, "no authorization data returned"),
            })?;

        debug!(registry, account = %ecr.account, region = %ecr.region, "obtained ECR credentials");
        decode_authorization_token(registry, token)
    }
}
