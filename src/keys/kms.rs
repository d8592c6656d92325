//! AWS KMS adapter for [`KeyManagement`].

use async_trait::async_trait;
use aws_config::{Region, SdkConfig};
use aws_sdk_kms::types::{KeyState, KeyUsageType};

use super::{KeyDescription, KeyManagement, KmsKeyArn, PublicKeyMaterial};
use crate::aws::{classify, FaultKind, ServiceFault};

/// KMS-backed key lookups.
///
/// Requests addressed by ARN go to the ARN's region; everything else uses
/// the ambient region.
#[derive(Debug, Clone)]
pub struct KmsKeyManagement {
    config: SdkConfig,
    client: aws_sdk_kms::Client,
}

impl KmsKeyManagement {
    /// Build the adapter from shared SDK configuration.
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            config: config.clone(),
            client: aws_sdk_kms::Client::new(config),
        }
    }

    fn client_for(&self, key_id: &str) -> aws_sdk_kms::Client {
        let arn_region = KmsKeyArn::parse(key_id)
            .ok()
            .map(|arn| arn.region().to_owned())
            .filter(|region| {
                self.config.region().map(ToString::to_string).as_deref() != Some(region.as_str())
            });
        match arn_region {
            Some(region) => {
                let conf = aws_sdk_kms::config::Builder::from(&self.config)
                    .region(Region::new(region))
                    .build();
                aws_sdk_kms::Client::from_conf(conf)
            }
            None => self.client.clone(),
        }
    }
}

#[async_trait]
impl KeyManagement for KmsKeyManagement {
    async fn describe_key(&self, key_id: &str) -> Result<KeyDescription, ServiceFault> {
        const OP: &str = "kms:DescribeKey";
        let output = self
            .client_for(key_id)
            .describe_key()
            .key_id(key_id)
            .send()
            .await
            .map_err(|e| classify(OP, &e))?;

        let metadata = output.key_metadata().ok_or_else(|| {
            ServiceFault::new(OP, FaultKind::Other, "response carried no key metadata")
        })?;

        Ok(KeyDescription {
            key_id: metadata.key_id().to_owned(),
            arn: metadata.arn().map(str::to_owned),
            enabled: metadata.enabled() && metadata.key_state() == Some(&KeyState::Enabled),
            sign_verify: metadata.key_usage() == Some(&KeyUsageType::SignVerify),
        })
    }

    async fn public_key(&self, key_id: &str) -> Result<PublicKeyMaterial, ServiceFault> {
        const OP: &str = "kms:GetPublicKey";
        let output = self
            .client_for(key_id)
            .get_public_key()
            .key_id(key_id)
            .send()
            .await
            .map_err(|e| classify(OP, &e))?;

        let spki_der = output
            .public_key()
            .map(|blob| blob.as_ref().to_vec())
            .ok_or_else(|| {
                ServiceFault::new(OP, FaultKind::Other, "response carried no public key")
            })?;

        Ok(PublicKeyMaterial {
            key_id: output.key_id().unwrap_or(key_id).to_owned(),
            spki_der,
        })
    }
}
