//! Configuration loading and validation.
//!
//! Values come from the process environment, then an optional TOML file,
//! then defaults, in that order of precedence. TOML keys are the lowercase
//! environment names (`key_alias`, `notification_topic`, ...).
//!
//! The three key sources form one group: if the environment sets any of
//! them, the file's key sources are ignored.
//!
//! Everything is validated here, before any network call: a [`GateConfig`]
//! always carries exactly one parsed key source.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::enforce::{EnforcementSettings, DEFAULT_CALL_TIMEOUT, DEFAULT_STOP_REASON};
use crate::keys::{KeyAlias, KeyReference, KmsKeyArn, VerificationKey};

/// Environment variable naming a KMS alias.
pub const KEY_ALIAS: &str = "KEY_ALIAS";
/// Environment variable holding a KMS key ARN.
pub const KEY_ARN: &str = "KEY_ARN";
/// Environment variable holding a PEM public key.
pub const KEY_PEM: &str = "KEY_PEM";
/// Environment variable naming the notification topic ARN.
pub const NOTIFICATION_TOPIC: &str = "NOTIFICATION_TOPIC";
/// Environment variable naming the expected repository.
pub const REPOSITORY_NAME: &str = "REPOSITORY_NAME";
/// Environment variable for the invocation timeout in seconds.
pub const INVOCATION_TIMEOUT_SECS: &str = "INVOCATION_TIMEOUT_SECS";
/// Environment variable for the per-call timeout in seconds.
pub const CALL_TIMEOUT_SECS: &str = "CALL_TIMEOUT_SECS";
/// Environment variable toggling redelivery on verification errors.
pub const FAIL_ON_VERIFICATION_ERROR: &str = "FAIL_ON_VERIFICATION_ERROR";
/// Environment variable for the stop reason.
pub const STOP_REASON: &str = "STOP_REASON";
/// Environment variable toggling service scale-down.
pub const SCALE_DOWN_SERVICE: &str = "SCALE_DOWN_SERVICE";

const LEGACY_TOPIC: &str = "SNS_TOPIC_ARN";
const LEGACY_REPOSITORY: &str = "REPO_NAME";

const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(60);

const KEY_SOURCES: [&str; 3] = [KEY_ALIAS, KEY_ARN, KEY_PEM];

/// Configuration errors. All of them are fatal and raised before any
/// network call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// None of `KEY_ALIAS`, `KEY_ARN`, `KEY_PEM` is set.
    #[error("no signing key configured: set exactly one of KEY_ALIAS, KEY_ARN, KEY_PEM")]
    MissingKeySource,
    /// More than one key source is set.
    #[error("ambiguous signing key: {sources:?} are all set, keep exactly one")]
    AmbiguousKeySource {
        /// The key sources that were set.
        sources: Vec<&'static str>,
    },
    /// A required value is missing.
    #[error("{key} is required")]
    Missing {
        /// Environment name of the value.
        key: &'static str,
    },
    /// A value is present but unusable.
    #[error("invalid {key}: {reason}")]
    Invalid {
        /// Environment name of the value.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
    /// The config file could not be read or parsed.
    #[error("config file {path}: {reason}")]
    File {
        /// Path of the file.
        path: PathBuf,
        /// Read or parse error.
        reason: String,
    },
}

/// Optional TOML config file. Every field may be overridden from the
/// environment.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// KMS alias name.
    pub key_alias: Option<String>,
    /// KMS key ARN.
    pub key_arn: Option<String>,
    /// PEM public key.
    pub key_pem: Option<String>,
    /// Notification topic ARN.
    pub notification_topic: Option<String>,
    /// Expected repository for diagnostics.
    pub repository_name: Option<String>,
    /// Invocation timeout in seconds.
    pub invocation_timeout_secs: Option<u64>,
    /// Per-call timeout in seconds.
    pub call_timeout_secs: Option<u64>,
    /// Fail the invocation on unresolved verification errors.
    pub fail_on_verification_error: Option<bool>,
    /// Stop reason.
    pub stop_reason: Option<String>,
    /// Scale the owning service to zero on termination.
    pub scale_down_service: Option<bool>,
}

impl FileConfig {
    /// Read and parse a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::File`] when the file cannot be read or parsed.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let file_error = |reason: String| ConfigError::File {
            path: path.to_path_buf(),
            reason,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
        toml::from_str(&contents).map_err(|e| file_error(e.to_string()))
    }

    fn entries(&self) -> HashMap<&'static str, String> {
        let mut entries = HashMap::new();
        let strings = [
            (KEY_ALIAS, &self.key_alias),
            (KEY_ARN, &self.key_arn),
            (KEY_PEM, &self.key_pem),
            (NOTIFICATION_TOPIC, &self.notification_topic),
            (REPOSITORY_NAME, &self.repository_name),
            (STOP_REASON, &self.stop_reason),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                entries.insert(key, value.clone());
            }
        }
        for (key, value) in [
            (INVOCATION_TIMEOUT_SECS, self.invocation_timeout_secs),
            (CALL_TIMEOUT_SECS, self.call_timeout_secs),
        ] {
            if let Some(value) = value {
                entries.insert(key, value.to_string());
            }
        }
        for (key, value) in [
            (FAIL_ON_VERIFICATION_ERROR, self.fail_on_verification_error),
            (SCALE_DOWN_SERVICE, self.scale_down_service),
        ] {
            if let Some(value) = value {
                entries.insert(key, value.to_string());
            }
        }
        entries
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// The trusted key source.
    pub key: KeyReference,
    /// Notification topic ARN.
    pub notification_topic: String,
    /// Expected repository, for diagnostics only.
    pub repository_name: Option<String>,
    /// Deadline for one invocation when the runtime supplies none.
    pub invocation_timeout: Duration,
    /// Budget for each outbound call.
    pub call_timeout: Duration,
    /// Fail the invocation when verification errors leave a task unresolved.
    pub fail_on_verification_error: bool,
    /// Reason recorded on stopped tasks.
    pub stop_reason: String,
    /// Scale the owning service to zero after stopping a task.
    pub scale_down_service: bool,
}

impl GateConfig {
    /// Load from the environment, layered over `path` when given.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unreadable files and invalid values.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => FileConfig::read(path)?,
            None => FileConfig::default(),
        };
        Self::from_lookup(|key| std::env::var(key).ok(), &file)
    }

    /// Load from the environment only.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok(), &FileConfig::default())
    }

    /// Build from an environment lookup layered over `file`.
    ///
    /// Empty or whitespace-only values count as unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for missing, ambiguous or invalid values.
    pub fn from_lookup<F>(lookup: F, file: &FileConfig) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file_entries = file.entries();
        let from_env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let from_file =
            |key: &str| file_entries.get(key).cloned().filter(|v| !v.trim().is_empty());
        let get = |key: &'static str| -> Option<String> {
            from_env(key).or_else(|| from_file(key))
        };

        let env_keys = KEY_SOURCES.map(|key| from_env(key));
        let [alias, arn, pem] = if env_keys.iter().any(Option::is_some) {
            env_keys
        } else {
            KEY_SOURCES.map(|key| from_file(key))
        };
        let key = key_reference(alias, arn, pem)?;

        let notification_topic = get(NOTIFICATION_TOPIC)
            .or_else(|| get(LEGACY_TOPIC))
            .map(|topic| topic.trim().to_owned())
            .ok_or(ConfigError::Missing {
                key: NOTIFICATION_TOPIC,
            })?;
        validate_topic(&notification_topic)?;

        let repository_name = get(REPOSITORY_NAME)
            .or_else(|| get(LEGACY_REPOSITORY))
            .map(|name| name.trim().to_owned());

        let invocation_timeout =
            seconds(INVOCATION_TIMEOUT_SECS, get(INVOCATION_TIMEOUT_SECS))?
                .unwrap_or(DEFAULT_INVOCATION_TIMEOUT);
        let call_timeout =
            seconds(CALL_TIMEOUT_SECS, get(CALL_TIMEOUT_SECS))?.unwrap_or(DEFAULT_CALL_TIMEOUT);

        let config = Self {
            key,
            notification_topic,
            repository_name,
            invocation_timeout,
            call_timeout,
            fail_on_verification_error: flag(
                FAIL_ON_VERIFICATION_ERROR,
                get(FAIL_ON_VERIFICATION_ERROR),
            )?
            .unwrap_or(true),
            stop_reason: get(STOP_REASON).unwrap_or_else(|| DEFAULT_STOP_REASON.to_owned()),
            scale_down_service: flag(SCALE_DOWN_SERVICE, get(SCALE_DOWN_SERVICE))?
                .unwrap_or(false),
        };
        config.check_time_budget()?;
        Ok(config)
    }

    /// The invocation timeout must leave verification some time after the
    /// stop, optional scale-down and notification calls are reserved.
    fn check_time_budget(&self) -> Result<(), ConfigError> {
        let settings = self.enforcement_settings();
        let reserved = settings.reserved_time();
        if self.invocation_timeout <= reserved {
            return Err(ConfigError::Invalid {
                key: CALL_TIMEOUT_SECS,
                reason: format!(
                    "{} enforcement calls of {}s each leave no verification time \
                     within the {}s invocation timeout",
                    settings.enforcement_steps(),
                    self.call_timeout.as_secs(),
                    self.invocation_timeout.as_secs()
                ),
            });
        }
        Ok(())
    }

    /// Settings for the enforcement controller.
    pub fn enforcement_settings(&self) -> EnforcementSettings {
        EnforcementSettings {
            stop_reason: self.stop_reason.clone(),
            scale_down_service: self.scale_down_service,
            call_timeout: self.call_timeout,
        }
    }
}

fn key_reference(
    alias: Option<String>,
    arn: Option<String>,
    pem: Option<String>,
) -> Result<KeyReference, ConfigError> {
    let sources: Vec<&'static str> = [
        (KEY_ALIAS, alias.is_some()),
        (KEY_ARN, arn.is_some()),
        (KEY_PEM, pem.is_some()),
    ]
    .into_iter()
    .filter_map(|(name, set)| set.then_some(name))
    .collect();
    if sources.len() > 1 {
        return Err(ConfigError::AmbiguousKeySource { sources });
    }

    let invalid = |key: &'static str| {
        move |e: crate::keys::KeyError| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }
    };
    if let Some(alias) = alias {
        return KeyAlias::parse(&alias)
            .map(KeyReference::Alias)
            .map_err(invalid(KEY_ALIAS));
    }
    if let Some(arn) = arn {
        return KmsKeyArn::parse(&arn)
            .map(KeyReference::Arn)
            .map_err(invalid(KEY_ARN));
    }
    if let Some(pem) = pem {
        return VerificationKey::from_pem(&unescape_newlines(&pem))
            .map(KeyReference::Pem)
            .map_err(invalid(KEY_PEM));
    }
    Err(ConfigError::MissingKeySource)
}

/// PEM passed through a single-line environment variable often arrives with
/// literal `\n` sequences.
fn unescape_newlines(pem: &str) -> String {
    if pem.contains('\n') {
        pem.to_owned()
    } else {
        pem.replace("\\n", "\n")
    }
}

fn validate_topic(topic: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = topic.splitn(6, ':').collect();
    match parts.as_slice() {
        ["arn", _, "sns", region, account, name]
            if !region.is_empty() && !account.is_empty() && !name.is_empty() =>
        {
            Ok(())
        }
        _ => Err(ConfigError::Invalid {
            key: NOTIFICATION_TOPIC,
            reason: format!("{topic:?} is not an SNS topic ARN"),
        }),
    }
}

fn seconds(key: &'static str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let secs: u64 = value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        reason: format!("{value:?} is not a whole number of seconds"),
    })?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key,
            reason: "must be at least one second".to_owned(),
        });
    }
    Ok(Some(Duration::from_secs(secs)))
}

fn flag(key: &'static str, value: Option<String>) -> Result<Option<bool>, ConfigError> {
    let Some(value) = value else {
        return Ok(None);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Some(true)),
        "false" | "0" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::Invalid {
            key,
            reason: format!("{value:?} is not a boolean"),
        }),
    }
}
