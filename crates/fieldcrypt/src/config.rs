//! Configuration loading and validation for the `fieldcrypt` binary.
//!
//! All values are read from `FIELDCRYPT_`-prefixed environment variables at
//! startup, e.g. `FIELDCRYPT_MASTER_SECRET`. Any missing or invalid value is a
//! [`CryptoError::Configuration`] and aborts startup.

use std::path::PathBuf;
use std::time::Duration;

use common::CryptoError;
use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;

use crate::crypto::MasterSecret;
use crate::registry::LifecyclePolicy;
use crate::rotation::RotationSettings;

const ENV_PREFIX: &str = "FIELDCRYPT";

/// Validated service configuration.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Base64 master secret, at least 32 bytes decoded. **Required.**
    pub master_secret: String,

    /// JSON file holding key metadata.
    #[serde(default = "default_key_store_path")]
    pub key_store_path: PathBuf,

    /// Accept `legacy` (pre-encryption) payloads on read.
    #[serde(default)]
    pub legacy_support: bool,

    #[serde(default = "default_rotation_batch_size")]
    pub rotation_batch_size: usize,

    /// Upper bound (seconds) on each rotation fetch and batch write.
    #[serde(default = "default_rotation_batch_timeout")]
    pub rotation_batch_timeout_secs: u64,

    #[serde(default = "default_rotation_max_batch_retries")]
    pub rotation_max_batch_retries: u32,

    /// Days a retired key stays readable before it may expire.
    #[serde(default = "default_key_retention_days")]
    pub key_retention_days: u32,

    /// Permit the audited Retired → Active reactivation.
    #[serde(default)]
    pub allow_reactivation: bool,

    /// OTLP endpoint for span export. Logs only when unset.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_key_store_path() -> PathBuf {
    PathBuf::from("fieldcrypt-keys.json")
}
fn default_rotation_batch_size() -> usize {
    100
}
fn default_rotation_batch_timeout() -> u64 {
    30
}
fn default_rotation_max_batch_retries() -> u32 {
    2
}
fn default_key_retention_days() -> u32 {
    90
}
fn default_log_level() -> String {
    "info".into()
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("master_secret", &"[redacted]")
            .field("key_store_path", &self.key_store_path)
            .field("legacy_support", &self.legacy_support)
            .field("rotation_batch_size", &self.rotation_batch_size)
            .field("rotation_batch_timeout_secs", &self.rotation_batch_timeout_secs)
            .field("rotation_max_batch_retries", &self.rotation_max_batch_retries)
            .field("key_retention_days", &self.key_retention_days)
            .field("allow_reactivation", &self.allow_reactivation)
            .field("otel_exporter_otlp_endpoint", &self.otel_exporter_otlp_endpoint)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Configuration`] if any required variable is
    /// absent or any value cannot be parsed or fails validation.
    pub fn from_env() -> Result<Self, CryptoError> {
        Self::from_builder(
            config::Config::builder()
                .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true)),
        )
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, CryptoError> {
        let cfg = builder.build().map_err(|e| {
            CryptoError::Configuration(format!("failed to build configuration: {e}"))
        })?;
        let mut c: Config = cfg.try_deserialize().map_err(|e| {
            CryptoError::Configuration(format!("failed to deserialise configuration: {e}"))
        })?;
        if c.otel_exporter_otlp_endpoint.as_deref().is_some_and(|e| e.trim().is_empty()) {
            c.otel_exporter_otlp_endpoint = None;
        }
        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<(), CryptoError> {
        MasterSecret::from_base64(&self.master_secret)?;
        if self.rotation_batch_size == 0 {
            return Err(invalid("ROTATION_BATCH_SIZE must be > 0"));
        }
        if self.rotation_batch_timeout_secs == 0 {
            return Err(invalid("ROTATION_BATCH_TIMEOUT_SECS must be > 0"));
        }
        if self.log_level.trim().is_empty() {
            return Err(invalid("LOG_LEVEL must not be empty"));
        }
        Ok(())
    }

    /// The decoded master secret.
    pub fn master_secret(&self) -> Result<MasterSecret, CryptoError> {
        MasterSecret::from_base64(&self.master_secret)
    }

    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            retention: chrono::Duration::days(i64::from(self.key_retention_days)),
            allow_reactivation: self.allow_reactivation,
        }
    }

    pub fn rotation_settings(&self) -> RotationSettings {
        RotationSettings {
            batch_timeout: Duration::from_secs(self.rotation_batch_timeout_secs),
            max_batch_retries: self.rotation_max_batch_retries,
        }
    }
}

fn invalid(msg: &str) -> CryptoError {
    CryptoError::Configuration(format!("{ENV_PREFIX}_{msg}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// base64 of 32 `A` bytes.
    const SECRET: &str = "QUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUE=";

    fn valid() -> Config {
        Config {
            master_secret: SECRET.into(),
            key_store_path: default_key_store_path(),
            legacy_support: false,
            rotation_batch_size: default_rotation_batch_size(),
            rotation_batch_timeout_secs: default_rotation_batch_timeout(),
            rotation_max_batch_retries: default_rotation_max_batch_retries(),
            key_retention_days: default_key_retention_days(),
            allow_reactivation: false,
            otel_exporter_otlp_endpoint: None,
            log_level: default_log_level(),
        }
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_key_store_path(), PathBuf::from("fieldcrypt-keys.json"));
        assert_eq!(default_rotation_batch_size(), 100);
        assert_eq!(default_rotation_batch_timeout(), 30);
        assert_eq!(default_rotation_max_batch_retries(), 2);
        assert_eq!(default_key_retention_days(), 90);
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn loads_with_only_master_secret() {
        let builder = config::Config::builder()
            .set_override("master_secret", SECRET)
            .unwrap()
            .set_override("otel_exporter_otlp_endpoint", "")
            .unwrap();
        let cfg = Config::from_builder(builder).unwrap();
        assert_eq!(cfg.rotation_batch_size, 100);
        assert!(!cfg.legacy_support);
        assert_eq!(cfg.otel_exporter_otlp_endpoint, None);
        assert_eq!(cfg.rotation_settings().batch_timeout, Duration::from_secs(30));
        assert_eq!(cfg.lifecycle_policy().retention, chrono::Duration::days(90));
    }

    #[test]
    fn missing_master_secret_is_configuration_error() {
        let err = Config::from_builder(config::Config::builder()).unwrap_err();
        assert!(matches!(err, CryptoError::Configuration(_)));
    }

    #[test]
    fn validate_rejects_short_master_secret() {
        let cfg = Config {
            master_secret: "c2hvcnQ=".into(),
            ..valid()
        };
        assert!(matches!(cfg.validate(), Err(CryptoError::Configuration(_))));
    }

    #[test]
    fn validate_rejects_zero_batch_size() {
        let cfg = Config {
            rotation_batch_size: 0,
            ..valid()
        };
        assert!(cfg.validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn debug_redacts_master_secret() {
        let shown = format!("{:?}", valid());
        assert!(!shown.contains(SECRET));
        assert!(shown.contains("[redacted]"));
    }
}
