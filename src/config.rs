use std::path::{Path, PathBuf};

use chrono::Duration;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File consulted when `IVOTE_CONFIG` is not set.
pub const DEFAULT_CONFIG_FILE: &str = "ivote.toml";

#[derive(Debug, Error)]
#[error("failed to load configuration: {0}")]
pub struct ConfigError(#[from] figment::Error);

/// Application configuration, derived from defaults, `ivote.toml` (or the
/// file named by `IVOTE_CONFIG`) and `IVOTE_*` environment variables, in
/// increasing order of precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // non-secrets
    store_path: PathBuf,
    log_config: PathBuf,
    max_submissions_per_voter: u32,
    verification_timeout: u32,
    verification_max_uses: u32,
    registry_path: PathBuf,
    device_key_path: PathBuf,
    // secrets
    device_activation_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("store"),
            log_config: PathBuf::from("log4rs.yaml"),
            max_submissions_per_voter: 10,
            verification_timeout: 30 * 60,
            verification_max_uses: 3,
            registry_path: PathBuf::from("registry.json"),
            device_key_path: PathBuf::from("device.json"),
            device_activation_secret: None,
        }
    }
}

impl Config {
    /// The layered configuration sources.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(Env::var_or("IVOTE_CONFIG", DEFAULT_CONFIG_FILE)))
            .merge(Env::prefixed("IVOTE_"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self::figment().extract()?)
    }

    /// Root directory of the persisted store.
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// log4rs configuration file.
    pub fn log_config(&self) -> &Path {
        &self.log_config
    }

    /// Maximum number of vote records accepted per voter.
    pub fn max_submissions_per_voter(&self) -> u32 {
        self.max_submissions_per_voter
    }

    /// Valid lifetime of a verification token, configured in seconds.
    pub fn verification_timeout(&self) -> Duration {
        Duration::seconds(self.verification_timeout.into())
    }

    /// Number of times a verification token may be used.
    pub fn verification_max_uses(&self) -> u32 {
        self.verification_max_uses
    }

    /// JSON certificate registry backing the trust oracle.
    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    /// Sealed key file of the software crypto device.
    pub fn device_key_path(&self) -> &Path {
        &self.device_key_path
    }

    /// Secret unlocking the crypto device. Only ever supplied through the
    /// environment or the config file at process start.
    pub fn device_activation_secret(&self) -> Option<&[u8]> {
        self.device_activation_secret.as_deref().map(str::as_bytes)
    }
}
