//! Configuration file of ds-sync.
//!
//! All default values live in `config.default.toml`, which is embedded at
//! compile time. A user file only needs the values it wants to change and is
//! merged on top of the defaults.

use std::{
    fs,
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64, NonZeroU8, NonZeroUsize},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use ds_reconciler::{
    AnchorDeriver, DeriveError, DnsKeySource, MultiReconcilerSettings, ReconcilerSettings,
    RegistrySettings, RetrySettings,
};
use serde::{Deserialize, Serialize};
use url::Url;

use super::log_level::{LogLevel, ModuleLevel};

/// Embedded copy of the default configuration.
pub const DEFAULT_CONFIG: &str = include_str!("config.default.toml");

/// Example configuration file
pub const SAMPLE_CONFIG: &str = include_str!("../../config.sample.toml");

/// Directory below the home directory that holds the config file.
pub const DEFAULT_CONFIG_DIR: &str = ".ds-sync";
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigReadError {
    #[error("config file could not be read: {0}")]
    ConfigFileNotFound(#[from] std::io::Error),
    #[error("config file is not valid TOML: {0}")]
    ConfigFileNotValid(#[from] toml::de::Error),
    #[error("failed to merge embedded and user TOML: {0}")]
    ConfigMergeError(String),
    #[error("invalid [dnssec] digest_types: {0}")]
    InvalidDigestTypes(#[from] DeriveError),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResolverToml {
    pub address: SocketAddr,
    pub timeout_ms: NonZeroU64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DnssecToml {
    pub digest_types: Vec<u8>,
    pub allow_empty_desired: bool,
}

#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct RegistrarToml {
    pub api_base_url: Url,
    pub api_key: String,
    pub secret_api_key: String,
    pub timeout_ms: NonZeroU64,
    pub max_retries: NonZeroU8,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// 0 means unlimited.
    pub requests_per_second: u32,
}

// Keeps the credentials out of logs.
impl std::fmt::Debug for RegistrarToml {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrarToml")
            .field("api_base_url", &self.api_base_url.as_str())
            .field("timeout_ms", &self.timeout_ms)
            .field("max_retries", &self.max_retries)
            .field("initial_retry_delay_ms", &self.initial_retry_delay_ms)
            .field("max_retry_delay_ms", &self.max_retry_delay_ms)
            .field("requests_per_second", &self.requests_per_second)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RunnerToml {
    pub concurrency: NonZeroUsize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LoggingToml {
    pub level: LogLevel,
    pub module_levels: Vec<ModuleLevel>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConfigToml {
    /// Where the DNSKEY records are read from.
    pub resolver: ResolverToml,
    /// How trust anchors are derived from the keys.
    pub dnssec: DnssecToml,
    /// Porkbun API access.
    pub registrar: RegistrarToml,
    pub runner: RunnerToml,
    pub logging: LoggingToml,
}

impl Default for ConfigToml {
    fn default() -> Self {
        ConfigToml::from_str(DEFAULT_CONFIG).expect("Embedded config.default.toml must be valid")
    }
}

impl ConfigToml {
    /// Read a config file and merge it on top of the embedded defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigReadError> {
        let raw = fs::read_to_string(path)?;
        Self::from_str_with_defaults(&raw)
    }

    /// Parse a raw TOML string and merge it on top of the embedded defaults.
    pub fn from_str_with_defaults(raw: &str) -> Result<Self, ConfigReadError> {
        let default_val: toml::Value = DEFAULT_CONFIG
            .parse()
            .expect("embedded defaults invalid TOML");
        let user_val: toml::Value = raw.parse()?;

        let merged_val = serde_toml_merge::merge(default_val, user_val)
            .map_err(|e| ConfigReadError::ConfigMergeError(e.to_string()))?;

        let config: ConfigToml = merged_val.try_into()?;
        config.anchor_deriver()?;
        Ok(config)
    }

    /// `~/.ds-sync/config.toml`, if the home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(DEFAULT_CONFIG_DIR).join(CONFIG_FILE_NAME))
    }

    /// Render the sample config with every value commented out.
    pub fn sample_string() -> String {
        SAMPLE_CONFIG
            .lines()
            .map(|line| {
                let trimmed = line.trim_start();
                if !trimmed.starts_with('#') && !trimmed.is_empty() {
                    format!("# {line}")
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<String>>()
            .join("\n")
    }

    pub fn anchor_deriver(&self) -> Result<AnchorDeriver, DeriveError> {
        AnchorDeriver::from_codes(&self.dnssec.digest_types)
    }

    pub fn key_source(&self) -> DnsKeySource {
        DnsKeySource::new(
            self.resolver.address,
            Duration::from_millis(self.resolver.timeout_ms.get()),
        )
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        let registrar = &self.registrar;
        let mut retry = RetrySettings::new();
        retry
            .max_retries(registrar.max_retries)
            .initial_retry_delay(Duration::from_millis(registrar.initial_retry_delay_ms))
            .max_retry_delay(Duration::from_millis(registrar.max_retry_delay_ms));
        let mut settings = RegistrySettings::new();
        settings
            .call_timeout(Duration::from_millis(registrar.timeout_ms.get()))
            .retry_settings(retry)
            .requests_per_second(NonZeroU32::new(registrar.requests_per_second));
        settings
    }

    pub fn reconciler_settings(&self) -> Result<ReconcilerSettings, DeriveError> {
        let mut settings = ReconcilerSettings::new();
        settings
            .deriver(self.anchor_deriver()?)
            .allow_empty_desired(self.dnssec.allow_empty_desired);
        Ok(settings)
    }

    pub fn multi_reconciler_settings(&self) -> MultiReconcilerSettings {
        let mut settings = MultiReconcilerSettings::new();
        settings.concurrency(self.runner.concurrency);
        settings
    }

    /// Default config for tests. Points the registrar at `api_base_url`.
    #[cfg(test)]
    pub fn test(api_base_url: Url) -> Self {
        let mut config = Self::default();
        config.registrar.api_base_url = api_base_url;
        config.registrar.api_key = "pk1_test".to_string();
        config.registrar.secret_api_key = "sk1_test".to_string();
        config.registrar.max_retries = NonZeroU8::MIN;
        config.registrar.requests_per_second = 0;
        config
    }
}

impl FromStr for ConfigToml {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}
