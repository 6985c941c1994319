//!
//! Wires the configuration into a ready to run reconciler.
//!

use std::sync::Arc;

use ds_reconciler::{
    DomainReconciler, KeySource, MultiReconcileResult, MultiReconciler, RegistryError,
    ResilientRegistry,
};
use tokio_util::sync::CancellationToken;

use crate::{config::ConfigToml, porkbun::PorkbunClient};

/// Command line switches that override the config file for one run.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub allow_empty: bool,
}

/// Turns user input into the form the registrar expects: lower case, no trailing dot.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_lowercase()
}

pub struct SyncApp {
    registry: Arc<ResilientRegistry<PorkbunClient>>,
    reconciler: MultiReconciler,
}

impl SyncApp {
    /// Reads DNSKEYs from the configured resolver.
    pub fn from_config(config: &ConfigToml, options: &SyncOptions) -> anyhow::Result<Self> {
        Self::with_key_source(config, options, Arc::new(config.key_source()))
    }

    pub fn with_key_source(
        config: &ConfigToml,
        options: &SyncOptions,
        key_source: Arc<dyn KeySource>,
    ) -> anyhow::Result<Self> {
        let client = PorkbunClient::from_config(&config.registrar)?;
        let registry = Arc::new(ResilientRegistry::new_with_settings(
            client,
            config.registry_settings(),
        ));

        let mut settings = config.reconciler_settings()?;
        settings
            .dry_run(options.dry_run)
            .allow_empty_desired(options.allow_empty || config.dnssec.allow_empty_desired);
        let reconciler =
            DomainReconciler::new_with_settings(key_source, registry.clone(), settings);

        Ok(Self {
            registry,
            reconciler: MultiReconciler::new_with_settings(
                reconciler,
                config.multi_reconciler_settings(),
            ),
        })
    }

    /// All domains of the registrar account.
    pub async fn domains(&self) -> Result<Vec<String>, RegistryError> {
        self.registry.inner().list_domains().await
    }

    pub async fn sync(&self, domains: Vec<String>, cancel: CancellationToken) -> MultiReconcileResult {
        let domains = domains.iter().map(|d| normalize_domain(d)).collect();
        self.reconciler.run(domains, cancel).await
    }
}
