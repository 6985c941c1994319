use std::{
    collections::{BTreeMap, HashSet},
    num::NonZeroUsize,
};

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::reconciler::{DomainOutcome, DomainReconciler, ReconcileStage, ReconcileStatus};

#[derive(Debug, Clone, Default, Serialize)]
pub struct MultiReconcileResult {
    outcomes: BTreeMap<String, DomainOutcome>,
    /// Domains that were never started because the run was cancelled.
    cancelled: Vec<String>,
}

impl MultiReconcileResult {
    pub fn new(outcomes: BTreeMap<String, DomainOutcome>, cancelled: Vec<String>) -> Self {
        Self {
            outcomes,
            cancelled,
        }
    }

    /// Number of domains, cancelled ones included.
    pub fn len(&self) -> usize {
        self.outcomes.len() + self.cancelled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, domain: &str) -> Option<&DomainOutcome> {
        self.outcomes.get(domain)
    }

    /// Outcomes sorted by domain.
    pub fn outcomes(&self) -> impl Iterator<Item = &DomainOutcome> {
        self.outcomes.values()
    }

    pub fn cancelled(&self) -> &[String] {
        &self.cancelled
    }

    fn domains_where(&self, predicate: impl Fn(&ReconcileStatus) -> bool) -> Vec<String> {
        self.outcomes
            .values()
            .filter(|outcome| predicate(&outcome.status))
            .map(|outcome| outcome.domain.clone())
            .collect()
    }

    pub fn converged(&self) -> Vec<String> {
        self.domains_where(ReconcileStatus::is_converged)
    }

    /// Domains where at least one operation failed
    pub fn partially_converged(&self) -> Vec<String> {
        self.domains_where(ReconcileStatus::is_partially_converged)
    }

    /// Domains held back because they would lose every anchor
    pub fn sensitive(&self) -> Vec<String> {
        self.domains_where(ReconcileStatus::is_sensitive_change)
    }

    pub fn planned(&self) -> Vec<String> {
        self.domains_where(ReconcileStatus::is_planned)
    }

    pub fn aborted(&self) -> Vec<String> {
        self.domains_where(ReconcileStatus::is_aborted)
    }

    /// True if every domain ran and ended converged, or planned in a dry run.
    pub fn is_fully_converged(&self) -> bool {
        self.cancelled.is_empty()
            && self
                .outcomes
                .values()
                .all(|o| o.status.is_converged() || o.status.is_planned())
    }
}

#[derive(Debug, Clone)]
pub struct MultiReconcilerSettings {
    pub(crate) concurrency: NonZeroUsize,
}

impl MultiReconcilerSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of domains reconciled at the same time.
    pub fn concurrency(&mut self, concurrency: NonZeroUsize) -> &mut Self {
        self.concurrency = concurrency;
        self
    }
}

impl Default for MultiReconcilerSettings {
    fn default() -> Self {
        Self {
            concurrency: NonZeroUsize::new(4).expect("4 is non-zero"),
        }
    }
}

/// Reconciles many domains on a bounded number of tokio tasks.
#[derive(Debug, Clone)]
pub struct MultiReconciler {
    reconciler: DomainReconciler,
    settings: MultiReconcilerSettings,
}

impl MultiReconciler {
    pub fn new(reconciler: DomainReconciler) -> Self {
        Self::new_with_settings(reconciler, MultiReconcilerSettings::default())
    }

    pub fn new_with_settings(
        reconciler: DomainReconciler,
        settings: MultiReconcilerSettings,
    ) -> Self {
        Self {
            reconciler,
            settings,
        }
    }

    /// Reconciles one domain on its own task so a panic only costs this domain.
    async fn reconcile_isolated(&self, domain: String) -> DomainOutcome {
        let reconciler = self.reconciler.clone();
        let name = domain.clone();
        match tokio::spawn(async move { reconciler.reconcile(&name).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Reconciling {domain} failed unexpectedly: {e}");
                DomainOutcome::aborted(
                    &domain,
                    ReconcileStage::Start,
                    format!("reconciliation task failed: {e}"),
                )
            }
        }
    }

    /// Reconcile the domains one after the other. Stops starting new domains once
    /// `cancel` fires.
    async fn run_serially(
        &self,
        domains: Vec<String>,
        cancel: CancellationToken,
    ) -> (Vec<DomainOutcome>, Vec<String>) {
        let mut outcomes = Vec::with_capacity(domains.len());
        let mut cancelled = vec![];
        for domain in domains {
            if cancel.is_cancelled() {
                cancelled.push(domain);
                continue;
            }
            let start = Instant::now();
            let outcome = self.reconcile_isolated(domain).await;
            let elapsed = start.elapsed().as_millis();
            tracing::debug!("Reconciled {} within {elapsed}ms.", outcome.domain);
            outcomes.push(outcome);
        }
        (outcomes, cancelled)
    }

    /// Reconcile the domains in parallel. Each task gets an equal share and works
    /// through it serially. Duplicates are reconciled once.
    pub async fn run(&self, domains: Vec<String>, cancel: CancellationToken) -> MultiReconcileResult {
        let mut seen = HashSet::with_capacity(domains.len());
        let domains: Vec<String> = domains
            .into_iter()
            .filter(|domain| seen.insert(domain.clone()))
            .collect();
        if domains.is_empty() {
            return MultiReconcileResult::default();
        }
        tracing::debug!("Start to reconcile {} domains.", domains.len());

        let chunk_size = domains.len().div_ceil(self.settings.concurrency.get());
        let chunks = domains
            .chunks(chunk_size)
            .map(|chunk| chunk.to_vec())
            .collect::<Vec<_>>();

        // Run in parallel
        let mut handles = vec![];
        for chunk in chunks {
            let reconciler = self.clone();
            let cancel = cancel.clone();
            let share = chunk.clone();
            let handle = tokio::spawn(async move { reconciler.run_serially(share, cancel).await });
            handles.push((chunk, handle));
        }

        // Join results of all tasks
        let mut outcomes = BTreeMap::new();
        let mut cancelled = vec![];
        for (chunk, handle) in handles {
            match handle.await {
                Ok((done, skipped)) => {
                    for outcome in done {
                        outcomes.insert(outcome.domain.clone(), outcome);
                    }
                    cancelled.extend(skipped);
                }
                Err(e) => {
                    tracing::error!("Failed to join handle in MultiReconciler::run: {e}");
                    for domain in chunk {
                        let outcome = DomainOutcome::aborted(
                            &domain,
                            ReconcileStage::Start,
                            format!("worker task failed: {e}"),
                        );
                        outcomes.insert(domain, outcome);
                    }
                }
            }
        }

        MultiReconcileResult::new(outcomes, cancelled)
    }
}
