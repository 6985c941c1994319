//!
//! Reconciles the DS records of a single domain.
//!
//! Start → KeysRetrieved → DesiredComputed → ActualRetrieved → PlanComputed → Executing
//! and ends in one of the [`ReconcileStatus`] variants. A failure before the plan
//! is computed aborts the domain without touching the registrar.
//!

use std::{collections::BTreeSet, fmt, sync::Arc};

use serde::Serialize;

use crate::{
    anchor::{AnchorDeriver, TrustAnchor},
    key_source::KeySource,
    plan::{PlannedOperation, ReconciliationPlan},
    registry::RegistryClient,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStage {
    Start,
    KeysRetrieved,
    DesiredComputed,
    ActualRetrieved,
    PlanComputed,
    Executing,
}

impl fmt::Display for ReconcileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReconcileStage::Start => "start",
            ReconcileStage::KeysRetrieved => "key retrieval",
            ReconcileStage::DesiredComputed => "anchor derivation",
            ReconcileStage::ActualRetrieved => "registry listing",
            ReconcileStage::PlanComputed => "planning",
            ReconcileStage::Executing => "execution",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum OperationResult {
    Applied,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationOutcome {
    pub operation: PlannedOperation,
    pub result: OperationResult,
}

impl OperationOutcome {
    pub fn is_applied(&self) -> bool {
        self.result == OperationResult::Applied
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileStatus {
    /// Every planned operation succeeded, or there was nothing to do.
    Converged,
    /// Some operations failed. Re-running retries exactly those still needed.
    PartiallyConverged { failed: Vec<OperationOutcome> },
    /// The plan would leave the domain without any anchor. Held back until confirmed.
    SensitiveChange,
    /// Dry run. The plan was computed but not executed.
    Planned,
    /// Keys or registry records could not be read. Nothing was changed.
    Aborted { stage: ReconcileStage, reason: String },
}

impl ReconcileStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, ReconcileStatus::Converged)
    }

    pub fn is_partially_converged(&self) -> bool {
        matches!(self, ReconcileStatus::PartiallyConverged { .. })
    }

    pub fn is_sensitive_change(&self) -> bool {
        matches!(self, ReconcileStatus::SensitiveChange)
    }

    pub fn is_planned(&self) -> bool {
        matches!(self, ReconcileStatus::Planned)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, ReconcileStatus::Aborted { .. })
    }
}

/// Result of reconciling one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainOutcome {
    pub domain: String,
    #[serde(flatten)]
    pub status: ReconcileStatus,
    /// `None` if the domain was aborted before a plan existed.
    pub plan: Option<ReconciliationPlan>,
    /// Outcome of every attempted operation, in execution order.
    pub operations: Vec<OperationOutcome>,
}

impl DomainOutcome {
    pub fn aborted(domain: &str, stage: ReconcileStage, reason: impl Into<String>) -> Self {
        Self {
            domain: domain.to_string(),
            status: ReconcileStatus::Aborted {
                stage,
                reason: reason.into(),
            },
            plan: None,
            operations: vec![],
        }
    }

    pub fn failed_operations(&self) -> Vec<&OperationOutcome> {
        self.operations.iter().filter(|o| !o.is_applied()).collect()
    }
}

/// Settings for creating a [`DomainReconciler`].
#[derive(Debug, Clone, Default)]
pub struct ReconcilerSettings {
    pub(crate) deriver: AnchorDeriver,
    pub(crate) allow_empty_desired: bool,
    pub(crate) dry_run: bool,
}

impl ReconcilerSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the digest types the desired anchors are derived with.
    pub fn deriver(&mut self, deriver: AnchorDeriver) -> &mut Self {
        self.deriver = deriver;
        self
    }

    /// Confirms that a domain without key-signing keys should lose all its anchors.
    /// Without this, such plans end as [`ReconcileStatus::SensitiveChange`].
    pub fn allow_empty_desired(&mut self, allow: bool) -> &mut Self {
        self.allow_empty_desired = allow;
        self
    }

    /// Compute plans without executing them.
    pub fn dry_run(&mut self, dry_run: bool) -> &mut Self {
        self.dry_run = dry_run;
        self
    }
}

/// Drives the reconciliation of a single domain.
#[derive(Clone)]
pub struct DomainReconciler {
    key_source: Arc<dyn KeySource>,
    registry: Arc<dyn RegistryClient>,
    settings: ReconcilerSettings,
}

impl fmt::Debug for DomainReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainReconciler")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DomainReconciler {
    pub fn new(key_source: Arc<dyn KeySource>, registry: Arc<dyn RegistryClient>) -> Self {
        Self::new_with_settings(key_source, registry, ReconcilerSettings::default())
    }

    pub fn new_with_settings(
        key_source: Arc<dyn KeySource>,
        registry: Arc<dyn RegistryClient>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            key_source,
            registry,
            settings,
        }
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// The anchors `domain` should have according to its published keys.
    /// A zone without keys yields an empty set.
    pub async fn desired_set(
        &self,
        domain: &str,
    ) -> Result<BTreeSet<TrustAnchor>, (ReconcileStage, String)> {
        let keys = match self.key_source.query_keys(domain).await {
            Ok(keys) => keys,
            Err(e) if e.is_empty_result() => {
                tracing::warn!("{domain} publishes no DNSKEY records.");
                vec![]
            }
            Err(e) => return Err((ReconcileStage::KeysRetrieved, e.to_string())),
        };
        tracing::debug!("{domain} stage={} keys={}", ReconcileStage::KeysRetrieved, keys.len());

        let desired = self
            .settings
            .deriver
            .desired_set(domain, &keys)
            .map_err(|e| (ReconcileStage::DesiredComputed, e.to_string()))?;
        tracing::debug!(
            "{domain} stage={} anchors={}",
            ReconcileStage::DesiredComputed,
            desired.len()
        );
        Ok(desired)
    }

    /// Reads both sides and computes the plan without executing it.
    pub async fn compute_plan(
        &self,
        domain: &str,
    ) -> Result<ReconciliationPlan, (ReconcileStage, String)> {
        let desired = self.desired_set(domain).await?;

        let actual = self
            .registry
            .list_trust_anchors(domain)
            .await
            .map_err(|e| (ReconcileStage::ActualRetrieved, e.to_string()))?;
        tracing::debug!(
            "{domain} stage={} anchors={}",
            ReconcileStage::ActualRetrieved,
            actual.len()
        );

        let plan = ReconciliationPlan::compute(&desired, &actual);
        tracing::debug!(
            "{domain} stage={} add={} remove={} unchanged={}",
            ReconcileStage::PlanComputed,
            plan.to_add.len(),
            plan.to_remove.len(),
            plan.unchanged.len()
        );
        Ok(plan)
    }

    /// Applies the plan: all additions first, then all removals. A failing
    /// operation doesn't stop the remaining ones.
    pub async fn execute(&self, domain: &str, plan: &ReconciliationPlan) -> Vec<OperationOutcome> {
        let mut outcomes = Vec::with_capacity(plan.len());
        for operation in plan.operations() {
            let result = match &operation {
                PlannedOperation::Add { anchor } => self
                    .registry
                    .create_trust_anchor(domain, anchor)
                    .await
                    .map(|id| {
                        if let Some(id) = id {
                            tracing::debug!("{domain} DS {anchor} got id {id}.");
                        }
                    }),
                PlannedOperation::Remove { id, .. } => {
                    self.registry.delete_trust_anchor(domain, id).await
                }
            };

            let result = match result {
                Ok(()) => {
                    tracing::info!("{domain} Applied: {operation}");
                    OperationResult::Applied
                }
                Err(e) => {
                    tracing::warn!("{domain} Failed to {operation}: {e}");
                    OperationResult::Failed(e.to_string())
                }
            };
            outcomes.push(OperationOutcome { operation, result });
        }
        outcomes
    }

    /// Runs the whole pipeline for one domain. Never fails: every problem ends
    /// up in the returned outcome.
    pub async fn reconcile(&self, domain: &str) -> DomainOutcome {
        tracing::debug!("{domain} stage={}", ReconcileStage::Start);
        let plan = match self.compute_plan(domain).await {
            Ok(plan) => plan,
            Err((stage, reason)) => {
                tracing::warn!("{domain} Aborted during {stage}: {reason}");
                return DomainOutcome::aborted(domain, stage, reason);
            }
        };

        for anchor in &plan.unchanged {
            tracing::debug!("{domain} DS {anchor} already in sync.");
        }

        if plan.removes_everything() && !self.settings.allow_empty_desired {
            tracing::warn!(
                "{domain} No key-signing keys found but the registrar holds {} DS records. Not removing them without confirmation.",
                plan.to_remove.len()
            );
            return DomainOutcome {
                domain: domain.to_string(),
                status: ReconcileStatus::SensitiveChange,
                plan: Some(plan),
                operations: vec![],
            };
        }

        if self.settings.dry_run {
            return DomainOutcome {
                domain: domain.to_string(),
                status: ReconcileStatus::Planned,
                plan: Some(plan),
                operations: vec![],
            };
        }

        tracing::debug!("{domain} stage={}", ReconcileStage::Executing);
        let operations = self.execute(domain, &plan).await;
        let failed: Vec<OperationOutcome> = operations
            .iter()
            .filter(|o| !o.is_applied())
            .cloned()
            .collect();
        let status = if failed.is_empty() {
            tracing::info!("{domain} Converged after {} operations.", operations.len());
            ReconcileStatus::Converged
        } else {
            tracing::warn!(
                "{domain} Partially converged. {}/{} operations failed.",
                failed.len(),
                operations.len()
            );
            ReconcileStatus::PartiallyConverged { failed }
        };

        DomainOutcome {
            domain: domain.to_string(),
            status,
            plan: Some(plan),
            operations,
        }
    }
}
