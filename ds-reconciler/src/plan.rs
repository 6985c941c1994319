//!
//! Set comparison between the anchors a domain should have and the ones the
//! registrar holds.
//!

use std::{collections::BTreeSet, fmt};

use serde::Serialize;

use crate::{
    anchor::TrustAnchor,
    registry::{AnchorId, RemoteAnchor},
};

/// A single registrar mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlannedOperation {
    Add { anchor: TrustAnchor },
    Remove { anchor: TrustAnchor, id: AnchorId },
}

impl PlannedOperation {
    pub fn anchor(&self) -> &TrustAnchor {
        match self {
            PlannedOperation::Add { anchor } => anchor,
            PlannedOperation::Remove { anchor, .. } => anchor,
        }
    }

    pub fn is_add(&self) -> bool {
        matches!(self, PlannedOperation::Add { .. })
    }
}

impl fmt::Display for PlannedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannedOperation::Add { anchor } => write!(f, "add DS {anchor}"),
            PlannedOperation::Remove { anchor, id } => write!(f, "delete DS {anchor} (id {id})"),
        }
    }
}

/// The minimal set of operations that turns the registrar's anchors into the
/// desired ones. Anchors present on both sides are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationPlan {
    pub to_add: BTreeSet<TrustAnchor>,
    pub to_remove: Vec<RemoteAnchor>,
    /// Anchors already held by the registrar that stay as they are.
    pub unchanged: BTreeSet<TrustAnchor>,
}

impl ReconciliationPlan {
    pub fn compute(desired: &BTreeSet<TrustAnchor>, actual: &[RemoteAnchor]) -> Self {
        let held: BTreeSet<&TrustAnchor> = actual.iter().map(|remote| &remote.anchor).collect();

        let to_add = desired
            .iter()
            .filter(|anchor| !held.contains(anchor))
            .cloned()
            .collect();
        let to_remove = actual
            .iter()
            .filter(|remote| !desired.contains(&remote.anchor))
            .cloned()
            .collect();
        let unchanged = desired
            .iter()
            .filter(|anchor| held.contains(anchor))
            .cloned()
            .collect();

        Self {
            to_add,
            to_remove,
            unchanged,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_add.len() + self.to_remove.len()
    }

    /// Execution order: every addition before any removal, so a key in rollover
    /// never loses its only anchor.
    pub fn operations(&self) -> Vec<PlannedOperation> {
        let adds = self.to_add.iter().map(|anchor| PlannedOperation::Add {
            anchor: anchor.clone(),
        });
        let removes = self.to_remove.iter().map(|remote| PlannedOperation::Remove {
            anchor: remote.anchor.clone(),
            id: remote.id.clone(),
        });
        adds.chain(removes).collect()
    }

    /// True when applying the plan leaves the registrar without any anchor.
    pub fn removes_everything(&self) -> bool {
        self.to_add.is_empty() && self.unchanged.is_empty() && !self.to_remove.is_empty()
    }
}
