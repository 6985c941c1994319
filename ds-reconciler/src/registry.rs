//!
//! Interface to the registrar that holds the DS records of a domain.
//!

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::anchor::TrustAnchor;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Transport failure, timeout, or the registrar asked us to slow down.
    #[error("Registry unavailable: {0}")]
    Unavailable(String),
    #[error("Registry authentication failed: {0}")]
    AuthFailure(String),
    /// The registrar refused this specific operation.
    #[error("Registry rejected the operation: {0}")]
    Rejected(String),
    /// The registrar answered with something we don't understand.
    #[error("Unexpected registry response: {0}")]
    UnexpectedResponse(String),
}

impl RegistryError {
    /// Only transport level problems are worth retrying. A rejection stays a rejection.
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Unavailable(_))
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, RegistryError::AuthFailure(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, RegistryError::Rejected(_))
    }
}

/// Opaque identifier the registrar assigns to a stored DS record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AnchorId(String);

impl AnchorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A trust anchor currently held by the registrar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RemoteAnchor {
    pub anchor: TrustAnchor,
    pub id: AnchorId,
}

impl RemoteAnchor {
    pub fn new(anchor: TrustAnchor, id: AnchorId) -> Self {
        Self { anchor, id }
    }
}

/// Reads and mutates the DS records a registrar holds for a domain.
///
/// Implementations must be safe to call concurrently for different domains.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// All DS records currently held for `domain`.
    async fn list_trust_anchors(&self, domain: &str) -> Result<Vec<RemoteAnchor>, RegistryError>;

    /// Creates a DS record. Returns the new record id if the registrar reports one.
    async fn create_trust_anchor(
        &self,
        domain: &str,
        anchor: &TrustAnchor,
    ) -> Result<Option<AnchorId>, RegistryError>;

    /// Deletes a DS record. Deleting an id that no longer exists succeeds.
    async fn delete_trust_anchor(&self, domain: &str, id: &AnchorId) -> Result<(), RegistryError>;
}
