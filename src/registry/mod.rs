//! Node registry: the durable inventory of admitted nodes.
//!
//! Entries are keyed by network address, which is unique across the
//! entire registry regardless of cluster grouping. Entries are created
//! only by a successful admission and never mutated here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub mod store;

pub use store::RedbRegistry;

/// An SSH secret. Redacted from `Debug` output and never logged; it is
/// serialized only into the registry record itself.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SshCredential(String);

impl SshCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Access the secret for authentication. Callers must not log it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SshCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SshCredential(******)")
    }
}

impl fmt::Display for SshCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("******")
    }
}

/// An unvalidated host submitted for admission. Discarded after the
/// admission succeeds or fails; carries no identity beyond its fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCandidate {
    /// Network address (IP); becomes the registry key.
    pub address: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_credential: SshCredential,
    /// Target cluster grouping.
    pub cluster_id: i64,
}

/// A persisted, admitted node binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Surrogate id assigned at save time.
    pub id: Uuid,

    /// Network address, unique across the whole registry.
    pub address: String,

    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_credential: SshCredential,

    /// Cluster grouping this node is bound to.
    pub cluster_id: i64,

    /// Assigned at save time.
    pub created_at: DateTime<Utc>,
}

/// Errors from registry reads and writes.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The address-uniqueness invariant was hit at write time.
    #[error("node with address {0} is already registered")]
    DuplicateAddress(String),

    #[error("registry storage error: {0}")]
    Storage(String),
}

/// Persistence seam for admitted nodes.
///
/// `find_by_cluster` and `find_all` are unordered by contract:
/// insertion order is not guaranteed and not meaningful.
pub trait NodeRegistry: Send + Sync {
    /// Uniqueness pre-check: how many entries hold this address.
    fn count_by_address(&self, address: &str) -> Result<u64, RegistryError>;

    /// Assign identity and creation timestamp, then persist.
    ///
    /// Enforces address uniqueness at write time: a duplicate address
    /// yields [`RegistryError::DuplicateAddress`] and writes nothing,
    /// even if the caller's pre-check raced.
    fn save(&self, candidate: NodeCandidate) -> Result<NodeEntry, RegistryError>;

    fn find_by_cluster(&self, cluster_id: i64) -> Result<Vec<NodeEntry>, RegistryError>;

    fn find_all(&self) -> Result<Vec<NodeEntry>, RegistryError>;
}
