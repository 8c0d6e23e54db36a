//! Live cluster state.
//!
//! A [`ClusterStateFetcher`] reads the set of nodes the control plane
//! currently knows about, with per-node capacity and version facts.
//! Facts are fetched fresh on every call and never persisted; their
//! identity key for merging is the primary network address.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod kube;
pub mod units;

pub use kube::KubeApiFetcher;

/// Runtime facts for one node as reported by the control plane.
///
/// Capacities are raw kilobyte counts; display conversion happens in
/// [`units`] when a view is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveNodeFact {
    /// Primary network address, the merge key.
    pub address: String,

    /// Secondary address (hostname).
    pub hostname: String,

    /// CPU core count (passes through unscaled).
    pub cores: u32,

    /// Raw memory capacity in kilobytes.
    pub memory_kb: u64,

    /// Raw ephemeral-storage capacity in kilobytes.
    pub storage_kb: u64,

    /// CPU architecture (x86_64, aarch64, ...).
    pub architecture: String,

    /// Container runtime version string.
    pub container_runtime_version: String,

    /// Kubelet version string.
    pub kubelet_version: String,

    /// Kernel version string.
    pub kernel_version: String,

    /// OS image string.
    pub os_image: String,
}

/// Errors from the live-state fetch.
///
/// An empty cluster is not an error: zero nodes is a valid answer.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("cluster control plane unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view of the nodes a live cluster control plane knows.
///
/// Injected as a capability so tests can substitute a fake; a component
/// holds a reference to it for its lifetime.
#[async_trait]
pub trait ClusterStateFetcher: Send + Sync {
    /// One fetch against the control plane. No retry or pagination at
    /// this layer.
    async fn list_live_nodes(&self) -> Result<Vec<LiveNodeFact>, ClusterError>;
}
