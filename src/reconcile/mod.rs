//! Reconciler: admission orchestration and registry/live-state merges.
//!
//! The two read operations are pure functions of their inputs: every
//! call re-fetches registry entries and live facts, joins them by
//! address, and builds [`MergedNodeView`]s. Nothing is cached. The one
//! write operation, [`Reconciler::admit`], gates a candidate through
//! the health probe before it reaches the registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cluster::units::format_gb;
use crate::cluster::{ClusterError, ClusterStateFetcher, LiveNodeFact};
use crate::probe::{ProbeError, ProbeTarget, Prober};
use crate::registry::{NodeCandidate, NodeEntry, NodeRegistry, RegistryError};

/// Runtime fields of a merged view, present only when a live fact
/// matched the entry's address. Capacities are already normalized to
/// display units here.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeInfo {
    pub hostname: String,
    pub cores: u32,
    /// e.g. `"16 GB"`
    pub memory: String,
    /// e.g. `"97 GB"`
    pub storage: String,
    pub architecture: String,
    pub container_runtime_version: String,
    pub kubelet_version: String,
    pub kernel_version: String,
    pub os_image: String,
}

impl RuntimeInfo {
    fn from_fact(fact: &LiveNodeFact) -> Self {
        Self {
            hostname: fact.hostname.clone(),
            cores: fact.cores,
            memory: format_gb(fact.memory_kb),
            storage: format_gb(fact.storage_kb),
            architecture: fact.architecture.clone(),
            container_runtime_version: fact.container_runtime_version.clone(),
            kubelet_version: fact.kubelet_version.clone(),
            kernel_version: fact.kernel_version.clone(),
            os_image: fact.os_image.clone(),
        }
    }
}

/// Read-model combining a registry entry with, when available, the
/// matching live fact. Recomputed on every query.
///
/// A bound node missing from live state keeps its registry fields and
/// has `runtime: None`; an unbound node has no registry fields and
/// `runtime: Some`.
#[derive(Debug, Clone, Serialize)]
pub struct MergedNodeView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    pub address: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeInfo>,
}

/// Admission failures. Distinct by contract: operators act differently
/// on "already exists", "unreachable/unhealthy", and "backend down".
#[derive(Error, Debug)]
pub enum AdmitError {
    /// Pre-check or write-time uniqueness hit; no remote call was made
    /// past the pre-check and nothing was written.
    #[error("node with address {0} is already registered")]
    DuplicateAddress(String),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("registry failure: {0}")]
    Persistence(String),
}

/// Listing failures. Only fetch-level problems fail a whole call;
/// per-node join misses degrade that entry instead.
#[derive(Error, Debug)]
pub enum ListError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("registry failure: {0}")]
    Persistence(String),
}

fn registry_admit_err(e: RegistryError) -> AdmitError {
    match e {
        RegistryError::DuplicateAddress(address) => AdmitError::DuplicateAddress(address),
        RegistryError::Storage(msg) => AdmitError::Persistence(msg),
    }
}

/// Orchestrates the probe, the registry, and the live-state fetcher.
pub struct Reconciler {
    registry: Arc<dyn NodeRegistry>,
    fetcher: Arc<dyn ClusterStateFetcher>,
    prober: Arc<dyn Prober>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn NodeRegistry>,
        fetcher: Arc<dyn ClusterStateFetcher>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            registry,
            fetcher,
            prober,
        }
    }

    /// Admit a candidate host: uniqueness pre-check, then probe, then
    /// save. All-or-nothing: any probe failure aborts before any
    /// registry write. The store's own write-time uniqueness check
    /// backstops the pre-check under concurrent admission.
    pub async fn admit(&self, candidate: NodeCandidate) -> Result<NodeEntry, AdmitError> {
        let count = self
            .registry
            .count_by_address(&candidate.address)
            .map_err(registry_admit_err)?;
        if count > 0 {
            return Err(AdmitError::DuplicateAddress(candidate.address));
        }

        // The probe blocks for the duration of connect, upload and
        // exec, so it runs off the async runtime's worker threads.
        let prober = Arc::clone(&self.prober);
        let probe_input = candidate.clone();
        tokio::task::spawn_blocking(move || {
            prober.probe(&ProbeTarget {
                address: &probe_input.address,
                port: probe_input.ssh_port,
                username: &probe_input.ssh_user,
                credential: &probe_input.ssh_credential,
            })
        })
        .await
        .map_err(|e| AdmitError::Persistence(format!("probe task aborted: {e}")))??;

        let entry = self.registry.save(candidate).map_err(registry_admit_err)?;
        info!(address = %entry.address, cluster_id = entry.cluster_id, "node admitted");
        Ok(entry)
    }

    /// Bound nodes of one cluster: one view per registry entry, with
    /// runtime fields populated when a live fact matches the entry's
    /// address and absent otherwise. A bound-but-missing node is not a
    /// failure.
    pub async fn list_bound(&self, cluster_id: i64) -> Result<Vec<MergedNodeView>, ListError> {
        let registry = Arc::clone(&self.registry);
        let (facts, entries) = tokio::join!(
            self.fetcher.list_live_nodes(),
            tokio::task::spawn_blocking(move || registry.find_by_cluster(cluster_id)),
        );

        let entries = entries
            .map_err(|e| ListError::Persistence(format!("registry task aborted: {e}")))?
            .map_err(|e| ListError::Persistence(e.to_string()))?;
        let by_address = index_by_address(facts?);

        Ok(entries
            .into_iter()
            .map(|entry| MergedNodeView {
                id: Some(entry.id),
                cluster_id: Some(entry.cluster_id),
                created_at: Some(entry.created_at),
                runtime: by_address.get(&entry.address).map(RuntimeInfo::from_fact),
                address: entry.address,
            })
            .collect())
    }

    /// Live nodes not bound to any cluster: live facts whose address is
    /// absent from the registry, with no registry-derived fields.
    pub async fn list_unbound(&self) -> Result<Vec<MergedNodeView>, ListError> {
        let registry = Arc::clone(&self.registry);
        let (facts, entries) = tokio::join!(
            self.fetcher.list_live_nodes(),
            tokio::task::spawn_blocking(move || registry.find_all()),
        );

        let entries = entries
            .map_err(|e| ListError::Persistence(format!("registry task aborted: {e}")))?
            .map_err(|e| ListError::Persistence(e.to_string()))?;
        let bound_addresses: HashSet<String> =
            entries.into_iter().map(|entry| entry.address).collect();

        Ok(facts?
            .into_iter()
            .filter(|fact| !bound_addresses.contains(&fact.address))
            .map(|fact| MergedNodeView {
                id: None,
                cluster_id: None,
                created_at: None,
                runtime: Some(RuntimeInfo::from_fact(&fact)),
                address: fact.address,
            })
            .collect())
    }
}

/// Address-keyed lookup over one fetch. At most one fact per address;
/// on duplicates the later entry wins, with a warning, since a
/// duplicate may mask a real control-plane inconsistency.
fn index_by_address(facts: Vec<LiveNodeFact>) -> HashMap<String, LiveNodeFact> {
    let mut by_address = HashMap::with_capacity(facts.len());
    for fact in facts {
        if let Some(earlier) = by_address.insert(fact.address.clone(), fact) {
            warn!(
                address = %earlier.address,
                "duplicate address in live node list; keeping the later entry"
            );
        }
    }
    by_address
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;

    use crate::probe::{
        HealthProber, ProbeConfig, RemoteSession, RemoteTransport, TransportError,
    };
    use crate::registry::SshCredential;

    // ========================================================================
    // Fakes
    // ========================================================================

    /// In-memory registry with the same write-time uniqueness rule as
    /// the redb store.
    #[derive(Default)]
    struct FakeRegistry {
        entries: Mutex<Vec<NodeEntry>>,
    }

    impl FakeRegistry {
        fn with_entry(address: &str, cluster_id: i64) -> Self {
            let registry = Self::default();
            registry
                .save(candidate(address, cluster_id))
                .expect("seed entry");
            registry
        }

        fn len(&self) -> usize {
            self.entries.lock().unwrap().len()
        }
    }

    impl NodeRegistry for FakeRegistry {
        fn count_by_address(&self, address: &str) -> Result<u64, RegistryError> {
            let entries = self.entries.lock().unwrap();
            Ok(entries.iter().filter(|e| e.address == address).count() as u64)
        }

        fn save(&self, candidate: NodeCandidate) -> Result<NodeEntry, RegistryError> {
            let mut entries = self.entries.lock().unwrap();
            if entries.iter().any(|e| e.address == candidate.address) {
                return Err(RegistryError::DuplicateAddress(candidate.address));
            }
            let entry = NodeEntry {
                id: Uuid::new_v4(),
                address: candidate.address,
                ssh_port: candidate.ssh_port,
                ssh_user: candidate.ssh_user,
                ssh_credential: candidate.ssh_credential,
                cluster_id: candidate.cluster_id,
                created_at: Utc::now(),
            };
            entries.push(entry.clone());
            Ok(entry)
        }

        fn find_by_cluster(&self, cluster_id: i64) -> Result<Vec<NodeEntry>, RegistryError> {
            let entries = self.entries.lock().unwrap();
            Ok(entries
                .iter()
                .filter(|e| e.cluster_id == cluster_id)
                .cloned()
                .collect())
        }

        fn find_all(&self) -> Result<Vec<NodeEntry>, RegistryError> {
            Ok(self.entries.lock().unwrap().clone())
        }
    }

    struct FakeFetcher {
        facts: Vec<LiveNodeFact>,
        unavailable: bool,
    }

    #[async_trait]
    impl ClusterStateFetcher for FakeFetcher {
        async fn list_live_nodes(&self) -> Result<Vec<LiveNodeFact>, ClusterError> {
            if self.unavailable {
                return Err(ClusterError::Unavailable("connection refused".to_string()));
            }
            Ok(self.facts.clone())
        }
    }

    /// Counts invocations; outcome is scripted.
    struct CountingProber {
        calls: AtomicUsize,
        outcome: Option<ProbeError>,
    }

    impl CountingProber {
        fn passing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                outcome: None,
            }
        }

        fn failing(error: ProbeError) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                outcome: Some(error),
            }
        }
    }

    impl Prober for CountingProber {
        fn probe(&self, _target: &ProbeTarget<'_>) -> Result<(), ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.outcome {
                None => Ok(()),
                Some(ProbeError::Connectivity(msg)) => {
                    Err(ProbeError::Connectivity(msg.clone()))
                }
                Some(ProbeError::Transfer(msg)) => Err(ProbeError::Transfer(msg.clone())),
                Some(ProbeError::Validation { output }) => Err(ProbeError::Validation {
                    output: output.clone(),
                }),
            }
        }
    }

    // ========================================================================
    // Fixtures
    // ========================================================================

    fn candidate(address: &str, cluster_id: i64) -> NodeCandidate {
        NodeCandidate {
            address: address.to_string(),
            ssh_port: 22,
            ssh_user: "root".to_string(),
            ssh_credential: SshCredential::new("secret"),
            cluster_id,
        }
    }

    fn fact(address: &str, cores: u32, memory_kb: u64) -> LiveNodeFact {
        LiveNodeFact {
            address: address.to_string(),
            hostname: format!("host-{address}"),
            cores,
            memory_kb,
            storage_kb: 102_687_672,
            architecture: "amd64".to_string(),
            container_runtime_version: "containerd://1.7.2".to_string(),
            kubelet_version: "v1.28.3".to_string(),
            kernel_version: "5.15.0".to_string(),
            os_image: "Ubuntu 22.04".to_string(),
        }
    }

    fn reconciler(
        registry: Arc<FakeRegistry>,
        facts: Vec<LiveNodeFact>,
        prober: Arc<CountingProber>,
    ) -> Reconciler {
        Reconciler::new(
            registry,
            Arc::new(FakeFetcher {
                facts,
                unavailable: false,
            }),
            prober,
        )
    }

    // ========================================================================
    // Admission
    // ========================================================================

    #[tokio::test]
    async fn test_admit_saves_after_probe_passes() {
        let registry = Arc::new(FakeRegistry::default());
        let prober = Arc::new(CountingProber::passing());
        let r = reconciler(Arc::clone(&registry), vec![], Arc::clone(&prober));

        let entry = r.admit(candidate("10.0.0.5", 1)).await.unwrap();
        assert_eq!(entry.address, "10.0.0.5");
        assert_eq!(prober.calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_admit_duplicate_fails_without_probe_or_write() {
        let registry = Arc::new(FakeRegistry::with_entry("10.0.0.5", 1));
        let prober = Arc::new(CountingProber::passing());
        let r = reconciler(Arc::clone(&registry), vec![], Arc::clone(&prober));

        let err = r.admit(candidate("10.0.0.5", 2)).await.unwrap_err();
        assert!(matches!(err, AdmitError::DuplicateAddress(_)));
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_admit_probe_failure_leaves_registry_unchanged() {
        for error in [
            ProbeError::Connectivity("unreachable".to_string()),
            ProbeError::Transfer("upload failed".to_string()),
            ProbeError::Validation {
                output: "error".to_string(),
            },
        ] {
            let registry = Arc::new(FakeRegistry::default());
            let prober = Arc::new(CountingProber::failing(error));
            let r = reconciler(Arc::clone(&registry), vec![], prober);

            let err = r.admit(candidate("10.0.0.5", 1)).await.unwrap_err();
            assert!(matches!(err, AdmitError::Probe(_)));
            assert_eq!(registry.len(), 0, "no partial entry persisted");
        }
    }

    #[tokio::test]
    async fn test_admit_write_time_duplicate_maps_to_duplicate_address() {
        // Simulates the race where the pre-check passes but the store
        // rejects the write.
        struct RacingRegistry {
            inner: FakeRegistry,
        }

        impl NodeRegistry for RacingRegistry {
            fn count_by_address(&self, _address: &str) -> Result<u64, RegistryError> {
                Ok(0) // the pre-check misses the concurrent writer
            }
            fn save(&self, candidate: NodeCandidate) -> Result<NodeEntry, RegistryError> {
                self.inner.save(candidate)
            }
            fn find_by_cluster(&self, cluster_id: i64) -> Result<Vec<NodeEntry>, RegistryError> {
                self.inner.find_by_cluster(cluster_id)
            }
            fn find_all(&self) -> Result<Vec<NodeEntry>, RegistryError> {
                self.inner.find_all()
            }
        }

        let registry = Arc::new(RacingRegistry {
            inner: FakeRegistry::with_entry("10.0.0.5", 1),
        });
        let r = Reconciler::new(
            registry,
            Arc::new(FakeFetcher {
                facts: vec![],
                unavailable: false,
            }),
            Arc::new(CountingProber::passing()),
        );

        let err = r.admit(candidate("10.0.0.5", 2)).await.unwrap_err();
        assert!(matches!(err, AdmitError::DuplicateAddress(_)));
    }

    #[tokio::test]
    async fn test_cancelled_admission_still_releases_session() {
        // A caller-side timeout drops the admit future mid-check; the
        // blocking gate runs to completion and the session is closed
        // exactly once, with nothing written.
        struct SlowTransport {
            closes: Arc<AtomicUsize>,
        }

        struct SlowSession {
            closes: Arc<AtomicUsize>,
        }

        impl RemoteTransport for SlowTransport {
            fn connect(
                &self,
                _address: &str,
                _port: u16,
                _username: &str,
                _credential: &SshCredential,
            ) -> Result<Box<dyn RemoteSession>, TransportError> {
                Ok(Box::new(SlowSession {
                    closes: Arc::clone(&self.closes),
                }))
            }
        }

        impl RemoteSession for SlowSession {
            fn upload(&mut self, _local: &Path, _remote: &str) -> Result<(), TransportError> {
                Ok(())
            }

            fn exec(&mut self, _command: &str) -> Result<String, TransportError> {
                std::thread::sleep(Duration::from_millis(200));
                Ok("ok!!!".to_string())
            }

            fn close(&mut self) {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
        }

        let closes = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(FakeRegistry::default());
        let gate = HealthProber::new(
            Box::new(SlowTransport {
                closes: Arc::clone(&closes),
            }),
            ProbeConfig::default(),
        );
        let r = Reconciler::new(
            Arc::clone(&registry) as Arc<dyn NodeRegistry>,
            Arc::new(FakeFetcher {
                facts: vec![],
                unavailable: false,
            }),
            Arc::new(gate),
        );

        let outcome =
            tokio::time::timeout(Duration::from_millis(50), r.admit(candidate("10.0.0.5", 1)))
                .await;
        assert!(outcome.is_err(), "admission should be cut off mid-check");

        // The detached blocking task finishes on its own schedule.
        let deadline = Instant::now() + Duration::from_secs(2);
        while closes.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 0, "no entry persisted after cancellation");
    }

    // ========================================================================
    // Merges
    // ========================================================================

    #[tokio::test]
    async fn test_list_bound_merges_matching_fact() {
        let registry = Arc::new(FakeRegistry::with_entry("10.0.0.5", 1));
        let facts = vec![fact("10.0.0.5", 4, 16_777_216), fact("10.0.0.9", 8, 0)];
        let r = reconciler(registry, facts, Arc::new(CountingProber::passing()));

        let views = r.list_bound(1).await.unwrap();
        assert_eq!(views.len(), 1);

        let view = &views[0];
        assert_eq!(view.address, "10.0.0.5");
        assert!(view.id.is_some());
        assert_eq!(view.cluster_id, Some(1));

        let runtime = view.runtime.as_ref().expect("matched fact");
        assert_eq!(runtime.cores, 4);
        assert_eq!(runtime.memory, "16 GB");
    }

    #[tokio::test]
    async fn test_list_bound_keeps_entry_missing_from_live_state() {
        let registry = Arc::new(FakeRegistry::with_entry("10.0.0.5", 1));
        let r = reconciler(registry, vec![], Arc::new(CountingProber::passing()));

        let views = r.list_bound(1).await.unwrap();
        assert_eq!(views.len(), 1, "one view per entry, match or not");
        assert_eq!(views[0].address, "10.0.0.5");
        assert!(views[0].runtime.is_none());
        assert!(views[0].id.is_some());
    }

    #[tokio::test]
    async fn test_list_unbound_excludes_registered_addresses() {
        let registry = Arc::new(FakeRegistry::with_entry("10.0.0.5", 1));
        let facts = vec![fact("10.0.0.5", 4, 16_777_216), fact("10.0.0.9", 8, 0)];
        let r = reconciler(registry, facts, Arc::new(CountingProber::passing()));

        let views = r.list_unbound().await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].address, "10.0.0.9");
        assert!(views[0].id.is_none());
        assert!(views[0].cluster_id.is_none());
        assert!(views[0].created_at.is_none());
        assert!(views[0].runtime.is_some());
    }

    #[tokio::test]
    async fn test_unbound_ignores_cluster_grouping() {
        // Registered under any cluster means bound, full stop.
        let registry = Arc::new(FakeRegistry::default());
        registry.save(candidate("10.0.0.5", 1)).unwrap();
        registry.save(candidate("10.0.0.6", 2)).unwrap();
        let facts = vec![fact("10.0.0.5", 4, 0), fact("10.0.0.6", 4, 0)];
        let r = reconciler(registry, facts, Arc::new(CountingProber::passing()));

        assert!(r.list_unbound().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partition_of_addresses() {
        // Bound over all clusters plus unbound together account for
        // exactly addresses(R) ∪ addresses(L), none double-counted.
        let registry = Arc::new(FakeRegistry::default());
        registry.save(candidate("10.0.0.1", 1)).unwrap();
        registry.save(candidate("10.0.0.2", 2)).unwrap();
        let facts = vec![
            fact("10.0.0.2", 2, 0),
            fact("10.0.0.3", 4, 0),
            fact("10.0.0.4", 8, 0),
        ];
        let r = reconciler(registry, facts, Arc::new(CountingProber::passing()));

        let mut seen = HashSet::new();
        for cluster_id in [1, 2] {
            for view in r.list_bound(cluster_id).await.unwrap() {
                assert!(seen.insert(view.address.clone()), "double-counted address");
            }
        }
        for view in r.list_unbound().await.unwrap() {
            assert!(seen.insert(view.address.clone()), "double-counted address");
        }

        let expected: HashSet<String> = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_duplicate_live_address_later_entry_wins() {
        let registry = Arc::new(FakeRegistry::with_entry("10.0.0.5", 1));
        let facts = vec![fact("10.0.0.5", 2, 0), fact("10.0.0.5", 16, 33_554_432)];
        let r = reconciler(registry, facts, Arc::new(CountingProber::passing()));

        let views = r.list_bound(1).await.unwrap();
        let runtime = views[0].runtime.as_ref().unwrap();
        assert_eq!(runtime.cores, 16);
        assert_eq!(runtime.memory, "32 GB");
    }

    #[tokio::test]
    async fn test_list_bound_surfaces_cluster_unavailable() {
        let r = Reconciler::new(
            Arc::new(FakeRegistry::with_entry("10.0.0.5", 1)),
            Arc::new(FakeFetcher {
                facts: vec![],
                unavailable: true,
            }),
            Arc::new(CountingProber::passing()),
        );

        assert!(matches!(
            r.list_bound(1).await.unwrap_err(),
            ListError::Cluster(ClusterError::Unavailable(_))
        ));
        assert!(matches!(
            r.list_unbound().await.unwrap_err(),
            ListError::Cluster(ClusterError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_cluster_is_not_an_error() {
        let registry = Arc::new(FakeRegistry::default());
        let r = reconciler(registry, vec![], Arc::new(CountingProber::passing()));

        assert!(r.list_bound(1).await.unwrap().is_empty());
        assert!(r.list_unbound().await.unwrap().is_empty());
    }
}
