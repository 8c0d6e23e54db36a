//! redb-backed node registry.
//!
//! One table, keyed by network address, with JSON-serialized entries as
//! values. Keying by address makes the uniqueness invariant structural:
//! `save` checks and inserts inside a single write transaction, so a
//! racing duplicate admission is rejected at write time rather than
//! relying on the caller's pre-check alone.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;
use uuid::Uuid;

use super::{NodeCandidate, NodeEntry, NodeRegistry, RegistryError};

/// Admitted nodes keyed by network address.
const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

fn storage_err(e: impl std::fmt::Display) -> RegistryError {
    RegistryError::Storage(e.to_string())
}

/// Thread-safe durable registry backed by redb.
#[derive(Clone)]
pub struct RedbRegistry {
    db: Arc<Database>,
}

impl RedbRegistry {
    /// Open (or create) a persistent registry at the given path.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let db = Database::create(path).map_err(storage_err)?;
        let registry = Self { db: Arc::new(db) };
        registry.ensure_table()?;
        debug!(?path, "node registry opened");
        Ok(registry)
    }

    /// Create an ephemeral in-memory registry (for testing).
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(storage_err)?;
        let registry = Self { db: Arc::new(db) };
        registry.ensure_table()?;
        Ok(registry)
    }

    fn ensure_table(&self) -> Result<(), RegistryError> {
        let txn = self.db.begin_write().map_err(storage_err)?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(storage_err)?;
        txn.commit().map_err(storage_err)?;
        Ok(())
    }

    fn scan(
        &self,
        mut keep: impl FnMut(&NodeEntry) -> bool,
    ) -> Result<Vec<NodeEntry>, RegistryError> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let table = txn.open_table(NODES).map_err(storage_err)?;
        let mut results = Vec::new();
        for item in table.iter().map_err(storage_err)? {
            let (_, value) = item.map_err(storage_err)?;
            let entry: NodeEntry =
                serde_json::from_slice(value.value()).map_err(storage_err)?;
            if keep(&entry) {
                results.push(entry);
            }
        }
        Ok(results)
    }
}

impl NodeRegistry for RedbRegistry {
    fn count_by_address(&self, address: &str) -> Result<u64, RegistryError> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let table = txn.open_table(NODES).map_err(storage_err)?;
        let present = table.get(address).map_err(storage_err)?.is_some();
        Ok(u64::from(present))
    }

    fn save(&self, candidate: NodeCandidate) -> Result<NodeEntry, RegistryError> {
        let entry = NodeEntry {
            id: Uuid::new_v4(),
            address: candidate.address,
            ssh_port: candidate.ssh_port,
            ssh_user: candidate.ssh_user,
            ssh_credential: candidate.ssh_credential,
            cluster_id: candidate.cluster_id,
            created_at: Utc::now(),
        };

        let value = serde_json::to_vec(&entry).map_err(storage_err)?;
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = txn.open_table(NODES).map_err(storage_err)?;
            let occupied = table.get(entry.address.as_str()).map_err(storage_err)?.is_some();
            if occupied {
                return Err(RegistryError::DuplicateAddress(entry.address));
            }
            table
                .insert(entry.address.as_str(), value.as_slice())
                .map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;
        debug!(address = %entry.address, cluster_id = entry.cluster_id, "node saved");
        Ok(entry)
    }

    fn find_by_cluster(&self, cluster_id: i64) -> Result<Vec<NodeEntry>, RegistryError> {
        self.scan(|entry| entry.cluster_id == cluster_id)
    }

    fn find_all(&self) -> Result<Vec<NodeEntry>, RegistryError> {
        self.scan(|_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SshCredential;

    fn candidate(address: &str, cluster_id: i64) -> NodeCandidate {
        NodeCandidate {
            address: address.to_string(),
            ssh_port: 22,
            ssh_user: "root".to_string(),
            ssh_credential: SshCredential::new("secret"),
            cluster_id,
        }
    }

    #[test]
    fn test_save_assigns_identity() {
        let registry = RedbRegistry::open_in_memory().unwrap();
        let entry = registry.save(candidate("10.0.0.5", 1)).unwrap();

        assert_eq!(entry.address, "10.0.0.5");
        assert_eq!(entry.cluster_id, 1);
        assert!(!entry.id.is_nil());
    }

    #[test]
    fn test_count_by_address() {
        let registry = RedbRegistry::open_in_memory().unwrap();
        assert_eq!(registry.count_by_address("10.0.0.5").unwrap(), 0);

        registry.save(candidate("10.0.0.5", 1)).unwrap();
        assert_eq!(registry.count_by_address("10.0.0.5").unwrap(), 1);
        assert_eq!(registry.count_by_address("10.0.0.9").unwrap(), 0);
    }

    #[test]
    fn test_duplicate_address_rejected_at_write_time() {
        let registry = RedbRegistry::open_in_memory().unwrap();
        registry.save(candidate("10.0.0.5", 1)).unwrap();

        // Same address under a different cluster still collides.
        let err = registry.save(candidate("10.0.0.5", 2)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateAddress(_)));
        assert_eq!(registry.find_all().unwrap().len(), 1);
    }

    #[test]
    fn test_find_by_cluster_filters() {
        let registry = RedbRegistry::open_in_memory().unwrap();
        registry.save(candidate("10.0.0.5", 1)).unwrap();
        registry.save(candidate("10.0.0.6", 1)).unwrap();
        registry.save(candidate("10.0.0.7", 2)).unwrap();

        assert_eq!(registry.find_by_cluster(1).unwrap().len(), 2);
        assert_eq!(registry.find_by_cluster(2).unwrap().len(), 1);
        assert_eq!(registry.find_by_cluster(3).unwrap().len(), 0);
        assert_eq!(registry.find_all().unwrap().len(), 3);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.redb");

        {
            let registry = RedbRegistry::open(&path).unwrap();
            registry.save(candidate("10.0.0.5", 1)).unwrap();
        }

        let registry = RedbRegistry::open(&path).unwrap();
        let all = registry.find_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].address, "10.0.0.5");
        assert_eq!(all[0].ssh_credential.expose(), "secret");
    }
}
