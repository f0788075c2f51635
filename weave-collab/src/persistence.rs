//! Durable update log in front of a [`Storage`] backend.
//!
//! Appends are best-effort: a failed write is retried a bounded number of
//! times with exponential backoff, then logged and given up on. Callers
//! broadcast before persisting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::storage::{StoreError, Storage, UpdateLog};

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Attempts per append, including the first one.
    pub retry_attempts: u32,
    /// Delay before the first retry; doubled on every further attempt.
    pub retry_backoff: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

/// Outcome of replaying a stored log into a fresh document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub replayed: usize,
    pub skipped: usize,
    pub last_seq: u64,
}

impl LoadReport {
    pub fn is_empty(&self) -> bool {
        self.replayed == 0 && self.skipped == 0
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PersistenceStats {
    pub persisted_updates: u64,
    pub failed_updates: u64,
    pub retries: u64,
    pub compactions: u64,
}

pub struct PersistenceGateway {
    store: Arc<dyn Storage>,
    config: PersistenceConfig,
    persisted: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    compactions: AtomicU64,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn Storage>, config: PersistenceConfig) -> Self {
        Self {
            store,
            config,
            persisted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    /// Append `update` to the document's log, retrying on failure.
    pub async fn persist_update(&self, doc_id: Uuid, update: &[u8]) -> Result<u64, StoreError> {
        let attempts = self.config.retry_attempts.max(1);
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 1;
        loop {
            match self.store.append_update(doc_id, update) {
                Ok(seq) => {
                    self.persisted.fetch_add(1, Ordering::Relaxed);
                    log::trace!("Persisted update {seq} of {doc_id} ({} bytes)", update.len());
                    return Ok(seq);
                }
                Err(e) if attempt < attempts => {
                    log::warn!("Persisting update of {doc_id} failed (attempt {attempt}/{attempts}): {e}");
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    log::error!("Giving up on update of {doc_id} after {attempts} attempt(s): {e}");
                    return Err(e);
                }
            }
        }
    }

    /// Rebuild a document from its baseline and deltas.
    ///
    /// Records that fail to decode or apply are skipped with a warning.
    pub fn load_document(&self, doc_id: Uuid) -> Result<(Doc, LoadReport), StoreError> {
        let log = self.store.load_log(doc_id)?;
        let doc = Doc::new();
        let mut report = LoadReport {
            last_seq: log.deltas.last().map_or(0, |(seq, _)| *seq),
            ..LoadReport::default()
        };

        {
            let mut txn = doc.transact_mut();
            for bytes in log.updates() {
                let applied = Update::decode_v1(bytes)
                    .map_err(|e| e.to_string())
                    .and_then(|update| txn.apply_update(update).map_err(|e| e.to_string()));
                match applied {
                    Ok(()) => report.replayed += 1,
                    Err(e) => {
                        log::warn!("Skipping undecodable record of {doc_id}: {e}");
                        report.skipped += 1;
                    }
                }
            }
        }

        if !report.is_empty() {
            log::debug!(
                "Loaded {doc_id}: {} record(s) replayed, {} skipped",
                report.replayed,
                report.skipped
            );
        }
        Ok((doc, report))
    }

    /// Flatten `doc` into a new baseline covering every delta up to `up_to`.
    pub fn compact(&self, doc_id: Uuid, doc: &Doc, up_to: u64) -> Result<u64, StoreError> {
        let baseline = doc.transact().encode_state_as_update_v1(&StateVector::default());
        let removed = self.store.compact(doc_id, &baseline, up_to)?;
        self.compactions.fetch_add(1, Ordering::Relaxed);
        log::info!("Compacted {doc_id}: {removed} delta(s) folded into a {} byte baseline", baseline.len());
        Ok(removed)
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            persisted_updates: self.persisted.load(Ordering::Relaxed),
            failed_updates: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoredLog, UpdateLog, VersionStore};
    use crate::versions::TemporalState;
    use std::sync::atomic::AtomicU32;
    use weave_core::{CanvasMaps, Graph};
    use yrs::{Map, WriteTxn};

    fn update_setting(key: &str, value: &str) -> Vec<u8> {
        let doc = Doc::new();
        let mut txn = doc.transact_mut();
        let map = txn.get_or_insert_map("blocks");
        map.insert(&mut txn, key, value);
        txn.encode_update_v1()
    }

    /// Fails the first `failures` appends, then delegates.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    impl UpdateLog for FlakyStore {
        fn append_update(&self, doc_id: Uuid, update: &[u8]) -> Result<u64, StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Database("disk full".into()));
            }
            self.inner.append_update(doc_id, update)
        }
        fn load_log(&self, doc_id: Uuid) -> Result<StoredLog, StoreError> {
            self.inner.load_log(doc_id)
        }
        fn last_sequence(&self, doc_id: Uuid) -> Result<u64, StoreError> {
            self.inner.last_sequence(doc_id)
        }
        fn compact(&self, doc_id: Uuid, baseline: &[u8], up_to: u64) -> Result<u64, StoreError> {
            self.inner.compact(doc_id, baseline, up_to)
        }
    }

    impl VersionStore for FlakyStore {
        fn commit_head(&self, version: &TemporalState, graph: &Graph) -> Result<(), StoreError> {
            self.inner.commit_head(version, graph)
        }
        fn get_version(&self, id: Uuid) -> Result<Option<TemporalState>, StoreError> {
            self.inner.get_version(id)
        }
        fn list_versions(&self, project_id: Uuid) -> Result<Vec<TemporalState>, StoreError> {
            self.inner.list_versions(project_id)
        }
        fn update_version(&self, version: &TemporalState) -> Result<(), StoreError> {
            self.inner.update_version(version)
        }
        fn delete_version(&self, project_id: Uuid, id: Uuid) -> Result<bool, StoreError> {
            self.inner.delete_version(project_id, id)
        }
        fn head(&self, project_id: Uuid) -> Result<Option<Uuid>, StoreError> {
            self.inner.head(project_id)
        }
        fn load_graph(&self, project_id: Uuid) -> Result<Option<Graph>, StoreError> {
            self.inner.load_graph(project_id)
        }
    }

    fn flaky(failures: u32) -> PersistenceGateway {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(failures),
        };
        PersistenceGateway::new(
            Arc::new(store),
            PersistenceConfig {
                retry_attempts: 3,
                retry_backoff: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_persist_retries_transient_failures() {
        let gateway = flaky(2);
        let doc = Uuid::new_v4();
        assert_eq!(gateway.persist_update(doc, b"u").await.unwrap(), 1);
        let stats = gateway.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.persisted_updates, 1);
    }

    #[tokio::test]
    async fn test_persist_gives_up_after_bounded_attempts() {
        let gateway = flaky(10);
        assert!(gateway.persist_update(Uuid::new_v4(), b"u").await.is_err());
        assert_eq!(gateway.stats().failed_updates, 1);
    }

    #[tokio::test]
    async fn test_load_skips_corrupt_records() {
        let store = Arc::new(MemoryStore::new());
        let gateway = PersistenceGateway::new(store.clone(), PersistenceConfig::default());
        let doc_id = Uuid::new_v4();

        gateway.persist_update(doc_id, &update_setting("a", "1")).await.unwrap();
        gateway.persist_update(doc_id, b"\x03").await.unwrap();
        gateway.persist_update(doc_id, &update_setting("b", "2")).await.unwrap();

        let (doc, report) = gateway.load_document(doc_id).unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.last_seq, 3);

        let maps = CanvasMaps::new(&doc);
        let txn = doc.transact();
        assert_eq!(maps.blocks.len(&txn), 2);
    }

    #[tokio::test]
    async fn test_compact_preserves_state() {
        let store = Arc::new(MemoryStore::new());
        let gateway = PersistenceGateway::new(store.clone(), PersistenceConfig::default());
        let doc_id = Uuid::new_v4();
        for i in 0..5 {
            gateway
                .persist_update(doc_id, &update_setting(&format!("k{i}"), "v"))
                .await
                .unwrap();
        }

        let (doc, _) = gateway.load_document(doc_id).unwrap();
        assert_eq!(gateway.compact(doc_id, &doc, 5).unwrap(), 5);
        assert_eq!(store.delta_count(doc_id), 0);

        let (reloaded, report) = gateway.load_document(doc_id).unwrap();
        assert_eq!(report.replayed, 1);
        let maps = CanvasMaps::new(&reloaded);
        assert_eq!(maps.blocks.len(&reloaded.transact()), 5);
    }
}
