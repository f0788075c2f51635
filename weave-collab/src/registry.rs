//! Live documents, one per project.
//!
//! ```text
//!            acquire                 release (last)            grace elapsed
//! unloaded ─────────► resident ───────────────────► draining ───────────────► compacted + unloaded
//!                        ▲                              │
//!                        └──────── acquire ─────────────┘
//! ```
//!
//! The registry map only holds one slot per project. Loading, seeding and
//! compaction run outside the map lock, so a slow store stalls only the
//! project it serves. Connection counts change under the map lock, and a
//! generation counter bumped on each acquire and release lets a stale grace
//! timer notice it no longer applies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use uuid::Uuid;
use weave_core::collab::{GUARD_ORIGIN, REMOTE_ORIGIN, RESTORE_ORIGIN};
use weave_core::{CanvasMaps, CollabError, CoreZone, Graph};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Transact, Update};

use crate::broadcast::BroadcastGroup;
use crate::persistence::PersistenceGateway;
use crate::protocol::SyncMessage;
use crate::storage::{StoreError, UpdateLog, VersionStore};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("document error: {0}")]
    Collab(#[from] CollabError),
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a document stays resident after its last connection closes.
    pub grace_period: Duration,
    /// Broadcast channel capacity per document.
    pub broadcast_capacity: usize,
    pub zone: CoreZone,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            broadcast_capacity: 256,
            zone: CoreZone::default(),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RegistryStats {
    pub resident_documents: usize,
    pub loads: u64,
    pub unloads: u64,
    pub failed_compactions: u64,
}

/// The authoritative replica of one project's canvas.
pub struct LiveDocument {
    project_id: Uuid,
    doc: Mutex<Doc>,
    maps: CanvasMaps,
    zone: CoreZone,
    broadcast: Arc<BroadcastGroup>,
    connections: AtomicUsize,
    generation: AtomicU64,
}

impl LiveDocument {
    fn new(project_id: Uuid, doc: Doc, zone: CoreZone, broadcast_capacity: usize) -> Self {
        let maps = CanvasMaps::new(&doc);
        Self {
            project_id,
            doc: Mutex::new(doc),
            maps,
            zone,
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
            connections: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Doc> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Merge a peer update.
    ///
    /// Returns a correction update when the merge broke the core block; it
    /// must be broadcast and persisted like any other update.
    pub fn apply_update(&self, update: &[u8]) -> Result<Option<Vec<u8>>, CollabError> {
        let update = Update::decode_v1(update)?;
        let doc = self.lock();
        {
            let mut txn = doc.transact_mut_with(Origin::from(REMOTE_ORIGIN));
            txn.apply_update(update)
                .map_err(|e| CollabError::Apply(e.to_string()))?;
        }
        let mut txn = doc.transact_mut_with(Origin::from(GUARD_ORIGIN));
        if self.maps.ensure_core(&mut txn, &self.zone)? {
            log::debug!("Restored core block of {} after a peer update", self.project_id);
            return Ok(Some(txn.encode_update_v1()));
        }
        Ok(None)
    }

    /// Seed an empty document from `graph` (if any) and make sure the core
    /// block exists. Returns the update to persist.
    fn seed(&self, graph: Option<&Graph>) -> Result<Option<Vec<u8>>, CollabError> {
        let doc = self.lock();
        let mut txn = doc.transact_mut_with(Origin::from(GUARD_ORIGIN));
        let mut changed = false;
        if let Some(graph) = graph {
            if self.maps.is_empty(&txn) {
                self.maps.replace_graph(&mut txn, graph, &self.zone)?;
                changed = true;
            }
        }
        changed |= self.maps.ensure_core(&mut txn, &self.zone)?;
        Ok(changed.then(|| txn.encode_update_v1()))
    }

    /// Replace the whole canvas with `graph`.
    pub fn replace_graph(&self, graph: &Graph) -> Result<Vec<u8>, CollabError> {
        let doc = self.lock();
        let mut txn = doc.transact_mut_with(Origin::from(RESTORE_ORIGIN));
        self.maps.replace_graph(&mut txn, graph, &self.zone)?;
        Ok(txn.encode_update_v1())
    }

    pub fn graph(&self) -> Graph {
        let doc = self.lock();
        let txn = doc.transact();
        self.maps.read_graph(&txn)
    }

    pub fn encode_state(&self) -> Vec<u8> {
        self.lock()
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.lock().transact().state_vector().encode_v1()
    }

    /// Updates a peer with state vector `remote_sv` is missing.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, CollabError> {
        let sv = StateVector::decode_v1(remote_sv)?;
        Ok(self.lock().transact().encode_diff_v1(&sv))
    }

    fn compact(&self, gateway: &PersistenceGateway) -> Result<u64, StoreError> {
        let doc = self.lock();
        let up_to = gateway.store().last_sequence(self.project_id)?;
        gateway.compact(self.project_id, &doc, up_to)
    }
}

/// A project's entry in the registry, filled once its load completes.
type Slot = Arc<OnceCell<Arc<LiveDocument>>>;

pub struct DocumentRegistry {
    gateway: Arc<PersistenceGateway>,
    config: RegistryConfig,
    documents: tokio::sync::Mutex<HashMap<Uuid, Slot>>,
    loads: AtomicU64,
    unloads: AtomicU64,
    failed_compactions: AtomicU64,
}

impl DocumentRegistry {
    pub fn new(gateway: Arc<PersistenceGateway>, config: RegistryConfig) -> Self {
        Self {
            gateway,
            config,
            documents: tokio::sync::Mutex::new(HashMap::new()),
            loads: AtomicU64::new(0),
            unloads: AtomicU64::new(0),
            failed_compactions: AtomicU64::new(0),
        }
    }

    pub fn gateway(&self) -> &Arc<PersistenceGateway> {
        &self.gateway
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Attach a connection to the project's document, loading it if needed.
    ///
    /// Concurrent acquires of the same project share one load.
    pub async fn acquire(&self, project_id: Uuid) -> Result<Arc<LiveDocument>, RegistryError> {
        loop {
            let slot = self
                .documents
                .lock()
                .await
                .entry(project_id)
                .or_default()
                .clone();

            let document = match slot.get_or_try_init(|| self.load(project_id)).await {
                Ok(document) => document.clone(),
                Err(e) => {
                    let mut documents = self.documents.lock().await;
                    if !slot.initialized()
                        && documents.get(&project_id).is_some_and(|s| Arc::ptr_eq(s, &slot))
                    {
                        documents.remove(&project_id);
                    }
                    return Err(e);
                }
            };

            let documents = self.documents.lock().await;
            if documents.get(&project_id).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                document.connections.fetch_add(1, Ordering::SeqCst);
                // Cancels any pending grace timer.
                document.generation.fetch_add(1, Ordering::SeqCst);
                return Ok(document);
            }
            // Unloaded between the load and this attach.
            log::debug!("Document {project_id} unloaded while attaching, reloading");
        }
    }

    async fn load(&self, project_id: Uuid) -> Result<Arc<LiveDocument>, RegistryError> {
        let (doc, report) = self.gateway.load_document(project_id)?;
        let document = Arc::new(LiveDocument::new(
            project_id,
            doc,
            self.config.zone,
            self.config.broadcast_capacity,
        ));

        // The log wins; graph rows only seed a document that has none.
        let rows = if report.is_empty() {
            self.gateway.store().load_graph(project_id)?
        } else {
            None
        };
        if let Some(seed) = document.seed(rows.as_ref())? {
            if let Err(e) = self.gateway.persist_update(project_id, &seed).await {
                log::error!("Seed of {project_id} kept in memory only: {e}");
            }
        }

        self.loads.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Loaded document {project_id} ({} record(s){})",
            report.replayed,
            if rows.is_some() { ", seeded from graph rows" } else { "" }
        );
        Ok(document)
    }

    /// Detach a connection. The last one out starts the grace timer.
    pub async fn release(self: &Arc<Self>, project_id: Uuid) {
        let documents = self.documents.lock().await;
        let Some(document) = documents.get(&project_id).and_then(|slot| slot.get()) else {
            return;
        };
        let previous = document.connections.fetch_sub(1, Ordering::SeqCst);
        if previous <= 1 {
            document.connections.store(0, Ordering::SeqCst);
            let generation = document.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.schedule_drain(project_id, generation);
        }
    }

    fn schedule_drain(self: &Arc<Self>, project_id: Uuid, generation: u64) {
        let registry = Arc::clone(self);
        let grace = self.config.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.finish_drain(project_id, generation).await;
        });
    }

    /// Compact and unload, unless a connection arrived in the meantime.
    ///
    /// The entry leaves the map before compaction starts; a failed
    /// compaction puts it back unless the project was loaded again.
    async fn finish_drain(self: &Arc<Self>, project_id: Uuid, generation: u64) {
        let (slot, document) = {
            let mut documents = self.documents.lock().await;
            let Some(slot) = documents.get(&project_id).cloned() else {
                return;
            };
            let Some(document) = slot.get().cloned() else {
                return;
            };
            if document.generation.load(Ordering::SeqCst) != generation
                || document.connection_count() > 0
            {
                log::debug!("Drain of {project_id} superseded");
                return;
            }
            documents.remove(&project_id);
            (slot, document)
        };

        match document.compact(&self.gateway) {
            Ok(_) => {
                self.unloads.fetch_add(1, Ordering::Relaxed);
                log::info!("Unloaded document {project_id}");
            }
            Err(e) => {
                self.failed_compactions.fetch_add(1, Ordering::Relaxed);
                let mut documents = self.documents.lock().await;
                if documents.contains_key(&project_id) {
                    log::error!("Compaction of {project_id} failed after it was reloaded: {e}");
                    return;
                }
                log::error!("Compaction of {project_id} failed, staying resident: {e}");
                documents.insert(project_id, slot);
                self.schedule_drain(project_id, generation);
            }
        }
    }

    /// Materialize `graph` into the live document, loading it if needed.
    ///
    /// Peers receive the change followed by a `Replaced` notice.
    pub async fn replace_graph(self: &Arc<Self>, project_id: Uuid, graph: &Graph) -> Result<(), RegistryError> {
        let document = self.acquire(project_id).await?;
        let result = self.replace_in(&document, graph).await;
        self.release(project_id).await;
        result
    }

    async fn replace_in(&self, document: &LiveDocument, graph: &Graph) -> Result<(), RegistryError> {
        let project_id = document.project_id;
        let update = document.replace_graph(graph)?;

        let broadcast = document.broadcast();
        for msg in [
            SyncMessage::delta(Uuid::nil(), project_id, 0, update.clone()),
            SyncMessage::replaced(project_id),
        ] {
            if let Err(e) = broadcast.broadcast(&msg) {
                log::warn!("Failed to announce replacement of {project_id}: {e}");
            }
        }

        // Best effort, already logged by the gateway.
        let _ = self.gateway.persist_update(project_id, &update).await;
        log::info!("Replaced contents of {project_id}");
        Ok(())
    }

    /// Compact every resident document. Used on shutdown.
    pub async fn flush_all(&self) -> usize {
        let resident: Vec<Arc<LiveDocument>> = self
            .documents
            .lock()
            .await
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect();
        let mut flushed = 0;
        for document in resident {
            let project_id = document.project_id;
            match document.compact(&self.gateway) {
                Ok(_) => flushed += 1,
                Err(e) => log::error!("Flush of {project_id} failed: {e}"),
            }
        }
        flushed
    }

    pub async fn is_resident(&self, project_id: Uuid) -> bool {
        self.get(project_id).await.is_some()
    }

    pub async fn get(&self, project_id: Uuid) -> Option<Arc<LiveDocument>> {
        self.documents
            .lock()
            .await
            .get(&project_id)
            .and_then(|slot| slot.get().cloned())
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            resident_documents: self
                .documents
                .lock()
                .await
                .values()
                .filter(|slot| slot.initialized())
                .count(),
            loads: self.loads.load(Ordering::Relaxed),
            unloads: self.unloads.load(Ordering::Relaxed),
            failed_compactions: self.failed_compactions.load(Ordering::Relaxed),
        }
    }
}
