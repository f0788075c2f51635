//! Persistent storage for canvas documents and their version history.
//!
//! ```text
//! ┌──────────────┐  append_update   ┌───────────────────────────────────────┐
//! │ Persistence  │ ───────────────► │ CF "documents"     baseline (LZ4)     │
//! │ Gateway      │  compact         │ CF "deltas"        project‖seq (LZ4)  │
//! └──────────────┘                  │ CF "metadata"      per-project info   │
//! ┌──────────────┐  commit_head     │ CF "versions"      version rows       │
//! │ Versioning   │ ───────────────► │ CF "version_index" project‖seq‖id     │
//! │ Service      │                  │ CF "heads"         project → version  │
//! └──────────────┘                  │ CF "graph_rows"    current graph      │
//!                                   └───────────────────────────────────────┘
//! ```
//!
//! [`DocumentStore`] is the RocksDB implementation, [`MemoryStore`] the
//! in-process one used by tests and storage-less deployments.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};

use uuid::Uuid;
use weave_core::Graph;

use crate::versions::TemporalState;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Everything needed to rebuild a document: the baseline (if compacted at
/// least once) followed by the deltas appended since, in sequence order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredLog {
    pub baseline: Option<Vec<u8>>,
    pub deltas: Vec<(u64, Vec<u8>)>,
}

impl StoredLog {
    pub fn is_empty(&self) -> bool {
        self.baseline.is_none() && self.deltas.is_empty()
    }

    /// Baseline first, then deltas.
    pub fn updates(&self) -> impl Iterator<Item = &[u8]> {
        self.baseline
            .iter()
            .map(Vec::as_slice)
            .chain(self.deltas.iter().map(|(_, d)| d.as_slice()))
    }
}

/// Durable, append-only update log per document.
pub trait UpdateLog: Send + Sync {
    /// Append one update. Returns its sequence number (starting at 1).
    fn append_update(&self, doc_id: Uuid, update: &[u8]) -> Result<u64, StoreError>;

    fn load_log(&self, doc_id: Uuid) -> Result<StoredLog, StoreError>;

    /// Highest sequence number appended so far (0 when none).
    fn last_sequence(&self, doc_id: Uuid) -> Result<u64, StoreError>;

    /// Store `baseline` as the document's new base state and drop every delta
    /// with a sequence number up to `up_to`. Returns how many were dropped.
    fn compact(&self, doc_id: Uuid, baseline: &[u8], up_to: u64) -> Result<u64, StoreError>;
}

/// Version rows, head pointers and the current-graph rows.
pub trait VersionStore: Send + Sync {
    /// Insert `version`, make it the project's head and replace the project's
    /// current-graph rows with `graph`, all in one atomic write.
    fn commit_head(&self, version: &TemporalState, graph: &Graph) -> Result<(), StoreError>;

    fn get_version(&self, version_id: Uuid) -> Result<Option<TemporalState>, StoreError>;

    /// All versions of a project in creation order.
    fn list_versions(&self, project_id: Uuid) -> Result<Vec<TemporalState>, StoreError>;

    /// Overwrite a version row in place (used for renames).
    fn update_version(&self, version: &TemporalState) -> Result<(), StoreError>;

    fn delete_version(&self, project_id: Uuid, version_id: Uuid) -> Result<bool, StoreError>;

    fn head(&self, project_id: Uuid) -> Result<Option<Uuid>, StoreError>;

    /// The project's current-graph rows, if any were ever written.
    fn load_graph(&self, project_id: Uuid) -> Result<Option<Graph>, StoreError>;
}

/// Both storage concerns behind one handle.
pub trait Storage: UpdateLog + VersionStore {}

impl<T: UpdateLog + VersionStore> Storage for T {}
