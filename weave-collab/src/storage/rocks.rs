//! RocksDB-backed store.
//!
//! Column families:
//! - `documents`: compacted baseline update per project (LZ4)
//! - `deltas`: appended updates, keyed by project (16 bytes) + seq (8 bytes BE), LZ4
//! - `metadata`: per-project log bookkeeping (bincode)
//! - `versions`: version rows keyed by version id (JSON)
//! - `version_index`: project + creation seq + version id, for ordered listing
//! - `heads`: project → head version id
//! - `graph_rows`: project + kind + record id → JSON, the current graph
//!
//! Every multi-key change goes through a single `WriteBatch`.

use chrono::Utc;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;
use weave_core::{Block, Graph, Link};

use super::{StoreError, StoredLog, UpdateLog, VersionStore};
use crate::versions::TemporalState;

const CF_DOCUMENTS: &str = "documents";
const CF_DELTAS: &str = "deltas";
const CF_METADATA: &str = "metadata";
const CF_VERSIONS: &str = "versions";
const CF_VERSION_INDEX: &str = "version_index";
const CF_HEADS: &str = "heads";
const CF_GRAPH_ROWS: &str = "graph_rows";

const COLUMN_FAMILIES: &[&str] = &[
    CF_DOCUMENTS,
    CF_DELTAS,
    CF_METADATA,
    CF_VERSIONS,
    CF_VERSION_INDEX,
    CF_HEADS,
    CF_GRAPH_ROWS,
];

/// Metadata key holding the version creation counter.
const VERSION_SEQ_KEY: &[u8] = b"version_seq";

const ROW_BLOCK: u8 = b'b';
const ROW_LINK: u8 = b'l';
const ROW_CONTENT: u8 = b'c';

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("weave_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-project log bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentMetadata {
    pub doc_id: Uuid,
    /// Highest delta sequence number ever assigned.
    pub last_seq: u64,
    /// Deltas currently stored (not yet compacted).
    pub delta_count: u64,
    pub baseline_size: u64,
    pub compressed_size: u64,
    pub compactions: u64,
    /// Seconds since the epoch.
    pub created_at: i64,
    pub updated_at: i64,
}

impl DocumentMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = Utc::now().timestamp();
        Self {
            doc_id,
            last_seq: 0,
            delta_count: 0,
            baseline_size: 0,
            compressed_size: 0,
            compactions: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now().timestamp();
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write sequences (metadata, counters, heads).
    write_lock: Mutex<()>,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA | CF_VERSIONS | CF_HEADS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_DELTAS | CF_VERSION_INDEX | CF_GRAPH_ROWS => {
                // Prefix-scanned by project id.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every (key, value) whose key starts with `prefix`.
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key, value));
        }
        Ok(rows)
    }

    fn delta_key(doc_id: Uuid, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn row_key(project_id: Uuid, kind: u8, id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(17 + id.len());
        key.extend_from_slice(project_id.as_bytes());
        key.push(kind);
        key.extend_from_slice(id.as_bytes());
        key
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, doc_id: Uuid) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every project with a stored log.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Ok(bytes) = <[u8; 16]>::try_from(key.as_ref()) {
                doc_ids.push(Uuid::from_bytes(bytes));
            }
        }
        Ok(doc_ids)
    }

    fn next_version_seq(&self) -> Result<u64, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let current = match self.db.get_cf(&cf, VERSION_SEQ_KEY)? {
            Some(bytes) => {
                let buf: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Deserialization("bad version counter".into()))?;
                u64::from_be_bytes(buf)
            }
            None => 0,
        };
        Ok(current + 1)
    }

    fn index_entry_for(&self, project_id: Uuid, version_id: Uuid) -> Result<Option<Box<[u8]>>, StoreError> {
        let rows = self.scan_prefix(CF_VERSION_INDEX, project_id.as_bytes())?;
        Ok(rows
            .into_iter()
            .map(|(key, _)| key)
            .find(|key| key.len() == 40 && &key[24..40] == version_id.as_bytes()))
    }
}

impl UpdateLog for DocumentStore {
    fn append_update(&self, doc_id: Uuid, update: &[u8]) -> Result<u64, StoreError> {
        let _guard = self.lock();
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self
            .load_metadata(doc_id)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id));
        meta.last_seq += 1;
        meta.delta_count += 1;
        meta.touch();

        let compressed = lz4_flex::compress_prepend_size(update);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_deltas, Self::delta_key(doc_id, meta.last_seq), &compressed);
        batch.put_cf(&cf_meta, doc_id.as_bytes(), &meta.encode()?);
        self.write(batch)?;

        Ok(meta.last_seq)
    }

    fn load_log(&self, doc_id: Uuid) -> Result<StoredLog, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let baseline = match self.db.get_cf(&cf_docs, doc_id.as_bytes())? {
            Some(compressed) => Some(
                lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?,
            ),
            None => None,
        };

        let mut deltas = Vec::new();
        for (key, value) in self.scan_prefix(CF_DELTAS, doc_id.as_bytes())? {
            let Ok(seq_bytes) = <[u8; 8]>::try_from(&key[16..]) else {
                continue;
            };
            let seq = u64::from_be_bytes(seq_bytes);
            match lz4_flex::decompress_size_prepended(&value) {
                Ok(delta) => deltas.push((seq, delta)),
                Err(e) => log::warn!("Skipping corrupt delta {seq} of {doc_id}: {e}"),
            }
        }

        Ok(StoredLog { baseline, deltas })
    }

    fn last_sequence(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        Ok(self.load_metadata(doc_id)?.map_or(0, |m| m.last_seq))
    }

    fn compact(&self, doc_id: Uuid, baseline: &[u8], up_to: u64) -> Result<u64, StoreError> {
        let _guard = self.lock();
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(baseline);
        let mut meta = self
            .load_metadata(doc_id)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id));

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, doc_id.as_bytes(), &compressed);

        let mut removed = 0u64;
        for (key, _) in self.scan_prefix(CF_DELTAS, doc_id.as_bytes())? {
            let Ok(seq_bytes) = <[u8; 8]>::try_from(&key[16..]) else {
                continue;
            };
            if u64::from_be_bytes(seq_bytes) > up_to {
                break;
            }
            batch.delete_cf(&cf_deltas, &key);
            removed += 1;
        }

        meta.delta_count = meta.delta_count.saturating_sub(removed);
        meta.baseline_size = baseline.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.compactions += 1;
        meta.touch();
        batch.put_cf(&cf_meta, doc_id.as_bytes(), &meta.encode()?);

        // Baseline and deletions land together or not at all.
        self.write(batch)?;
        Ok(removed)
    }
}

impl VersionStore for DocumentStore {
    fn commit_head(&self, version: &TemporalState, graph: &Graph) -> Result<(), StoreError> {
        let _guard = self.lock();
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_index = self.cf(CF_VERSION_INDEX)?;
        let cf_heads = self.cf(CF_HEADS)?;
        let cf_rows = self.cf(CF_GRAPH_ROWS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let project = version.project_id;

        let seq = self.next_version_seq()?;
        let mut index_key = Vec::with_capacity(40);
        index_key.extend_from_slice(project.as_bytes());
        index_key.extend_from_slice(&seq.to_be_bytes());
        index_key.extend_from_slice(version.id.as_bytes());

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_versions, version.id.as_bytes(), serde_json::to_vec(version)?);
        batch.put_cf(&cf_index, &index_key, []);
        batch.put_cf(&cf_heads, project.as_bytes(), version.id.as_bytes());
        batch.put_cf(&cf_meta, VERSION_SEQ_KEY, seq.to_be_bytes());

        for (key, _) in self.scan_prefix(CF_GRAPH_ROWS, project.as_bytes())? {
            batch.delete_cf(&cf_rows, &key);
        }
        for block in &graph.blocks {
            batch.put_cf(&cf_rows, Self::row_key(project, ROW_BLOCK, &block.id), serde_json::to_vec(block)?);
        }
        for link in &graph.links {
            batch.put_cf(&cf_rows, Self::row_key(project, ROW_LINK, &link.id), serde_json::to_vec(link)?);
        }
        for (block_id, text) in &graph.contents {
            batch.put_cf(&cf_rows, Self::row_key(project, ROW_CONTENT, block_id), serde_json::to_vec(text)?);
        }

        self.write(batch)
    }

    fn get_version(&self, version_id: Uuid) -> Result<Option<TemporalState>, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        match self.db.get_cf(&cf, version_id.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn list_versions(&self, project_id: Uuid) -> Result<Vec<TemporalState>, StoreError> {
        let mut versions = Vec::new();
        for (key, _) in self.scan_prefix(CF_VERSION_INDEX, project_id.as_bytes())? {
            let Ok(id_bytes) = <[u8; 16]>::try_from(&key[24..]) else {
                continue;
            };
            match self.get_version(Uuid::from_bytes(id_bytes))? {
                Some(version) => versions.push(version),
                None => log::warn!("Version index of {project_id} points at a missing row"),
            }
        }
        Ok(versions)
    }

    fn update_version(&self, version: &TemporalState) -> Result<(), StoreError> {
        let _guard = self.lock();
        let cf = self.cf(CF_VERSIONS)?;
        if self.db.get_cf(&cf, version.id.as_bytes())?.is_none() {
            return Err(StoreError::NotFound(version.id.to_string()));
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, version.id.as_bytes(), serde_json::to_vec(version)?);
        self.write(batch)
    }

    fn delete_version(&self, project_id: Uuid, version_id: Uuid) -> Result<bool, StoreError> {
        let _guard = self.lock();
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_index = self.cf(CF_VERSION_INDEX)?;

        let index_key = self.index_entry_for(project_id, version_id)?;
        let exists = self.db.get_cf(&cf_versions, version_id.as_bytes())?.is_some();
        if index_key.is_none() && !exists {
            return Ok(false);
        }

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_versions, version_id.as_bytes());
        if let Some(key) = index_key {
            batch.delete_cf(&cf_index, &key);
        }
        self.write(batch)?;
        Ok(true)
    }

    fn head(&self, project_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        let cf = self.cf(CF_HEADS)?;
        match self.db.get_cf(&cf, project_id.as_bytes())? {
            Some(bytes) => {
                let id: [u8; 16] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Deserialization("bad head pointer".into()))?;
                Ok(Some(Uuid::from_bytes(id)))
            }
            None => Ok(None),
        }
    }

    fn load_graph(&self, project_id: Uuid) -> Result<Option<Graph>, StoreError> {
        let rows = self.scan_prefix(CF_GRAPH_ROWS, project_id.as_bytes())?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut blocks = BTreeMap::new();
        let mut links = BTreeMap::new();
        let mut graph = Graph::new();
        for (key, value) in rows {
            if key.len() < 17 {
                continue;
            }
            let id = String::from_utf8_lossy(&key[17..]).into_owned();
            let parsed = match key[16] {
                ROW_BLOCK => serde_json::from_slice::<Block>(&value).map(|b| {
                    blocks.insert(id, b);
                }),
                ROW_LINK => serde_json::from_slice::<Link>(&value).map(|l| {
                    links.insert(id, l);
                }),
                ROW_CONTENT => serde_json::from_slice::<String>(&value).map(|t| {
                    graph.contents.insert(id, t);
                }),
                _ => Ok(()),
            };
            if let Err(e) = parsed {
                log::warn!("Skipping unreadable graph row of {project_id}: {e}");
            }
        }
        graph.blocks = blocks.into_values().collect();
        graph.links = links.into_values().collect();
        Ok(Some(graph))
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::versions::TemporalState;
    use weave_core::{BlockKind, Mutation, Rect};

    fn open(dir: &tempfile::TempDir) -> DocumentStore {
        DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    fn version(project: Uuid, parent: Option<Uuid>, graph: &Graph) -> TemporalState {
        TemporalState {
            id: Uuid::new_v4(),
            project_id: project,
            parent_id: parent,
            author: Uuid::nil(),
            intent: "save".into(),
            mutations: vec![Mutation::ReplaceGraph { graph: graph.clone() }],
            snapshot: true,
            content_hash: graph.content_hash(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_append_and_load_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let doc = Uuid::new_v4();

        assert_eq!(store.append_update(doc, b"one").unwrap(), 1);
        assert_eq!(store.append_update(doc, b"two").unwrap(), 2);
        store.append_update(Uuid::new_v4(), b"other").unwrap();

        let log = store.load_log(doc).unwrap();
        assert!(log.baseline.is_none());
        assert_eq!(log.deltas, vec![(1, b"one".to_vec()), (2, b"two".to_vec())]);
        assert_eq!(store.last_sequence(doc).unwrap(), 2);
    }

    #[test]
    fn test_compact_keeps_later_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let doc = Uuid::new_v4();
        for i in 0..5u8 {
            store.append_update(doc, &[i]).unwrap();
        }

        assert_eq!(store.compact(doc, b"base", 3).unwrap(), 3);
        let log = store.load_log(doc).unwrap();
        assert_eq!(log.baseline.as_deref(), Some(&b"base"[..]));
        assert_eq!(log.deltas.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![4, 5]);

        // Sequence numbers keep growing after compaction.
        assert_eq!(store.append_update(doc, b"x").unwrap(), 6);
        let meta = store.load_metadata(doc).unwrap().unwrap();
        assert_eq!(meta.delta_count, 3);
        assert_eq!(meta.compactions, 1);
    }

    #[test]
    fn test_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Uuid::new_v4();
        {
            let store = open(&dir);
            store.append_update(doc, b"persisted").unwrap();
        }
        let store = open(&dir);
        assert_eq!(store.load_log(doc).unwrap().deltas[0].1, b"persisted".to_vec());
        assert_eq!(store.list_documents().unwrap(), vec![doc]);
    }

    #[test]
    fn test_commit_head_replaces_graph_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let project = Uuid::new_v4();

        let mut first = Graph::new();
        first.blocks.push(Block::new("a", BlockKind::Note, Rect::new(800.0, 0.0, 10.0, 10.0), Uuid::nil()));
        first.contents.insert("a".into(), "hello".into());
        let v1 = version(project, None, &first);
        store.commit_head(&v1, &first).unwrap();
        assert_eq!(store.head(project).unwrap(), Some(v1.id));
        assert_eq!(store.load_graph(project).unwrap().unwrap(), first);

        let mut second = Graph::new();
        second.blocks.push(Block::new("b", BlockKind::Note, Rect::new(900.0, 0.0, 10.0, 10.0), Uuid::nil()));
        second.links.push(Link::new("l", "b", "b"));
        let v2 = version(project, Some(v1.id), &second);
        store.commit_head(&v2, &second).unwrap();

        assert_eq!(store.head(project).unwrap(), Some(v2.id));
        assert_eq!(store.load_graph(project).unwrap().unwrap(), second);
        let listed: Vec<Uuid> = store.list_versions(project).unwrap().iter().map(|v| v.id).collect();
        assert_eq!(listed, vec![v1.id, v2.id]);
    }

    #[test]
    fn test_update_and_delete_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let project = Uuid::new_v4();
        let graph = Graph::new();
        let mut v1 = version(project, None, &graph);
        store.commit_head(&v1, &graph).unwrap();
        let v2 = version(project, Some(v1.id), &graph);
        store.commit_head(&v2, &graph).unwrap();

        v1.intent = "renamed".into();
        store.update_version(&v1).unwrap();
        assert_eq!(store.get_version(v1.id).unwrap().unwrap().intent, "renamed");

        assert!(store.delete_version(project, v1.id).unwrap());
        assert!(!store.delete_version(project, v1.id).unwrap());
        assert!(store.get_version(v1.id).unwrap().is_none());
        assert_eq!(store.list_versions(project).unwrap().len(), 1);

        let ghost = version(project, None, &graph);
        assert!(matches!(store.update_version(&ghost), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_missing_graph_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert!(store.load_graph(Uuid::new_v4()).unwrap().is_none());
        assert!(store.head(Uuid::new_v4()).unwrap().is_none());
    }
}
