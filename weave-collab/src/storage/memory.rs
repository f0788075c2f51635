//! In-process store. Same contract as [`super::DocumentStore`], nothing
//! survives the process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;
use weave_core::Graph;

use super::{StoreError, StoredLog, UpdateLog, VersionStore};
use crate::versions::TemporalState;

#[derive(Default)]
struct LogState {
    baseline: Option<Vec<u8>>,
    deltas: BTreeMap<u64, Vec<u8>>,
    last_seq: u64,
}

#[derive(Default)]
struct VersionState {
    rows: HashMap<Uuid, TemporalState>,
    /// Project → version ids in creation order.
    order: HashMap<Uuid, Vec<Uuid>>,
    heads: HashMap<Uuid, Uuid>,
    graphs: HashMap<Uuid, Graph>,
}

#[derive(Default)]
pub struct MemoryStore {
    logs: RwLock<HashMap<Uuid, LogState>>,
    versions: RwLock<VersionState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed current-graph rows without creating a version.
    pub fn put_graph(&self, project_id: Uuid, graph: Graph) {
        self.versions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .graphs
            .insert(project_id, graph);
    }

    pub fn delta_count(&self, doc_id: Uuid) -> usize {
        self.logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&doc_id)
            .map_or(0, |log| log.deltas.len())
    }
}

impl UpdateLog for MemoryStore {
    fn append_update(&self, doc_id: Uuid, update: &[u8]) -> Result<u64, StoreError> {
        let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        let log = logs.entry(doc_id).or_default();
        log.last_seq += 1;
        log.deltas.insert(log.last_seq, update.to_vec());
        Ok(log.last_seq)
    }

    fn load_log(&self, doc_id: Uuid) -> Result<StoredLog, StoreError> {
        let logs = self.logs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(logs
            .get(&doc_id)
            .map(|log| StoredLog {
                baseline: log.baseline.clone(),
                deltas: log.deltas.iter().map(|(s, d)| (*s, d.clone())).collect(),
            })
            .unwrap_or_default())
    }

    fn last_sequence(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        let logs = self.logs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(logs.get(&doc_id).map_or(0, |log| log.last_seq))
    }

    fn compact(&self, doc_id: Uuid, baseline: &[u8], up_to: u64) -> Result<u64, StoreError> {
        let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        let log = logs.entry(doc_id).or_default();
        log.baseline = Some(baseline.to_vec());
        let kept = log.deltas.split_off(&(up_to + 1));
        let removed = log.deltas.len() as u64;
        log.deltas = kept;
        Ok(removed)
    }
}

impl VersionStore for MemoryStore {
    fn commit_head(&self, version: &TemporalState, graph: &Graph) -> Result<(), StoreError> {
        let mut state = self.versions.write().unwrap_or_else(PoisonError::into_inner);
        let project = version.project_id;
        state.rows.insert(version.id, version.clone());
        state.order.entry(project).or_default().push(version.id);
        state.heads.insert(project, version.id);
        state.graphs.insert(project, graph.clone());
        Ok(())
    }

    fn get_version(&self, version_id: Uuid) -> Result<Option<TemporalState>, StoreError> {
        let state = self.versions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.rows.get(&version_id).cloned())
    }

    fn list_versions(&self, project_id: Uuid) -> Result<Vec<TemporalState>, StoreError> {
        let state = self.versions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .order
            .get(&project_id)
            .map(|ids| ids.iter().filter_map(|id| state.rows.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    fn update_version(&self, version: &TemporalState) -> Result<(), StoreError> {
        let mut state = self.versions.write().unwrap_or_else(PoisonError::into_inner);
        match state.rows.get_mut(&version.id) {
            Some(row) => {
                *row = version.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(version.id.to_string())),
        }
    }

    fn delete_version(&self, project_id: Uuid, version_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.versions.write().unwrap_or_else(PoisonError::into_inner);
        let removed = state.rows.remove(&version_id).is_some();
        if let Some(ids) = state.order.get_mut(&project_id) {
            ids.retain(|id| *id != version_id);
        }
        Ok(removed)
    }

    fn head(&self, project_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        let state = self.versions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.heads.get(&project_id).copied())
    }

    fn load_graph(&self, project_id: Uuid) -> Result<Option<Graph>, StoreError> {
        let state = self.versions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.graphs.get(&project_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_splits_at_sequence() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        for i in 0..4u8 {
            store.append_update(doc, &[i]).unwrap();
        }
        assert_eq!(store.compact(doc, b"base", 2).unwrap(), 2);

        let log = store.load_log(doc).unwrap();
        assert_eq!(log.baseline, Some(b"base".to_vec()));
        assert_eq!(log.deltas, vec![(3, vec![2]), (4, vec![3])]);
        assert_eq!(store.append_update(doc, b"x").unwrap(), 5);
    }

    #[test]
    fn test_unknown_document_is_empty() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        assert!(store.load_log(doc).unwrap().is_empty());
        assert_eq!(store.last_sequence(doc).unwrap(), 0);
        assert!(store.load_graph(doc).unwrap().is_none());
    }
}
