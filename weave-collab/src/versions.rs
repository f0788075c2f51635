//! Named, immutable snapshots of a project's graph.
//!
//! Every version records its parent (the head when it was created) and a
//! list of mutations. Versions written today carry a single `ReplaceGraph`
//! and are therefore self-sufficient snapshots, but reconstruction still
//! walks the parent chain and stops at the first snapshot it meets.
//!
//! History is append-only: restoring creates a new head rather than moving
//! the pointer back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;
use weave_core::{Graph, Mutation};

use crate::registry::{DocumentRegistry, RegistryError};
use crate::storage::{StoreError, Storage, VersionStore};

/// Longest parent chain followed by [`VersionService::reconstruct`].
pub const MAX_RECONSTRUCT_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalState {
    pub id: Uuid,
    pub project_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub author: Uuid,
    pub intent: String,
    pub mutations: Vec<Mutation>,
    /// The mutation list rebuilds the graph without any ancestor.
    pub snapshot: bool,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl TemporalState {
    fn full(project_id: Uuid, parent_id: Option<Uuid>, author: Uuid, intent: String, graph: Graph) -> Self {
        let content_hash = graph.content_hash();
        let mutations = vec![Mutation::ReplaceGraph { graph }];
        Self {
            id: Uuid::new_v4(),
            project_id,
            parent_id,
            author,
            intent,
            snapshot: mutations.iter().any(Mutation::is_self_sufficient),
            mutations,
            content_hash,
            created_at: Utc::now(),
        }
    }
}

/// One row of a project's history listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub intent: String,
    pub author: Uuid,
    pub created_at: DateTime<Utc>,
    pub content_hash: String,
    pub is_head: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Created(Uuid),
    /// The graph matches the head; nothing was written.
    Unchanged(Uuid),
}

impl SaveOutcome {
    pub fn version_id(&self) -> Uuid {
        match self {
            SaveOutcome::Created(id) | SaveOutcome::Unchanged(id) => *id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("version {0} not found")]
    NotFound(Uuid),
    #[error("version chain of {0} is deeper than the reconstruction limit")]
    ReconstructionDepthExceeded(Uuid),
    #[error("version conflict: {0}")]
    VersionConflict(String),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("live document error: {0}")]
    Live(#[from] RegistryError),
}

pub struct VersionService {
    store: Arc<dyn Storage>,
    registry: Option<Arc<DocumentRegistry>>,
    max_depth: usize,
    /// Serializes head changes.
    write_lock: tokio::sync::Mutex<()>,
}

impl VersionService {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self {
            store,
            registry: None,
            max_depth: MAX_RECONSTRUCT_DEPTH,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Restores are also pushed into the live documents of `registry`.
    pub fn with_registry(mut self, registry: Arc<DocumentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// Record `graph` as the project's new head, unless it equals the head.
    pub async fn save(
        &self,
        project_id: Uuid,
        author: Uuid,
        graph: &Graph,
        intent: impl Into<String>,
    ) -> Result<SaveOutcome, VersionError> {
        let _guard = self.write_lock.lock().await;
        let hash = graph.content_hash();
        let head = self.store.head(project_id)?;

        if let Some(head_id) = head {
            if let Some(head_version) = self.store.get_version(head_id)? {
                if head_version.content_hash == hash {
                    log::debug!("Save of {project_id} skipped, head {head_id} is identical");
                    return Ok(SaveOutcome::Unchanged(head_id));
                }
            }
        }

        let version = TemporalState::full(project_id, head, author, intent.into(), graph.clone());
        self.store.commit_head(&version, graph)?;
        log::info!("Saved version {} of {project_id} ({:?})", version.id, version.intent);
        Ok(SaveOutcome::Created(version.id))
    }

    /// Rebuild the graph of `version_id`.
    pub fn reconstruct(&self, version_id: Uuid) -> Result<Graph, VersionError> {
        let target = self
            .store
            .get_version(version_id)?
            .ok_or(VersionError::NotFound(version_id))?;
        self.reconstruct_from(target)
    }

    fn reconstruct_from(&self, target: TemporalState) -> Result<Graph, VersionError> {
        let target_id = target.id;
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        let mut current = target;

        loop {
            if chain.len() >= self.max_depth || !seen.insert(current.id) {
                return Err(VersionError::ReconstructionDepthExceeded(target_id));
            }
            let parent_id = current.parent_id;
            let stop = current.snapshot;
            chain.push(current);
            if stop {
                break;
            }
            let Some(parent_id) = parent_id else {
                break;
            };
            match self.store.get_version(parent_id)? {
                Some(parent) => current = parent,
                None => {
                    log::warn!("Version chain of {target_id} is broken at {parent_id}");
                    break;
                }
            }
        }

        let mut graph = Graph::new();
        for version in chain.iter().rev() {
            graph.apply_all(&version.mutations);
        }
        Ok(graph)
    }

    /// Make `version_id` the content of a new head and push it into the live
    /// document. Returns the new head's id.
    pub async fn restore(&self, project_id: Uuid, version_id: Uuid, author: Uuid) -> Result<Uuid, VersionError> {
        let (new_id, graph) = {
            let _guard = self.write_lock.lock().await;
            let target = self
                .store
                .get_version(version_id)?
                .filter(|v| v.project_id == project_id)
                .ok_or(VersionError::NotFound(version_id))?;
            let intent = format!("Restored from \"{}\"", target.intent);
            let graph = self.reconstruct_from(target)?;

            let head = self.store.head(project_id)?;
            let version = TemporalState::full(project_id, head, author, intent, graph.clone());
            self.store.commit_head(&version, &graph)?;
            log::info!("Restored {version_id} of {project_id} as {}", version.id);
            (version.id, graph)
        };

        if let Some(registry) = &self.registry {
            registry.replace_graph(project_id, &graph).await?;
        }
        Ok(new_id)
    }

    pub async fn rename(&self, version_id: Uuid, intent: impl Into<String>) -> Result<(), VersionError> {
        let _guard = self.write_lock.lock().await;
        let mut version = self
            .store
            .get_version(version_id)?
            .ok_or(VersionError::NotFound(version_id))?;
        version.intent = intent.into();
        self.store.update_version(&version)?;
        Ok(())
    }

    /// Delete a version. The head cannot be deleted.
    pub async fn delete(&self, version_id: Uuid) -> Result<(), VersionError> {
        let _guard = self.write_lock.lock().await;
        let version = self
            .store
            .get_version(version_id)?
            .ok_or(VersionError::NotFound(version_id))?;
        if self.store.head(version.project_id)? == Some(version_id) {
            return Err(VersionError::VersionConflict(format!(
                "{version_id} is the current head of {}",
                version.project_id
            )));
        }
        self.store.delete_version(version.project_id, version_id)?;
        log::info!("Deleted version {version_id} of {}", version.project_id);
        Ok(())
    }

    /// All versions of a project in creation order.
    pub fn history(&self, project_id: Uuid) -> Result<Vec<VersionSummary>, VersionError> {
        let head = self.store.head(project_id)?;
        Ok(self
            .store
            .list_versions(project_id)?
            .into_iter()
            .map(|v| VersionSummary {
                is_head: Some(v.id) == head,
                id: v.id,
                parent_id: v.parent_id,
                intent: v.intent,
                author: v.author,
                created_at: v.created_at,
                content_hash: v.content_hash,
            })
            .collect())
    }

    pub fn get(&self, version_id: Uuid) -> Result<TemporalState, VersionError> {
        self.store
            .get_version(version_id)?
            .ok_or(VersionError::NotFound(version_id))
    }

    pub fn head(&self, project_id: Uuid) -> Result<Option<Uuid>, VersionError> {
        Ok(self.store.head(project_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, VersionStore};
    use weave_core::{Block, BlockKind, Rect};

    fn graph_with(id: &str, x: f64) -> Graph {
        let mut graph = Graph::new();
        graph
            .blocks
            .push(Block::new(id, BlockKind::Note, Rect::new(x, 0.0, 100.0, 50.0), Uuid::nil()));
        graph.contents.insert(id.to_string(), format!("body of {id}"));
        graph
    }

    fn service() -> (Arc<MemoryStore>, VersionService) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), VersionService::new(store))
    }

    #[tokio::test]
    async fn test_double_save_is_unchanged() {
        let (_, versions) = service();
        let project = Uuid::new_v4();
        let graph = graph_with("b1", 800.0);

        let first = versions.save(project, Uuid::nil(), &graph, "first").await.unwrap();
        let second = versions.save(project, Uuid::nil(), &graph, "again").await.unwrap();
        assert!(matches!(first, SaveOutcome::Created(_)));
        assert_eq!(second, SaveOutcome::Unchanged(first.version_id()));
        assert_eq!(versions.history(project).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_ignores_sub_unit_jitter() {
        let (_, versions) = service();
        let project = Uuid::new_v4();
        let first = versions.save(project, Uuid::nil(), &graph_with("b1", 800.0), "a").await.unwrap();
        let jittered = versions.save(project, Uuid::nil(), &graph_with("b1", 800.2), "b").await.unwrap();
        assert_eq!(jittered, SaveOutcome::Unchanged(first.version_id()));
    }

    #[tokio::test]
    async fn test_save_links_parent_and_replaces_rows() {
        let (store, versions) = service();
        let project = Uuid::new_v4();
        let v1 = versions.save(project, Uuid::nil(), &graph_with("a", 800.0), "one").await.unwrap();
        let v2 = versions.save(project, Uuid::nil(), &graph_with("b", 900.0), "two").await.unwrap();

        let row = versions.get(v2.version_id()).unwrap();
        assert_eq!(row.parent_id, Some(v1.version_id()));
        assert!(row.snapshot);
        assert_eq!(versions.head(project).unwrap(), Some(v2.version_id()));
        assert_eq!(store.load_graph(project).unwrap(), Some(graph_with("b", 900.0)));
    }

    #[tokio::test]
    async fn test_reconstruct_is_idempotent() {
        let (_, versions) = service();
        let project = Uuid::new_v4();
        let v = versions.save(project, Uuid::nil(), &graph_with("a", 800.0), "one").await.unwrap();

        let first = serde_json::to_vec(&versions.reconstruct(v.version_id()).unwrap()).unwrap();
        let second = serde_json::to_vec(&versions.reconstruct(v.version_id()).unwrap()).unwrap();
        assert_eq!(first, second);
        assert!(matches!(
            versions.reconstruct(Uuid::new_v4()),
            Err(VersionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reconstruct_walks_partial_versions() {
        let (store, versions) = service();
        let project = Uuid::new_v4();
        let base = versions.save(project, Uuid::nil(), &graph_with("a", 800.0), "base").await.unwrap();

        let partial = TemporalState {
            id: Uuid::new_v4(),
            project_id: project,
            parent_id: Some(base.version_id()),
            author: Uuid::nil(),
            intent: "moved".into(),
            mutations: vec![Mutation::SetContent {
                block_id: "a".into(),
                text: "edited".into(),
            }],
            snapshot: false,
            content_hash: String::new(),
            created_at: Utc::now(),
        };
        store.commit_head(&partial, &Graph::new()).unwrap();

        let graph = versions.reconstruct(partial.id).unwrap();
        assert_eq!(graph.block("a").map(|b| b.x), Some(800.0));
        assert_eq!(graph.contents.get("a").map(String::as_str), Some("edited"));
    }

    #[tokio::test]
    async fn test_reconstruct_depth_limit_catches_cycles() {
        let (store, versions) = service();
        let project = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        for (id, parent) in [(a, b), (b, a)] {
            let version = TemporalState {
                id,
                project_id: project,
                parent_id: Some(parent),
                author: Uuid::nil(),
                intent: "loop".into(),
                mutations: Vec::new(),
                snapshot: false,
                content_hash: String::new(),
                created_at: Utc::now(),
            };
            store.commit_head(&version, &Graph::new()).unwrap();
        }

        assert!(matches!(
            versions.reconstruct(a),
            Err(VersionError::ReconstructionDepthExceeded(id)) if id == a
        ));
    }

    #[tokio::test]
    async fn test_restore_creates_new_head() {
        let (store, versions) = service();
        let project = Uuid::new_v4();
        let author = Uuid::new_v4();
        let v1 = versions.save(project, author, &graph_with("a", 800.0), "first draft").await.unwrap();
        versions.save(project, author, &graph_with("b", 900.0), "second").await.unwrap();

        let restored = versions.restore(project, v1.version_id(), author).await.unwrap();
        assert_ne!(restored, v1.version_id());
        assert_eq!(versions.head(project).unwrap(), Some(restored));

        let row = versions.get(restored).unwrap();
        assert_eq!(row.intent, "Restored from \"first draft\"");
        assert_eq!(
            versions.reconstruct(restored).unwrap(),
            versions.reconstruct(v1.version_id()).unwrap()
        );
        assert_eq!(store.load_graph(project).unwrap(), Some(graph_with("a", 800.0)));
        // The original stays in history.
        assert_eq!(versions.history(project).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_restore_rejects_foreign_version() {
        let (_, versions) = service();
        let v = versions.save(Uuid::new_v4(), Uuid::nil(), &graph_with("a", 800.0), "x").await.unwrap();
        assert!(matches!(
            versions.restore(Uuid::new_v4(), v.version_id(), Uuid::nil()).await,
            Err(VersionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_head_is_rejected() {
        let (_, versions) = service();
        let project = Uuid::new_v4();
        let v1 = versions.save(project, Uuid::nil(), &graph_with("a", 800.0), "one").await.unwrap();
        let v2 = versions.save(project, Uuid::nil(), &graph_with("b", 800.0), "two").await.unwrap();
        let v3 = versions.save(project, Uuid::nil(), &graph_with("c", 800.0), "three").await.unwrap();

        assert!(matches!(
            versions.delete(v3.version_id()).await,
            Err(VersionError::VersionConflict(_))
        ));
        versions.delete(v2.version_id()).await.unwrap();

        let remaining: Vec<Uuid> = versions.history(project).unwrap().iter().map(|v| v.id).collect();
        assert_eq!(remaining, vec![v1.version_id(), v3.version_id()]);
        assert!(matches!(versions.delete(v2.version_id()).await, Err(VersionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rename_and_head_marker() {
        let (_, versions) = service();
        let project = Uuid::new_v4();
        let v1 = versions.save(project, Uuid::nil(), &graph_with("a", 800.0), "one").await.unwrap();
        let v2 = versions.save(project, Uuid::nil(), &graph_with("b", 800.0), "two").await.unwrap();

        versions.rename(v1.version_id(), "renamed").await.unwrap();
        let history = versions.history(project).unwrap();
        assert_eq!(history[0].intent, "renamed");
        assert!(!history[0].is_head);
        assert!(history[1].is_head);
        assert_eq!(history[1].id, v2.version_id());
    }
}
