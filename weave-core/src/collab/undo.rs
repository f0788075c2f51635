//! Per-client undo history.
//!
//! Only transactions tagged with this client's local origin are captured.
//! Remote merges, guard corrections and restores never enter the stacks, so
//! undoing never reverts a peer's work.

use yrs::{Doc, Origin, UndoManager};

use super::CanvasMaps;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryState {
    pub can_undo: bool,
    pub can_redo: bool,
}

pub struct UndoHistory {
    manager: UndoManager,
    doc: Doc,
    scope: CanvasMaps,
    origin: Origin,
}

impl UndoHistory {
    pub fn new(doc: &Doc, scope: &CanvasMaps, origin: Origin) -> Self {
        Self {
            manager: Self::build(doc, scope, &origin),
            doc: doc.clone(),
            scope: scope.clone(),
            origin,
        }
    }

    fn build(doc: &Doc, scope: &CanvasMaps, origin: &Origin) -> UndoManager {
        let mut manager = UndoManager::new(doc, &scope.blocks);
        manager.expand_scope(&scope.links);
        manager.expand_scope(&scope.contents);
        manager.include_origin(origin.clone());
        manager
    }

    pub fn undo(&mut self) -> bool {
        self.manager.undo_blocking()
    }

    pub fn redo(&mut self) -> bool {
        self.manager.redo_blocking()
    }

    pub fn can_undo(&self) -> bool {
        self.manager.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.manager.can_redo()
    }

    /// Close the current capture group so the next commit becomes its own
    /// undo step.
    pub fn seal(&mut self) {
        self.manager.reset();
    }

    /// Drop both stacks and start tracking from the current state.
    pub fn discard(&mut self) {
        self.manager = Self::build(&self.doc, &self.scope, &self.origin);
    }

    pub fn state(&self) -> HistoryState {
        HistoryState {
            can_undo: self.can_undo(),
            can_redo: self.can_redo(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::collab::CanvasStore;
    use crate::{Block, BlockKind, Rect};
    use uuid::Uuid;

    fn note(id: &str, x: f64) -> Block {
        Block::new(id, BlockKind::Note, Rect::new(x, 0.0, 200.0, 120.0), Uuid::nil())
    }

    #[test]
    fn test_undo_redo_local_commit() {
        let mut store = CanvasStore::with_client_id(1);
        store.seed_core().unwrap();
        assert!(!store.can_undo());

        store.apply_local_change(|d| d.upsert_block(note("a", 800.0))).unwrap();
        assert!(store.can_undo());

        let update = store.undo().unwrap();
        assert!(update.is_some());
        assert!(store.block("a").is_none());
        assert!(store.can_redo());

        store.redo().unwrap();
        assert!(store.block("a").is_some());
    }

    #[test]
    fn test_each_commit_is_one_step() {
        let mut store = CanvasStore::with_client_id(1);
        store.seed_core().unwrap();
        store.apply_local_change(|d| d.upsert_block(note("a", 800.0))).unwrap();
        store.apply_local_change(|d| d.upsert_block(note("b", 1100.0))).unwrap();

        store.undo().unwrap();
        assert!(store.block("a").is_some());
        assert!(store.block("b").is_none());
    }

    #[test]
    fn test_undo_ignores_peer_edits() {
        let mut alice = CanvasStore::with_client_id(1);
        let mut bob = CanvasStore::with_client_id(2);
        let seed = alice.seed_core().unwrap().unwrap();
        bob.apply_remote_update(&seed).unwrap();

        let from_alice = alice
            .apply_local_change(|d| d.upsert_block(note("a", 800.0)))
            .unwrap()
            .unwrap();
        let from_bob = bob
            .apply_local_change(|d| d.upsert_block(note("b", 1100.0)))
            .unwrap()
            .unwrap();
        alice.apply_remote_update(&from_bob).unwrap();
        bob.apply_remote_update(&from_alice).unwrap();

        let replay = alice.undo().unwrap().unwrap();
        assert!(alice.block("a").is_none());
        assert!(alice.block("b").is_some());

        // The replay travels like any other update.
        bob.apply_remote_update(&replay).unwrap();
        assert_eq!(alice.graph(), bob.graph());

        // Nothing left for alice: bob's block is not hers to undo.
        assert!(!alice.can_undo());
    }

    #[test]
    fn test_history_events_fire_on_transitions() {
        let mut store = CanvasStore::with_client_id(1);
        store.seed_core().unwrap();
        let events = store.subscribe_history();

        store.apply_local_change(|d| d.upsert_block(note("a", 800.0))).unwrap();
        let state = events.try_recv().unwrap();
        assert!(state.can_undo);
        assert!(!state.can_redo);

        // No transition, no event.
        store.apply_local_change(|d| d.upsert_block(note("b", 1100.0))).unwrap();
        assert!(events.try_recv().is_err());

        store.discard_history();
        let cleared = events.try_recv().unwrap();
        assert!(!cleared.can_undo);
    }

    #[test]
    fn test_text_edit_is_undoable() {
        let mut store = CanvasStore::with_client_id(1);
        store.seed_core().unwrap();
        store.apply_local_change(|d| d.upsert_block(note("a", 800.0))).unwrap();
        store.insert_text("a", 0, "draft").unwrap();
        assert_eq!(store.text("a").unwrap(), "draft");

        store.undo().unwrap();
        assert_eq!(store.text("a").unwrap_or_default(), "");
        assert!(store.block("a").is_some());
    }
}
