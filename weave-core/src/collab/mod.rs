use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, GetString, Map, MapRef, Origin, Out, ReadTxn, StateVector, Text, TextPrelim, TextRef,
    Transact, TransactionMut, Update,
};

use crate::events::Emitter;
use crate::layout::CoreZone;
use crate::{Block, BlockKind, Graph, Link, CORE_BLOCK_ID};

pub mod undo;

use undo::{HistoryState, UndoHistory};

pub const BLOCKS_MAP: &str = "blocks";
pub const LINKS_MAP: &str = "links";
pub const CONTENTS_MAP: &str = "contents";

pub const REMOTE_ORIGIN: &str = "weave:remote";
pub const GUARD_ORIGIN: &str = "weave:guard";
pub const RESTORE_ORIGIN: &str = "weave:restore";

#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("failed to decode update: {0}")]
    Decode(#[from] yrs::encoding::read::Error),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unknown block: {0}")]
    UnknownBlock(String),
}

/// Where a transaction came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Committed by this client through `apply_local_change` or a text edit.
    Local,
    /// Integrated from a peer.
    Remote,
    /// Produced by undo or redo.
    Replay,
    /// Core-block correction committed after a remote update.
    Guard,
    /// Wholesale replacement of the document.
    Restore,
}

/// Keys touched by one transaction, per collection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub blocks: BTreeSet<String>,
    pub links: BTreeSet<String>,
    pub contents: BTreeSet<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.links.is_empty() && self.contents.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    pub origin: ChangeOrigin,
    pub changes: ChangeSet,
}

/// Raw string view of the three collections, used to compute change sets.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct RawState {
    blocks: HashMap<String, String>,
    links: HashMap<String, String>,
    contents: HashMap<String, String>,
}

impl RawState {
    fn diff(&self, after: &RawState) -> ChangeSet {
        ChangeSet {
            blocks: diff_keys(&self.blocks, &after.blocks),
            links: diff_keys(&self.links, &after.links),
            contents: diff_keys(&self.contents, &after.contents),
        }
    }
}

fn diff_keys(before: &HashMap<String, String>, after: &HashMap<String, String>) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    for (key, value) in before {
        if after.get(key) != Some(value) {
            keys.insert(key.clone());
        }
    }
    for key in after.keys() {
        if !before.contains_key(key) {
            keys.insert(key.clone());
        }
    }
    keys
}

fn decode_record<R: serde::de::DeserializeOwned>(value: Out) -> Option<R> {
    let json = value.cast::<String>().ok()?;
    serde_json::from_str(&json).ok()
}

/// Handles on the three replicated collections of a canvas document.
///
/// Shared by the client-side [`CanvasStore`] and the server, which only holds
/// a bare `Doc`.
#[derive(Clone)]
pub struct CanvasMaps {
    pub blocks: MapRef,
    pub links: MapRef,
    pub contents: MapRef,
}

impl CanvasMaps {
    pub fn new(doc: &Doc) -> Self {
        Self {
            blocks: doc.get_or_insert_map(BLOCKS_MAP),
            links: doc.get_or_insert_map(LINKS_MAP),
            contents: doc.get_or_insert_map(CONTENTS_MAP),
        }
    }

    pub fn block<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<Block> {
        self.blocks.get(txn, id).and_then(decode_record)
    }

    pub fn link<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<Link> {
        self.links.get(txn, id).and_then(decode_record)
    }

    pub fn blocks<T: ReadTxn>(&self, txn: &T) -> BTreeMap<String, Block> {
        self.blocks
            .iter(txn)
            .filter_map(|(id, value)| decode_record(value).map(|b: Block| (id.to_string(), b)))
            .collect()
    }

    pub fn links<T: ReadTxn>(&self, txn: &T) -> BTreeMap<String, Link> {
        self.links
            .iter(txn)
            .filter_map(|(id, value)| decode_record(value).map(|l: Link| (id.to_string(), l)))
            .collect()
    }

    pub fn text_ref<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<TextRef> {
        match self.contents.get(txn, id) {
            Some(Out::YText(text)) => Some(text),
            _ => None,
        }
    }

    pub fn text<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<String> {
        self.text_ref(txn, id).map(|t| t.get_string(txn))
    }

    pub fn is_empty<T: ReadTxn>(&self, txn: &T) -> bool {
        self.blocks.len(txn) == 0 && self.links.len(txn) == 0 && self.contents.len(txn) == 0
    }

    pub fn read_graph<T: ReadTxn>(&self, txn: &T) -> Graph {
        let mut contents = BTreeMap::new();
        for (id, value) in self.contents.iter(txn) {
            if let Out::YText(text) = value {
                contents.insert(id.to_string(), text.get_string(txn));
            }
        }
        Graph {
            blocks: self.blocks(txn).into_values().collect(),
            links: self.links(txn).into_values().collect(),
            contents,
        }
    }

    pub(crate) fn raw<T: ReadTxn>(&self, txn: &T) -> RawState {
        let strings = |map: &MapRef| -> HashMap<String, String> {
            map.iter(txn)
                .filter_map(|(id, value)| value.cast::<String>().ok().map(|s| (id.to_string(), s)))
                .collect()
        };
        let mut contents = HashMap::new();
        for (id, value) in self.contents.iter(txn) {
            if let Out::YText(text) = value {
                contents.insert(id.to_string(), text.get_string(txn));
            }
        }
        RawState {
            blocks: strings(&self.blocks),
            links: strings(&self.links),
            contents,
        }
    }

    pub fn put_block_json(&self, txn: &mut TransactionMut, id: &str, json: String) {
        self.blocks.insert(txn, id.to_string(), json);
    }

    pub fn put_link_json(&self, txn: &mut TransactionMut, id: &str, json: String) {
        self.links.insert(txn, id.to_string(), json);
    }

    /// Remove a block record together with its text body.
    pub fn remove_block(&self, txn: &mut TransactionMut, id: &str) {
        self.blocks.remove(txn, id);
        self.contents.remove(txn, id);
    }

    pub fn remove_link(&self, txn: &mut TransactionMut, id: &str) {
        self.links.remove(txn, id);
    }

    pub fn ensure_text(&self, txn: &mut TransactionMut, id: &str) -> TextRef {
        match self.text_ref(&*txn, id) {
            Some(text) => text,
            None => self.contents.insert(txn, id.to_string(), TextPrelim::new("")),
        }
    }

    /// Overwrite a text body, leaving it untouched when already equal.
    pub fn set_text(&self, txn: &mut TransactionMut, id: &str, value: &str) {
        let text = self.ensure_text(txn, id);
        if text.get_string(&*txn) == value {
            return;
        }
        let len = text.len(&*txn);
        if len > 0 {
            text.remove_range(txn, 0, len);
        }
        if !value.is_empty() {
            text.insert(txn, 0, value);
        }
    }

    /// Make sure the core block exists with its fixed geometry.
    /// Returns whether anything was written.
    pub fn ensure_core(&self, txn: &mut TransactionMut, zone: &CoreZone) -> Result<bool, CollabError> {
        let fixed = match self.block(&*txn, CORE_BLOCK_ID) {
            Some(core) if core.kind == BlockKind::Core && core.rect() == zone.rect => return Ok(false),
            Some(mut core) => {
                core.kind = BlockKind::Core;
                core.set_rect(zone.rect);
                core
            }
            None => Block::core(zone),
        };
        let json = serde_json::to_string(&fixed)?;
        self.put_block_json(txn, CORE_BLOCK_ID, json);
        Ok(true)
    }

    /// Replace the whole canvas with `graph` inside one transaction.
    ///
    /// Only records that differ are rewritten. The core block survives even
    /// when `graph` lacks it, and links targeting it are dropped.
    pub fn replace_graph(
        &self,
        txn: &mut TransactionMut,
        graph: &Graph,
        zone: &CoreZone,
    ) -> Result<(), CollabError> {
        let mut blocks = Vec::with_capacity(graph.blocks.len());
        for block in &graph.blocks {
            if block.id == CORE_BLOCK_ID || block.is_core() {
                continue;
            }
            let mut placed = block.clone();
            placed.set_rect(zone.place(block.rect()));
            let json = serde_json::to_string(&placed)?;
            blocks.push((placed, json));
        }
        let mut links = Vec::with_capacity(graph.links.len());
        for link in &graph.links {
            if link.target == CORE_BLOCK_ID {
                continue;
            }
            links.push((link, serde_json::to_string(link)?));
        }
        let core_json = match graph.block(CORE_BLOCK_ID) {
            Some(core) => {
                let mut core = core.clone();
                core.kind = BlockKind::Core;
                core.set_rect(zone.rect);
                Some(serde_json::to_string(&core)?)
            }
            None => None,
        };

        let keep_blocks: HashSet<String> = blocks.iter().map(|(b, _)| b.id.clone()).collect();
        let keep_links: HashSet<&str> = links.iter().map(|(l, _)| l.id.as_str()).collect();

        let stale_blocks: Vec<String> = self
            .blocks
            .keys(&*txn)
            .filter(|id| *id != CORE_BLOCK_ID && !keep_blocks.contains(*id))
            .map(str::to_string)
            .collect();
        let stale_links: Vec<String> = self
            .links
            .keys(&*txn)
            .filter(|id| !keep_links.contains(id))
            .map(str::to_string)
            .collect();
        let stale_contents: Vec<String> = self
            .contents
            .keys(&*txn)
            .filter(|id| !graph.contents.contains_key(*id))
            .map(str::to_string)
            .collect();

        for id in &stale_links {
            self.remove_link(txn, id);
        }
        for id in &stale_blocks {
            self.remove_block(txn, id);
        }
        for id in &stale_contents {
            self.contents.remove(txn, id);
        }

        for (block, json) in blocks {
            if self.block(&*txn, &block.id).as_ref() != Some(&block) {
                self.put_block_json(txn, &block.id, json);
            }
        }
        for (link, json) in links {
            if self.link(&*txn, &link.id).as_ref() != Some(link) {
                self.put_link_json(txn, &link.id, json);
            }
        }
        if let Some(json) = core_json {
            if self.blocks.get(&*txn, CORE_BLOCK_ID).and_then(|v| v.cast::<String>().ok()) != Some(json.clone()) {
                self.put_block_json(txn, CORE_BLOCK_ID, json);
            }
        }
        self.ensure_core(txn, zone)?;

        for (id, body) in &graph.contents {
            if keep_blocks.contains(id) || id == CORE_BLOCK_ID {
                self.set_text(txn, id, body);
            }
        }
        Ok(())
    }
}

/// Editable copy of the blocks and links collections handed to mutators.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CanvasDraft {
    pub blocks: BTreeMap<String, Block>,
    pub links: BTreeMap<String, Link>,
}

impl CanvasDraft {
    pub fn upsert_block(&mut self, block: Block) {
        self.blocks.insert(block.id.clone(), block);
    }

    pub fn block_mut(&mut self, id: &str) -> Option<&mut Block> {
        self.blocks.get_mut(id)
    }

    /// Move a block. Returns false when it does not exist.
    pub fn move_block(&mut self, id: &str, x: f64, y: f64) -> bool {
        match self.blocks.get_mut(id) {
            Some(block) => {
                block.x = x;
                block.y = y;
                true
            }
            None => false,
        }
    }

    /// Remove a block and every link attached to it.
    pub fn remove_block(&mut self, id: &str) -> Option<Block> {
        let removed = self.blocks.remove(id);
        if removed.is_some() {
            self.links.retain(|_, link| !link.touches(id));
        }
        removed
    }

    pub fn upsert_link(&mut self, link: Link) {
        self.links.insert(link.id.clone(), link);
    }

    pub fn remove_link(&mut self, id: &str) -> Option<Link> {
        self.links.remove(id)
    }
}

#[derive(Default)]
struct CommitPlan {
    blocks: Vec<(String, String)>,
    links: Vec<(String, String)>,
    removed_blocks: Vec<String>,
    removed_links: Vec<String>,
    filtered: usize,
}

impl CommitPlan {
    fn is_empty(&self) -> bool {
        self.blocks.is_empty()
            && self.links.is_empty()
            && self.removed_blocks.is_empty()
            && self.removed_links.is_empty()
    }
}

/// Client-side replica of a canvas document.
///
/// All local writes go through [`CanvasStore::apply_local_change`] or the
/// text helpers and are tagged with this client's origin, so the undo
/// history only ever sees them.
pub struct CanvasStore {
    doc: Doc,
    maps: CanvasMaps,
    zone: CoreZone,
    local_origin: Origin,
    history: UndoHistory,
    last_history: HistoryState,
    changes: Emitter<ChangeEvent>,
    remote_changes: Emitter<ChangeEvent>,
    history_events: Emitter<HistoryState>,
}

impl CanvasStore {
    pub fn new() -> Self {
        Self::with_doc(Doc::new(), CoreZone::default())
    }

    /// Deterministic client id, handy for tests and replay tooling.
    pub fn with_client_id(client_id: u64) -> Self {
        Self::with_doc(Doc::with_client_id(client_id), CoreZone::default())
    }

    pub fn with_doc(doc: Doc, zone: CoreZone) -> Self {
        let maps = CanvasMaps::new(&doc);
        let local_origin = Origin::from(format!("weave:local:{}", doc.client_id()).as_str());
        let history = UndoHistory::new(&doc, &maps, local_origin.clone());
        Self {
            doc,
            maps,
            zone,
            local_origin,
            history,
            last_history: HistoryState::default(),
            changes: Emitter::new(),
            remote_changes: Emitter::new(),
            history_events: Emitter::new(),
        }
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn zone(&self) -> &CoreZone {
        &self.zone
    }

    // ─── Observation ──────────────────────────────────────────────────

    /// Every committed change, whatever its origin.
    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Changes that did not originate from a local edit: peer updates,
    /// undo/redo replays, guard corrections and restores.
    pub fn observe_remote_changes(&self) -> std::sync::mpsc::Receiver<ChangeEvent> {
        self.remote_changes.subscribe()
    }

    pub fn subscribe_history(&self) -> std::sync::mpsc::Receiver<HistoryState> {
        self.history_events.subscribe()
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn graph(&self) -> Graph {
        let txn = self.doc.transact();
        self.maps.read_graph(&txn)
    }

    pub fn block(&self, id: &str) -> Option<Block> {
        let txn = self.doc.transact();
        self.maps.block(&txn, id)
    }

    pub fn link(&self, id: &str) -> Option<Link> {
        let txn = self.doc.transact();
        self.maps.link(&txn, id)
    }

    pub fn block_count(&self) -> u32 {
        let txn = self.doc.transact();
        self.maps.blocks.len(&txn)
    }

    pub fn text(&self, block_id: &str) -> Option<String> {
        let txn = self.doc.transact();
        self.maps.text(&txn, block_id)
    }

    fn draft(&self) -> CanvasDraft {
        let txn = self.doc.transact();
        CanvasDraft {
            blocks: self.maps.blocks(&txn),
            links: self.maps.links(&txn),
        }
    }

    fn raw(&self) -> RawState {
        let txn = self.doc.transact();
        self.maps.raw(&txn)
    }

    // ─── Local writes ─────────────────────────────────────────────────

    /// Seed the core block if missing. Not recorded in the undo history.
    pub fn seed_core(&mut self) -> Result<Option<Vec<u8>>, CollabError> {
        let before = self.raw();
        let update = {
            let mut txn = self.doc.transact_mut_with(Origin::from(GUARD_ORIGIN));
            if !self.maps.ensure_core(&mut txn, &self.zone)? {
                return Ok(None);
            }
            txn.encode_update_v1()
        };
        self.finish(ChangeOrigin::Guard, before);
        Ok(Some(update))
    }

    /// Run `mutator` over a draft of the current collections and commit the
    /// surviving differences as one local transaction.
    ///
    /// Returns the update to broadcast, or `None` when nothing changed.
    pub fn apply_local_change<F>(&mut self, mutator: F) -> Result<Option<Vec<u8>>, CollabError>
    where
        F: FnOnce(&mut CanvasDraft),
    {
        let current = self.draft();
        let mut draft = current.clone();
        mutator(&mut draft);

        let plan = self.plan_commit(&current, draft)?;
        if plan.filtered > 0 {
            log::debug!("Dropped {} edit(s) violating canvas invariants", plan.filtered);
        }
        if plan.is_empty() {
            return Ok(None);
        }

        let before = self.raw();
        let update = {
            let mut txn = self.doc.transact_mut_with(self.local_origin.clone());
            for id in &plan.removed_links {
                self.maps.remove_link(&mut txn, id);
            }
            for id in &plan.removed_blocks {
                self.maps.remove_block(&mut txn, id);
            }
            for (id, json) in plan.blocks {
                self.maps.put_block_json(&mut txn, &id, json);
            }
            for (id, json) in plan.links {
                self.maps.put_link_json(&mut txn, &id, json);
            }
            txn.encode_update_v1()
        };
        self.history.seal();
        self.finish(ChangeOrigin::Local, before);
        Ok(Some(update))
    }

    fn plan_commit(&self, current: &CanvasDraft, draft: CanvasDraft) -> Result<CommitPlan, CollabError> {
        let mut plan = CommitPlan::default();

        for (id, block) in &current.blocks {
            if draft.blocks.contains_key(id) {
                continue;
            }
            if block.is_core() || id == CORE_BLOCK_ID {
                plan.filtered += 1;
                continue;
            }
            plan.removed_blocks.push(id.clone());
        }

        for (id, mut block) in draft.blocks {
            block.id = id.clone();
            let previous = current.blocks.get(&id);
            match previous {
                Some(prev) if prev.is_core() || id == CORE_BLOCK_ID => {
                    // Metadata on the core may change; geometry and kind may not.
                    if block.rect() != self.zone.rect || !block.is_core() {
                        plan.filtered += 1;
                    }
                    block.kind = BlockKind::Core;
                    block.set_rect(self.zone.rect);
                    if &block != prev {
                        plan.blocks.push((id, serde_json::to_string(&block)?));
                    }
                }
                _ => {
                    if block.is_core() || id == CORE_BLOCK_ID {
                        plan.filtered += 1;
                        continue;
                    }
                    let placed = self.zone.place(block.rect());
                    block.set_rect(placed);
                    if previous != Some(&block) {
                        plan.blocks.push((id, serde_json::to_string(&block)?));
                    }
                }
            }
        }

        let removed: HashSet<&str> = plan.removed_blocks.iter().map(String::as_str).collect();
        for (id, link) in &current.links {
            let dropped = !draft.links.contains_key(id);
            let orphaned = removed.contains(link.source.as_str()) || removed.contains(link.target.as_str());
            if dropped || orphaned {
                plan.removed_links.push(id.clone());
            }
        }
        for (id, mut link) in draft.links {
            link.id = id.clone();
            if removed.contains(link.source.as_str()) || removed.contains(link.target.as_str()) {
                continue;
            }
            if link.target == CORE_BLOCK_ID {
                plan.filtered += 1;
                continue;
            }
            if current.links.get(&id) != Some(&link) {
                plan.links.push((id, serde_json::to_string(&link)?));
            }
        }

        Ok(plan)
    }

    /// Insert `chunk` into a block's text body at `index` (clamped to its length).
    pub fn insert_text(
        &mut self,
        block_id: &str,
        index: u32,
        chunk: &str,
    ) -> Result<Option<Vec<u8>>, CollabError> {
        if chunk.is_empty() {
            return Ok(None);
        }
        if self.block(block_id).is_none() {
            return Err(CollabError::UnknownBlock(block_id.to_string()));
        }
        let before = self.raw();
        let update = {
            let mut txn = self.doc.transact_mut_with(self.local_origin.clone());
            let text = self.maps.ensure_text(&mut txn, block_id);
            let index = index.min(text.len(&txn));
            text.insert(&mut txn, index, chunk);
            txn.encode_update_v1()
        };
        self.history.seal();
        self.finish(ChangeOrigin::Local, before);
        Ok(Some(update))
    }

    /// Delete `len` units of a block's text body starting at `index`.
    pub fn delete_text(
        &mut self,
        block_id: &str,
        index: u32,
        len: u32,
    ) -> Result<Option<Vec<u8>>, CollabError> {
        let available = {
            let txn = self.doc.transact();
            match self.maps.text_ref(&txn, block_id) {
                Some(text) => text.len(&txn),
                None => return Ok(None),
            }
        };
        if index >= available || len == 0 {
            return Ok(None);
        }
        let len = len.min(available - index);
        let before = self.raw();
        let update = {
            let mut txn = self.doc.transact_mut_with(self.local_origin.clone());
            let text = self.maps.ensure_text(&mut txn, block_id);
            text.remove_range(&mut txn, index, len);
            txn.encode_update_v1()
        };
        self.history.seal();
        self.finish(ChangeOrigin::Local, before);
        Ok(Some(update))
    }

    // ─── Remote integration ───────────────────────────────────────────

    /// Merge an update from a peer.
    ///
    /// Returns a correction update when the merged state broke the core-block
    /// invariant; it must be broadcast like any local update.
    pub fn apply_remote_update(&mut self, update: &[u8]) -> Result<Option<Vec<u8>>, CollabError> {
        let update = Update::decode_v1(update)?;
        let before = self.raw();
        {
            let mut txn = self.doc.transact_mut_with(Origin::from(REMOTE_ORIGIN));
            txn.apply_update(update)
                .map_err(|e| CollabError::Apply(e.to_string()))?;
        }
        self.finish(ChangeOrigin::Remote, before);
        self.enforce_core()
    }

    fn enforce_core(&mut self) -> Result<Option<Vec<u8>>, CollabError> {
        let needs_fix = {
            let txn = self.doc.transact();
            if self.maps.blocks.len(&txn) == 0 {
                false
            } else {
                match self.maps.block(&txn, CORE_BLOCK_ID) {
                    Some(core) => core.kind != BlockKind::Core || core.rect() != self.zone.rect,
                    None => true,
                }
            }
        };
        if !needs_fix {
            return Ok(None);
        }
        log::debug!("Restoring core block after remote update");
        self.seed_core()
    }

    /// Replace the whole document. The undo history is discarded.
    pub fn replace_graph(&mut self, graph: &Graph) -> Result<Vec<u8>, CollabError> {
        let before = self.raw();
        let update = {
            let mut txn = self.doc.transact_mut_with(Origin::from(RESTORE_ORIGIN));
            self.maps.replace_graph(&mut txn, graph, &self.zone)?;
            txn.encode_update_v1()
        };
        self.history.discard();
        self.finish(ChangeOrigin::Restore, before);
        Ok(update)
    }

    /// Drop both undo stacks, e.g. after the server replaced the document.
    pub fn discard_history(&mut self) {
        self.history.discard();
        self.publish_history();
    }

    // ─── Undo / redo ──────────────────────────────────────────────────

    pub fn undo(&mut self) -> Result<Option<Vec<u8>>, CollabError> {
        self.replay(true)
    }

    pub fn redo(&mut self) -> Result<Option<Vec<u8>>, CollabError> {
        self.replay(false)
    }

    fn replay(&mut self, undo: bool) -> Result<Option<Vec<u8>>, CollabError> {
        let before = self.raw();
        let sv = self.doc.transact().state_vector();
        let applied = if undo {
            self.history.undo()
        } else {
            self.history.redo()
        };
        if !applied {
            return Ok(None);
        }
        let update = self.doc.transact().encode_state_as_update_v1(&sv);
        self.finish(ChangeOrigin::Replay, before);
        Ok(Some(update))
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn history_state(&self) -> HistoryState {
        self.history.state()
    }

    // ─── Sync helpers ─────────────────────────────────────────────────

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    pub fn encode_state_as_update(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Updates the peer with state vector `remote_sv` is missing.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, CollabError> {
        let sv = StateVector::decode_v1(remote_sv)?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    // ─── Events ───────────────────────────────────────────────────────

    fn finish(&mut self, origin: ChangeOrigin, before: RawState) {
        let changes = before.diff(&self.raw());
        if !changes.is_empty() {
            let event = ChangeEvent { origin, changes };
            if origin != ChangeOrigin::Local {
                self.remote_changes.emit(event.clone());
            }
            self.changes.emit(event);
        }
        self.publish_history();
    }

    fn publish_history(&mut self) {
        let state = self.history.state();
        if state != self.last_history {
            self.last_history = state;
            self.history_events.emit(state);
        }
    }
}

impl Default for CanvasStore {
    fn default() -> Self {
        Self::new()
    }
}
