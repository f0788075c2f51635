//! Weave core: the canvas data model and its replicated store.
//!
//! ```text
//! ┌──────────────┐   apply_local_change    ┌──────────────┐
//! │  CanvasDraft │ ──────────────────────► │ CanvasStore  │── update bytes ──► network
//! │ (plain data) │   guard + dirty check   │  (yrs Doc)   │◄─ remote bytes ──  network
//! └──────────────┘                         └──────┬───────┘
//!                                                 │ ChangeEvent { origin, changes }
//!                                                 ▼
//!                                   UndoHistory / UI projection / persistence
//! ```
//!
//! The replicated document holds three collections: `blocks` and `links`
//! (JSON records keyed by id) and `contents` (one `yrs` text per block).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub mod collab;
pub mod events;
pub mod graph;
pub mod layout;

pub use collab::undo::{HistoryState, UndoHistory};
pub use collab::{
    CanvasDraft, CanvasMaps, CanvasStore, ChangeEvent, ChangeOrigin, ChangeSet, CollabError,
};
pub use events::Emitter;
pub use graph::{Mutation, CONTENT_HASH_LEN};
pub use layout::CoreZone;

/// Identifier of the single core block every canvas contains.
pub const CORE_BLOCK_ID: &str = "core";

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle in canvas coordinates (origin + size).
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    #[inline]
    pub fn max_x(&self) -> f64 {
        self.x + self.width
    }

    #[inline]
    pub fn max_y(&self) -> f64 {
        self.y + self.height
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Grow the rectangle by `margin` on every side.
    pub fn inflate(&self, margin: f64) -> Rect {
        Rect::new(
            self.x - margin,
            self.y - margin,
            self.width + margin * 2.0,
            self.height + margin * 2.0,
        )
    }

    /// Strict overlap test. Rectangles that only share an edge do not overlap.
    #[inline]
    pub fn overlaps(&self, other: &Rect) -> bool {
        self.x < other.max_x()
            && self.max_x() > other.x
            && self.y < other.max_y()
            && self.max_y() > other.y
    }

    pub fn with_origin(&self, origin: Point) -> Rect {
        Rect::new(origin.x, origin.y, self.width, self.height)
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    /// The immovable anchor node. Exactly one per canvas.
    Core,
    Text,
    Note,
    Image,
    Embed,
    Frame,
}

/// A node in the canvas graph.
///
/// The rich-text body is not part of the record; it lives in the `contents`
/// collection under the same id.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: String,
    pub kind: BlockKind,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub owner: Uuid,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Block {
    pub fn new(id: impl Into<String>, kind: BlockKind, rect: Rect, owner: Uuid) -> Self {
        Self {
            id: id.into(),
            kind,
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            owner,
            locked: false,
            metadata: serde_json::Map::new(),
        }
    }

    /// The default core block seeded into every new canvas.
    pub fn core(zone: &CoreZone) -> Self {
        let mut block = Block::new(CORE_BLOCK_ID, BlockKind::Core, zone.rect, Uuid::nil());
        block.locked = true;
        block
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }

    pub fn is_core(&self) -> bool {
        self.kind == BlockKind::Core
    }

    pub fn set_rect(&mut self, rect: Rect) {
        self.x = rect.x;
        self.y = rect.y;
        self.width = rect.width;
        self.height = rect.height;
    }
}

/// A directed edge between two blocks.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Link {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
            label: None,
        }
    }

    pub fn touches(&self, block_id: &str) -> bool {
        self.source == block_id || self.target == block_id
    }
}

/// Plain-data projection of a canvas: what versions store and what the API returns.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Graph {
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub links: Vec<Link>,
    /// Block id → text body.
    #[serde(default)]
    pub contents: BTreeMap<String, String>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn link(&self, id: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.id == id)
    }

    pub fn core_block(&self) -> Option<&Block> {
        self.blocks.iter().find(|b| b.is_core())
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.links.is_empty() && self.contents.is_empty()
    }
}
