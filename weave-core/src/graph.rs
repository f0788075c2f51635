//! Graph mutations, normalization and content hashing.
//!
//! Versions store a list of [`Mutation`]s. Replaying them in order over an
//! empty graph reconstructs the version; a `ReplaceGraph` mutation is
//! self-sufficient on its own.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Block, Graph, Link};

/// Length of a hex-encoded SHA-256 content hash.
pub const CONTENT_HASH_LEN: usize = 64;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    ReplaceGraph { graph: Graph },
    UpsertBlock { block: Block },
    RemoveBlock { id: String },
    UpsertLink { link: Link },
    RemoveLink { id: String },
    SetContent { block_id: String, text: String },
}

impl Mutation {
    /// Whether applying this mutation alone yields a complete graph.
    pub fn is_self_sufficient(&self) -> bool {
        matches!(self, Mutation::ReplaceGraph { .. })
    }
}

impl Graph {
    pub fn apply(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::ReplaceGraph { graph } => *self = graph.clone(),
            Mutation::UpsertBlock { block } => {
                match self.blocks.iter_mut().find(|b| b.id == block.id) {
                    Some(existing) => *existing = block.clone(),
                    None => self.blocks.push(block.clone()),
                }
            }
            Mutation::RemoveBlock { id } => {
                self.blocks.retain(|b| &b.id != id);
                self.links.retain(|l| !l.touches(id));
                self.contents.remove(id);
            }
            Mutation::UpsertLink { link } => {
                match self.links.iter_mut().find(|l| l.id == link.id) {
                    Some(existing) => *existing = link.clone(),
                    None => self.links.push(link.clone()),
                }
            }
            Mutation::RemoveLink { id } => self.links.retain(|l| &l.id != id),
            Mutation::SetContent { block_id, text } => {
                self.contents.insert(block_id.clone(), text.clone());
            }
        }
    }

    pub fn apply_all<'a>(&mut self, mutations: impl IntoIterator<Item = &'a Mutation>) {
        for mutation in mutations {
            self.apply(mutation);
        }
    }

    /// Canonical form: records sorted by id, coordinates rounded to whole units,
    /// empty text bodies dropped.
    pub fn normalized(&self) -> Graph {
        let mut blocks = self.blocks.clone();
        for block in &mut blocks {
            block.x = block.x.round();
            block.y = block.y.round();
            block.width = block.width.round();
            block.height = block.height.round();
        }
        blocks.sort_by(|a, b| a.id.cmp(&b.id));

        let mut links = self.links.clone();
        links.sort_by(|a, b| a.id.cmp(&b.id));

        let contents = self
            .contents
            .iter()
            .filter(|(_, text)| !text.is_empty())
            .map(|(id, text)| (id.clone(), text.clone()))
            .collect();

        Graph {
            blocks,
            links,
            contents,
        }
    }

    /// Hex SHA-256 over the JSON encoding of the normalized graph.
    pub fn content_hash(&self) -> String {
        let normalized = self.normalized();
        let mut hasher = Sha256::new();
        // Graph serialization cannot fail: all keys are strings.
        if let Ok(bytes) = serde_json::to_vec(&normalized) {
            hasher.update(&bytes);
        }
        hex::encode(hasher.finalize())
    }
}
