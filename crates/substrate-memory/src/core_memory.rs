use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use substrate_core::{Result, SubstrateError};
use tracing::{debug, warn};

use crate::store::MemoryStore;

/// Default per-block character limit.
pub const DEFAULT_BLOCK_LIMIT: usize = 2000;

/// Blocks at or above this share of their limit are flagged for cleanup.
pub const CAPACITY_WARNING_PCT: usize = 80;

/// A labelled, always-in-context memory block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreBlock {
    pub label: String,
    pub content: String,
    pub description: Option<String>,
    /// Maximum content length in characters.
    pub limit: usize,
    pub read_only: bool,
    pub updated_at: DateTime<Utc>,
}

impl CoreBlock {
    pub fn new(label: impl Into<String>, content: impl Into<String>, limit: usize) -> Self {
        Self {
            label: label.into(),
            content: content.into(),
            description: None,
            limit,
            read_only: false,
            updated_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Content length in characters.
    pub fn chars(&self) -> usize {
        self.content.chars().count()
    }

    /// Percentage of the limit in use.
    pub fn usage_pct(&self) -> usize {
        if self.limit == 0 {
            return 100;
        }
        self.chars() * 100 / self.limit
    }

    pub fn near_capacity(&self) -> bool {
        self.usage_pct() >= CAPACITY_WARNING_PCT
    }
}

/// A mutating core-memory operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEdit<'a> {
    Append(&'a str),
    Replace { old: &'a str, new: &'a str },
    Rethink(&'a str),
}

impl BlockEdit<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Append(_) => "append",
            Self::Replace { .. } => "replace",
            Self::Rethink(_) => "rethink",
        }
    }
}

struct Slot {
    label: String,
    block: Mutex<CoreBlock>,
}

/// Core memory: the small set of blocks rendered into every prompt.
///
/// Shared by all sessions of an agent. Each block has its own lock, so two
/// sessions editing the same block serialize while edits to different blocks
/// proceed independently.
pub struct CoreMemory {
    /// Creation order is rendering order.
    slots: RwLock<Vec<Arc<Slot>>>,
    default_limit: usize,
    store: Option<Arc<MemoryStore>>,
}

impl Default for CoreMemory {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_LIMIT)
    }
}

impl CoreMemory {
    /// In-memory core memory with no persistence.
    pub fn new(default_limit: usize) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            default_limit,
            store: None,
        }
    }

    /// Core memory backed by `store`, preloaded with the blocks it holds.
    pub fn with_store(store: Arc<MemoryStore>, default_limit: usize) -> Result<Self> {
        let blocks = store.load_blocks()?;
        debug!(count = blocks.len(), "loaded core memory blocks");
        let slots = blocks
            .into_iter()
            .map(|b| {
                Arc::new(Slot {
                    label: b.label.clone(),
                    block: Mutex::new(b),
                })
            })
            .collect();
        Ok(Self {
            slots: RwLock::new(slots),
            default_limit,
            store: Some(store),
        })
    }

    pub fn default_limit(&self) -> usize {
        self.default_limit
    }

    fn slot(&self, label: &str) -> Result<Arc<Slot>> {
        self.slots
            .read()
            .iter()
            .find(|s| s.label == label)
            .cloned()
            .ok_or_else(|| SubstrateError::BlockNotFound(label.to_string()))
    }

    pub fn contains(&self, label: &str) -> bool {
        self.slots.read().iter().any(|s| s.label == label)
    }

    /// Create a new block. Fails with `DuplicateBlock` if the label exists.
    pub fn create_block(&self, block: CoreBlock) -> Result<CoreBlock> {
        let len = block.chars();
        if len > block.limit {
            return Err(SubstrateError::BlockLimitExceeded {
                label: block.label.clone(),
                len,
                limit: block.limit,
            });
        }

        let mut slots = self.slots.write();
        if slots.iter().any(|s| s.label == block.label) {
            return Err(SubstrateError::DuplicateBlock(block.label.clone()));
        }
        if let Some(ref store) = self.store {
            store.save_block(&block)?;
        }
        slots.push(Arc::new(Slot {
            label: block.label.clone(),
            block: Mutex::new(block.clone()),
        }));
        debug!(label = %block.label, "created core memory block");
        Ok(block)
    }

    /// Create the block unless a block with the same label already exists.
    /// Returns true if a block was created.
    pub fn ensure_block(&self, block: CoreBlock) -> Result<bool> {
        match self.create_block(block) {
            Ok(_) => Ok(true),
            Err(SubstrateError::DuplicateBlock(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Concatenate `text` onto the block's content.
    pub fn append(&self, label: &str, text: &str, override_read_only: bool) -> Result<CoreBlock> {
        self.edit(label, BlockEdit::Append(text), override_read_only)
    }

    /// Replace every occurrence of `old` with `new`. Fails with `NotFound` if `old` is absent.
    pub fn replace(
        &self,
        label: &str,
        old: &str,
        new: &str,
        override_read_only: bool,
    ) -> Result<CoreBlock> {
        self.edit(label, BlockEdit::Replace { old, new }, override_read_only)
    }

    /// Overwrite the block's content entirely.
    pub fn rethink(&self, label: &str, content: &str, override_read_only: bool) -> Result<CoreBlock> {
        self.edit(label, BlockEdit::Rethink(content), override_read_only)
    }

    /// Apply one edit atomically with respect to the block.
    /// On any error the block is left unchanged.
    pub fn edit(&self, label: &str, edit: BlockEdit<'_>, override_read_only: bool) -> Result<CoreBlock> {
        let slot = self.slot(label)?;
        let mut block = slot.block.lock();

        if block.read_only && !override_read_only {
            return Err(SubstrateError::ReadOnlyBlock(label.to_string()));
        }

        let updated = match edit {
            BlockEdit::Append(text) => format!("{}{}", block.content, text),
            BlockEdit::Replace { old, new } => {
                if old.is_empty() || !block.content.contains(old) {
                    return Err(SubstrateError::NotFound {
                        label: label.to_string(),
                        needle: old.to_string(),
                    });
                }
                block.content.replace(old, new)
            }
            BlockEdit::Rethink(text) => text.to_string(),
        };

        let len = updated.chars().count();
        if len > block.limit {
            warn!(label, len, limit = block.limit, op = edit.name(), "core memory edit exceeds block limit");
            return Err(SubstrateError::BlockLimitExceeded {
                label: label.to_string(),
                len,
                limit: block.limit,
            });
        }

        let mut next = block.clone();
        next.content = updated;
        next.updated_at = Utc::now();

        // Persist before publishing so memory and disk never disagree.
        if let Some(ref store) = self.store {
            store.save_block(&next)?;
        }
        *block = next.clone();
        debug!(label, op = edit.name(), chars = len, "core memory block updated");
        Ok(next)
    }

    /// Snapshot of one block.
    pub fn get(&self, label: &str) -> Result<CoreBlock> {
        Ok(self.slot(label)?.block.lock().clone())
    }

    /// Snapshot of all blocks, in creation order.
    pub fn list(&self) -> Vec<CoreBlock> {
        let slots: Vec<Arc<Slot>> = self.slots.read().clone();
        slots.iter().map(|s| s.block.lock().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
