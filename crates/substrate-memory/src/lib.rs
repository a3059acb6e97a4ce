//! # substrate-memory
//!
//! Memory for the Substrate agent:
//!
//! - **Core memory**: a handful of labelled blocks rendered into every prompt,
//!   edited by the model through append / replace / rethink.
//! - **Archival memory**: an append-only, embedding-indexed log searched by
//!   similarity for per-turn recall.
//! - **Store**: SQLite persistence for both, plus session histories.

pub mod archival;
pub mod core_memory;
pub mod store;

pub use archival::{
    ArchivalEntry, ArchivalMemory, ArchivalStats, MemoryCategory, NewEntry, ScoredEntry,
    SearchQuery,
};
pub use core_memory::{BlockEdit, CoreBlock, CoreMemory, DEFAULT_BLOCK_LIMIT};
pub use store::{MemoryStore, SessionRow};
