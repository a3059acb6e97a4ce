//! # substrate-runtime
//!
//! The turn engine: one user message in, one committed assistant reply out.
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────────┐
//!              │    Agent     │  ← built from SubstrateConfig
//!              └──────┬───────┘
//!                     │ run_turn(session, text, cancel)
//!                     ▼
//!              ┌──────────────┐
//!              │ Orchestrator │
//!              │              │
//!              │ 1. Lease     │  ← one turn per session
//!              │ 2. Recall    │  ← archival top-K
//!              │ 3. Context   │  ← core blocks + warnings
//!              │ 4. Model     │  ← router: retry, failover
//!              │ 5. Dispatch  │  ← tool registry
//!              │ 6. Commit    │  ← only on DONE
//!              └──────────────┘
//!                     │
//!         ┌───────────┼───────────┐
//!         ▼           ▼           ▼
//!    ┌─────────┐ ┌─────────┐ ┌──────────┐
//!    │  Model  │ │  Core   │ │ Archival │
//!    │ Router  │ │ Memory  │ │  Memory  │
//!    └─────────┘ └─────────┘ └──────────┘
//! ```

pub mod agent;
pub mod contamination;
pub mod context;
pub mod memory_tools;
pub mod orchestrator;
pub mod registry;
pub mod session;

pub use agent::{Agent, build_embedder, build_router, resolve_db_path};
pub use contamination::{Contamination, ContaminationDetector};
pub use memory_tools::{MemoryHandles, memory_tool_specs, register_memory_tools};
pub use orchestrator::{Orchestrator, ToolActivity, TurnEvent, TurnSettings};
pub use registry::{ToolRegistry, tool_fn, validate_arguments};
pub use session::{Session, SessionLease, SessionRegistry};
