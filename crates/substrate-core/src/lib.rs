//! # substrate-core
//!
//! Core types, traits, and primitives for the Substrate agent runtime.
//! This crate defines the shared vocabulary used by every other crate in the workspace:
//! messages, tool specifications and results, the error taxonomy, and the event bus.

pub mod error;
pub mod event;
pub mod message;
pub mod tool;
pub mod types;

pub use error::{Result, SubstrateError};
pub use event::{Event, EventBus};
pub use message::{Message, MessageContent, Role};
pub use tool::{SideEffectClass, ToolCall, ToolContext, ToolHandler, ToolResult, ToolSpec};
pub use types::*;
