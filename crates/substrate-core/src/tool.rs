use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::SessionId;

/// How a tool interacts with the world. Gates concurrency in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectClass {
    /// No side effects; may run concurrently with anything.
    Pure,
    /// Writes core or archival memory; serialized per session.
    MutatesMemory,
    /// Talks to the network or filesystem; may run concurrently.
    ExternalIo,
    /// Runs untrusted code in a sandbox under a resource ceiling.
    Sandboxed,
}

impl SideEffectClass {
    /// Whether calls of this class may overlap with other calls in the same batch.
    pub fn is_parallel_safe(self) -> bool {
        matches!(self, Self::Pure | Self::ExternalIo)
    }
}

/// Description of a tool advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique name, e.g. "core_memory_append", "web_search".
    pub name: String,
    /// Human-readable description for the model.
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
    pub side_effect: SideEffectClass,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        side_effect: SideEffectClass,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            side_effect,
        }
    }
}

/// A request from the model to call a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// The result of executing a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub success: bool,
    /// Rendered output, or a human-readable error description.
    pub content: String,
    /// Structured payload returned by the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolResult {
    pub fn ok(tool_call_id: impl Into<String>, data: Value) -> Self {
        let content = match &data {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        };
        Self {
            tool_call_id: tool_call_id.into(),
            success: true,
            content,
            data: Some(data),
        }
    }

    pub fn error(tool_call_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: false,
            content: message.into(),
            data: None,
        }
    }
}

/// Per-call context handed to tool handlers.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: SessionId,
}

/// Something that can execute calls for one registered tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute with already-validated arguments and return the output payload.
    async fn call(&self, ctx: &ToolContext, args: Value) -> crate::Result<Value>;
}
