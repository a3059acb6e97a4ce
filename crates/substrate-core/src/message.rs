use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tool::{ToolCall, ToolResult};

/// A message in a session's history. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: Vec<MessageContent>,
    pub timestamp: DateTime<Utc>,
    /// Tool calls requested by the assistant in this message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Optional metadata (model used, contamination flags, etc.)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content block within a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        success: bool,
    },
}

impl Message {
    /// Create a simple text message.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: vec![MessageContent::Text { text: text.into() }],
            timestamp: Utc::now(),
            tool_calls: vec![],
            metadata: Default::default(),
        }
    }

    /// An assistant message bearing tool calls. Empty text produces no text block.
    pub fn assistant_with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let text = text.into();
        let mut msg = Self::text(Role::Assistant, String::new());
        msg.content = if text.is_empty() {
            vec![]
        } else {
            vec![MessageContent::Text { text }]
        };
        msg.tool_calls = tool_calls;
        msg
    }

    /// A tool-role message answering exactly one tool call.
    pub fn tool_result(result: &ToolResult, content: impl Into<String>) -> Self {
        let mut msg = Self::text(Role::Tool, String::new());
        msg.content = vec![MessageContent::ToolResult {
            tool_call_id: result.tool_call_id.clone(),
            content: content.into(),
            success: result.success,
        }];
        msg
    }

    /// Extract all text content joined together.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                MessageContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The tool call this message answers, when role is `Tool`.
    pub fn answered_tool_call_id(&self) -> Option<&str> {
        self.content.iter().find_map(|c| match c {
            MessageContent::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
    }

    /// Estimate token count for this message (~4 chars per token).
    pub fn estimate_tokens(&self) -> usize {
        // Role overhead (~4 tokens for role markers)
        let mut chars = 16usize;

        for block in &self.content {
            match block {
                MessageContent::Text { text } => chars += text.len(),
                MessageContent::ToolResult {
                    content,
                    tool_call_id,
                    ..
                } => chars += content.len() + tool_call_id.len(),
            }
        }

        for tc in &self.tool_calls {
            chars += tc.tool_name.len() + tc.id.len() + tc.arguments.to_string().len();
        }

        (chars / 4).max(1)
    }
}
