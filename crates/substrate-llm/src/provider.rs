use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use substrate_core::{Message, Result, SubstrateError, ToolCall, ToolSpec};

/// A request to an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// The model to use. The router strips the "provider/" prefix before handing it on.
    pub model: String,
    /// Conversation history.
    pub messages: Vec<Message>,
    /// Tools advertised to the model.
    pub tools: Vec<ToolSpec>,
    /// System prompt (separate from messages for providers that support it).
    pub system: Option<String>,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Temperature.
    pub temperature: f32,
    /// Whether to stream the response.
    pub stream: bool,
}

/// A complete (non-streaming) response from an LLM.
///
/// `message.tool_calls` carries structured tool-call requests. Text in
/// `message.content` is passed through verbatim, even when it looks like a
/// tool invocation.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub message: Message,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

impl LlmResponse {
    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.message.tool_calls
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.message.tool_calls.is_empty()
    }

    pub fn text(&self) -> String {
        self.message.text_content()
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Error,
}

impl FinishReason {
    /// Map an OpenAI-style `finish_reason` string.
    pub fn from_wire(reason: Option<&str>, has_tool_calls: bool) -> Self {
        match reason {
            Some("length") => Self::Length,
            Some("content_filter") | Some("error") => Self::Error,
            Some("tool_calls") | Some("function_call") => Self::ToolCalls,
            _ if has_tool_calls => Self::ToolCalls,
            _ => Self::Stop,
        }
    }
}

/// A chunk of a streaming response.
///
/// A stream yields any number of `TextDelta`s and then exactly one terminal
/// chunk: `Done` with the assembled response, or `Error`.
#[derive(Debug)]
pub enum StreamChunk {
    /// Content text delta.
    TextDelta(String),
    /// Stream finished; carries the full assembled response.
    Done(LlmResponse),
    /// The stream broke off. Any partial content is to be discarded.
    Error(SubstrateError),
}

/// Token usage statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Trait implemented by each LLM provider adapter.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Routing name, e.g. "openrouter", "grok", "openai".
    fn name(&self) -> &str;

    /// Models known to this provider (used when a model id has no prefix).
    fn models(&self) -> Vec<String>;

    /// Send a non-streaming request.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Send a streaming request. Dropping the receiver cancels the stream and
    /// closes the underlying connection.
    async fn stream(
        &self,
        request: &LlmRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>>;

    /// Check if this provider is usable (credentials present, endpoint reachable).
    async fn health_check(&self) -> Result<()>;
}
