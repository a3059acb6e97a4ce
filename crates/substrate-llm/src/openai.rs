use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;
use substrate_core::{Message, MessageContent, Result, Role, SubstrateError, ToolCall};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::provider::*;
use crate::transport::{classify_request_error, error_from_response};

/// Which OpenAI-compatible service an adapter talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenRouter,
    Grok,
    OpenAi,
}

impl ProviderKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::OpenRouter => "openrouter",
            Self::Grok => "grok",
            Self::OpenAi => "openai",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenRouter => "https://openrouter.ai/api/v1",
            Self::Grok => "https://api.x.ai/v1",
            Self::OpenAi => "https://api.openai.com/v1",
        }
    }

    fn known_models(self) -> Vec<String> {
        let models: &[&str] = match self {
            Self::OpenRouter => &[
                "x-ai/grok-4",
                "anthropic/claude-sonnet-4",
                "openai/gpt-4o",
                "google/gemini-2.5-pro",
            ],
            Self::Grok => &["grok-4", "grok-3", "grok-3-mini"],
            Self::OpenAi => &["gpt-4o", "gpt-4o-mini", "o3", "o3-mini"],
        };
        models.iter().map(|m| m.to_string()).collect()
    }
}

/// Chat-completions adapter for OpenAI-compatible APIs.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    kind: ProviderKind,
}

impl OpenAiCompatProvider {
    pub fn new(kind: ProviderKind, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: kind.default_base_url().into(),
            kind,
        }
    }

    pub fn openrouter(api_key: String) -> Self {
        Self::new(ProviderKind::OpenRouter, api_key)
    }

    pub fn grok(api_key: String) -> Self {
        Self::new(ProviderKind::Grok, api_key)
    }

    pub fn openai(api_key: String) -> Self {
        Self::new(ProviderKind::OpenAi, api_key)
    }

    /// Use a custom base URL (proxies, self-hosted gateways, vLLM, etc.)
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Apply a per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        self
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body);
        if self.kind == ProviderKind::OpenRouter {
            req = req
                .header("HTTP-Referer", "https://github.com/substrate-agent/substrate")
                .header("X-Title", "substrate");
        }
        req
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn models(&self) -> Vec<String> {
        self.kind.known_models()
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let body = build_body(request, false);
        debug!(provider = self.name(), model = %request.model, "sending completion request");

        let resp = self
            .post(&body)
            .send()
            .await
            .map_err(|e| classify_request_error(self.name(), e))?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| classify_request_error(self.name(), e))?;

        parse_completion(&data)
    }

    async fn stream(&self, request: &LlmRequest) -> Result<mpsc::Receiver<StreamChunk>> {
        let body = build_body(request, true);
        debug!(provider = self.name(), model = %request.model, "opening completion stream");

        // Connect and check status up front so HTTP failures reach the router's retry loop.
        let resp = self
            .post(&body)
            .send()
            .await
            .map_err(|e| classify_request_error(self.name(), e))?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let (tx, rx) = mpsc::channel(256);
        let provider = self.name().to_string();

        tokio::spawn(async move {
            use futures::StreamExt;

            let mut bytes = resp.bytes_stream();
            let mut lines = LineBuffer::default();
            let mut acc = SseAccumulator::default();

            loop {
                // Dropping `bytes` on return closes the connection.
                let chunk = tokio::select! {
                    _ = tx.closed() => {
                        debug!(provider = %provider, "stream consumer went away, closing");
                        return;
                    }
                    chunk = bytes.next() => chunk,
                };
                let chunk = match chunk {
                    Some(Ok(c)) => c,
                    Some(Err(e)) => {
                        let _ = tx
                            .send(StreamChunk::Error(classify_request_error(&provider, e)))
                            .await;
                        return;
                    }
                    None => break,
                };
                lines.push(&chunk);

                while let Some(line) = lines.next_line() {
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        let _ = tx.send(StreamChunk::Done(acc.finish())).await;
                        return;
                    }
                    match acc.feed(data) {
                        Ok(Some(delta)) => {
                            if tx.send(StreamChunk::TextDelta(delta)).await.is_err() {
                                debug!(provider = %provider, "stream consumer went away, closing");
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = tx.send(StreamChunk::Error(e)).await;
                            return;
                        }
                    }
                }
            }

            // Some gateways close without [DONE].
            let _ = tx.send(StreamChunk::Done(acc.finish())).await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<()> {
        info!(provider = self.name(), "checking API health");
        if self.api_key.is_empty() {
            return Err(SubstrateError::fatal(format!(
                "{} API key not set",
                self.name()
            )));
        }
        let resp = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| classify_request_error(self.name(), e))?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(())
    }
}

// ── Wire format ────────────────────────────────────────────────

/// Splits a byte stream into lines. Bytes are only decoded once a full line
/// has arrived, so a multi-byte character split across chunks survives.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }
}

fn wire_messages(request: &LlmRequest) -> Vec<Value> {
    let mut messages = Vec::new();

    if let Some(ref system) = request.system {
        messages.push(json!({ "role": "system", "content": system }));
    }

    for msg in &request.messages {
        match msg.role {
            Role::System => {
                messages.push(json!({ "role": "system", "content": msg.text_content() }));
            }
            Role::User => {
                messages.push(json!({ "role": "user", "content": msg.text_content() }));
            }
            Role::Assistant if msg.tool_calls.is_empty() => {
                messages.push(json!({ "role": "assistant", "content": msg.text_content() }));
            }
            Role::Assistant => {
                let calls: Vec<Value> = msg
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.tool_name,
                                "arguments": match &tc.arguments {
                                    Value::String(raw) => raw.clone(),
                                    args => args.to_string(),
                                },
                            }
                        })
                    })
                    .collect();
                let text = msg.text_content();
                let content = if text.is_empty() { Value::Null } else { json!(text) };
                messages.push(json!({
                    "role": "assistant",
                    "content": content,
                    "tool_calls": calls,
                }));
            }
            Role::Tool => {
                for block in &msg.content {
                    if let MessageContent::ToolResult {
                        tool_call_id,
                        content,
                        ..
                    } = block
                    {
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_call_id,
                            "content": content,
                        }));
                    }
                }
            }
        }
    }

    messages
}

/// Build a chat-completions request body.
pub fn build_body(request: &LlmRequest, stream: bool) -> Value {
    let mut body = json!({
        "model": &request.model,
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
        "messages": wire_messages(request),
    });

    if stream {
        body["stream"] = json!(true);
        body["stream_options"] = json!({ "include_usage": true });
    }

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    body
}

/// Parse the arguments string of a tool call. Malformed JSON is kept verbatim as a
/// string so the registry's argument validation rejects it.
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn usage_from(data: &Value) -> Usage {
    Usage {
        input_tokens: data["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: data["completion_tokens"].as_u64().unwrap_or(0) as u32,
    }
}

fn assemble(text: String, tool_calls: Vec<ToolCall>, usage: Usage, reason: Option<&str>) -> LlmResponse {
    let finish_reason = FinishReason::from_wire(reason, !tool_calls.is_empty());
    LlmResponse {
        message: Message::assistant_with_tool_calls(text, tool_calls),
        usage,
        finish_reason,
    }
}

/// Parse a non-streaming chat-completions response.
pub fn parse_completion(data: &Value) -> Result<LlmResponse> {
    if let Some(err) = data.get("error").filter(|e| !e.is_null()) {
        let message = err["message"].as_str().unwrap_or("unknown provider error");
        return Err(SubstrateError::fatal(message.to_string()));
    }

    let choice = data["choices"]
        .get(0)
        .ok_or_else(|| SubstrateError::fatal("response has no choices"))?;

    let text = choice["message"]["content"].as_str().unwrap_or("").to_string();

    let tool_calls: Vec<ToolCall> = choice["message"]["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|c| {
                    Some(ToolCall {
                        id: c["id"].as_str()?.to_string(),
                        tool_name: c["function"]["name"].as_str()?.to_string(),
                        arguments: parse_arguments(c["function"]["arguments"].as_str().unwrap_or("")),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(assemble(
        text,
        tool_calls,
        usage_from(&data["usage"]),
        choice["finish_reason"].as_str(),
    ))
}

/// Accumulates SSE `data:` payloads into a final response.
#[derive(Default)]
pub struct SseAccumulator {
    text: String,
    /// index -> (id, name, arguments_json)
    tool_calls: BTreeMap<u64, (String, String, String)>,
    finish_reason: Option<String>,
    usage: Usage,
}

impl SseAccumulator {
    /// Feed one event payload. Returns the text delta it carried, if any.
    pub fn feed(&mut self, data: &str) -> Result<Option<String>> {
        let event: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };

        if let Some(err) = event.get("error").filter(|e| !e.is_null()) {
            let message = err["message"].as_str().unwrap_or("stream error");
            return Err(SubstrateError::retryable(message.to_string()));
        }

        if let Some(usage) = event.get("usage").filter(|u| !u.is_null()) {
            self.usage = usage_from(usage);
        }

        let choice = &event["choices"][0];
        if let Some(fr) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(fr.to_string());
        }

        let delta = &choice["delta"];
        if let Some(calls) = delta["tool_calls"].as_array() {
            for tc in calls {
                let idx = tc["index"].as_u64().unwrap_or(0);
                let entry = self.tool_calls.entry(idx).or_default();
                if let Some(id) = tc["id"].as_str() {
                    entry.0 = id.to_string();
                }
                if let Some(name) = tc["function"]["name"].as_str() {
                    entry.1.push_str(name);
                }
                if let Some(args) = tc["function"]["arguments"].as_str() {
                    entry.2.push_str(args);
                }
            }
        }

        match delta["content"].as_str() {
            Some(text) if !text.is_empty() => {
                self.text.push_str(text);
                Ok(Some(text.to_string()))
            }
            _ => Ok(None),
        }
    }

    pub fn finish(self) -> LlmResponse {
        let tool_calls = self
            .tool_calls
            .into_values()
            .filter(|(_, name, _)| !name.is_empty())
            .map(|(id, name, args)| ToolCall {
                id,
                tool_name: name,
                arguments: parse_arguments(&args),
            })
            .collect();
        assemble(self.text, tool_calls, self.usage, self.finish_reason.as_deref())
    }
}
