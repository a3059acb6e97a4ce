//! Mock model and embedding providers for deterministic testing.
//!
//! Return pre-configured responses without making any HTTP calls.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::embedding::EmbeddingProvider;
use crate::provider::*;
use substrate_core::{Message, Result, SubstrateError, ToolCall};

/// A mock LLM provider that returns pre-configured responses.
///
/// # Example
/// ```
/// use substrate_llm::mock::MockProvider;
/// let provider = MockProvider::new("test")
///     .with_response("Hello, world!");
/// ```
pub struct MockProvider {
    responses: Arc<Mutex<Vec<MockResponse>>>,
    /// Track all requests received (for assertions in tests).
    pub requests: Arc<Mutex<Vec<LlmRequest>>>,
    name: String,
}

/// How a queued mock response fails.
#[derive(Clone, Debug)]
pub enum MockFailure {
    Retryable(String),
    Fatal(String),
    /// Stream emits its text deltas and then breaks off with this error.
    MidStream(String),
}

/// A pre-configured response from the mock provider.
#[derive(Clone)]
pub struct MockResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    /// If set, the provider fails instead of answering.
    pub error: Option<MockFailure>,
    /// Delay before answering (per text delta when streaming).
    pub delay: Option<Duration>,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            text: String::new(),
            tool_calls: vec![],
            finish_reason: FinishReason::Stop,
            usage: Usage {
                input_tokens: 100,
                output_tokens: 50,
            },
            error: None,
            delay: None,
        }
    }
}

impl MockResponse {
    /// Create a text response.
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    /// A response requesting the given tool calls.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            finish_reason: FinishReason::ToolCalls,
            ..Default::default()
        }
    }

    /// A retryable transport failure.
    pub fn error(msg: &str) -> Self {
        Self {
            error: Some(MockFailure::Retryable(msg.to_string())),
            ..Default::default()
        }
    }

    /// A fatal transport failure.
    pub fn fatal(msg: &str) -> Self {
        Self {
            error: Some(MockFailure::Fatal(msg.to_string())),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn into_response(self) -> LlmResponse {
        LlmResponse {
            message: Message::assistant_with_tool_calls(self.text, self.tool_calls),
            usage: self.usage,
            finish_reason: self.finish_reason,
        }
    }
}

impl MockFailure {
    fn into_error(self) -> SubstrateError {
        match self {
            Self::Retryable(m) | Self::MidStream(m) => SubstrateError::retryable(m),
            Self::Fatal(m) => SubstrateError::fatal(m),
        }
    }
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(vec![])),
            requests: Arc::new(Mutex::new(vec![])),
            name: name.into(),
        }
    }

    /// Queue a simple text response.
    pub fn with_response(self, text: &str) -> Self {
        self.with_mock_response(MockResponse::text(text))
    }

    /// Queue a single tool call response.
    pub fn with_tool_call(self, name: &str, args: serde_json::Value) -> Self {
        self.with_mock_response(MockResponse::tool_calls(vec![ToolCall {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            tool_name: name.to_string(),
            arguments: args,
        }]))
    }

    /// Queue a retryable error response.
    pub fn with_error(self, error: &str) -> Self {
        self.with_mock_response(MockResponse::error(error))
    }

    /// Queue a fully custom response.
    pub fn with_mock_response(self, resp: MockResponse) -> Self {
        self.queue(resp);
        self
    }

    /// Queue a response through a shared reference.
    pub fn queue(&self, resp: MockResponse) {
        self.responses.lock().unwrap().push(resp);
    }

    /// Get all requests that were made to this provider.
    pub fn recorded_requests(&self) -> Arc<Mutex<Vec<LlmRequest>>> {
        Arc::clone(&self.requests)
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Pop the next queued response, or return a default "no response queued" message.
    fn next_response(&self) -> MockResponse {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            MockResponse::text("(mock: no more queued responses)")
        } else {
            responses.remove(0)
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn models(&self) -> Vec<String> {
        vec!["mock-model".to_string()]
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let mut mock = self.next_response();

        if let Some(delay) = mock.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = mock.error.take() {
            return Err(error.into_error());
        }

        Ok(mock.into_response())
    }

    async fn stream(&self, request: &LlmRequest) -> Result<mpsc::Receiver<StreamChunk>> {
        self.requests.lock().unwrap().push(request.clone());
        let mut mock = self.next_response();

        let mid_stream = match mock.error.take() {
            Some(MockFailure::MidStream(m)) => Some(m),
            Some(other) => return Err(other.into_error()),
            None => None,
        };

        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            // Stream the text word by word, keeping the whitespace
            let words: Vec<String> = mock
                .text
                .split_inclusive(' ')
                .map(|w| w.to_string())
                .collect();
            for word in words {
                if let Some(delay) = mock.delay {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(StreamChunk::TextDelta(word)).await.is_err() {
                    return;
                }
            }

            if let Some(m) = mid_stream {
                let _ = tx
                    .send(StreamChunk::Error(SubstrateError::retryable(m)))
                    .await;
                return;
            }

            let _ = tx.send(StreamChunk::Done(mock.into_response())).await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ── Mock embedding ─────────────────────────────────────────────

/// Deterministic embedder: a hashed bag of lowercase words, L2-normalised.
/// Texts sharing words score higher; exact vectors can be pinned per text.
pub struct MockEmbedding {
    dims: usize,
    failing: Arc<AtomicBool>,
    pinned: Mutex<HashMap<String, Vec<f32>>>,
    calls: AtomicUsize,
}

impl Default for MockEmbedding {
    fn default() -> Self {
        Self::new(64)
    }
}

impl MockEmbedding {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            failing: Arc::new(AtomicBool::new(false)),
            pinned: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Return exactly `vector` whenever `text` is embedded.
    pub fn with_vector(self, text: &str, vector: Vec<f32>) -> Self {
        self.pinned.lock().unwrap().insert(text.to_string(), vector);
        self
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Shared switch for flipping failure from outside.
    pub fn failure_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.failing)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.pinned.lock().unwrap().get(text) {
            return v.clone();
        }
        let mut v = vec![0.0f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let word = word.to_lowercase();
            // FNV-1a
            let mut hash: u64 = 0xcbf29ce484222325;
            for b in word.bytes() {
                hash ^= b as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
            v[(hash % self.dims as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedding {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SubstrateError::Embedding("mock embedder is down".into()));
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;
    use substrate_core::Role;

    fn request(stream: bool) -> LlmRequest {
        LlmRequest {
            model: "test".into(),
            messages: vec![Message::text(Role::User, "hello")],
            tools: vec![],
            system: Some("be nice".into()),
            max_tokens: 100,
            temperature: 0.7,
            stream,
        }
    }

    #[tokio::test]
    async fn test_mock_text_response() {
        let provider = MockProvider::new("mock").with_response("Hello!");
        let resp = provider.complete(&request(false)).await.unwrap();
        assert_eq!(resp.text(), "Hello!");
        assert_eq!(resp.finish_reason, FinishReason::Stop);
        assert!(!resp.has_tool_calls());
    }

    #[tokio::test]
    async fn test_mock_tool_call() {
        let provider = MockProvider::new("mock")
            .with_tool_call("core_memory_get", serde_json::json!({"label": "human"}));
        let resp = provider.complete(&request(false)).await.unwrap();
        assert!(resp.has_tool_calls());
        assert_eq!(resp.tool_calls()[0].tool_name, "core_memory_get");
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
        assert!(resp.message.content.is_empty());
    }

    #[tokio::test]
    async fn test_mock_errors_keep_their_class() {
        let provider = MockProvider::new("mock")
            .with_error("HTTP 503")
            .with_mock_response(MockResponse::fatal("HTTP 401"));
        assert!(provider.complete(&request(false)).await.unwrap_err().is_retryable());
        assert!(!provider.complete(&request(false)).await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_mock_records_requests() {
        let provider = MockProvider::new("mock").with_response("ok");
        let _ = provider.complete(&request(false)).await;
        assert_eq!(provider.request_count(), 1);
        let recorded = provider.recorded_requests();
        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded[0].system, Some("be nice".into()));
    }

    #[tokio::test]
    async fn test_mock_streaming_ends_with_done() {
        let provider = MockProvider::new("mock").with_response("Hello world");
        let mut rx = provider.stream(&request(true)).await.unwrap();
        let mut text = String::new();
        let mut done = None;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                StreamChunk::TextDelta(t) => text.push_str(&t),
                StreamChunk::Done(resp) => done = Some(resp),
                StreamChunk::Error(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(text, "Hello world");
        assert_eq!(done.unwrap().text(), "Hello world");
    }

    #[tokio::test]
    async fn test_mock_stream_mid_error() {
        let provider = MockProvider::new("mock").with_mock_response(MockResponse {
            text: "partial answer".into(),
            error: Some(MockFailure::MidStream("connection reset".into())),
            ..Default::default()
        });
        let mut rx = provider.stream(&request(true)).await.unwrap();
        let mut last = None;
        while let Some(chunk) = rx.recv().await {
            last = Some(chunk);
        }
        assert!(matches!(last, Some(StreamChunk::Error(_))));
    }

    #[tokio::test]
    async fn test_mock_multiple_responses_in_order() {
        let provider = MockProvider::new("mock")
            .with_response("first")
            .with_response("second");
        assert_eq!(provider.complete(&request(false)).await.unwrap().text(), "first");
        assert_eq!(provider.complete(&request(false)).await.unwrap().text(), "second");
        assert_eq!(
            provider.complete(&request(false)).await.unwrap().text(),
            "(mock: no more queued responses)"
        );
    }

    #[tokio::test]
    async fn test_mock_embedding_shared_words_score_higher() {
        let emb = MockEmbedding::default();
        let v = emb
            .embed(&["likes dark coffee", "coffee", "rainy weather"])
            .await
            .unwrap();
        assert!(cosine_similarity(&v[1], &v[0]) > cosine_similarity(&v[1], &v[2]));
        assert_eq!(v[0].len(), 64);
    }

    #[tokio::test]
    async fn test_mock_embedding_failure_switch() {
        let emb = MockEmbedding::default().with_vector("x", vec![1.0; 64]);
        assert_eq!(emb.embed_one("x").await.unwrap(), vec![1.0; 64]);
        emb.set_failing(true);
        assert!(emb.embed_one("x").await.is_err());
        assert_eq!(emb.call_count(), 2);
    }
}
