//! # substrate-llm
//!
//! The model client: one `LlmProvider` interface with an OpenAI-compatible
//! adapter per service (OpenRouter, Grok, OpenAI), a router that adds retry,
//! circuit breaking and fallback, and the embedding backends used by archival
//! memory.

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod provider;
pub mod router;
mod transport;

pub use embedding::{EmbeddingProvider, OllamaEmbedding, OpenAiEmbedding, cosine_similarity};
pub use mock::{MockEmbedding, MockProvider, MockResponse};
pub use openai::{OpenAiCompatProvider, ProviderKind};
pub use provider::{FinishReason, LlmProvider, LlmRequest, LlmResponse, StreamChunk, Usage};
pub use router::{ModelRouter, RetryPolicy};
