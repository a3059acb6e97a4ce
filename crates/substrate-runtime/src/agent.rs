use futures::Stream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use substrate_config::{EmbeddingConfig, ProvidersConfig, SubstrateConfig};
use substrate_core::{EventBus, Message, Result, ToolHandler, ToolSpec};
use substrate_llm::{
    EmbeddingProvider, ModelRouter, OllamaEmbedding, OpenAiCompatProvider, OpenAiEmbedding,
    RetryPolicy,
};
use substrate_memory::{ArchivalMemory, CoreBlock, CoreMemory, MemoryStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::memory_tools::{MemoryHandles, register_memory_tools};
use crate::orchestrator::{Orchestrator, TurnEvent, TurnSettings};
use crate::registry::ToolRegistry;
use crate::session::SessionRegistry;

/// A fully wired agent: model router, both memory tiers, tools and sessions.
pub struct Agent {
    config: SubstrateConfig,
    orchestrator: Orchestrator,
    tools: Arc<ToolRegistry>,
    core: Arc<CoreMemory>,
    archival: Arc<ArchivalMemory>,
    sessions: Arc<SessionRegistry>,
    router: ModelRouter,
    events: EventBus,
    embedder_ready: bool,
}

impl Agent {
    /// Build an agent from configuration: providers, embedder, SQLite store,
    /// seeded core blocks and the built-in memory tools.
    pub async fn from_config(config: SubstrateConfig) -> Result<Self> {
        info!("initializing agent");
        let router = build_router(&config.providers);
        if router.providers().is_empty() {
            warn!("no model provider has credentials; set OPENROUTER_API_KEY, GROK_API_KEY or OPENAI_API_KEY");
        }
        let embedder = build_embedder(&config.memory.embedding, &config.providers);

        let db_path = resolve_db_path(&config);
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let store = Arc::new(MemoryStore::open(&db_path)?);
        info!(path = %db_path.display(), "memory store opened");

        let mut agent = Self::with_parts(config, router, embedder, Some(store))?;
        agent.embedder_ready = agent.archival.probe_embedder().await;
        Ok(agent)
    }

    /// Assemble an agent from ready-made parts. Without a store, memory and
    /// sessions live only in this process.
    pub fn with_parts(
        config: SubstrateConfig,
        router: ModelRouter,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        store: Option<Arc<MemoryStore>>,
    ) -> Result<Self> {
        let settings = TurnSettings::from_config(&config)?;
        let block_limit = config.memory.block_limit;

        let (core, archival, sessions) = match store {
            Some(store) => (
                CoreMemory::with_store(Arc::clone(&store), block_limit)?,
                ArchivalMemory::with_store(Arc::clone(&store), embedder)?,
                SessionRegistry::with_store(config.agent.model.clone(), store),
            ),
            None => (
                CoreMemory::new(block_limit),
                ArchivalMemory::new(embedder),
                SessionRegistry::new(config.agent.model.clone()),
            ),
        };

        for seed in &config.memory.blocks {
            let mut block = CoreBlock::new(
                seed.label.clone(),
                seed.content.clone(),
                seed.limit.unwrap_or(block_limit),
            )
            .read_only(seed.read_only);
            if let Some(ref d) = seed.description {
                block = block.with_description(d.clone());
            }
            if core.ensure_block(block)? {
                info!(label = %seed.label, "seeded core memory block");
            }
        }

        let core = Arc::new(core);
        let archival = Arc::new(archival);
        let sessions = Arc::new(sessions);
        let events = EventBus::default();
        let tools = Arc::new(ToolRegistry::with_timeouts(
            Duration::from_secs(config.agent.tool_timeout_secs),
            Duration::from_secs(config.agent.sandbox_timeout_secs),
        ));
        register_memory_tools(
            &tools,
            MemoryHandles {
                core: Arc::clone(&core),
                archival: Arc::clone(&archival),
                events: events.clone(),
            },
        )?;

        let orchestrator = Orchestrator::new(
            router.clone(),
            Arc::clone(&tools),
            Arc::clone(&core),
            Arc::clone(&archival),
            Arc::clone(&sessions),
            events.clone(),
            settings,
        );

        Ok(Self {
            config,
            orchestrator,
            tools,
            core,
            archival,
            sessions,
            router,
            events,
            embedder_ready: false,
        })
    }

    /// Add a tool next to the built-in memory tools.
    pub fn register_tool(&self, spec: ToolSpec, handler: Arc<dyn ToolHandler>) -> Result<()> {
        self.tools.register(spec, handler)
    }

    /// Run one turn as a stream of deltas, tool activity and a final message.
    pub fn run_turn(
        &self,
        session_id: &str,
        user_message: &str,
        model_override: Option<&str>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = TurnEvent> + Send + 'static {
        self.orchestrator
            .run_turn(session_id, user_message, model_override, cancel)
    }

    /// Run one turn to completion.
    pub async fn chat(&self, session_id: &str, user_message: &str) -> Result<Message> {
        self.orchestrator
            .complete_turn(session_id, user_message, None)
            .await
    }

    pub async fn chat_with_model(
        &self,
        session_id: &str,
        user_message: &str,
        model: &str,
    ) -> Result<Message> {
        self.orchestrator
            .complete_turn(session_id, user_message, Some(model))
            .await
    }

    pub fn history(&self, session_id: &str) -> Result<Vec<Message>> {
        self.sessions.history(session_id)
    }

    pub fn config(&self) -> &SubstrateConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn core_memory(&self) -> &Arc<CoreMemory> {
        &self.core
    }

    pub fn archival_memory(&self) -> &Arc<ArchivalMemory> {
        &self.archival
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    /// Subscribe to runtime events.
    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    /// Whether the embedding backend answered the startup probe.
    pub fn embedder_ready(&self) -> bool {
        self.embedder_ready
    }
}

/// One OpenAI-compatible provider per service that has an API key.
pub fn build_router(providers: &ProvidersConfig) -> ModelRouter {
    let timeout = Duration::from_secs(providers.request_timeout_secs);
    let mut router = ModelRouter::new().with_retry_policy(RetryPolicy {
        max_retries: providers.max_retries,
        base_delay: Duration::from_millis(providers.retry_base_delay_ms),
    });

    let configured = [
        (
            providers.openrouter_api_key.as_ref(),
            providers.openrouter_base_url.as_ref(),
            OpenAiCompatProvider::openrouter as fn(String) -> OpenAiCompatProvider,
        ),
        (
            providers.grok_api_key.as_ref(),
            providers.grok_base_url.as_ref(),
            OpenAiCompatProvider::grok,
        ),
        (
            providers.openai_api_key.as_ref(),
            providers.openai_base_url.as_ref(),
            OpenAiCompatProvider::openai,
        ),
    ];
    for (key, base_url, make) in configured {
        let Some(key) = key.filter(|k| !k.is_empty()) else {
            continue;
        };
        let mut provider = make(key.clone()).with_timeout(timeout);
        if let Some(url) = base_url {
            provider = provider.with_base_url(url.clone());
        }
        router.add_provider(Arc::new(provider));
    }
    router
}

/// The configured embedding backend, or `None` for "none", unknown names,
/// and OpenAI without a key.
pub fn build_embedder(
    embedding: &EmbeddingConfig,
    providers: &ProvidersConfig,
) -> Option<Arc<dyn EmbeddingProvider>> {
    match embedding.provider.as_str() {
        "ollama" => {
            let mut e = OllamaEmbedding::new(&embedding.model).with_dimensions(embedding.dimensions);
            if let Some(ref url) = embedding.base_url {
                e = e.with_base_url(url.clone());
            }
            Some(Arc::new(e))
        }
        "openai" => {
            let Some(key) = providers.openai_api_key.clone() else {
                warn!("openai embeddings need OPENAI_API_KEY; archival search disabled");
                return None;
            };
            let mut e = OpenAiEmbedding::new(key)
                .with_model(embedding.model.clone(), embedding.dimensions);
            if let Some(ref url) = embedding.base_url {
                e = e.with_base_url(url.clone());
            }
            Some(Arc::new(e))
        }
        "none" => None,
        other => {
            warn!(provider = other, "unknown embedding provider; archival search disabled");
            None
        }
    }
}

/// `memory.db_path`, resolved under `~/.substrate/` when relative.
pub fn resolve_db_path(config: &SubstrateConfig) -> PathBuf {
    let path = &config.memory.db_path;
    if path.is_absolute() {
        return path.clone();
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".substrate")
        .join(path)
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("model", &self.config.agent.model)
            .field("tools", &self.tools.len())
            .field("blocks", &self.core.len())
            .field("archival", &self.archival.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
