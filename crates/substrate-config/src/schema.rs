use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Root configuration — maps to `substrate.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubstrateConfig {
    pub agent: AgentConfig,
    pub memory: MemoryConfig,
    pub providers: ProvidersConfig,
    pub logging: LoggingConfig,
}

// ── Agent ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Primary model identifier in "provider/model" form, e.g. "openrouter/x-ai/grok-4".
    pub model: String,
    /// Fallback model for when the primary provider is unavailable.
    pub fallback_model: Option<String>,
    /// System preamble placed at the top of every prompt.
    pub system_prompt: Option<String>,
    /// Path to a file containing the system preamble (overrides `system_prompt`).
    pub system_prompt_file: Option<PathBuf>,
    /// Maximum tokens per model response.
    pub max_tokens: u32,
    /// Temperature (0.0 - 2.0).
    pub temperature: f32,
    /// Maximum tool-dispatch cycles per turn before the turn is forced to finish.
    pub max_tool_depth: u32,
    /// End the turn with `MaxIterationsExceeded` instead of a depth notice.
    pub fail_on_max_depth: bool,
    /// Number of archival entries recalled into each prompt.
    pub archival_top_k: usize,
    /// Timeout for a single tool call.
    pub tool_timeout_secs: u64,
    /// Tighter ceiling applied to sandboxed-execution tools.
    pub sandbox_timeout_secs: u64,
    /// Longer tool outputs are truncated (head + tail) before entering history. 0 = no limit.
    pub tool_result_max_chars: usize,
    /// Most recent committed messages sent to the model each call. Older ones stay
    /// in the session's stored history. 0 = send everything.
    pub history_limit: usize,
    /// Request streaming responses from the model.
    pub stream: bool,
    /// Store each completed exchange in archival memory as an interaction moment.
    pub auto_archive: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "openrouter/x-ai/grok-4".into(),
            fallback_model: None,
            system_prompt: None,
            system_prompt_file: None,
            max_tokens: 4096,
            temperature: 0.7,
            max_tool_depth: 10,
            fail_on_max_depth: false,
            archival_top_k: 5,
            tool_timeout_secs: 60,
            sandbox_timeout_secs: 30,
            tool_result_max_chars: 16_000,
            history_limit: 40,
            stream: true,
            auto_archive: false,
        }
    }
}

// ── Memory ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// Default character limit for core memory blocks.
    pub block_limit: usize,
    /// Core memory blocks created at agent initialization (if not already persisted).
    pub blocks: Vec<BlockSeed>,
    /// Entries below this importance are left out of prompt recall.
    pub archival_min_importance: Option<u8>,
    pub embedding: EmbeddingConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("substrate.db"),
            block_limit: 2000,
            blocks: vec![
                BlockSeed {
                    label: "persona".into(),
                    content: "I am a helpful assistant with a persistent memory.".into(),
                    description: Some("Who I am and how I behave".into()),
                    read_only: false,
                    limit: None,
                },
                BlockSeed {
                    label: "human".into(),
                    content: String::new(),
                    description: Some("What I know about the person I talk to".into()),
                    read_only: false,
                    limit: None,
                },
            ],
            archival_min_importance: None,
            embedding: EmbeddingConfig::default(),
        }
    }
}

/// Initial definition of a core memory block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSeed {
    pub label: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    /// Overrides `memory.block_limit` for this block.
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// "ollama", "openai", or "none".
    pub provider: String,
    pub model: String,
    /// Endpoint override (defaults to the provider's public endpoint).
    pub base_url: Option<String>,
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".into(),
            model: "nomic-embed-text".into(),
            base_url: None,
            dimensions: 768,
        }
    }
}

// ── Providers ──────────────────────────────────────────────────

/// Model provider credentials and transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// OpenRouter API key. Falls back to OPENROUTER_API_KEY.
    pub openrouter_api_key: Option<String>,
    pub openrouter_base_url: Option<String>,
    /// xAI Grok API key. Falls back to GROK_API_KEY, then XAI_API_KEY.
    pub grok_api_key: Option<String>,
    pub grok_base_url: Option<String>,
    /// OpenAI (or any OpenAI-compatible endpoint) API key. Falls back to OPENAI_API_KEY.
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    /// Per-request timeout for model calls.
    pub request_timeout_secs: u64,
    /// Retries for transient failures (429, 5xx, timeouts).
    pub max_retries: u32,
    /// Base delay for exponential backoff (doubles each retry).
    pub retry_base_delay_ms: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openrouter_api_key: None,
            openrouter_base_url: None,
            grok_api_key: None,
            grok_base_url: None,
            openai_api_key: None,
            openai_base_url: None,
            request_timeout_secs: 120,
            max_retries: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
    /// Log file path (None = stderr only).
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
            file: None,
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let icon = match self.severity {
            WarningSeverity::Error => "❌",
            WarningSeverity::Warning => "⚠️ ",
            WarningSeverity::Info => "💡",
        };
        write!(f, "{} {}: {}", icon, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl SubstrateConfig {
    /// Resolve the system preamble: file > inline > None.
    pub fn system_preamble(&self) -> substrate_core::Result<Option<String>> {
        if let Some(ref path) = self.agent.system_prompt_file {
            let text = std::fs::read_to_string(path).map_err(|e| {
                substrate_core::SubstrateError::Config(format!(
                    "failed to read system_prompt_file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            return Ok(Some(text));
        }
        Ok(self.agent.system_prompt.clone())
    }

    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Agent model ───
        let model = &self.agent.model;
        if model.is_empty() {
            warnings.push(ConfigWarning {
                field: "agent.model".into(),
                message: "model is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 'openrouter/x-ai/grok-4' or 'grok/grok-4'".into()),
            });
        } else if !model.contains('/') {
            warnings.push(ConfigWarning {
                field: "agent.model".into(),
                message: format!("model '{}' should be in 'provider/model' format", model),
                severity: WarningSeverity::Warning,
                hint: Some("Use 'openrouter/<vendor>/<model>', 'grok/<model>', or 'openai/<model>'".into()),
            });
        }

        // ── Temperature ───
        if self.agent.temperature < 0.0 || self.agent.temperature > 2.0 {
            warnings.push(ConfigWarning {
                field: "agent.temperature".into(),
                message: format!("temperature {} is out of range", self.agent.temperature),
                severity: WarningSeverity::Error,
                hint: Some("Temperature must be between 0.0 and 2.0".into()),
            });
        }

        // ── Max tokens ───
        if self.agent.max_tokens == 0 {
            warnings.push(ConfigWarning {
                field: "agent.max_tokens".into(),
                message: "max_tokens is 0, the model cannot produce output".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 4096".into()),
            });
        }

        // ── Tool depth ───
        if self.agent.max_tool_depth == 0 {
            warnings.push(ConfigWarning {
                field: "agent.max_tool_depth".into(),
                message: "max_tool_depth is 0, tool calls can never run".into(),
                severity: WarningSeverity::Error,
                hint: Some("The default is 10".into()),
            });
        } else if self.agent.max_tool_depth > 50 {
            warnings.push(ConfigWarning {
                field: "agent.max_tool_depth".into(),
                message: format!("max_tool_depth {} allows very long tool loops", self.agent.max_tool_depth),
                severity: WarningSeverity::Warning,
                hint: Some("A single-digit or low double-digit bound is typical".into()),
            });
        }

        if self.agent.archival_top_k == 0 {
            warnings.push(ConfigWarning {
                field: "agent.archival_top_k".into(),
                message: "archival recall is disabled".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        if self.agent.tool_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "agent.tool_timeout_secs".into(),
                message: "tool timeout is 0, every tool call would time out".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 60".into()),
            });
        }

        // ── Memory blocks ───
        if self.memory.block_limit == 0 {
            warnings.push(ConfigWarning {
                field: "memory.block_limit".into(),
                message: "block_limit is 0, no block can hold content".into(),
                severity: WarningSeverity::Error,
                hint: Some("The default is 2000 characters".into()),
            });
        }
        let mut seen = HashSet::new();
        for (i, seed) in self.memory.blocks.iter().enumerate() {
            if seed.label.trim().is_empty() {
                warnings.push(ConfigWarning {
                    field: format!("memory.blocks[{i}].label"),
                    message: "block label is empty".into(),
                    severity: WarningSeverity::Error,
                    hint: None,
                });
            } else if !seen.insert(seed.label.as_str()) {
                warnings.push(ConfigWarning {
                    field: format!("memory.blocks[{i}].label"),
                    message: format!("duplicate block label '{}'", seed.label),
                    severity: WarningSeverity::Error,
                    hint: Some("Block labels must be unique".into()),
                });
            }
            let limit = seed.limit.unwrap_or(self.memory.block_limit);
            let len = seed.content.chars().count();
            if len > limit {
                warnings.push(ConfigWarning {
                    field: format!("memory.blocks[{i}].content"),
                    message: format!("initial content is {len} chars, limit is {limit}"),
                    severity: WarningSeverity::Error,
                    hint: Some("Shorten the seed or raise its limit".into()),
                });
            }
        }

        if let Some(min) = self.memory.archival_min_importance
            && !(1..=10).contains(&min)
        {
            warnings.push(ConfigWarning {
                field: "memory.archival_min_importance".into(),
                message: format!("importance threshold {min} is outside 1-10"),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }

        // ── Embedding provider ───
        let valid_embedders = ["ollama", "openai", "none"];
        if !valid_embedders.contains(&self.memory.embedding.provider.as_str()) {
            warnings.push(ConfigWarning {
                field: "memory.embedding.provider".into(),
                message: format!("unknown embedding provider '{}'", self.memory.embedding.provider),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_embedders.join(", "))),
            });
        } else if self.memory.embedding.provider == "none" {
            warnings.push(ConfigWarning {
                field: "memory.embedding.provider".into(),
                message: "no embedder configured, archival search will return nothing".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Provider credentials ───
        let providers = &self.providers;
        if providers.openrouter_api_key.is_none()
            && providers.grok_api_key.is_none()
            && providers.openai_api_key.is_none()
        {
            warnings.push(ConfigWarning {
                field: "providers".into(),
                message: "no model provider API key configured".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Set OPENROUTER_API_KEY, GROK_API_KEY, or OPENAI_API_KEY".into()),
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
