use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use substrate_config::{ConfigLoader, LoggingConfig, SubstrateConfig, WarningSeverity};
use substrate_core::SubstrateError;
use substrate_llm::{EmbeddingProvider, LlmProvider};
use substrate_memory::MemoryStore;
use substrate_runtime::{build_embedder, build_router, resolve_db_path};

mod chat;
mod memory;

/// Substrate — conversational agent with persistent memory
#[derive(Parser)]
#[command(name = "substrate", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to substrate.toml config file
    #[arg(short, long, global = true, env = "SUBSTRATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat in the terminal
    Chat {
        /// Session ID to resume (a new one is created if omitted)
        #[arg(short, long)]
        session: Option<String>,
        /// Model for this chat, overriding agent.model
        #[arg(short, long)]
        model: Option<String>,
    },
    /// Show the effective configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect core and archival memory
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
    /// Validate configuration and probe model and embedding providers
    Doctor,
    /// Show version and build info
    Version,
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// List core memory blocks with their capacity
    Blocks {
        #[arg(long)]
        json: bool,
    },
    /// Similarity search over archival memory
    Search {
        query: String,
        /// Maximum results
        #[arg(short = 'n', long, default_value = "5")]
        limit: usize,
        /// Only entries of this category (fact, emotion, insight, interaction_moment, preference, event)
        #[arg(long)]
        category: Option<String>,
        /// Only entries at or above this importance (1-10)
        #[arg(long)]
        min_importance: Option<u8>,
        /// Only entries carrying any of these tags
        #[arg(short, long)]
        tag: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Archival memory totals by category
    Stats {
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub async fn run(self) -> substrate_core::Result<()> {
        // Load config first so we can use it for the log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // --verbose > --quiet > --log-level > logging.level; RUST_LOG beats all of them
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(&config.logging.level)
        };
        init_tracing(&config.logging, log_level)?;

        match self.command {
            Commands::Chat { session, model } => {
                chat::cmd_chat(&config_loader, session, model).await
            }
            Commands::Config { json } => Self::cmd_config(&config, json),
            Commands::Memory { action } => memory::cmd_memory(config, action).await,
            Commands::Doctor => Self::cmd_doctor(&config, config_loader.path()).await,
            Commands::Version => Self::cmd_version(),
            Commands::Completions { shell } => Self::cmd_completions(shell),
        }
    }

    fn cmd_config(config: &SubstrateConfig, json: bool) -> substrate_core::Result<()> {
        let rendered = if json {
            serde_json::to_string_pretty(config)?
        } else {
            toml::to_string_pretty(config)
                .map_err(|e| SubstrateError::Config(format!("cannot render config: {e}")))?
        };
        println!("{rendered}");
        Ok(())
    }

    async fn cmd_doctor(
        config: &SubstrateConfig,
        config_path: &std::path::Path,
    ) -> substrate_core::Result<()> {
        println!("🩺 Substrate Doctor");
        println!("   config: {}", config_path.display());
        println!();

        let mut failures = 0usize;
        let mut warn_count = 0usize;

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    println!("  {w}");
                    if w.severity == WarningSeverity::Warning {
                        warn_count += 1;
                    }
                }
            }
            Err(e) => {
                println!("{e}");
                failures += 1;
            }
        }

        // ── Model providers ───
        let router = build_router(&config.providers);
        if router.providers().is_empty() {
            println!("  ❌ providers: no API key configured");
            println!("     ↳ set OPENROUTER_API_KEY, GROK_API_KEY or OPENAI_API_KEY");
            failures += 1;
        }
        for provider in router.providers() {
            match provider.health_check().await {
                Ok(()) => println!("  ✅ provider {}: reachable", provider.name()),
                Err(e) => {
                    println!("  ❌ provider {}: {e}", provider.name());
                    failures += 1;
                }
            }
        }
        if router.resolve(&config.agent.model).is_none() {
            println!("  ⚠️  agent.model '{}' has no configured provider", config.agent.model);
            warn_count += 1;
        }

        // ── Embedder ───
        match build_embedder(&config.memory.embedding, &config.providers) {
            None => {
                println!("  ⚠️  embedder: none, archival search disabled");
                warn_count += 1;
            }
            Some(embedder) => match embedder.embed_one("health check").await {
                Ok(v) if v.len() == config.memory.embedding.dimensions => {
                    println!("  ✅ embedder {}: {} dimensions", embedder.name(), v.len())
                }
                Ok(v) => {
                    println!(
                        "  ⚠️  embedder {}: returned {} dimensions, config says {}",
                        embedder.name(),
                        v.len(),
                        config.memory.embedding.dimensions
                    );
                    warn_count += 1;
                }
                Err(e) => {
                    println!("  ❌ embedder {}: {e}", embedder.name());
                    failures += 1;
                }
            },
        }

        // ── Store ───
        let db_path = resolve_db_path(config);
        match MemoryStore::open(&db_path) {
            Ok(_) => println!("  ✅ store: {}", db_path.display()),
            Err(e) => {
                println!("  ❌ store {}: {e}", db_path.display());
                failures += 1;
            }
        }

        println!();
        println!("  {failures} failures, ⚠️  {warn_count} warnings");
        Ok(())
    }

    fn cmd_version() -> substrate_core::Result<()> {
        println!("Substrate v{}", env!("CARGO_PKG_VERSION"));
        println!("   Target: {}", std::env::consts::ARCH);
        println!("   OS: {}", std::env::consts::OS);
        #[cfg(debug_assertions)]
        println!("   Profile: debug");
        #[cfg(not(debug_assertions))]
        println!("   Profile: release");
        Ok(())
    }

    fn cmd_completions(shell: Shell) -> substrate_core::Result<()> {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "substrate", &mut std::io::stdout());
        Ok(())
    }
}

/// Install the global subscriber. Logs go to stderr, or to `logging.file`
/// without colour when one is set.
fn init_tracing(logging: &LoggingConfig, level: &str) -> substrate_core::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (writer, ansi) = match logging.file {
        Some(ref path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi);
    let installed = match logging.format.as_str() {
        "json" => builder.json().with_target(true).try_init(),
        "compact" => builder.compact().with_target(false).try_init(),
        _ => builder.pretty().with_target(false).try_init(),
    };
    installed.map_err(|e| SubstrateError::Config(format!("failed to initialise logging: {e}")))
}

/// Truncate a string to `max` characters on one line, appending "..." if truncated.
fn truncate_output(s: &str, max: usize) -> String {
    let flat = s.replace('\n', " ");
    if flat.chars().count() <= max {
        flat
    } else {
        let head: String = flat.chars().take(max).collect();
        format!("{head}...")
    }
}
