use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use substrate_core::SubstrateError;
use tracing::{info, warn};

use crate::schema::SubstrateConfig;

/// Loads and optionally hot-reloads the Substrate configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<SubstrateConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > SUBSTRATE_CONFIG env > ~/.substrate/substrate.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("SUBSTRATE_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".substrate")
            .join("substrate.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> substrate_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::parse_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            SubstrateConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(SubstrateError::Config(e));
            }
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Build a loader around an in-memory config (no file backing).
    pub fn from_config(config: SubstrateConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path: PathBuf::new(),
        }
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> SubstrateConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<SubstrateConfig>> {
        Arc::clone(&self.config)
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    fn parse_file(path: &Path) -> substrate_core::Result<SubstrateConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<SubstrateConfig>(&raw).map_err(|e| {
            SubstrateError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Apply env var overrides (SUBSTRATE_AGENT_MODEL, SUBSTRATE_LOG_LEVEL, etc.)
    pub fn apply_env_overrides(mut config: SubstrateConfig) -> SubstrateConfig {
        if let Ok(v) = std::env::var("SUBSTRATE_AGENT_MODEL") {
            config.agent.model = v;
        }
        if let Ok(v) = std::env::var("SUBSTRATE_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("SUBSTRATE_MAX_TOOL_DEPTH") {
            if let Ok(depth) = v.parse::<u32>() {
                config.agent.max_tool_depth = depth;
            }
        }
        if let Ok(v) = std::env::var("SUBSTRATE_DB_PATH") {
            config.memory.db_path = PathBuf::from(v);
        }
        // API keys: config file takes priority, env is the fallback.
        if config.providers.openrouter_api_key.is_none() {
            if let Ok(v) = std::env::var("OPENROUTER_API_KEY") {
                config.providers.openrouter_api_key = Some(v);
            }
        }
        if config.providers.grok_api_key.is_none() {
            if let Ok(v) = std::env::var("GROK_API_KEY").or_else(|_| std::env::var("XAI_API_KEY")) {
                config.providers.grok_api_key = Some(v);
            }
        }
        if config.providers.openai_api_key.is_none() {
            if let Ok(v) = std::env::var("OPENAI_API_KEY") {
                config.providers.openai_api_key = Some(v);
            }
        }
        config
    }

    /// Reload the config from disk.
    pub fn reload(&self) -> substrate_core::Result<()> {
        if !self.config_path.exists() {
            return Err(SubstrateError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::apply_env_overrides(Self::parse_file(&self.config_path)?);
        new_config.validate().map_err(SubstrateError::Config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that reloads the config when the file changes.
    /// The returned watcher must be kept alive for watching to continue.
    pub fn watch(&self) -> substrate_core::Result<notify::RecommendedWatcher> {
        let config = Arc::clone(&self.config);
        let config_path = self.config_path.clone();

        info!(?config_path, "starting config file watcher");

        let path_for_event = config_path.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        return;
                    }
                    let is_our_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == path_for_event.file_name());
                    if !is_our_file {
                        return;
                    }

                    info!("config file changed, reloading");
                    match ConfigLoader::parse_file(&path_for_event) {
                        Ok(new_config) => {
                            let new_config = ConfigLoader::apply_env_overrides(new_config);
                            if let Err(e) = new_config.validate() {
                                warn!(error = %e, "reloaded config is invalid, keeping current config");
                                return;
                            }
                            *config.write() = new_config;
                            info!("configuration hot-reloaded successfully");
                        }
                        Err(e) => {
                            warn!(error = %e, "config file has errors, keeping current config");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "file watcher error");
                }
            },
        )
        .map_err(|e| SubstrateError::Config(format!("failed to create file watcher: {}", e)))?;

        // Watch the parent directory (some editors create temp files + rename)
        let watch_path = self
            .config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| {
                SubstrateError::Config(format!("failed to watch config directory: {}", e))
            })?;

        Ok(watcher)
    }
}
