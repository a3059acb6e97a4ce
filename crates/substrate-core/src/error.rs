use thiserror::Error;

/// Unified error type for the entire Substrate runtime.
#[derive(Error, Debug)]
pub enum SubstrateError {
    // ── Session / turn errors ──────────────────────────────────
    #[error("session busy: {0} already has a turn in flight")]
    SessionBusy(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("maximum tool-call depth exceeded ({limit} cycles)")]
    MaxIterationsExceeded { limit: u32 },

    #[error("turn cancelled")]
    Cancelled,

    // ── Model client errors ────────────────────────────────────
    #[error("transport failure ({}): {message}", transport_class(.retryable))]
    Transport { retryable: bool, message: String },

    #[error("model rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    // ── Tool errors ────────────────────────────────────────────
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool already registered: {0}")]
    DuplicateTool(String),

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("tool execution failed: {tool}: {reason}")]
    ToolExecution { tool: String, reason: String },

    #[error("tool timed out: {tool} after {secs}s")]
    ToolTimeout { tool: String, secs: u64 },

    // ── Memory errors ──────────────────────────────────────────
    #[error("memory block not found: {0}")]
    BlockNotFound(String),

    #[error("text not found in block {label}: {needle}")]
    NotFound { label: String, needle: String },

    #[error("memory block is read-only: {0}")]
    ReadOnlyBlock(String),

    #[error("memory block {label} would exceed its limit ({len} > {limit} chars)")]
    BlockLimitExceeded {
        label: String,
        len: usize,
        limit: usize,
    },

    #[error("memory block already exists: {0}")]
    DuplicateBlock(String),

    #[error("archival entry not found: {0}")]
    EntryNotFound(String),

    #[error("embedding backend error: {0}")]
    Embedding(String),

    #[error("memory error: {0}")]
    Memory(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl SubstrateError {
    /// Build a transport failure that is worth retrying.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            retryable: true,
            message: message.into(),
        }
    }

    /// Build a transport failure that must not be retried.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            retryable: false,
            message: message.into(),
        }
    }

    /// Whether the model client should retry the request that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                retryable: true,
                ..
            } | Self::RateLimited { .. }
        )
    }

    /// Classify an HTTP status from a model or embedding endpoint.
    /// 429 and 5xx are transient; everything else (auth, malformed request) is fatal.
    pub fn from_http_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {status}: {body}");
        match status {
            429 | 500..=599 => Self::retryable(message),
            _ => Self::fatal(message),
        }
    }
}

fn transport_class(retryable: &bool) -> &'static str {
    if *retryable { "retryable" } else { "fatal" }
}

pub type Result<T> = std::result::Result<T, SubstrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert!(SubstrateError::from_http_status(429, "slow down").is_retryable());
        assert!(SubstrateError::from_http_status(503, "overloaded").is_retryable());
        assert!(!SubstrateError::from_http_status(401, "bad key").is_retryable());
        assert!(!SubstrateError::from_http_status(400, "bad body").is_retryable());
    }

    #[test]
    fn test_rate_limited_is_retryable() {
        let err = SubstrateError::RateLimited { retry_after_secs: 3 };
        assert!(err.is_retryable());
        assert!(err.to_string().contains('3'));
    }

    #[test]
    fn test_transport_display_names_class() {
        let err = SubstrateError::fatal("HTTP 401: unauthorized");
        assert!(err.to_string().contains("fatal"));
        let err = SubstrateError::retryable("timed out");
        assert!(err.to_string().contains("retryable"));
    }

    #[test]
    fn test_memory_errors_display() {
        let err = SubstrateError::NotFound {
            label: "persona".into(),
            needle: "grumpy".into(),
        };
        let s = err.to_string();
        assert!(s.contains("persona"));
        assert!(s.contains("grumpy"));
        assert!(SubstrateError::ReadOnlyBlock("system".into())
            .to_string()
            .contains("read-only"));
    }
}
