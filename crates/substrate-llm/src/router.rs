use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use substrate_core::{Result, SubstrateError};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::provider::{LlmProvider, LlmRequest, LlmResponse, StreamChunk};

/// Default retry attempts for transient errors (429, 5xx, timeouts).
const MAX_RETRIES: u32 = 3;
/// Default base delay for exponential backoff (doubles each retry).
const BASE_DELAY_MS: u64 = 1000;
/// Upper bound on a server-supplied `Retry-After` wait.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Retry schedule for transient model failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: Duration::from_millis(BASE_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based). A rate-limit hint wins over backoff.
    fn delay_for(&self, attempt: u32, err: &SubstrateError) -> Duration {
        if let SubstrateError::RateLimited { retry_after_secs } = err {
            return Duration::from_secs(*retry_after_secs).min(MAX_RETRY_AFTER);
        }
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

// ── Circuit Breaker ────────────────────────────────────────────

/// Number of consecutive failures before opening the circuit.
const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
/// How long the circuit stays open before allowing a probe request.
const CIRCUIT_OPEN_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    /// Normal operation: requests flow through.
    Closed,
    /// Provider is failing: reject requests immediately.
    Open { since: Instant },
    /// A single probe request is in flight. If it never reports back
    /// (the caller dropped it), another probe is allowed after the cooldown.
    HalfOpen { since: Instant },
}

#[derive(Debug)]
struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
        }
    }

    fn allow_request(&mut self, cooldown: Duration) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { since } | CircuitState::HalfOpen { since } => {
                if since.elapsed() >= cooldown {
                    self.state = CircuitState::HalfOpen {
                        since: Instant::now(),
                    };
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= CIRCUIT_FAILURE_THRESHOLD
            || matches!(self.state, CircuitState::HalfOpen { .. })
        {
            self.state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, CircuitState::Open { .. })
    }
}

/// Routes model requests to the configured provider adapter, with retry,
/// circuit breaking and failover to a fallback model.
#[derive(Clone)]
pub struct ModelRouter {
    providers: Vec<Arc<dyn LlmProvider>>,
    /// Circuit breakers keyed by provider name.
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
    retry: RetryPolicy,
    circuit_cooldown: Duration,
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// How one provider attempt ended.
enum Attempt<T> {
    Done(Result<T>),
    /// Provider could not serve the request; try the fallback.
    Failover(Option<SubstrateError>),
}

impl ModelRouter {
    pub fn new() -> Self {
        Self {
            providers: vec![],
            breakers: Arc::new(Mutex::new(HashMap::new())),
            retry: RetryPolicy::default(),
            circuit_cooldown: CIRCUIT_OPEN_DURATION,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// How long an open circuit rejects requests before a probe is let through.
    pub fn with_circuit_cooldown(mut self, cooldown: Duration) -> Self {
        self.circuit_cooldown = cooldown;
        self
    }

    /// Register a provider.
    pub fn add_provider(&mut self, provider: Arc<dyn LlmProvider>) {
        let name = provider.name().to_string();
        info!(provider = %name, "registered LLM provider");
        self.breakers
            .lock()
            .entry(name)
            .or_insert_with(CircuitBreaker::new);
        self.providers.push(provider);
    }

    pub fn providers(&self) -> &[Arc<dyn LlmProvider>] {
        &self.providers
    }

    fn is_available(&self, provider_name: &str) -> bool {
        let mut breakers = self.breakers.lock();
        breakers
            .get_mut(provider_name)
            .map(|cb| cb.allow_request(self.circuit_cooldown))
            .unwrap_or(true)
    }

    fn record_success(&self, provider_name: &str) {
        if let Some(cb) = self.breakers.lock().get_mut(provider_name) {
            cb.record_success();
        }
    }

    fn record_failure(&self, provider_name: &str) {
        let mut breakers = self.breakers.lock();
        if let Some(cb) = breakers.get_mut(provider_name) {
            let was_open = cb.is_open();
            cb.record_failure();
            if !was_open && cb.is_open() {
                warn!(
                    provider = provider_name,
                    failures = cb.consecutive_failures,
                    "circuit breaker OPEN, provider disabled for {}s",
                    self.circuit_cooldown.as_secs()
                );
            }
        }
    }

    /// Find the provider for a model string like "openrouter/x-ai/grok-4".
    /// Returns the provider and the provider-local model name.
    pub fn resolve(&self, model: &str) -> Option<(Arc<dyn LlmProvider>, String)> {
        if let Some((prefix, model_name)) = model.split_once('/') {
            for p in &self.providers {
                if p.name().eq_ignore_ascii_case(prefix) {
                    return Some((Arc::clone(p), model_name.to_string()));
                }
            }
        }
        for p in &self.providers {
            if p.models().iter().any(|m| m == model) {
                return Some((Arc::clone(p), model.to_string()));
            }
        }
        None
    }

    /// Complete a request, with retry on transient errors and failover.
    pub async fn complete(
        &self,
        request: &LlmRequest,
        fallback_model: Option<&str>,
    ) -> Result<LlmResponse> {
        self.route(request, fallback_model, |p, req| async move { p.complete(&req).await })
            .await
    }

    /// Open a stream, with retry on transient connection errors and failover.
    /// Failures after the stream is open arrive as `StreamChunk::Error`.
    pub async fn stream(
        &self,
        request: &LlmRequest,
        fallback_model: Option<&str>,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        self.route(request, fallback_model, |p, req| async move { p.stream(&req).await })
            .await
    }

    async fn route<T, F, Fut>(
        &self,
        request: &LlmRequest,
        fallback_model: Option<&str>,
        call: F,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn LlmProvider>, LlmRequest) -> Fut + Copy,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let primary_err = match self.attempt(&request.model, request, call).await {
            Attempt::Done(result) => return result,
            Attempt::Failover(err) => err,
        };

        if let Some(fallback) = fallback_model.filter(|f| *f != request.model) {
            warn!(primary = %request.model, fallback, "failing over to fallback model");
            match self.attempt(fallback, request, call).await {
                Attempt::Done(result) => return result,
                Attempt::Failover(Some(e)) => return Err(e),
                Attempt::Failover(None) => {}
            }
        }

        Err(primary_err.unwrap_or_else(|| SubstrateError::ModelUnavailable(request.model.clone())))
    }

    /// Try one model: resolve, check the breaker, run with retries.
    async fn attempt<T, F, Fut>(&self, model: &str, request: &LlmRequest, call: F) -> Attempt<T>
    where
        F: Fn(Arc<dyn LlmProvider>, LlmRequest) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let Some((provider, model_name)) = self.resolve(model) else {
            warn!(model, "no provider registered for model");
            return Attempt::Failover(None);
        };
        let name = provider.name().to_string();
        if !self.is_available(&name) {
            warn!(provider = %name, "circuit breaker is OPEN, skipping provider");
            return Attempt::Failover(None);
        }

        let mut req = request.clone();
        req.model = model_name;

        let mut attempt = 0;
        loop {
            match call(Arc::clone(&provider), req.clone()).await {
                Ok(value) => {
                    self.record_success(&name);
                    return Attempt::Done(Ok(value));
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt, &e);
                    attempt += 1;
                    warn!(
                        provider = %name,
                        attempt,
                        max = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    self.record_failure(&name);
                    warn!(provider = %name, error = %e, "provider failed after retries");
                    return Attempt::Failover(Some(e));
                }
                Err(e) => {
                    // Fatal: auth or malformed request. No retry, no failover.
                    self.record_failure(&name);
                    return Attempt::Done(Err(e));
                }
            }
        }
    }
}
