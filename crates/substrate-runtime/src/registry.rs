use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use substrate_core::{
    Result, SessionId, SideEffectClass, SubstrateError, ToolCall, ToolContext, ToolHandler,
    ToolResult, ToolSpec,
};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SANDBOX_TIMEOUT: Duration = Duration::from_secs(30);

struct RegisteredTool {
    spec: ToolSpec,
    handler: Arc<dyn ToolHandler>,
}

/// Maps tool names to handlers and executes model-requested calls.
///
/// Every failure (unknown tool, bad arguments, handler error, timeout, panic)
/// comes back as a `ToolResult` with `success = false`; `dispatch` never errors.
pub struct ToolRegistry {
    /// Registration order is advertising order.
    tools: RwLock<Vec<Arc<RegisteredTool>>>,
    timeout: Duration,
    sandbox_timeout: Duration,
    /// Serializes memory-mutating calls per session. Entries live only while
    /// a call holds or waits on them.
    session_locks: DashMap<SessionId, Arc<TokioMutex<()>>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::with_timeouts(DEFAULT_TOOL_TIMEOUT, DEFAULT_SANDBOX_TIMEOUT)
    }

    /// `sandbox_timeout` is the ceiling for `Sandboxed` tools and is never
    /// looser than `timeout`.
    pub fn with_timeouts(timeout: Duration, sandbox_timeout: Duration) -> Self {
        Self {
            tools: RwLock::new(Vec::new()),
            timeout,
            sandbox_timeout: sandbox_timeout.min(timeout),
            session_locks: DashMap::new(),
        }
    }

    /// Register a tool. Names are unique.
    pub fn register(&self, spec: ToolSpec, handler: Arc<dyn ToolHandler>) -> Result<()> {
        let mut tools = self.tools.write();
        if tools.iter().any(|t| t.spec.name == spec.name) {
            return Err(SubstrateError::DuplicateTool(spec.name));
        }
        info!(tool = %spec.name, side_effect = ?spec.side_effect, "registered tool");
        tools.push(Arc::new(RegisteredTool { spec, handler }));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().iter().any(|t| t.spec.name == name)
    }

    pub fn spec(&self, name: &str) -> Option<ToolSpec> {
        self.lookup(name).map(|t| t.spec.clone())
    }

    /// Specs of every registered tool, for advertising to the model.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.read().iter().map(|t| t.spec.clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.read().iter().map(|t| t.spec.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        self.tools.read().iter().find(|t| t.spec.name == name).cloned()
    }

    fn session_lock(&self, session_id: &str) -> Arc<TokioMutex<()>> {
        Arc::clone(
            &self.session_locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(TokioMutex::new(()))),
        )
    }

    fn release_session_lock(&self, session_id: &str) {
        self.session_locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Execute one call.
    pub async fn dispatch(&self, ctx: &ToolContext, call: &ToolCall) -> ToolResult {
        let Some(tool) = self.lookup(&call.tool_name) else {
            warn!(tool = %call.tool_name, "model requested an unknown tool");
            let err = SubstrateError::ToolNotFound(call.tool_name.clone());
            return ToolResult::error(&call.id, err.to_string());
        };

        let args = match call.arguments {
            Value::Null => Value::Object(Default::default()),
            ref v => v.clone(),
        };
        if let Err(e) = validate_arguments(&tool.spec, &args) {
            debug!(tool = %call.tool_name, error = %e, "rejected tool arguments");
            return ToolResult::error(&call.id, e.to_string());
        }

        let serial = match tool.spec.side_effect {
            SideEffectClass::MutatesMemory => {
                Some(self.session_lock(&ctx.session_id).lock_owned().await)
            }
            _ => None,
        };

        let limit = match tool.spec.side_effect {
            SideEffectClass::Sandboxed => self.sandbox_timeout,
            _ => self.timeout,
        };

        // The JoinSet aborts the handler if this future is dropped, and turns
        // a panicking handler into a JoinError instead of unwinding into us.
        let mut set = JoinSet::new();
        let handler = Arc::clone(&tool.handler);
        let task_ctx = ctx.clone();
        set.spawn(async move { tokio::time::timeout(limit, handler.call(&task_ctx, args)).await });

        let outcome = match set.join_next().await {
            Some(Ok(Ok(Ok(data)))) => Ok(data),
            Some(Ok(Ok(Err(e)))) => Err(e),
            Some(Ok(Err(_elapsed))) => Err(SubstrateError::ToolTimeout {
                tool: call.tool_name.clone(),
                secs: limit.as_secs(),
            }),
            Some(Err(join_err)) => Err(SubstrateError::ToolExecution {
                tool: call.tool_name.clone(),
                reason: format!("handler aborted: {join_err}"),
            }),
            None => Err(SubstrateError::ToolExecution {
                tool: call.tool_name.clone(),
                reason: "handler did not run".into(),
            }),
        };
        if let Some(guard) = serial {
            drop(guard);
            self.release_session_lock(&ctx.session_id);
        }

        match outcome {
            Ok(data) => {
                debug!(tool = %call.tool_name, call_id = %call.id, "tool succeeded");
                ToolResult::ok(&call.id, data)
            }
            Err(e) => {
                warn!(tool = %call.tool_name, call_id = %call.id, error = %e, "tool failed");
                ToolResult::error(&call.id, e.to_string())
            }
        }
    }

    /// Execute a batch of calls and return one result per call, in call order.
    ///
    /// Runs of consecutive `Pure`/`ExternalIo` calls execute concurrently;
    /// `MutatesMemory` and `Sandboxed` calls run one at a time in order.
    pub async fn dispatch_all(&self, ctx: &ToolContext, calls: &[ToolCall]) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        let mut batch: Vec<&ToolCall> = Vec::new();

        for call in calls {
            if self.is_parallel_safe(&call.tool_name) {
                batch.push(call);
                continue;
            }
            if !batch.is_empty() {
                results.extend(self.run_batch(ctx, &batch).await);
                batch.clear();
            }
            results.push(self.dispatch(ctx, call).await);
        }
        if !batch.is_empty() {
            results.extend(self.run_batch(ctx, &batch).await);
        }
        results
    }

    async fn run_batch(&self, ctx: &ToolContext, batch: &[&ToolCall]) -> Vec<ToolResult> {
        if batch.len() > 1 {
            debug!(calls = batch.len(), "running parallel-safe tool calls concurrently");
        }
        join_all(batch.iter().map(|call| self.dispatch(ctx, call))).await
    }

    /// Unknown tools count as parallel-safe: they fail without side effects.
    fn is_parallel_safe(&self, name: &str) -> bool {
        self.lookup(name)
            .is_none_or(|t| t.spec.side_effect.is_parallel_safe())
    }
}

/// Check `args` against the `required`, `type` and `enum` constraints of the
/// spec's JSON schema. Unknown properties are allowed.
pub fn validate_arguments(spec: &ToolSpec, args: &Value) -> Result<()> {
    let invalid = |reason: String| SubstrateError::InvalidArguments {
        tool: spec.name.clone(),
        reason,
    };

    // Model output that did not parse is carried as the raw string
    if args.is_string() {
        return Err(invalid("arguments are not valid JSON".to_string()));
    }
    let Some(obj) = args.as_object() else {
        return Err(invalid(format!("expected a JSON object, got {}", type_name(args))));
    };

    if let Some(required) = spec.parameters.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if obj.get(field).is_none_or(Value::is_null) {
                return Err(invalid(format!("missing required field '{field}'")));
            }
        }
    }

    let Some(props) = spec.parameters.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    for (key, value) in obj {
        if value.is_null() {
            continue;
        }
        let Some(schema) = props.get(key) else {
            continue;
        };
        if let Some(expected) = schema.get("type").and_then(Value::as_str)
            && !type_matches(expected, value)
        {
            return Err(invalid(format!(
                "field '{key}' must be {expected}, got {}",
                type_name(value)
            )));
        }
        if let Some(allowed) = schema.get("enum").and_then(Value::as_array)
            && !allowed.contains(value)
        {
            let options: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
            return Err(invalid(format!(
                "field '{key}' must be one of {}, got {value}",
                options.join(", ")
            )));
        }
        if let (Some(items), Some(array)) = (schema.get("items"), value.as_array())
            && let Some(item_type) = items.get("type").and_then(Value::as_str)
            && let Some(bad) = array.iter().find(|v| !type_matches(item_type, v))
        {
            return Err(invalid(format!(
                "items of '{key}' must be {item_type}, got {}",
                type_name(bad)
            )));
        }
    }
    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ── Closure handlers ───────────────────────────────────────────

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(ToolContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value> {
        (self.0)(ctx.clone(), args).await
    }
}

/// Wrap an async closure as a tool handler.
///
/// ```
/// use substrate_runtime::registry::tool_fn;
/// let echo = tool_fn(|_ctx, args| async move { Ok(args) });
/// ```
pub fn tool_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
