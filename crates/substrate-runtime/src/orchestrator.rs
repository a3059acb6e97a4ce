use chrono::Local;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use substrate_config::SubstrateConfig;
use substrate_core::{
    Event, EventBus, Message, Result, Role, SubstrateError, ToolCall, ToolContext, TurnState,
};
use substrate_llm::{LlmRequest, LlmResponse, ModelRouter, StreamChunk};
use substrate_memory::{ArchivalMemory, CoreMemory, MemoryCategory, NewEntry, SearchQuery};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::contamination::ContaminationDetector;
use crate::context::{
    DEFAULT_PREAMBLE, DEPTH_LIMIT_NOTICE, PromptContext, history_window, iteration_warning,
    render_system_prompt, truncate_tool_output,
};
use crate::registry::ToolRegistry;
use crate::session::{SessionLease, SessionRegistry};

/// Per-turn knobs, taken from `[agent]` and `[memory]`.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub model: String,
    pub fallback_model: Option<String>,
    pub preamble: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_tool_depth: u32,
    /// Fail the turn with `MaxIterationsExceeded` instead of finishing with a notice.
    pub fail_on_max_depth: bool,
    pub archival_top_k: usize,
    pub archival_min_importance: Option<u8>,
    pub tool_result_max_chars: usize,
    /// Committed messages sent with each model call. 0 = all of them.
    pub history_limit: usize,
    pub stream: bool,
    /// Store every finished exchange as an `interaction_moment` archival entry.
    pub auto_archive: bool,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            model: "openrouter/x-ai/grok-4".into(),
            fallback_model: None,
            preamble: DEFAULT_PREAMBLE.into(),
            max_tokens: 4096,
            temperature: 0.7,
            max_tool_depth: 10,
            fail_on_max_depth: false,
            archival_top_k: 5,
            archival_min_importance: None,
            tool_result_max_chars: 16_000,
            history_limit: 40,
            stream: true,
            auto_archive: false,
        }
    }
}

impl TurnSettings {
    pub fn from_config(config: &SubstrateConfig) -> Result<Self> {
        let agent = &config.agent;
        Ok(Self {
            model: agent.model.clone(),
            fallback_model: agent.fallback_model.clone(),
            preamble: config
                .system_preamble()?
                .unwrap_or_else(|| DEFAULT_PREAMBLE.to_string()),
            max_tokens: agent.max_tokens,
            temperature: agent.temperature,
            max_tool_depth: agent.max_tool_depth,
            fail_on_max_depth: agent.fail_on_max_depth,
            archival_top_k: agent.archival_top_k,
            archival_min_importance: config.memory.archival_min_importance,
            tool_result_max_chars: agent.tool_result_max_chars,
            history_limit: agent.history_limit,
            stream: agent.stream,
            auto_archive: agent.auto_archive,
        })
    }
}

/// A tool call starting or finishing inside a turn.
#[derive(Debug, Clone)]
pub enum ToolActivity {
    Started {
        call_id: String,
        tool_name: String,
        arguments: Value,
    },
    Finished {
        call_id: String,
        tool_name: String,
        success: bool,
    },
}

/// Items of the stream returned by [`Orchestrator::run_turn`].
///
/// A turn always ends with exactly one `Final` or one `Error`.
#[derive(Debug)]
pub enum TurnEvent {
    TextDelta(String),
    ToolActivity(ToolActivity),
    Final(Message),
    Error(SubstrateError),
}

/// How one model call ended.
enum ModelStep {
    Answered(LlmResponse),
    Failed(SubstrateError),
}

/// Drives turns: builds context, calls the model, dispatches tools, commits.
#[derive(Clone)]
pub struct Orchestrator {
    router: ModelRouter,
    tools: Arc<ToolRegistry>,
    core: Arc<CoreMemory>,
    archival: Arc<ArchivalMemory>,
    sessions: Arc<SessionRegistry>,
    events: EventBus,
    settings: TurnSettings,
}

impl Orchestrator {
    pub fn new(
        router: ModelRouter,
        tools: Arc<ToolRegistry>,
        core: Arc<CoreMemory>,
        archival: Arc<ArchivalMemory>,
        sessions: Arc<SessionRegistry>,
        events: EventBus,
        settings: TurnSettings,
    ) -> Self {
        Self {
            router,
            tools,
            core,
            archival,
            sessions,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> &TurnSettings {
        &self.settings
    }

    /// Run one user turn as a stream of events.
    ///
    /// Nothing is committed to the session until the turn reaches DONE; a
    /// failed or cancelled turn (or one whose stream is dropped) leaves the
    /// session at its previous state and can simply be retried.
    pub fn run_turn(
        &self,
        session_id: &str,
        user_message: &str,
        model_override: Option<&str>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = TurnEvent> + Send + 'static {
        let this = self.clone();
        let session_id = session_id.to_string();
        let user_text = user_message.to_string();
        let model_override = model_override.map(String::from);

        async_stream::stream! {
            let turn_id = Uuid::new_v4();
            let mut lease = match this.sessions.acquire(&session_id) {
                Ok(lease) => lease,
                Err(e) => {
                    warn!(session = %session_id, error = %e, "turn rejected");
                    yield TurnEvent::Error(e);
                    return;
                }
            };
            lease.iteration = 0;
            let model = model_override.unwrap_or_else(|| lease.model.clone());
            let settings = &this.settings;

            info!(session = %session_id, %turn_id, model = %model, "turn started");
            this.events.publish(Event::TurnStarted {
                session_id: session_id.clone(),
                turn_id,
                model: model.clone(),
            });

            // ── BUILDING_CONTEXT ──
            let mut state = TurnState::BuildingContext;
            debug!(session = %session_id, %state);

            let recall = this.recall(&user_text);
            let recalled = tokio::select! {
                _ = cancel.cancelled() => None,
                hits = recall => Some(hits),
            };
            let Some(recalled) = recalled else {
                yield TurnEvent::Error(this.fail(&session_id, turn_id, SubstrateError::Cancelled));
                return;
            };

            let detector = match ContaminationDetector::new(this.tools.names()) {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!(error = %e, "contamination detector unavailable for this turn");
                    None
                }
            };
            let tool_specs = this.tools.specs();
            let ctx = ToolContext { session_id: session_id.clone() };

            // Messages produced this turn; committed only on DONE.
            let mut pending = vec![Message::text(Role::User, user_text.clone())];
            let mut cycles: u32 = 0;

            loop {
                // ── AWAITING_MODEL ──
                state = TurnState::AwaitingModel;
                debug!(session = %session_id, %state, cycles);
                this.events.publish(Event::ModelRequested {
                    session_id: session_id.clone(),
                    turn_id,
                    iteration: cycles,
                });

                let request = this.build_request(&lease, &pending, &recalled, &tool_specs, &model, cycles);

                let step = if settings.stream {
                    let opened = tokio::select! {
                        _ = cancel.cancelled() => Err(SubstrateError::Cancelled),
                        rx = this.router.stream(&request, settings.fallback_model.as_deref()) => rx,
                    };
                    match opened {
                        Err(e) => ModelStep::Failed(e),
                        Ok(mut rx) => loop {
                            let next = tokio::select! {
                                _ = cancel.cancelled() => None,
                                chunk = rx.recv() => Some(chunk),
                            };
                            match next {
                                // Dropping `rx` closes the connection.
                                None => break ModelStep::Failed(SubstrateError::Cancelled),
                                Some(Some(StreamChunk::TextDelta(t))) => yield TurnEvent::TextDelta(t),
                                Some(Some(StreamChunk::Done(resp))) => break ModelStep::Answered(resp),
                                Some(Some(StreamChunk::Error(e))) => break ModelStep::Failed(e),
                                Some(None) => {
                                    break ModelStep::Failed(SubstrateError::retryable(
                                        "model stream ended without a final response",
                                    ))
                                }
                            }
                        },
                    }
                } else {
                    let done = tokio::select! {
                        _ = cancel.cancelled() => Err(SubstrateError::Cancelled),
                        resp = this.router.complete(&request, settings.fallback_model.as_deref()) => resp,
                    };
                    match done {
                        Ok(resp) => ModelStep::Answered(resp),
                        Err(e) => ModelStep::Failed(e),
                    }
                };

                let response = match step {
                    ModelStep::Answered(resp) => resp,
                    ModelStep::Failed(e) => {
                        yield TurnEvent::Error(this.fail(&session_id, turn_id, e));
                        return;
                    }
                };
                debug!(
                    session = %session_id,
                    finish = ?response.finish_reason,
                    tool_calls = response.tool_calls().len(),
                    input_tokens = response.usage.input_tokens,
                    output_tokens = response.usage.output_tokens,
                    "model responded"
                );

                let calls: Vec<ToolCall> = response.tool_calls().to_vec();
                if calls.is_empty() {
                    let mut reply = response.message;
                    reply.role = Role::Assistant;
                    reply.metadata.insert("model".into(), Value::String(model.clone()));
                    if let Some(hit) = detector.as_ref().and_then(|d| d.inspect(&reply.text_content())) {
                        warn!(
                            session = %session_id,
                            %turn_id,
                            tool = ?hit.tool_name,
                            excerpt = %hit.excerpt,
                            "prompt contamination: tool call written as text"
                        );
                        reply.metadata.insert("prompt_contamination".into(), Value::Bool(true));
                        this.events.publish(Event::PromptContamination {
                            session_id: session_id.clone(),
                            turn_id,
                            tool_name: hit.tool_name,
                            excerpt: hit.excerpt,
                        });
                    }
                    pending.push(reply.clone());
                    match this.finish(&mut lease, pending, turn_id, cycles, false).await {
                        Ok(()) => yield TurnEvent::Final(reply),
                        Err(e) => yield TurnEvent::Error(this.fail(&session_id, turn_id, e)),
                    }
                    return;
                }

                // ── TOOL_DISPATCH ──
                state = TurnState::ToolDispatch;
                debug!(session = %session_id, %state, calls = calls.len());
                pending.push(Message::assistant_with_tool_calls(response.text(), calls.clone()));

                for call in &calls {
                    this.events.publish(Event::ToolDispatched {
                        session_id: session_id.clone(),
                        tool_name: call.tool_name.clone(),
                        tool_call_id: call.id.clone(),
                    });
                    yield TurnEvent::ToolActivity(ToolActivity::Started {
                        call_id: call.id.clone(),
                        tool_name: call.tool_name.clone(),
                        arguments: call.arguments.clone(),
                    });
                }

                let dispatched = tokio::select! {
                    _ = cancel.cancelled() => None,
                    results = this.tools.dispatch_all(&ctx, &calls) => Some(results),
                };
                let Some(results) = dispatched else {
                    yield TurnEvent::Error(this.fail(&session_id, turn_id, SubstrateError::Cancelled));
                    return;
                };

                for (call, result) in calls.iter().zip(results) {
                    this.events.publish(Event::ToolCompleted {
                        session_id: session_id.clone(),
                        tool_call_id: call.id.clone(),
                        success: result.success,
                    });
                    yield TurnEvent::ToolActivity(ToolActivity::Finished {
                        call_id: call.id.clone(),
                        tool_name: call.tool_name.clone(),
                        success: result.success,
                    });
                    let content = truncate_tool_output(&result.content, settings.tool_result_max_chars);
                    pending.push(Message::tool_result(&result, content));
                }

                cycles += 1;
                lease.iteration = cycles;

                if cycles >= settings.max_tool_depth {
                    warn!(session = %session_id, %turn_id, limit = settings.max_tool_depth, "maximum tool-call depth reached");
                    if settings.fail_on_max_depth {
                        let err = SubstrateError::MaxIterationsExceeded { limit: settings.max_tool_depth };
                        yield TurnEvent::Error(this.fail(&session_id, turn_id, err));
                        return;
                    }
                    let mut notice = Message::text(Role::Assistant, DEPTH_LIMIT_NOTICE);
                    notice.metadata.insert("model".into(), Value::String(model.clone()));
                    notice.metadata.insert("depth_limited".into(), Value::Bool(true));
                    pending.push(notice.clone());
                    match this.finish(&mut lease, pending, turn_id, cycles, true).await {
                        Ok(()) => yield TurnEvent::Final(notice),
                        Err(e) => yield TurnEvent::Error(this.fail(&session_id, turn_id, e)),
                    }
                    return;
                }
            }
        }
    }

    /// Run a turn to completion and return its final message.
    pub async fn complete_turn(
        &self,
        session_id: &str,
        user_message: &str,
        model_override: Option<&str>,
    ) -> Result<Message> {
        let stream = self.run_turn(session_id, user_message, model_override, CancellationToken::new());
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            match event {
                TurnEvent::Final(msg) => return Ok(msg),
                TurnEvent::Error(e) => return Err(e),
                TurnEvent::TextDelta(_) | TurnEvent::ToolActivity(_) => {}
            }
        }
        Err(SubstrateError::Cancelled)
    }

    /// Top-K archival entries for the user's message. Degrades to nothing.
    async fn recall(&self, user_text: &str) -> Vec<substrate_memory::ScoredEntry> {
        if self.settings.archival_top_k == 0 || self.archival.is_empty() {
            return Vec::new();
        }
        let mut query = SearchQuery::new(user_text, self.settings.archival_top_k);
        if let Some(min) = self.settings.archival_min_importance {
            query = query.min_importance(min);
        }
        self.archival.search(&query).await
    }

    fn build_request(
        &self,
        lease: &SessionLease,
        pending: &[Message],
        recalled: &[substrate_memory::ScoredEntry],
        tools: &[substrate_core::ToolSpec],
        model: &str,
        cycles: u32,
    ) -> LlmRequest {
        let blocks = self.core.list();
        let mut system = render_system_prompt(&PromptContext {
            preamble: &self.settings.preamble,
            blocks: &blocks,
            recalled,
            history_len: lease.messages.len(),
            archival_count: self.archival.len(),
            max_tool_depth: self.settings.max_tool_depth,
            now: Local::now(),
        });
        if let Some(warning) = iteration_warning(cycles, self.settings.max_tool_depth) {
            warn!(session = %lease.id, cycles, "turn nearing tool-call depth limit");
            system.push_str("\n\n");
            system.push_str(&warning);
        }

        let history = history_window(&lease.messages, self.settings.history_limit);
        if history.len() < lease.messages.len() {
            debug!(
                session = %lease.id,
                sent = history.len(),
                dropped = lease.messages.len() - history.len(),
                "history windowed"
            );
        }

        LlmRequest {
            model: model.to_string(),
            messages: history.iter().chain(pending).cloned().collect(),
            tools: tools.to_vec(),
            system: Some(system),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            stream: self.settings.stream,
        }
    }

    /// Commit the turn, archive it if configured, and announce completion.
    async fn finish(
        &self,
        lease: &mut SessionLease,
        pending: Vec<Message>,
        turn_id: Uuid,
        cycles: u32,
        depth_limited: bool,
    ) -> Result<()> {
        let exchange = if self.settings.auto_archive {
            let user = pending.first().map(Message::text_content).unwrap_or_default();
            let reply = pending.last().map(Message::text_content).unwrap_or_default();
            Some(format!("User: {user}\nAssistant: {reply}"))
        } else {
            None
        };

        self.sessions.commit(lease, pending)?;

        if let Some(content) = exchange {
            let entry = NewEntry::new(content, MemoryCategory::InteractionMoment, 5)
                .with_tags([lease.id.clone()]);
            match self.archival.insert(entry).await {
                Ok(e) => self.events.publish(Event::ArchivalInserted {
                    entry_id: e.id,
                    category: e.category.to_string(),
                }),
                Err(e) => warn!(session = %lease.id, error = %e, "failed to archive exchange"),
            }
        }

        info!(session = %lease.id, %turn_id, cycles, depth_limited, state = %TurnState::Done, "turn completed");
        self.events.publish(Event::TurnCompleted {
            session_id: lease.id.clone(),
            turn_id,
            iterations: cycles,
            depth_limited,
        });
        Ok(())
    }

    /// Log and announce a failed turn, handing the error back for the caller.
    fn fail(&self, session_id: &str, turn_id: Uuid, err: SubstrateError) -> SubstrateError {
        match err {
            SubstrateError::Cancelled => {
                warn!(session = %session_id, %turn_id, "turn cancelled")
            }
            ref e => warn!(session = %session_id, %turn_id, error = %e, state = %TurnState::Failed, "turn failed"),
        }
        self.events.publish(Event::TurnFailed {
            session_id: session_id.to_string(),
            turn_id,
            reason: err.to_string(),
        });
        err
    }
}
