#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use substrate_config::{BlockSeed, SubstrateConfig};
    use substrate_core::{
        Event, Message, MessageContent, Role, SideEffectClass, SubstrateError, ToolCall, ToolSpec,
    };
    use substrate_llm::{
        EmbeddingProvider, MockEmbedding, MockProvider, MockResponse, ModelRouter, RetryPolicy,
    };
    use substrate_memory::{MemoryCategory, MemoryStore, NewEntry};
    use substrate_runtime::context::DEPTH_LIMIT_NOTICE;
    use substrate_runtime::{Agent, ToolActivity, TurnEvent, tool_fn};
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;

    // ── Harness ────────────────────────────────────────────────

    fn config() -> SubstrateConfig {
        let mut config = SubstrateConfig::default();
        config.agent.model = "mock/m".into();
        config.agent.stream = false;
        config.memory.embedding.provider = "none".into();
        config.memory.blocks = vec![
            BlockSeed {
                label: "persona".into(),
                content: "Helpful".into(),
                description: None,
                read_only: false,
                limit: None,
            },
            BlockSeed {
                label: "rules".into(),
                content: "Be honest.".into(),
                description: None,
                read_only: true,
                limit: None,
            },
        ];
        config
    }

    fn router(mock: &Arc<MockProvider>) -> ModelRouter {
        let mut router = ModelRouter::new().with_retry_policy(RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
        });
        router.add_provider(mock.clone());
        router
    }

    fn agent_with(
        config: SubstrateConfig,
        mock: &Arc<MockProvider>,
        embedder: Option<Arc<MockEmbedding>>,
    ) -> Agent {
        let embedder = embedder.map(|e| e as Arc<dyn EmbeddingProvider>);
        Agent::with_parts(config, router(mock), embedder, None).unwrap()
    }

    fn call(id: &str, tool: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            tool_name: tool.into(),
            arguments: args,
        }
    }

    fn tool_payload(msg: &Message) -> (String, String, bool) {
        match &msg.content[0] {
            MessageContent::ToolResult {
                tool_call_id,
                content,
                success,
            } => (tool_call_id.clone(), content.clone(), *success),
            other => panic!("expected a tool result, got {other:?}"),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    async fn collect(agent: &Agent, session: &str, text: &str) -> Vec<TurnEvent> {
        agent
            .run_turn(session, text, None, CancellationToken::new())
            .collect()
            .await
    }

    // ── Plain turns ────────────────────────────────────────────

    mod plain_turns {
        use super::*;

        #[tokio::test]
        async fn test_single_answer_commits_two_messages() {
            let mock = Arc::new(MockProvider::new("mock").with_response("4"));
            let agent = agent_with(config(), &mock, None);
            let mut rx = agent.event_bus().subscribe();

            let reply = agent.chat("s1", "what's 2+2?").await.unwrap();
            assert_eq!(reply.text_content(), "4");
            assert_eq!(reply.role, Role::Assistant);

            let history = agent.history("s1").unwrap();
            assert_eq!(history.len(), 2);
            assert_eq!(history[0].role, Role::User);
            assert_eq!(history[0].text_content(), "what's 2+2?");
            assert_eq!(history[1].text_content(), "4");

            let requests = mock.recorded_requests();
            let requests = requests.lock().unwrap();
            assert_eq!(requests.len(), 1);
            let system = requests[0].system.clone().unwrap();
            assert!(system.contains("<persona EDITABLE"));
            assert!(system.contains("Helpful"));
            assert!(system.contains("<rules READ-ONLY"));
            assert_eq!(requests[0].tools.len(), 7);

            let events = drain(&mut rx);
            assert!(matches!(events.first(), Some(Event::TurnStarted { .. })));
            assert!(events.iter().any(|e| matches!(
                e,
                Event::TurnCompleted { iterations: 0, depth_limited: false, .. }
            )));
        }

        #[tokio::test]
        async fn test_history_carries_into_next_turn() {
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_response("Nice to meet you")
                    .with_response("You are Ada"),
            );
            let agent = agent_with(config(), &mock, None);
            agent.chat("s", "I am Ada").await.unwrap();
            agent.chat("s", "Who am I?").await.unwrap();

            let requests = mock.recorded_requests();
            let requests = requests.lock().unwrap();
            let texts: Vec<String> = requests[1].messages.iter().map(|m| m.text_content()).collect();
            assert_eq!(texts, vec!["I am Ada", "Nice to meet you", "Who am I?"]);
            assert_eq!(agent.history("s").unwrap().len(), 4);
        }

        #[tokio::test]
        async fn test_model_override_is_per_turn() {
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_response("a")
                    .with_response("b"),
            );
            let agent = agent_with(config(), &mock, None);
            agent.chat_with_model("s", "hi", "mock/other").await.unwrap();
            agent.chat("s", "again").await.unwrap();

            let requests = mock.recorded_requests();
            let requests = requests.lock().unwrap();
            assert_eq!(requests[0].model, "other");
            assert_eq!(requests[1].model, "m");
            let lease = agent.sessions().acquire("s").unwrap();
            assert_eq!(lease.model, "mock/m");
        }

        #[tokio::test]
        async fn test_streaming_deltas_add_up_to_final() {
            let mock = Arc::new(MockProvider::new("mock").with_response("Hello there friend"));
            let mut cfg = config();
            cfg.agent.stream = true;
            let agent = agent_with(cfg, &mock, None);

            let events = collect(&agent, "s", "hi").await;
            let deltas: Vec<String> = events
                .iter()
                .filter_map(|e| match e {
                    TurnEvent::TextDelta(t) => Some(t.clone()),
                    _ => None,
                })
                .collect();
            assert_eq!(deltas, vec!["Hello ", "there ", "friend"]);
            match events.last() {
                Some(TurnEvent::Final(msg)) => assert_eq!(msg.text_content(), deltas.concat()),
                other => panic!("expected Final, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_model_failure_leaves_history_unchanged() {
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_response("first")
                    .with_mock_response(MockResponse::fatal("invalid api key")),
            );
            let agent = agent_with(config(), &mock, None);
            let mut rx = agent.event_bus().subscribe();
            agent.chat("s", "one").await.unwrap();

            let err = agent.chat("s", "two").await.unwrap_err();
            assert!(!err.is_retryable());
            assert_eq!(agent.history("s").unwrap().len(), 2);
            assert!(drain(&mut rx).iter().any(|e| matches!(e, Event::TurnFailed { .. })));
        }

        #[tokio::test]
        async fn test_history_limit_windows_model_context() {
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_response("hello")
                    .with_mock_response(MockResponse::tool_calls(vec![call(
                        "l",
                        "core_memory_list",
                        json!({}),
                    )]))
                    .with_response("two blocks")
                    .with_response("third"),
            );
            let mut cfg = config();
            cfg.agent.history_limit = 2;
            let agent = agent_with(cfg, &mock, None);
            agent.chat("s", "hi").await.unwrap();
            agent.chat("s", "what do you hold?").await.unwrap();
            agent.chat("s", "again").await.unwrap();

            let requests = mock.recorded_requests();
            let requests = requests.lock().unwrap();
            // Messages of the running turn are always sent in full
            assert_eq!(requests[2].messages.len(), 5);
            // The last two committed messages would open on a tool result whose
            // call is cut off, so the window starts after it
            let texts: Vec<String> = requests[3].messages.iter().map(|m| m.text_content()).collect();
            assert_eq!(texts, vec!["two blocks", "again"]);
            // Stored history is never trimmed
            assert_eq!(agent.history("s").unwrap().len(), 8);
        }
    }

    // ── Tool dispatch ──────────────────────────────────────────

    mod tool_dispatch {
        use super::*;

        #[tokio::test]
        async fn test_archival_search_result_feeds_next_model_call() {
            let embedder = Arc::new(
                MockEmbedding::new(3)
                    .with_vector("x", vec![1.0, 0.0, 0.0])
                    .with_vector("x marks the spot", vec![1.0, 0.0, 0.0])
                    .with_vector("the letter x again", vec![1.0, 0.0, 0.0]),
            );
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_mock_response(MockResponse::tool_calls(vec![call(
                        "c1",
                        "archival_memory_search",
                        json!({"query": "x", "limit": 3}),
                    )]))
                    .with_response("Found them"),
            );
            let agent = agent_with(config(), &mock, Some(embedder));
            let archival = agent.archival_memory();
            archival
                .insert(NewEntry::new("x marks the spot", MemoryCategory::Fact, 5))
                .await
                .unwrap();
            archival
                .insert(NewEntry::new("the letter x again", MemoryCategory::Event, 7))
                .await
                .unwrap();

            let reply = agent.chat("s", "what do you know about x?").await.unwrap();
            assert_eq!(reply.text_content(), "Found them");
            assert_eq!(mock.request_count(), 2);

            let history = agent.history("s").unwrap();
            assert_eq!(history.len(), 4);
            assert_eq!(history[1].tool_calls.len(), 1);
            assert_eq!(history[2].role, Role::Tool);
            let (id, content, success) = tool_payload(&history[2]);
            assert_eq!(id, "c1");
            assert!(success);
            let hits: Vec<serde_json::Value> = serde_json::from_str(&content).unwrap();
            assert_eq!(hits.len(), 2);
            assert_eq!(hits[0]["importance"], 7);
        }

        #[tokio::test]
        async fn test_embedder_outage_yields_empty_search_and_turn_proceeds() {
            let embedder = Arc::new(MockEmbedding::new(64));
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_mock_response(MockResponse::tool_calls(vec![call(
                        "c1",
                        "archival_memory_search",
                        json!({"query": "x"}),
                    )]))
                    .with_response("Nothing found"),
            );
            let agent = agent_with(config(), &mock, Some(Arc::clone(&embedder)));
            agent
                .archival_memory()
                .insert(NewEntry::new("x", MemoryCategory::Fact, 5))
                .await
                .unwrap();
            embedder.set_failing(true);

            let reply = agent.chat("s", "search x").await.unwrap();
            assert_eq!(reply.text_content(), "Nothing found");
            let (_, content, success) = tool_payload(&agent.history("s").unwrap()[2]);
            assert!(success);
            assert_eq!(content, "[]");
        }

        #[tokio::test]
        async fn test_every_call_answered_in_order_before_next_model_call() {
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_mock_response(MockResponse::tool_calls(vec![
                        call("a", "core_memory_get", json!({"label": "persona"})),
                        call("b", "no_such_tool", json!({})),
                        call("c", "core_memory_list", json!({})),
                        call("d", "core_memory_append", json!({"label": "persona", "content": " and kind"})),
                    ]))
                    .with_response("done"),
            );
            let agent = agent_with(config(), &mock, None);
            agent.chat("s", "go").await.unwrap();

            let requests = mock.recorded_requests();
            let requests = requests.lock().unwrap();
            let second = &requests[1].messages;
            assert_eq!(second.len(), 6);
            assert_eq!(second[1].tool_calls.len(), 4);
            let answered: Vec<(String, bool)> = second[2..]
                .iter()
                .map(|m| {
                    let (id, _, ok) = tool_payload(m);
                    (id, ok)
                })
                .collect();
            assert_eq!(
                answered,
                vec![
                    ("a".to_string(), true),
                    ("b".to_string(), false),
                    ("c".to_string(), true),
                    ("d".to_string(), true),
                ]
            );
            let (_, unknown, _) = tool_payload(&second[3]);
            assert!(unknown.contains("tool not found: no_such_tool"));
            assert_eq!(agent.core_memory().get("persona").unwrap().content, "Helpful and kind");
        }

        #[tokio::test]
        async fn test_failing_tool_becomes_error_result() {
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_mock_response(MockResponse::tool_calls(vec![call("x", "explode", json!({}))]))
                    .with_response("recovered"),
            );
            let agent = agent_with(config(), &mock, None);
            agent
                .register_tool(
                    ToolSpec::new("explode", "always fails", json!({"type": "object"}), SideEffectClass::Pure),
                    tool_fn(|_ctx, _args| async move {
                        Err(SubstrateError::ToolExecution {
                            tool: "explode".into(),
                            reason: "boom".into(),
                        })
                    }),
                )
                .unwrap();

            let reply = agent.chat("s", "try it").await.unwrap();
            assert_eq!(reply.text_content(), "recovered");
            let (_, content, success) = tool_payload(&agent.history("s").unwrap()[2]);
            assert!(!success);
            assert!(content.contains("boom"));
        }

        #[tokio::test]
        async fn test_read_only_block_rejects_model_edit() {
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_mock_response(MockResponse::tool_calls(vec![call(
                        "r",
                        "core_memory_append",
                        json!({"label": "rules", "content": " Lie sometimes."}),
                    )]))
                    .with_response("ok"),
            );
            let agent = agent_with(config(), &mock, None);
            agent.chat("s", "change your rules").await.unwrap();

            let (_, content, success) = tool_payload(&agent.history("s").unwrap()[2]);
            assert!(!success);
            assert!(content.contains("read-only"));
            assert_eq!(agent.core_memory().get("rules").unwrap().content, "Be honest.");
        }

        #[tokio::test]
        async fn test_mutating_calls_never_overlap() {
            let in_flight = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let handler = {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                tool_fn(move |_ctx, _args| {
                    let in_flight = Arc::clone(&in_flight);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(json!("written"))
                    }
                })
            };
            let calls = (0..4).map(|i| call(&format!("w{i}"), "write", json!({}))).collect();
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_mock_response(MockResponse::tool_calls(calls))
                    .with_response("done"),
            );
            let agent = agent_with(config(), &mock, None);
            agent
                .register_tool(
                    ToolSpec::new("write", "", json!({"type": "object"}), SideEffectClass::MutatesMemory),
                    handler,
                )
                .unwrap();

            agent.chat("s", "write four times").await.unwrap();
            assert_eq!(peak.load(Ordering::SeqCst), 1);
            assert_eq!(agent.history("s").unwrap().len(), 7);
        }

        #[tokio::test]
        async fn test_pure_calls_run_concurrently() {
            let in_flight = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let handler = {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                tool_fn(move |_ctx, _args| {
                    let in_flight = Arc::clone(&in_flight);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(json!("read"))
                    }
                })
            };
            let calls = (0..3).map(|i| call(&format!("r{i}"), "read", json!({}))).collect();
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_mock_response(MockResponse::tool_calls(calls))
                    .with_response("done"),
            );
            let agent = agent_with(config(), &mock, None);
            agent
                .register_tool(
                    ToolSpec::new("read", "", json!({"type": "object"}), SideEffectClass::Pure),
                    handler,
                )
                .unwrap();

            agent.chat("s", "read three times").await.unwrap();
            assert!(peak.load(Ordering::SeqCst) > 1);
        }

        #[tokio::test]
        async fn test_tool_activity_brackets_each_call() {
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_mock_response(MockResponse::tool_calls(vec![call(
                        "g",
                        "core_memory_get",
                        json!({"label": "persona"}),
                    )]))
                    .with_response("ok"),
            );
            let agent = agent_with(config(), &mock, None);
            let events = collect(&agent, "s", "look").await;
            let activity: Vec<&ToolActivity> = events
                .iter()
                .filter_map(|e| match e {
                    TurnEvent::ToolActivity(a) => Some(a),
                    _ => None,
                })
                .collect();
            assert_eq!(activity.len(), 2);
            assert!(matches!(activity[0], ToolActivity::Started { call_id, .. } if call_id == "g"));
            assert!(matches!(activity[1], ToolActivity::Finished { success: true, .. }));
        }

        #[tokio::test]
        async fn test_invalid_arguments_never_reach_handlers() {
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_mock_response(MockResponse::tool_calls(vec![
                        call("bad", "core_memory_append", json!({"label": "persona"})),
                        call("raw", "core_memory_append", json!("{\"label\": \"persona\", \"content\": \" x")),
                    ]))
                    .with_response("sorry"),
            );
            let agent = agent_with(config(), &mock, None);
            let reply = agent.chat("s", "remember this").await.unwrap();
            assert_eq!(reply.text_content(), "sorry");

            let history = agent.history("s").unwrap();
            let (id, content, success) = tool_payload(&history[2]);
            assert_eq!(id, "bad");
            assert!(!success);
            assert!(content.contains("missing required field 'content'"));
            let (id, content, success) = tool_payload(&history[3]);
            assert_eq!(id, "raw");
            assert!(!success);
            assert!(content.contains("not valid JSON"));
            assert_eq!(agent.core_memory().get("persona").unwrap().content, "Helpful");
        }

        #[tokio::test]
        async fn test_hung_tool_times_out_and_turn_continues() {
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_mock_response(MockResponse::tool_calls(vec![call("h", "hang", json!({}))]))
                    .with_response("gave up waiting"),
            );
            let mut cfg = config();
            cfg.agent.tool_timeout_secs = 1;
            let agent = agent_with(cfg, &mock, None);
            agent
                .register_tool(
                    ToolSpec::new("hang", "never returns", json!({"type": "object"}), SideEffectClass::ExternalIo),
                    tool_fn(|_ctx, _args| async move {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(json!("late"))
                    }),
                )
                .unwrap();

            let reply = agent.chat("s", "wait for it").await.unwrap();
            assert_eq!(reply.text_content(), "gave up waiting");
            let (_, content, success) = tool_payload(&agent.history("s").unwrap()[2]);
            assert!(!success);
            assert!(content.contains("timed out"));
        }
    }

    // ── Depth limit ────────────────────────────────────────────

    mod depth_limit {
        use super::*;

        fn looping_mock(cycles: usize) -> Arc<MockProvider> {
            let mock = MockProvider::new("mock");
            for i in 0..cycles {
                mock.queue(MockResponse::tool_calls(vec![call(
                    &format!("c{i}"),
                    "core_memory_get",
                    json!({"label": "persona"}),
                )]));
            }
            mock.queue(MockResponse::text("never reached"));
            Arc::new(mock)
        }

        #[tokio::test]
        async fn test_turn_finishes_with_notice_at_limit() {
            let mock = looping_mock(5);
            let mut cfg = config();
            cfg.agent.max_tool_depth = 3;
            let agent = agent_with(cfg, &mock, None);
            let mut rx = agent.event_bus().subscribe();

            let reply = agent.chat("s", "loop").await.unwrap();
            assert_eq!(reply.text_content(), DEPTH_LIMIT_NOTICE);
            assert_eq!(mock.request_count(), 3);
            assert_eq!(agent.history("s").unwrap().len(), 8);
            assert!(drain(&mut rx).iter().any(|e| matches!(
                e,
                Event::TurnCompleted { iterations: 3, depth_limited: true, .. }
            )));
        }

        #[tokio::test]
        async fn test_warnings_escalate_near_limit() {
            let mock = looping_mock(5);
            let mut cfg = config();
            cfg.agent.max_tool_depth = 3;
            let agent = agent_with(cfg, &mock, None);
            agent.chat("s", "loop").await.unwrap();

            let requests = mock.recorded_requests();
            let requests = requests.lock().unwrap();
            let system = |i: usize| requests[i].system.clone().unwrap_or_default();
            assert!(!system(0).contains("WARNING"));
            assert!(system(1).contains("ITERATION WARNING"));
            assert!(system(2).contains("FINAL WARNING"));
        }

        #[tokio::test]
        async fn test_fail_on_max_depth() {
            let mock = looping_mock(5);
            let mut cfg = config();
            cfg.agent.max_tool_depth = 2;
            cfg.agent.fail_on_max_depth = true;
            let agent = agent_with(cfg, &mock, None);

            let err = agent.chat("s", "loop").await.unwrap_err();
            assert!(matches!(err, SubstrateError::MaxIterationsExceeded { limit: 2 }));
            assert!(agent.history("s").unwrap().is_empty());
        }
    }

    // ── Contamination ──────────────────────────────────────────

    mod contamination {
        use super::*;

        const FAKE_CALL: &str =
            r#"<tool_call>{"name": "core_memory_append", "arguments": {}}</tool_call>"#;

        #[tokio::test]
        async fn test_textual_tool_call_is_flagged() {
            let mock = Arc::new(MockProvider::new("mock").with_response(FAKE_CALL));
            let agent = agent_with(config(), &mock, None);
            let mut rx = agent.event_bus().subscribe();

            let reply = agent.chat("s", "remember that").await.unwrap();
            assert_eq!(reply.text_content(), FAKE_CALL);
            assert_eq!(reply.metadata.get("prompt_contamination"), Some(&json!(true)));
            assert!(drain(&mut rx).iter().any(|e| matches!(e, Event::PromptContamination { .. })));
            assert_eq!(mock.request_count(), 1);
        }

        #[tokio::test]
        async fn test_not_checked_when_structured_calls_present() {
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_mock_response(MockResponse {
                        text: FAKE_CALL.into(),
                        ..MockResponse::tool_calls(vec![call("c", "core_memory_list", json!({}))])
                    })
                    .with_response("clean"),
            );
            let agent = agent_with(config(), &mock, None);
            let mut rx = agent.event_bus().subscribe();

            agent.chat("s", "hi").await.unwrap();
            assert!(!drain(&mut rx).iter().any(|e| matches!(e, Event::PromptContamination { .. })));
        }
    }

    // ── Sessions ───────────────────────────────────────────────

    mod sessions {
        use super::*;

        #[tokio::test]
        async fn test_concurrent_turn_on_same_session_is_busy() {
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_mock_response(MockResponse::text("slow").with_delay(Duration::from_millis(300))),
            );
            let agent = Arc::new(agent_with(config(), &mock, None));

            let first = {
                let agent = Arc::clone(&agent);
                tokio::spawn(async move { agent.chat("s", "one").await })
            };
            tokio::time::sleep(Duration::from_millis(50)).await;

            let err = agent.chat("s", "two").await.unwrap_err();
            assert!(matches!(err, SubstrateError::SessionBusy(_)));
            assert!(first.await.unwrap().is_ok());
            assert_eq!(agent.history("s").unwrap().len(), 2);
            assert_eq!(mock.request_count(), 1);
        }

        #[tokio::test]
        async fn test_different_sessions_run_in_parallel() {
            let mock = Arc::new(MockProvider::new("mock"));
            for _ in 0..2 {
                mock.queue(MockResponse::text("ok").with_delay(Duration::from_millis(100)));
            }
            let agent = agent_with(config(), &mock, None);
            let (a, b) = tokio::join!(agent.chat("a", "hi"), agent.chat("b", "hi"));
            assert!(a.is_ok() && b.is_ok());
        }

        #[tokio::test]
        async fn test_cancelled_turn_commits_nothing() {
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_response("first")
                    .with_mock_response(MockResponse::text("late").with_delay(Duration::from_secs(5))),
            );
            let agent = agent_with(config(), &mock, None);
            agent.chat("s", "one").await.unwrap();

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                trigger.cancel();
            });
            let events: Vec<TurnEvent> = agent.run_turn("s", "two", None, cancel).collect().await;

            assert!(matches!(events.last(), Some(TurnEvent::Error(SubstrateError::Cancelled))));
            assert_eq!(agent.history("s").unwrap().len(), 2);
            assert!(!agent.sessions().is_busy("s"));
        }

        #[tokio::test]
        async fn test_cancel_mid_stream_commits_nothing() {
            let mock = Arc::new(MockProvider::new("mock").with_mock_response(
                MockResponse::text("one two three four five six seven eight")
                    .with_delay(Duration::from_millis(30)),
            ));
            let mut cfg = config();
            cfg.agent.stream = true;
            let agent = agent_with(cfg, &mock, None);

            let cancel = CancellationToken::new();
            let stream = agent.run_turn("s", "count", None, cancel.clone());
            futures::pin_mut!(stream);
            let mut deltas = 0;
            let mut last = None;
            while let Some(event) = stream.next().await {
                if matches!(event, TurnEvent::TextDelta(_)) {
                    deltas += 1;
                    cancel.cancel();
                }
                last = Some(event);
            }

            assert!(deltas < 8);
            assert!(matches!(last, Some(TurnEvent::Error(SubstrateError::Cancelled))));
            assert!(agent.history("s").unwrap().is_empty());
            assert!(!agent.sessions().is_busy("s"));
        }

        #[tokio::test]
        async fn test_cancel_mid_dispatch_commits_nothing() {
            let mock = Arc::new(
                MockProvider::new("mock")
                    .with_mock_response(MockResponse::tool_calls(vec![call("w", "wait", json!({}))]))
                    .with_response("never reached"),
            );
            let agent = agent_with(config(), &mock, None);
            let finished = Arc::new(AtomicUsize::new(0));
            let done = finished.clone();
            agent
                .register_tool(
                    ToolSpec::new("wait", "slow lookup", json!({"type": "object"}), SideEffectClass::Pure),
                    tool_fn(move |_ctx, _args| {
                        let done = done.clone();
                        async move {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            done.fetch_add(1, Ordering::SeqCst);
                            Ok(json!("found"))
                        }
                    }),
                )
                .unwrap();

            let cancel = CancellationToken::new();
            let stream = agent.run_turn("s", "look it up", None, cancel.clone());
            futures::pin_mut!(stream);
            let mut last = None;
            while let Some(event) = stream.next().await {
                if matches!(event, TurnEvent::ToolActivity(ToolActivity::Started { .. })) {
                    cancel.cancel();
                }
                last = Some(event);
            }

            assert!(matches!(last, Some(TurnEvent::Error(SubstrateError::Cancelled))));
            assert_eq!(mock.request_count(), 1);
            assert_eq!(finished.load(Ordering::SeqCst), 0);
            assert!(agent.history("s").unwrap().is_empty());
            assert!(!agent.sessions().is_busy("s"));
        }

        #[tokio::test]
        async fn test_history_survives_restart() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("substrate.db");
            {
                let mock = Arc::new(
                    MockProvider::new("mock")
                        .with_mock_response(MockResponse::tool_calls(vec![call(
                            "a",
                            "core_memory_append",
                            json!({"label": "persona", "content": " and curious"}),
                        )]))
                        .with_response("noted"),
                );
                let store = Arc::new(MemoryStore::open(&path).unwrap());
                let agent = Agent::with_parts(config(), router(&mock), None, Some(store)).unwrap();
                agent.chat("s", "be curious").await.unwrap();
            }

            let mock = Arc::new(MockProvider::new("mock").with_response("hello again"));
            let store = Arc::new(MemoryStore::open(&path).unwrap());
            let agent = Agent::with_parts(config(), router(&mock), None, Some(store)).unwrap();
            assert_eq!(
                agent.core_memory().get("persona").unwrap().content,
                "Helpful and curious"
            );
            agent.chat("s", "remember me?").await.unwrap();
            assert_eq!(agent.history("s").unwrap().len(), 6);
        }
    }

    // ── Auto-archive ───────────────────────────────────────────

    #[tokio::test]
    async fn test_auto_archive_stores_exchange() {
        let mock = Arc::new(MockProvider::new("mock").with_response("hello"));
        let mut cfg = config();
        cfg.agent.auto_archive = true;
        let agent = agent_with(cfg, &mock, None);
        let mut rx = agent.event_bus().subscribe();

        agent.chat("s1", "hi").await.unwrap();
        let id = drain(&mut rx)
            .into_iter()
            .find_map(|e| match e {
                Event::ArchivalInserted { entry_id, .. } => Some(entry_id),
                _ => None,
            })
            .expect("exchange archived");
        let entry = agent.archival_memory().get(id).unwrap();
        assert_eq!(entry.content, "User: hi\nAssistant: hello");
        assert_eq!(entry.category, MemoryCategory::InteractionMoment);
        assert!(entry.tags.contains("s1"));
    }
}
