#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use substrate_core::{Message, Role, SubstrateError};
    use substrate_llm::mock::{MockProvider, MockResponse};
    use substrate_llm::provider::{LlmRequest, StreamChunk};
    use substrate_llm::router::{ModelRouter, RetryPolicy};

    fn make_request(model: &str) -> LlmRequest {
        LlmRequest {
            model: model.to_string(),
            messages: vec![Message::text(Role::User, "Hello")],
            max_tokens: 100,
            temperature: 0.7,
            tools: vec![],
            system: None,
            stream: false,
        }
    }

    fn fast_router() -> ModelRouter {
        ModelRouter::new().with_retry_policy(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        })
    }

    // ── Router resolve / complete ──────────────────────────────

    #[tokio::test]
    async fn test_complete_with_prefix_resolution() {
        let mock = Arc::new(MockProvider::new("openrouter").with_response("Hello from mock!"));
        let mut router = fast_router();
        router.add_provider(mock.clone());

        let resp = router
            .complete(&make_request("openrouter/x-ai/grok-4"), None)
            .await
            .unwrap();
        assert_eq!(resp.text(), "Hello from mock!");
        // Only the prefix is stripped; the rest of the id is kept intact
        let recorded = mock.recorded_requests();
        assert_eq!(recorded.lock().unwrap()[0].model, "x-ai/grok-4");
    }

    #[tokio::test]
    async fn test_resolve_by_known_model_without_prefix() {
        let mut router = fast_router();
        router.add_provider(Arc::new(MockProvider::new("mock").with_response("hi")));
        let resp = router.complete(&make_request("mock-model"), None).await.unwrap();
        assert_eq!(resp.text(), "hi");
    }

    #[tokio::test]
    async fn test_unknown_model_is_unavailable() {
        let router = fast_router();
        let result = router.complete(&make_request("nonexistent/model"), None).await;
        assert!(matches!(result, Err(SubstrateError::ModelUnavailable(_))));
    }

    #[tokio::test]
    async fn test_failover_to_fallback_after_retries() {
        let primary = Arc::new(MockProvider::new("primary"));
        for _ in 0..4 {
            primary.queue(MockResponse::error("HTTP 500: Internal Server Error"));
        }
        let fallback = MockProvider::new("fallback").with_response("Fallback reply");

        let mut router = fast_router();
        router.add_provider(primary.clone());
        router.add_provider(Arc::new(fallback));

        let resp = router
            .complete(&make_request("primary/model"), Some("fallback/model"))
            .await
            .unwrap();
        assert_eq!(resp.text(), "Fallback reply");
        // One initial attempt plus three retries
        assert_eq!(primary.request_count(), 4);
    }

    #[tokio::test]
    async fn test_retryable_error_surfaces_without_fallback() {
        let primary = MockProvider::new("primary");
        for _ in 0..4 {
            primary.queue(MockResponse::error("HTTP 503"));
        }
        let mut router = fast_router();
        router.add_provider(Arc::new(primary));

        let err = router
            .complete(&make_request("primary/model"), None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    // ── Retry logic ────────────────────────────────────────────

    #[tokio::test]
    async fn test_retry_on_transient_error() {
        let mock = MockProvider::new("retry_test")
            .with_mock_response(MockResponse::error("HTTP 429: rate limited"))
            .with_response("success after retry");

        let mut router = fast_router();
        router.add_provider(Arc::new(mock));

        let resp = router
            .complete(&make_request("retry_test/model"), None)
            .await
            .unwrap();
        assert_eq!(resp.text(), "success after retry");
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried_or_failed_over() {
        let primary = Arc::new(
            MockProvider::new("no_retry")
                .with_mock_response(MockResponse::fatal("HTTP 401: invalid API key")),
        );
        let fallback = Arc::new(MockProvider::new("fallback").with_response("should not be used"));

        let mut router = fast_router();
        router.add_provider(primary.clone());
        router.add_provider(fallback.clone());

        let err = router
            .complete(&make_request("no_retry/model"), Some("fallback/model"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(primary.request_count(), 1);
        assert_eq!(fallback.request_count(), 0);
    }

    // ── Circuit breaker ────────────────────────────────────────

    #[tokio::test]
    async fn test_circuit_opens_after_consecutive_failures() {
        let flaky = Arc::new(MockProvider::new("flaky"));
        for _ in 0..5 {
            flaky.queue(MockResponse::fatal("HTTP 400: bad request"));
        }
        let mut router = fast_router();
        router.add_provider(flaky.clone());

        for _ in 0..5 {
            assert!(router.complete(&make_request("flaky/m"), None).await.is_err());
        }
        // Sixth request is short-circuited without reaching the provider
        let result = router.complete(&make_request("flaky/m"), None).await;
        assert!(matches!(result, Err(SubstrateError::ModelUnavailable(_))));
        assert_eq!(flaky.request_count(), 5);
    }

    #[tokio::test]
    async fn test_cancelled_recovery_attempt_does_not_disable_provider() {
        let flaky = Arc::new(MockProvider::new("flaky"));
        for _ in 0..5 {
            flaky.queue(MockResponse::fatal("HTTP 400: bad request"));
        }
        flaky.queue(MockResponse::text("slow").with_delay(Duration::from_secs(5)));
        flaky.queue(MockResponse::text("recovered"));
        let mut router = fast_router().with_circuit_cooldown(Duration::from_millis(50));
        router.add_provider(flaky.clone());

        for _ in 0..5 {
            assert!(router.complete(&make_request("flaky/m"), None).await.is_err());
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        // The recovery attempt is dropped before the provider answers
        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            router.complete(&make_request("flaky/m"), None),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(flaky.request_count(), 6);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let resp = router.complete(&make_request("flaky/m"), None).await.unwrap();
        assert_eq!(resp.text(), "recovered");

        // Closed again: requests flow without waiting for a cooldown
        flaky.queue(MockResponse::text("steady"));
        let resp = router.complete(&make_request("flaky/m"), None).await.unwrap();
        assert_eq!(resp.text(), "steady");
    }

    #[tokio::test]
    async fn test_open_circuit_routes_to_fallback() {
        let flaky = MockProvider::new("flaky");
        for _ in 0..5 {
            flaky.queue(MockResponse::fatal("HTTP 400"));
        }
        let fallback = MockProvider::new("fallback").with_response("from fallback");
        let mut router = fast_router();
        router.add_provider(Arc::new(flaky));
        router.add_provider(Arc::new(fallback));

        for _ in 0..5 {
            let _ = router.complete(&make_request("flaky/m"), Some("fallback/m")).await;
        }
        let resp = router
            .complete(&make_request("flaky/m"), Some("fallback/m"))
            .await
            .unwrap();
        assert_eq!(resp.text(), "from fallback");
    }

    // ── Stream ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_stream_basic() {
        let mock = MockProvider::new("stream_test").with_response("streamed text");
        let mut router = fast_router();
        router.add_provider(Arc::new(mock));

        let mut rx = router
            .stream(&make_request("stream_test/model"), None)
            .await
            .unwrap();

        let mut text = String::new();
        let mut finished = false;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                StreamChunk::TextDelta(t) => text.push_str(&t),
                StreamChunk::Done(resp) => {
                    assert_eq!(resp.text(), "streamed text");
                    finished = true;
                }
                StreamChunk::Error(e) => panic!("unexpected stream error: {e}"),
            }
        }
        assert_eq!(text, "streamed text");
        assert!(finished);
    }

    #[tokio::test]
    async fn test_stream_open_is_retried() {
        let mock = MockProvider::new("s")
            .with_mock_response(MockResponse::error("HTTP 502"))
            .with_response("ok");
        let mut router = fast_router();
        router.add_provider(Arc::new(mock));
        assert!(router.stream(&make_request("s/m"), None).await.is_ok());
    }

    // ── Request recording ──────────────────────────────────────

    #[tokio::test]
    async fn test_request_recording() {
        let mock = MockProvider::new("recorder").with_response("ok");
        let requests = mock.recorded_requests();

        let mut router = fast_router();
        router.add_provider(Arc::new(mock));

        router
            .complete(&make_request("recorder/model"), None)
            .await
            .unwrap();

        let recorded = requests.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].messages[0].text_content(), "Hello");
    }
}
