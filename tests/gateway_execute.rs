use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use llm_gateway::gateway::usage::CallRecord;
use llm_gateway::gateway::{CallStatus, ErrorContext, FinishReason};
use llm_gateway::{
    Attribution, BoundedExecutor, ChatGateway, Clock, CompletionRequest, CompletionResponse,
    CompletionTransport, CredentialPool, CredentialState, ErrorClass, GatewayError, ManualClock,
    Message, NoopUsageSink, PoolConfig, ProviderError, RequestGateway, TokenUsage, TokioClock,
    UsageSink,
};

type Script = dyn Fn(&str, usize) -> Result<CompletionResponse, ProviderError> + Send + Sync;

#[derive(Debug, Clone)]
struct Call {
    secret: String,
    at: Instant,
}

/// Fake transport: answers according to `script(secret, call_index)` and
/// records when each call arrived on the gateway's clock.
struct ScriptedTransport {
    clock: Arc<dyn Clock>,
    delay: Duration,
    script: Box<Script>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    fn new(
        clock: Arc<dyn Clock>,
        script: impl Fn(&str, usize) -> Result<CompletionResponse, ProviderError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            clock,
            delay: Duration::ZERO,
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionTransport for ScriptedTransport {
    async fn complete(
        &self,
        secret: &str,
        _req: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                secret: secret.to_string(),
                at: self.clock.now(),
            });
            calls.len() - 1
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.script)(secret, index)
    }
}

#[derive(Default)]
struct CollectingSink {
    records: Mutex<Vec<CallRecord>>,
}

#[async_trait]
impl UsageSink for CollectingSink {
    async fn record(&self, record: CallRecord) {
        self.records.lock().unwrap().push(record);
    }
}

fn ok(text: &str) -> Result<CompletionResponse, ProviderError> {
    Ok(CompletionResponse {
        text: text.to_string(),
        usage: TokenUsage::new(5, 7),
        finish_reason: FinishReason::Stop,
    })
}

fn rate_limited() -> ProviderError {
    ProviderError::rate_limited(
        Some(Duration::from_secs(1)),
        ErrorContext::new().with_status(429),
    )
}

fn request(prompt: &str) -> CompletionRequest {
    CompletionRequest::new(
        "gpt-4o-mini",
        vec![Message::user(prompt)],
        Attribution::new("test"),
    )
}

fn build(
    transport: Arc<ScriptedTransport>,
    secrets: &[&str],
    clock: Arc<dyn Clock>,
    sink: Arc<dyn UsageSink>,
) -> RequestGateway {
    let pool =
        CredentialPool::from_secrets(secrets.iter().copied(), PoolConfig::default(), clock.clone())
            .unwrap();
    RequestGateway::builder(transport, Arc::new(pool))
        .clock(clock)
        .usage_sink(sink)
        .build()
}

#[tokio::test(start_paused = true)]
async fn concurrent_identical_requests_make_one_network_call() {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock);
    let transport = Arc::new(
        ScriptedTransport::new(clock.clone(), |_, _| ok("shared"))
            .with_delay(Duration::from_millis(200)),
    );
    let gateway = build(transport.clone(), &["k1"], clock, Arc::new(NoopUsageSink));

    let pending: Vec<_> = (0..10).map(|_| gateway.execute(request("same"))).collect();
    let results = futures::future::join_all(pending).await;

    assert_eq!(transport.count(), 1);
    for result in results {
        assert_eq!(result.unwrap().text, "shared");
    }
    assert_eq!(gateway.in_flight(), 0);

    // Settled result is now cached.
    assert_eq!(gateway.execute(request("same")).await.unwrap().text, "shared");
    assert_eq!(transport.count(), 1);
}

#[tokio::test]
async fn coalesced_callers_share_the_same_failure() {
    let clock = Arc::new(ManualClock::new());
    let transport = Arc::new(ScriptedTransport::new(clock.clone(), |_, _| {
        Err(rate_limited())
    }));
    let gateway = build(transport.clone(), &["k1"], clock, Arc::new(NoopUsageSink));

    let (a, b) = tokio::join!(
        gateway.execute(request("q")),
        gateway.execute(request("q"))
    );
    assert!(matches!(a, Err(GatewayError::Exhausted { .. })));
    assert!(matches!(b, Err(GatewayError::Exhausted { .. })));
    assert_eq!(transport.count(), 3);
    assert_eq!(gateway.in_flight(), 0);
    assert!(gateway.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cache_serves_within_ttl_and_refetches_after() {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock);
    let transport = Arc::new(ScriptedTransport::new(clock.clone(), |_, i| {
        ok(&format!("answer-{i}"))
    }));
    let gateway = build(transport.clone(), &["k1"], clock, Arc::new(NoopUsageSink));

    assert_eq!(gateway.execute(request("q")).await.unwrap().text, "answer-0");

    tokio::time::advance(Duration::from_secs(23 * 3600)).await;
    assert_eq!(gateway.execute(request("q")).await.unwrap().text, "answer-0");
    assert_eq!(transport.count(), 1);

    tokio::time::advance(Duration::from_secs(2 * 3600)).await;
    assert_eq!(gateway.execute(request("q")).await.unwrap().text, "answer-1");
    assert_eq!(transport.count(), 2);
}

#[tokio::test]
async fn rejected_credential_is_skipped_while_quarantined() {
    let clock = Arc::new(ManualClock::new());
    let transport = Arc::new(ScriptedTransport::new(clock.clone(), |secret, _| {
        if secret == "bad" {
            Err(ProviderError::invalid_credential(
                "invalid api key",
                ErrorContext::new().with_status(401),
            ))
        } else {
            ok("fine")
        }
    }));
    let gateway = build(
        transport.clone(),
        &["bad", "good"],
        clock.clone(),
        Arc::new(NoopUsageSink),
    );

    for i in 0..4 {
        let resp = gateway.execute(request(&format!("prompt {i}"))).await.unwrap();
        assert_eq!(resp.text, "fine");
    }

    let bad_calls = transport
        .calls()
        .iter()
        .filter(|c| c.secret == "bad")
        .count();
    assert_eq!(bad_calls, 1);
    assert!(clock.elapsed() < Duration::from_secs(300));

    let snapshot = gateway.pool().snapshot();
    assert_eq!(snapshot[0].state, CredentialState::Quarantined);
    assert_eq!(snapshot[1].state, CredentialState::Healthy);
    assert_eq!(snapshot[1].request_count, 4);
}

#[tokio::test]
async fn persistent_rate_limit_exhausts_after_three_attempts() {
    let clock = Arc::new(ManualClock::new());
    let origin = clock.origin();
    let transport = Arc::new(ScriptedTransport::new(clock.clone(), |_, _| {
        Err(rate_limited())
    }));
    let gateway = build(
        transport.clone(),
        &["only"],
        clock.clone(),
        Arc::new(NoopUsageSink),
    );

    let err = gateway.execute(request("q")).await.unwrap_err();
    match &err {
        GatewayError::Exhausted {
            attempts, class, ..
        } => {
            assert_eq!(*attempts, 3);
            assert_eq!(*class, ErrorClass::RateLimited);
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
    assert_eq!(err.provider_error().and_then(|e| e.http_status()), Some(429));

    // Each retry waits out the 180s cooldown rather than hammering the key.
    let offsets: Vec<u64> = transport
        .calls()
        .iter()
        .map(|c| c.at.duration_since(origin).as_secs())
        .collect();
    assert_eq!(offsets, vec![0, 180, 360]);

    let snapshot = gateway.pool().snapshot();
    assert_eq!(snapshot[0].state, CredentialState::Cooling);
    assert_eq!(snapshot[0].error_count, 3);
}

#[tokio::test]
async fn least_used_credential_is_chosen() {
    let clock = Arc::new(ManualClock::new());
    let transport = Arc::new(ScriptedTransport::new(clock.clone(), |_, _| ok("x")));
    let gateway = build(
        transport.clone(),
        &["a", "b", "c"],
        clock,
        Arc::new(NoopUsageSink),
    );

    for i in 0..6 {
        gateway.execute(request(&format!("p{i}"))).await.unwrap();
    }

    let secrets: Vec<String> = transport.calls().into_iter().map(|c| c.secret).collect();
    assert_eq!(secrets, vec!["a", "b", "c", "a", "b", "c"]);
    assert!(gateway
        .pool()
        .snapshot()
        .iter()
        .all(|s| s.request_count == 2));
}

#[tokio::test(start_paused = true)]
async fn dispatches_are_globally_spaced() {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock);
    let transport = Arc::new(ScriptedTransport::new(clock.clone(), |_, _| ok("x")));
    let gateway = build(
        transport.clone(),
        &["a", "b", "c", "d"],
        clock,
        Arc::new(NoopUsageSink),
    );

    let tasks = (0..4).map(|i| {
        let gateway = gateway.clone();
        move || async move { gateway.execute(request(&format!("p{i}"))).await }
    });
    let results = BoundedExecutor::execute(tasks, 4).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let mut times: Vec<Instant> = transport.calls().into_iter().map(|c| c.at).collect();
    times.sort();
    for pair in times.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= Duration::from_secs(3));
    }
}

#[tokio::test(start_paused = true)]
async fn dispatches_stay_globally_spaced_when_a_key_is_cooling() {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock);
    let transport = Arc::new(ScriptedTransport::new(clock.clone(), |_, _| ok("x")));
    let pool = CredentialPool::from_secrets(
        ["a", "b"],
        PoolConfig {
            cooldown: Duration::from_secs(7),
            ..PoolConfig::default()
        },
        clock.clone(),
    )
    .unwrap();
    pool.record_failure("key-1", ErrorClass::RateLimited);
    let gateway = RequestGateway::builder(transport.clone(), Arc::new(pool))
        .clock(clock)
        .usage_sink(Arc::new(NoopUsageSink))
        .build();

    let tasks = (0..4).map(|i| {
        let gateway = gateway.clone();
        move || async move { gateway.execute(request(&format!("p{i}"))).await }
    });
    let results = BoundedExecutor::execute(tasks, 4).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let mut times: Vec<Instant> = transport.calls().into_iter().map(|c| c.at).collect();
    assert_eq!(times.len(), 4);
    times.sort();
    for pair in times.windows(2) {
        assert!(
            pair[1].duration_since(pair[0]) >= Duration::from_secs(3),
            "dispatches {:?} apart",
            pair[1].duration_since(pair[0])
        );
    }
}

#[tokio::test]
async fn latency_is_measured_on_the_gateway_clock() {
    let clock = Arc::new(ManualClock::new());
    let script_clock = clock.clone();
    let transport = Arc::new(ScriptedTransport::new(clock.clone(), move |_, _| {
        script_clock.advance(Duration::from_millis(1500));
        ok("slow")
    }));
    let sink = Arc::new(CollectingSink::default());
    let gateway = build(transport, &["k1"], clock, sink.clone());

    gateway.execute(request("q")).await.unwrap();

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, CallStatus::Success);
    assert_eq!(records[0].latency_ms, 1500);
}

#[tokio::test]
async fn server_error_then_success_recovers() {
    let clock = Arc::new(ManualClock::new());
    let transport = Arc::new(ScriptedTransport::new(clock.clone(), |_, i| {
        if i == 0 {
            Err(ProviderError::server(
                503,
                "overloaded",
                ErrorContext::new().with_status(503),
            ))
        } else {
            ok("second time lucky")
        }
    }));
    let sink = Arc::new(CollectingSink::default());
    let gateway = build(transport.clone(), &["k1"], clock, sink.clone());

    let resp = gateway.execute(request("q")).await.unwrap();
    assert_eq!(resp.text, "second time lucky");
    gateway.execute(request("q")).await.unwrap();
    assert_eq!(transport.count(), 2);

    let snapshot = gateway.pool().snapshot();
    assert_eq!(snapshot[0].consecutive_errors, 0);
    assert_eq!(snapshot[0].error_count, 1);

    let records = sink.records.lock().unwrap();
    let statuses: Vec<CallStatus> = records.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![CallStatus::Error, CallStatus::Success, CallStatus::CacheHit]
    );
    let attempts: Vec<u32> = records.iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 0]);
    assert_eq!(records[0].error_class, Some(ErrorClass::ServerError));
    assert_eq!(records[1].prompt_tokens, 5);
    assert_eq!(records[1].credential_id.as_deref(), Some("key-1"));
}

#[tokio::test]
async fn configuration_failures_are_not_retried() {
    let clock = Arc::new(ManualClock::new());
    let transport = Arc::new(ScriptedTransport::new(clock.clone(), |_, _| {
        Err(ProviderError::config("Invalid API key format"))
    }));
    let gateway = build(transport.clone(), &["k1"], clock, Arc::new(NoopUsageSink));

    let err = gateway.execute(request("q")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Fatal(_)));
    assert_eq!(transport.count(), 1);
}

#[tokio::test]
async fn gateway_is_usable_through_the_chat_trait() {
    async fn ask(gateway: &dyn ChatGateway, prompt: &str) -> Result<String, GatewayError> {
        Ok(gateway.chat(request(prompt)).await?.text)
    }

    let clock = Arc::new(ManualClock::new());
    let transport = Arc::new(ScriptedTransport::new(clock.clone(), |_, _| ok("via trait")));
    let gateway = build(transport, &["k1"], clock, Arc::new(NoopUsageSink));

    assert_eq!(ask(&gateway, "hi").await.unwrap(), "via trait");
}

#[test]
fn empty_pool_is_rejected() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
    let err = CredentialPool::from_secrets(Vec::<String>::new(), PoolConfig::default(), clock)
        .unwrap_err();
    assert!(matches!(err, GatewayError::EmptyPool));
}
