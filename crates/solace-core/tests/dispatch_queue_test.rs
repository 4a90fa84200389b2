//! End-to-end tests for the dispatch engine against a scripted backend.

use async_trait::async_trait;
use solace_core::{
    CacheConfig, CircuitBreaker, CircuitBreakerConfig, CooldownManager, DispatchConfig,
    DispatchEngine, DispatchError, DispatchServices, GenerationBackend, RateLimitTracker,
    RateLimits, RequestPriority, ResponseCache, WireMessage,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Backend that logs the last message text of each call, optionally blocks on
/// a gate, and replays a script of canned outcomes (echo once exhausted).
struct ScriptedBackend {
    calls: Mutex<Vec<String>>,
    gate: Semaphore,
    script: Mutex<VecDeque<Result<String, DispatchError>>>,
}

impl ScriptedBackend {
    fn open() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            gate: Semaphore::new(Semaphore::MAX_PERMITS),
            script: Mutex::new(VecDeque::new()),
        })
    }

    fn gated() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
            script: Mutex::new(VecDeque::new()),
        })
    }

    fn push_outcome(&self, outcome: Result<String, DispatchError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn generate(&self, messages: &[WireMessage]) -> Result<String, DispatchError> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| DispatchError::Channel("gate closed".into()))?;
        permit.forget();
        let tag = messages
            .last()
            .map(|m| m.joined_text())
            .unwrap_or_default();
        self.calls.lock().unwrap().push(tag.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(format!("echo:{tag}")),
        }
    }
}

fn engine_with(backend: Arc<ScriptedBackend>, limits: RateLimits) -> DispatchEngine {
    let services = DispatchServices {
        tracker: RateLimitTracker::new(limits),
        breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
        cooldown: CooldownManager::with_min_delay(Duration::ZERO),
        cache: ResponseCache::new(CacheConfig::default()),
    };
    DispatchEngine::new(
        backend,
        services,
        DispatchConfig {
            insufficient_quota_backoff: Duration::from_millis(10),
        },
    )
}

fn generous_limits() -> RateLimits {
    RateLimits {
        rpm: 100,
        tpm: 250_000,
        rpd: 100,
    }
}

fn msg(text: &str) -> Vec<WireMessage> {
    vec![WireMessage::new("user", text)]
}

#[tokio::test]
async fn drains_by_priority_not_arrival_order() {
    let backend = ScriptedBackend::gated();
    let engine = engine_with(Arc::clone(&backend), generous_limits());

    // A gated warmup occupies the drain task while the rest pile up.
    let warmup = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.enqueue(msg("warmup"), RequestPriority::Critical).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut handles = Vec::new();
    for (text, priority) in [
        ("normal", RequestPriority::Normal),
        ("critical", RequestPriority::Critical),
        ("low", RequestPriority::Low),
        ("high", RequestPriority::High),
    ] {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.enqueue(msg(text), priority).await
        }));
        // Deterministic arrival order.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(engine.queue_len(), 4);

    backend.gate.add_permits(5);
    warmup.await.unwrap().unwrap();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(
        backend.calls(),
        vec!["warmup", "critical", "high", "normal", "low"]
    );
}

#[tokio::test]
async fn oversized_request_is_requeued_not_rejected() {
    let backend = ScriptedBackend::open();
    // TPM budget far below the request's estimated cost.
    let engine = engine_with(
        Arc::clone(&backend),
        RateLimits {
            rpm: 100,
            tpm: 50,
            rpd: 100,
        },
    );

    // ~1000 chars -> ~250 tokens, never fits 50 TPM.
    let big = "x".repeat(1000);
    let attempt = tokio::time::timeout(
        Duration::from_millis(200),
        engine.enqueue(msg(&big), RequestPriority::Normal),
    )
    .await;

    // Still waiting (requeued), not resolved with an error.
    assert!(attempt.is_err());
    // No window was consumed and the backend never saw the request.
    let state = engine.rate_limit_state();
    assert_eq!(state.rpm.used, 0);
    assert_eq!(state.rpd.used, 0);
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn exhausted_daily_quota_rejects_with_reset_hint() {
    let backend = ScriptedBackend::open();
    let engine = engine_with(
        Arc::clone(&backend),
        RateLimits {
            rpm: 100,
            tpm: 250_000,
            rpd: 1,
        },
    );

    engine
        .enqueue(msg("first"), RequestPriority::Normal)
        .await
        .unwrap();
    let err = engine
        .enqueue(msg("second"), RequestPriority::Normal)
        .await
        .unwrap_err();
    match err {
        DispatchError::QuotaExhausted(message) => {
            assert!(message.contains("daily limit reached (1/1)"), "{message}");
            assert!(message.contains("resets in"), "{message}");
        }
        other => panic!("expected QuotaExhausted, got {other:?}"),
    }
    assert_eq!(backend.calls().len(), 1);
}

#[tokio::test]
async fn rate_limit_failure_trips_the_breaker() {
    let backend = ScriptedBackend::open();
    backend.push_outcome(Err(DispatchError::RateLimited { retry_after: None }));
    let engine = engine_with(Arc::clone(&backend), generous_limits());

    let first = engine.enqueue(msg("first"), RequestPriority::Normal).await;
    assert!(matches!(first, Err(DispatchError::RateLimited { .. })));

    // Breaker is now open; the next request is rejected without a call.
    let second = engine.enqueue(msg("second"), RequestPriority::Normal).await;
    match second {
        Err(DispatchError::BreakerOpen(secs)) => assert!(secs > 0 && secs <= 60),
        other => panic!("expected BreakerOpen, got {other:?}"),
    }
    assert_eq!(backend.calls().len(), 1);
}

#[tokio::test]
async fn non_rate_limit_failure_leaves_breaker_closed() {
    let backend = ScriptedBackend::open();
    backend.push_outcome(Err(DispatchError::Api {
        status: 500,
        message: "server error".into(),
    }));
    let engine = engine_with(Arc::clone(&backend), generous_limits());

    let first = engine.enqueue(msg("first"), RequestPriority::Normal).await;
    assert!(matches!(first, Err(DispatchError::Api { .. })));
    engine
        .enqueue(msg("second"), RequestPriority::Normal)
        .await
        .unwrap();
    assert_eq!(backend.calls().len(), 2);
}

#[tokio::test]
async fn identical_context_hits_the_cache() {
    let backend = ScriptedBackend::open();
    let engine = engine_with(Arc::clone(&backend), generous_limits());

    let first = engine
        .request(msg("how are you"), RequestPriority::Normal)
        .await
        .unwrap();
    let second = engine
        .request(msg("how are you"), RequestPriority::Normal)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(backend.calls().len(), 1);

    engine
        .request(msg("different question"), RequestPriority::Normal)
        .await
        .unwrap();
    assert_eq!(backend.calls().len(), 2);
}

#[tokio::test]
async fn concurrent_identical_requests_share_one_call() {
    let backend = ScriptedBackend::gated();
    let engine = engine_with(Arc::clone(&backend), generous_limits());

    let a = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.request(msg("same"), RequestPriority::Normal).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let b = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.request(msg("same"), RequestPriority::Normal).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    backend.gate.add_permits(5);
    let ra = a.await.unwrap().unwrap();
    let rb = b.await.unwrap().unwrap();
    assert_eq!(ra, rb);
    assert_eq!(backend.calls().len(), 1);
}

#[tokio::test]
async fn clear_rejects_everything_still_queued() {
    let backend = ScriptedBackend::gated();
    let engine = engine_with(Arc::clone(&backend), generous_limits());

    let in_flight = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.enqueue(msg("in-flight"), RequestPriority::Normal).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let queued = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.enqueue(msg("queued"), RequestPriority::Normal).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(engine.queue_len(), 1);
    engine.clear();
    assert_eq!(engine.queue_len(), 0);
    assert!(matches!(
        queued.await.unwrap(),
        Err(DispatchError::Cleared)
    ));

    // The in-flight request is unaffected by clear.
    backend.gate.add_permits(1);
    in_flight.await.unwrap().unwrap();
}
