//! The dispatch engine: a priority request queue that serializes calls to the
//! rate-limited generation endpoint.
//!
//! One always-running drain task pulls from the head of the queue and, for
//! each item in order: waits out the cooldown spacing, checks the circuit
//! breaker, pre-checks the rate tracker, and only then records usage and
//! invokes the endpoint. Exactly one call is in flight at a time, which keeps
//! throttle accounting deterministic without per-item locks.
//!
//! An item whose estimated token cost exceeds the *remaining* TPM (but not
//! the whole budget) is requeued at the front and retried after a backoff —
//! a retry, not a failure, so it never touches the circuit breaker.

use crate::breaker::CircuitBreaker;
use crate::cache::{hash_context, ResponseCache};
use crate::conversation::WireMessage;
use crate::cooldown::CooldownManager;
use crate::error::DispatchError;
use crate::gemini::GenerationBackend;
use crate::limits::RateLimitTracker;
use crate::tokens::estimate_conversation_tokens;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Queue tiers. Lower weight drains first; FIFO within a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl RequestPriority {
    fn weight(&self) -> u8 {
        match self {
            RequestPriority::Critical => 0,
            RequestPriority::High => 1,
            RequestPriority::Normal => 2,
            RequestPriority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPriority::Critical => "critical",
            RequestPriority::High => "high",
            RequestPriority::Normal => "normal",
            RequestPriority::Low => "low",
        }
    }
}

/// Dispatch tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Backoff before retrying an item that did not fit the remaining TPM.
    pub insufficient_quota_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            insufficient_quota_backoff: Duration::from_secs(5),
        }
    }
}

struct QueuedRequest {
    id: Uuid,
    priority: RequestPriority,
    messages: Vec<WireMessage>,
    created_at: Instant,
    reply: oneshot::Sender<Result<String, DispatchError>>,
}

type FlightResult = Result<String, DispatchError>;

struct Shared {
    queue: Mutex<VecDeque<QueuedRequest>>,
    cooldown: CooldownManager,
    breaker: CircuitBreaker,
    tracker: Mutex<RateLimitTracker>,
    cache: Mutex<ResponseCache>,
    in_flight: Mutex<HashMap<String, broadcast::Sender<FlightResult>>>,
    backend: Arc<dyn GenerationBackend>,
    config: DispatchConfig,
}

/// Explicitly constructed services the engine coordinates. Each one owns its
/// own state and can be unit-tested in isolation.
pub struct DispatchServices {
    pub tracker: RateLimitTracker,
    pub breaker: CircuitBreaker,
    pub cooldown: CooldownManager,
    pub cache: ResponseCache,
}

/// Handle to the dispatch engine. Cloneable; all clones share one queue and
/// one drain task.
#[derive(Clone)]
pub struct DispatchEngine {
    shared: Arc<Shared>,
    notify: Arc<Notify>,
}

impl DispatchEngine {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        services: DispatchServices,
        config: DispatchConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cooldown: services.cooldown,
            breaker: services.breaker,
            tracker: Mutex::new(services.tracker),
            cache: Mutex::new(services.cache),
            in_flight: Mutex::new(HashMap::new()),
            backend,
            config,
        });
        let notify = Arc::new(Notify::new());
        tokio::spawn(drain_loop(Arc::downgrade(&shared), Arc::clone(&notify)));
        Self { shared, notify }
    }

    /// Queue a call and wait for its outcome. Bypasses neither the cache nor
    /// the single-flight registry; use [`DispatchEngine::request`] for the
    /// full conversational path.
    pub async fn enqueue(
        &self,
        messages: Vec<WireMessage>,
        priority: RequestPriority,
    ) -> Result<String, DispatchError> {
        let rx = self.submit(messages, priority);
        rx.await
            .map_err(|_| DispatchError::Channel("dispatch worker dropped the request".into()))?
    }

    /// Conversational request path: exact-context cache hit short-circuits the
    /// whole dispatch pipeline; otherwise concurrent identical requests fold
    /// into one underlying call and share its result.
    pub async fn request(
        &self,
        messages: Vec<WireMessage>,
        priority: RequestPriority,
    ) -> Result<String, DispatchError> {
        let hash = hash_context(&messages);
        if let Some(cached) = lock(&self.shared.cache).get(&hash) {
            debug!(hash = &hash[..hash.len().min(8)], "cache hit, skipping dispatch");
            return Ok(cached);
        }

        enum Flight {
            Leader(broadcast::Sender<FlightResult>),
            Follower(broadcast::Receiver<FlightResult>),
        }

        let flight = {
            let mut registry = lock(&self.shared.in_flight);
            match registry.get(&hash) {
                Some(tx) => Flight::Follower(tx.subscribe()),
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    registry.insert(hash.clone(), tx.clone());
                    Flight::Leader(tx)
                }
            }
        };

        match flight {
            Flight::Follower(mut rx) => {
                debug!(hash = &hash[..hash.len().min(8)], "joining in-flight request");
                match rx.recv().await {
                    Ok(result) => result,
                    Err(_) => Err(DispatchError::Channel("in-flight request abandoned".into())),
                }
            }
            Flight::Leader(tx) => {
                let result = self.enqueue(messages, priority).await;
                if let Ok(text) = &result {
                    if !text.is_empty() {
                        lock(&self.shared.cache).insert(hash.clone(), text.clone());
                    }
                }
                lock(&self.shared.in_flight).remove(&hash);
                let _ = tx.send(result.clone());
                result
            }
        }
    }

    /// Reject everything still queued. In-flight work is unaffected.
    pub fn clear(&self) {
        let drained: Vec<QueuedRequest> = lock(&self.shared.queue).drain(..).collect();
        for req in drained {
            let _ = req.reply.send(Err(DispatchError::Cleared));
        }
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Snapshot of the rate tracker (prunes windows as a side effect).
    pub fn rate_limit_state(&self) -> crate::limits::RateLimitState {
        lock(&self.shared.tracker).calculate_state()
    }

    fn submit(
        &self,
        messages: Vec<WireMessage>,
        priority: RequestPriority,
    ) -> oneshot::Receiver<FlightResult> {
        let (tx, rx) = oneshot::channel();
        let request = QueuedRequest {
            id: Uuid::new_v4(),
            priority,
            messages,
            created_at: Instant::now(),
            reply: tx,
        };
        {
            let mut queue = lock(&self.shared.queue);
            // Insertion point: first entry with strictly lower priority.
            let index = queue
                .iter()
                .position(|r| r.priority.weight() > priority.weight())
                .unwrap_or(queue.len());
            queue.insert(index, request);
        }
        self.notify.notify_one();
        rx
    }
}

impl Drop for DispatchEngine {
    fn drop(&mut self) {
        // Wake the drain task so it can observe the dropped engine and exit.
        self.notify.notify_waiters();
    }
}

async fn drain_loop(weak: Weak<Shared>, notify: Arc<Notify>) {
    loop {
        let Some(shared) = weak.upgrade() else { break };
        let item = lock(&shared.queue).pop_front();
        match item {
            Some(request) => process_one(&shared, request).await,
            None => {
                drop(shared);
                notify.notified().await;
            }
        }
    }
    debug!("dispatch drain loop ended");
}

async fn process_one(shared: &Shared, request: QueuedRequest) {
    let queue_ms = request.created_at.elapsed().as_millis() as u64;

    shared.cooldown.wait_if_needed().await;

    if !shared.breaker.can_proceed() {
        let wait_secs = shared
            .breaker
            .time_until_close()
            .map(|d| d.as_secs_f64().ceil() as u64)
            .unwrap_or(60);
        error!(
            request_id = %request.id,
            priority = request.priority.as_str(),
            wait_secs,
            queue_ms,
            "circuit breaker open, rejecting request"
        );
        let _ = request.reply.send(Err(DispatchError::BreakerOpen(wait_secs)));
        return;
    }

    let state = lock(&shared.tracker).calculate_state();
    if state.is_limited {
        error!(
            request_id = %request.id,
            priority = request.priority.as_str(),
            rpm = format!("{}/{}", state.rpm.used, state.rpm.limit),
            tpm = format!("{}/{}", state.tpm.used, state.tpm.limit),
            rpd = format!("{}/{}", state.rpd.used, state.rpd.limit),
            queue_ms,
            "rate limit exhausted, rejecting request"
        );
        let message = if state.rpd.remaining == 0 {
            let hours = (state.ms_until_reset as f64 / 3_600_000.0).ceil() as i64;
            format!(
                "daily limit reached ({}/{}), resets in {}h",
                state.rpd.used, state.rpd.limit, hours
            )
        } else {
            "please try again later".to_string()
        };
        let _ = request.reply.send(Err(DispatchError::QuotaExhausted(message)));
        return;
    }

    let estimate = estimate_conversation_tokens(&request.messages);
    let fits = state.rpm.remaining > 0
        && state.rpd.remaining > 0
        && state.tpm.remaining >= estimate.input_tokens;
    if !fits {
        warn!(
            request_id = %request.id,
            priority = request.priority.as_str(),
            required_tokens = estimate.input_tokens,
            tpm_remaining = state.tpm.remaining,
            queue_ms,
            "insufficient quota, requeueing at front"
        );
        lock(&shared.queue).push_front(request);
        tokio::time::sleep(shared.config.insufficient_quota_backoff).await;
        return;
    }

    if !lock(&shared.tracker).record_request(estimate.input_tokens) {
        // A window shifted between the pre-check and the record; retry.
        warn!(request_id = %request.id, "rate limit reached at record time, requeueing");
        lock(&shared.queue).push_front(request);
        tokio::time::sleep(shared.config.insufficient_quota_backoff).await;
        return;
    }

    shared.cooldown.record_call();
    info!(
        request_id = %request.id,
        priority = request.priority.as_str(),
        estimated_tokens = estimate.input_tokens,
        queue_ms,
        "processing request"
    );

    let started = Instant::now();
    match shared.backend.generate(&request.messages).await {
        Ok(text) => {
            info!(
                request_id = %request.id,
                duration_ms = started.elapsed().as_millis() as u64,
                response_len = text.len(),
                "request completed"
            );
            let _ = request.reply.send(Ok(text));
            shared.breaker.record_success();
        }
        Err(e) => {
            if e.is_rate_limit() {
                error!(request_id = %request.id, error = %e, "rate limit error during execution");
                shared.breaker.record_failure_with_hint(e.retry_hint());
            } else {
                error!(request_id = %request.id, error = %e, "request failed");
            }
            let _ = request.reply.send(Err(e));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
