//! solace-core: conversation state, rate-limited dispatch, and crisis
//! detection for the Solace voice companion.
//!
//! Everything that talks to the generation endpoint goes through the
//! [`DispatchEngine`], which serializes calls behind a priority queue,
//! sliding-window rate tracking, a circuit breaker, call spacing, and a
//! response cache. The crisis classifier is the one exception; safety
//! checks bypass the queue.

mod breaker;
mod cache;
mod config;
mod conversation;
mod cooldown;
mod crisis;
mod error;
mod gemini;
mod limits;
mod queue;
mod tokens;

// Conversation state + wire format
pub use conversation::{
    ConversationMessage, ConversationState, Role, WireMessage, WirePart, MAX_CONTEXT_MESSAGES,
};

// Token estimation (chars/4 heuristic)
pub use tokens::{
    estimate_conversation_tokens, estimate_message_tokens, estimate_tokens, TokenEstimate,
    AVG_RESPONSE_CHARS,
};

// Configuration + provider limits
pub use config::{
    ms_until_daily_reset, rate_limits_for, reference_day, CompanionConfig, RateLimits,
    DEFAULT_GENERATION_MODEL, RESET_TZ_OFFSET_MS,
};

// Dispatch pipeline services
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState};
pub use cache::{hash_context, CacheConfig, ResponseCache};
pub use cooldown::CooldownManager;
pub use limits::{RateLimitState, RateLimitTracker, RateLimitUsage, TokenSpend, WindowUsage};

// The dispatch engine itself
pub use queue::{DispatchConfig, DispatchEngine, DispatchServices, RequestPriority};

// Generation backend seam + HTTP client
pub use gemini::{GeminiClient, GenerationBackend};

// Crisis detection (classifier + local pattern screen)
pub use crisis::{
    quick_pattern_check, CrisisAction, CrisisAlertRequest, CrisisClassifier,
    CrisisDetectionResult, CrisisLevel, CrisisMonitor, Severity, CRISIS_DETECTION_PROMPT,
};

pub use error::DispatchError;
