//! Crisis classification against scripted backend responses.

use async_trait::async_trait;
use solace_core::{
    ConversationState, CrisisClassifier, CrisisLevel, DispatchError, GenerationBackend, Role,
    WireMessage, CRISIS_DETECTION_PROMPT,
};
use std::sync::{Arc, Mutex};

struct CannedBackend {
    response: Result<String, DispatchError>,
    last_prompt: Mutex<Option<String>>,
}

impl CannedBackend {
    fn replying(text: &str) -> Arc<Self> {
        Arc::new(Self {
            response: Ok(text.to_string()),
            last_prompt: Mutex::new(None),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            response: Err(DispatchError::Network("connection refused".into())),
            last_prompt: Mutex::new(None),
        })
    }
}

#[async_trait]
impl GenerationBackend for CannedBackend {
    async fn generate(&self, messages: &[WireMessage]) -> Result<String, DispatchError> {
        let prompt = messages.first().map(|m| m.joined_text()).unwrap_or_default();
        *self.last_prompt.lock().unwrap() = Some(prompt);
        self.response.clone()
    }
}

fn conversation(user_text: &str) -> ConversationState {
    let mut state = ConversationState::new();
    state.add_message(Role::User, "hi");
    state.add_message(Role::Ai, "hello, how are you feeling today?");
    state.add_message(Role::User, user_text);
    state
}

#[tokio::test]
async fn well_formed_verdict_is_used_directly() {
    let backend = CannedBackend::replying(
        r#"{"level": 2, "confidence": 0.85, "indicators": ["researching methods"],
            "reasoning": "method mentions without a plan", "detectedPatterns": ["method-mention"]}"#,
    );
    let classifier = CrisisClassifier::new(backend.clone());
    let state = conversation("I had a rough week");

    let result = classifier.classify(&state).await;
    assert_eq!(result.level, CrisisLevel::Moderate);
    assert_eq!(result.confidence, 0.85);
    assert_eq!(result.detected_patterns, vec!["method-mention"]);

    // The prompt carries the rubric and the transcript.
    let prompt = backend.last_prompt.lock().unwrap().clone().unwrap();
    assert!(prompt.starts_with(CRISIS_DETECTION_PROMPT));
    assert!(prompt.contains("USER: I had a rough week"));
    assert!(prompt.contains("AI: hello"));
}

#[tokio::test]
async fn markdown_fenced_json_still_parses() {
    let backend = CannedBackend::replying(
        "```json\n{\"level\": 1, \"confidence\": 0.6, \"indicators\": [], \"reasoning\": \"passive ideation\", \"detectedPatterns\": []}\n```",
    );
    let classifier = CrisisClassifier::new(backend);
    let result = classifier
        .classify(&conversation("some days are hard"))
        .await;
    assert_eq!(result.level, CrisisLevel::AtRisk);
}

#[tokio::test]
async fn malformed_response_degrades_to_safe_default() {
    let backend = CannedBackend::replying("I'm sorry, I can't help with that.");
    let classifier = CrisisClassifier::new(backend);
    let result = classifier
        .classify(&conversation("what's the weather like"))
        .await;
    assert_eq!(result.level, CrisisLevel::None);
    assert_eq!(result.confidence, 0.5);
    assert!(result.indicators.is_empty());
}

#[tokio::test]
async fn backend_failure_degrades_to_safe_default() {
    let backend = CannedBackend::failing();
    let classifier = CrisisClassifier::new(backend);
    let result = classifier
        .classify(&conversation("just checking in"))
        .await;
    assert_eq!(result.level, CrisisLevel::None);
    assert_eq!(result.confidence, 0.5);
}

#[tokio::test]
async fn local_patterns_override_an_underreporting_classifier() {
    let backend = CannedBackend::replying(
        r#"{"level": 0, "confidence": 0.9, "indicators": [], "reasoning": "benign", "detectedPatterns": []}"#,
    );
    let classifier = CrisisClassifier::new(backend);
    let result = classifier
        .classify(&conversation("I want to kill myself"))
        .await;
    assert_eq!(result.level, CrisisLevel::High);
    assert_eq!(result.confidence, 0.75);
    assert_eq!(result.detected_patterns, vec!["quick-pattern-match"]);
    assert_eq!(result.indicators, vec!["I want to kill myself"]);
}

#[tokio::test]
async fn local_patterns_raise_even_when_the_backend_fails() {
    let backend = CannedBackend::failing();
    let classifier = CrisisClassifier::new(backend);
    let result = classifier
        .classify(&conversation("everything feels hopeless"))
        .await;
    assert_eq!(result.level, CrisisLevel::AtRisk);
    assert_eq!(result.confidence, 0.75);
}

#[tokio::test]
async fn out_of_range_verdict_is_clamped() {
    let backend = CannedBackend::replying(
        r#"{"level": 9, "confidence": 3.5, "indicators": [], "reasoning": "??", "detectedPatterns": []}"#,
    );
    let classifier = CrisisClassifier::new(backend);
    let result = classifier
        .classify(&conversation("nice day out"))
        .await;
    // Out-of-range level reads as 0; confidence clamps to 1.
    assert_eq!(result.level, CrisisLevel::None);
    assert_eq!(result.confidence, 1.0);
}
