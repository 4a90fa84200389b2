//! Graduated crisis detection.
//!
//! Two independent signals are combined: a model-based classifier that reads
//! the recent conversation and returns a structured JSON verdict, and a local
//! regex pattern check over the last user utterance. The local check exists
//! because the classifier can under-report; whichever signal reports the
//! higher level wins. Classification must never take the conversation down,
//! so every failure path degrades to a safe level-0 result instead of an
//! error.
//!
//! Classifier calls go straight to the backend, bypassing the dispatch
//! queue: a safety check must not sit behind queued small talk.

use crate::conversation::{ConversationMessage, ConversationState, Role, WireMessage};
use crate::gemini::GenerationBackend;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Risk ladder. Levels 1..=4 escalate; 0 is ordinary conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CrisisLevel {
    None,
    AtRisk,
    Moderate,
    High,
    Critical,
}

impl CrisisLevel {
    pub fn as_u8(&self) -> u8 {
        match self {
            CrisisLevel::None => 0,
            CrisisLevel::AtRisk => 1,
            CrisisLevel::Moderate => 2,
            CrisisLevel::High => 3,
            CrisisLevel::Critical => 4,
        }
    }

    /// Round and clamp an arbitrary numeric verdict into a valid level.
    /// Anything outside 0..=4 (or non-finite) reads as level 0.
    pub fn from_number(value: f64) -> Self {
        if !value.is_finite() || !(0.0..=4.0).contains(&value) {
            return CrisisLevel::None;
        }
        match value.round() as u8 {
            1 => CrisisLevel::AtRisk,
            2 => CrisisLevel::Moderate,
            3 => CrisisLevel::High,
            4 => CrisisLevel::Critical,
            _ => CrisisLevel::None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CrisisLevel::None => "Not Suicidal",
            CrisisLevel::AtRisk => "At Risk",
            CrisisLevel::Moderate => "Moderate",
            CrisisLevel::High => "High",
            CrisisLevel::Critical => "Critical",
        }
    }

    /// Severity band for levels above 0.
    pub fn severity(&self) -> Option<Severity> {
        match self {
            CrisisLevel::None => None,
            CrisisLevel::AtRisk => Some(Severity::Low),
            CrisisLevel::Moderate => Some(Severity::Medium),
            CrisisLevel::High => Some(Severity::High),
            CrisisLevel::Critical => Some(Severity::Critical),
        }
    }

    /// The intervention this level calls for.
    pub fn action(&self) -> CrisisAction {
        match self {
            CrisisLevel::None => CrisisAction::ContinueNormal,
            CrisisLevel::AtRisk => CrisisAction::OfferBreathingGrounding,
            CrisisLevel::Moderate => CrisisAction::ProperConversationAndBreathing,
            CrisisLevel::High => CrisisAction::ShowEmergencyContacts,
            CrisisLevel::Critical => CrisisAction::ShowCrisisHotlines,
        }
    }
}

impl TryFrom<u8> for CrisisLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CrisisLevel::None),
            1 => Ok(CrisisLevel::AtRisk),
            2 => Ok(CrisisLevel::Moderate),
            3 => Ok(CrisisLevel::High),
            4 => Ok(CrisisLevel::Critical),
            other => Err(format!("crisis level out of range: {other}")),
        }
    }
}

impl From<CrisisLevel> for u8 {
    fn from(level: CrisisLevel) -> u8 {
        level.as_u8()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrisisAction {
    ContinueNormal,
    OfferBreathingGrounding,
    ProperConversationAndBreathing,
    ShowEmergencyContacts,
    ShowCrisisHotlines,
}

/// One classification outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrisisDetectionResult {
    pub level: CrisisLevel,
    pub confidence: f64,
    pub indicators: Vec<String>,
    pub reasoning: String,
    pub detected_patterns: Vec<String>,
}

impl CrisisDetectionResult {
    /// Level 0, confidence 0.5. Returned whenever classification cannot be
    /// completed.
    pub fn safe_default() -> Self {
        Self {
            level: CrisisLevel::None,
            confidence: 0.5,
            indicators: Vec::new(),
            reasoning: "Unable to perform crisis detection - defaulting to safe level".into(),
            detected_patterns: Vec::new(),
        }
    }
}

/// Untrusted classifier output, before validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVerdict {
    #[serde(default)]
    level: Option<f64>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    indicators: Option<Vec<String>>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    detected_patterns: Option<Vec<String>>,
}

impl RawVerdict {
    fn validate(self) -> CrisisDetectionResult {
        CrisisDetectionResult {
            level: self.level.map(CrisisLevel::from_number).unwrap_or(CrisisLevel::None),
            confidence: self.confidence.map(|c| c.clamp(0.0, 1.0)).unwrap_or(0.5),
            indicators: self.indicators.unwrap_or_default(),
            reasoning: self
                .reasoning
                .unwrap_or_else(|| "No reasoning provided".into()),
            detected_patterns: self.detected_patterns.unwrap_or_default(),
        }
    }
}

pub const CRISIS_DETECTION_PROMPT: &str = "\
You are a crisis assessment system for a mental-health support conversation. \
Read the conversation and assess the user's suicide risk on this scale:\n\
- 0: Not suicidal. General conversation, daily life topics.\n\
- 1: At risk. Passive suicidal ideation, thoughts of death, hopelessness, wishing to not exist.\n\
- 2: Moderate. Suicidal method mentioned without detail, considering or researching ways to die.\n\
- 3: High. Suicidal intent expressed, preparing to die, saying goodbye, sense of urgency.\n\
- 4: Critical. Detailed plan with specific method, time or place decided, access to means, imminent risk.\n\
Respond with JSON only, no prose, in this exact shape:\n\
{\"level\": <0-4>, \"confidence\": <0-1>, \"indicators\": [<verbatim quotes>], \
\"reasoning\": <one sentence>, \"detectedPatterns\": [<pattern names>]}";

/// How many recent messages the classifier reads.
const CLASSIFIER_CONTEXT: usize = 10;

static LEVEL4_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)tonight.*(kill|suicide|end|die)",
        r"(?i)tomorrow.*(kill|suicide|end|die)",
        r"(?i)(got|have|bought).*(pills|gun|rope|knife).*(end|kill|suicide)",
        r"(?i)specific (plan|method|way).*(suicide|kill myself|end)",
        r"(?i)goodbye.*(kill|suicide|die|end)",
        r"(?i)(plan|planning).*(suicide|kill myself|end my life)",
    ])
});

static LEVEL3_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)suicidal (intention|intent)",
        r"(?i)have suicidal",
        r"(?i)(will|going to|want to).*(kill myself|commit suicide|end my life)",
        r"(?i)i (will|am going to|want to) (die|suicide)",
        r"(?i)preparing to (die|kill|suicide)",
        r"(?i)(decided|planning) to (die|kill myself|end)",
        r"(?i)can't (take|do|handle) (it|this|anymore).*(die|kill|end)",
    ])
});

static LEVEL2_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)(thinking about|considering|researching).*(ways to|how to).*(die|suicide|kill)",
        r"(?i)(pills|overdose|hanging|jumping|weapon).*(thoughts|ideation)",
        r"(?i)suicide.*(method|way)",
        r"(?i)how (to|do i).*(die|kill myself|suicide)",
    ])
});

static LEVEL1_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)(wish|want).*(die|death|not (exist|alive|here))",
        r"(?i)better off dead",
        r"(?i)(life|living).*(meaningless|pointless|not worth)",
        r"(?i)suicidal (thought|thinking)",
        r"(?i)don't want to (live|exist|be here)",
        r"(?i)hopeless",
    ])
});

fn compile(sources: &[&str]) -> Vec<Regex> {
    sources
        .iter()
        .filter_map(|s| match Regex::new(s) {
            Ok(re) => Some(re),
            Err(e) => {
                error!(pattern = s, error = %e, "invalid crisis pattern, skipping");
                None
            }
        })
        .collect()
}

/// Local keyword screen over one utterance. Highest family that matches wins;
/// within a family the first match decides.
pub fn quick_pattern_check(text: &str) -> CrisisLevel {
    let families: [(&Lazy<Vec<Regex>>, CrisisLevel); 4] = [
        (&LEVEL4_PATTERNS, CrisisLevel::Critical),
        (&LEVEL3_PATTERNS, CrisisLevel::High),
        (&LEVEL2_PATTERNS, CrisisLevel::Moderate),
        (&LEVEL1_PATTERNS, CrisisLevel::AtRisk),
    ];
    for (patterns, level) in families {
        if patterns.iter().any(|re| re.is_match(text)) {
            return level;
        }
    }
    CrisisLevel::None
}

/// Model-backed classifier with the local pattern screen as a floor.
pub struct CrisisClassifier {
    backend: Arc<dyn GenerationBackend>,
}

impl CrisisClassifier {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }

    /// Classify the conversation. Infallible by construction: any backend or
    /// parse failure degrades to the safe default, and the local pattern
    /// check can only raise the reported level, never lower it.
    pub async fn classify(&self, conversation: &ConversationState) -> CrisisDetectionResult {
        let last_user = conversation.last_user_message().map(|m| m.text.clone());

        let verdict = match self.classify_inner(&conversation.messages).await {
            Some(v) => v,
            None => CrisisDetectionResult::safe_default(),
        };
        let result = reconcile(verdict, last_user.as_deref());
        info!(
            level = result.level.as_u8(),
            confidence = result.confidence,
            "crisis classification complete"
        );
        result
    }

    async fn classify_inner(&self, messages: &[ConversationMessage]) -> Option<CrisisDetectionResult> {
        let start = messages.len().saturating_sub(CLASSIFIER_CONTEXT);
        let transcript = messages[start..]
            .iter()
            .map(|m| {
                let speaker = match m.role {
                    Role::User => "USER",
                    Role::Ai => "AI",
                };
                format!("{speaker}: {}", m.text)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "{CRISIS_DETECTION_PROMPT}\n\nCONVERSATION:\n{transcript}\n\nANALYSIS (JSON only):"
        );
        let request = [WireMessage::new("user", prompt)];

        let text = match self.backend.generate(&request).await {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "crisis classifier call failed");
                return None;
            }
        };
        debug!(response_len = text.len(), "crisis classifier raw response");

        let json = extract_json(&text)?;
        match serde_json::from_str::<RawVerdict>(json) {
            Ok(raw) => Some(raw.validate()),
            Err(e) => {
                error!(error = %e, "crisis classifier returned malformed JSON");
                None
            }
        }
    }
}

/// The model may wrap its JSON in markdown fences or prose; take the span
/// from the first `{` to the last `}`.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end >= start).then(|| &text[start..=end])
}

/// Combine the classifier verdict with the local pattern screen: the higher
/// level wins. A local override carries fixed 0.75 confidence and quotes the
/// triggering utterance.
fn reconcile(verdict: CrisisDetectionResult, last_user: Option<&str>) -> CrisisDetectionResult {
    let Some(text) = last_user else {
        return verdict;
    };
    let local = quick_pattern_check(text);
    if local <= verdict.level {
        return verdict;
    }
    info!(
        pattern_level = local.as_u8(),
        classifier_level = verdict.level.as_u8(),
        "local pattern check raised crisis level"
    );
    let excerpt: String = text.chars().take(100).collect();
    CrisisDetectionResult {
        level: local,
        confidence: 0.75,
        indicators: vec![excerpt],
        reasoning: format!(
            "Pattern-based detection (classifier returned level {})",
            verdict.level.as_u8()
        ),
        detected_patterns: vec!["quick-pattern-match".into()],
    }
}

/// Payload handed to the external alerting collaborator. Only levels 3 and 4
/// warrant an alert; lower levels return `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrisisAlertRequest {
    pub crisis_event_id: Uuid,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

impl CrisisAlertRequest {
    pub fn from_result(result: &CrisisDetectionResult, user_name: Option<String>) -> Option<Self> {
        if result.level < CrisisLevel::High {
            return None;
        }
        let severity = result.level.severity()?;
        Some(Self {
            crisis_event_id: Uuid::new_v4(),
            severity,
            user_name,
        })
    }
}

/// Rolling record of classification outcomes for the current session.
#[derive(Debug, Default)]
pub struct CrisisMonitor {
    latest: Option<CrisisDetectionResult>,
    history: VecDeque<CrisisDetectionResult>,
    analyzing: bool,
}

/// Detections kept in the session history.
const HISTORY_CAP: usize = 10;

impl CrisisMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: CrisisDetectionResult) {
        self.latest = Some(result.clone());
        self.history.push_back(result);
        while self.history.len() > HISTORY_CAP {
            self.history.pop_front();
        }
        self.analyzing = false;
    }

    pub fn set_analyzing(&mut self, analyzing: bool) {
        self.analyzing = analyzing;
    }

    pub fn is_analyzing(&self) -> bool {
        self.analyzing
    }

    pub fn latest(&self) -> Option<&CrisisDetectionResult> {
        self.latest.as_ref()
    }

    pub fn history(&self) -> impl Iterator<Item = &CrisisDetectionResult> {
        self.history.iter()
    }

    /// Highest level seen this session; level 0 when the history is empty.
    pub fn highest_level(&self) -> CrisisLevel {
        self.history
            .iter()
            .map(|r| r.level)
            .max()
            .unwrap_or(CrisisLevel::None)
    }

    pub fn reset(&mut self) {
        self.latest = None;
        self.history.clear();
        self.analyzing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_from_number_rounds_and_clamps() {
        assert_eq!(CrisisLevel::from_number(2.4), CrisisLevel::Moderate);
        assert_eq!(CrisisLevel::from_number(3.6), CrisisLevel::Critical);
        assert_eq!(CrisisLevel::from_number(-1.0), CrisisLevel::None);
        assert_eq!(CrisisLevel::from_number(7.0), CrisisLevel::None);
        assert_eq!(CrisisLevel::from_number(f64::NAN), CrisisLevel::None);
    }

    #[test]
    fn severity_bands_follow_the_ladder() {
        assert_eq!(CrisisLevel::None.severity(), None);
        assert_eq!(CrisisLevel::AtRisk.severity(), Some(Severity::Low));
        assert_eq!(CrisisLevel::Moderate.severity(), Some(Severity::Medium));
        assert_eq!(CrisisLevel::High.severity(), Some(Severity::High));
        assert_eq!(CrisisLevel::Critical.severity(), Some(Severity::Critical));
    }

    #[test]
    fn pattern_families_rank_highest_first() {
        assert_eq!(
            quick_pattern_check("I bought pills and I'm going to end it"),
            CrisisLevel::Critical
        );
        assert_eq!(
            quick_pattern_check("I want to kill myself"),
            CrisisLevel::High
        );
        assert_eq!(
            quick_pattern_check("I've been researching ways to die"),
            CrisisLevel::Moderate
        );
        assert_eq!(quick_pattern_check("everything feels hopeless"), CrisisLevel::AtRisk);
        assert_eq!(quick_pattern_check("I had a nice walk today"), CrisisLevel::None);
    }

    #[test]
    fn validation_clamps_out_of_range_fields() {
        let raw: RawVerdict =
            serde_json::from_str(r#"{"level": 9.0, "confidence": 1.7}"#).unwrap();
        let validated = raw.validate();
        assert_eq!(validated.level, CrisisLevel::None);
        assert_eq!(validated.confidence, 1.0);
        assert!(validated.indicators.is_empty());
        assert_eq!(validated.reasoning, "No reasoning provided");
    }

    #[test]
    fn extract_json_strips_markdown_fences() {
        let text = "```json\n{\"level\": 2}\n```";
        assert_eq!(extract_json(text), Some("{\"level\": 2}"));
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn local_pattern_raises_but_never_lowers() {
        let verdict = CrisisDetectionResult {
            level: CrisisLevel::None,
            confidence: 0.9,
            indicators: vec![],
            reasoning: "looks fine".into(),
            detected_patterns: vec![],
        };
        let raised = reconcile(verdict.clone(), Some("I want to kill myself"));
        assert_eq!(raised.level, CrisisLevel::High);
        assert_eq!(raised.confidence, 0.75);

        let high = CrisisDetectionResult {
            level: CrisisLevel::Critical,
            confidence: 0.95,
            indicators: vec![],
            reasoning: "imminent".into(),
            detected_patterns: vec![],
        };
        let kept = reconcile(high, Some("everything feels hopeless"));
        assert_eq!(kept.level, CrisisLevel::Critical);
        assert_eq!(kept.confidence, 0.95);
    }

    #[test]
    fn alerts_fire_only_for_high_and_critical() {
        let mut result = CrisisDetectionResult::safe_default();
        assert!(CrisisAlertRequest::from_result(&result, None).is_none());
        result.level = CrisisLevel::Moderate;
        assert!(CrisisAlertRequest::from_result(&result, None).is_none());
        result.level = CrisisLevel::High;
        let alert = CrisisAlertRequest::from_result(&result, Some("Sam".into())).unwrap();
        assert_eq!(alert.severity, Severity::High);
        assert_eq!(alert.user_name.as_deref(), Some("Sam"));
        result.level = CrisisLevel::Critical;
        let alert = CrisisAlertRequest::from_result(&result, None).unwrap();
        assert_eq!(alert.severity, Severity::Critical);
    }

    #[test]
    fn monitor_caps_history_and_tracks_peak() {
        let mut monitor = CrisisMonitor::new();
        for i in 0..12 {
            let mut r = CrisisDetectionResult::safe_default();
            if i == 11 {
                r.level = CrisisLevel::High;
            }
            monitor.record(r);
        }
        assert_eq!(monitor.history().count(), 10);
        assert_eq!(monitor.highest_level(), CrisisLevel::High);
        monitor.reset();
        assert_eq!(monitor.highest_level(), CrisisLevel::None);
        assert!(monitor.latest().is_none());
    }
}
