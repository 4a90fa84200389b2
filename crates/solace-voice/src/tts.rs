//! Text-to-speech: turn a response into audio bytes for playback.
//!
//! Backends are synchronous (blocking HTTP); the orchestrator runs them via
//! `spawn_blocking`. Voice parameters (stability, similarity boost, speed)
//! ride along with every request.

use crate::error::{VoiceError, VoiceResult};
use serde::Serialize;
use solace_core::CompanionConfig;
use tracing::debug;

/// Backend that turns text into audio bytes (WAV/MP3). Return an empty vec to
/// skip playback.
pub trait TtsBackend: Send + Sync {
    fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>>;
}

/// Silent TTS for exercising the loop without a synthesis service.
#[derive(Debug, Default)]
pub struct PlaceholderTts;

impl TtsBackend for PlaceholderTts {
    fn synthesize(&self, _text: &str) -> VoiceResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Voice parameters sent with every synthesis request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSettings {
    pub voice_id: String,
    pub model_id: String,
    pub stability: f32,
    pub similarity_boost: f32,
    pub speed: f32,
}

impl VoiceSettings {
    pub fn from_config(config: &CompanionConfig) -> Self {
        Self {
            voice_id: config.voice_id.clone().unwrap_or_default(),
            model_id: config.tts_model_id.clone(),
            stability: config.tts_stability,
            similarity_boost: config.tts_similarity_boost,
            speed: config.tts_speed,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeRequest<'a> {
    text: &'a str,
    voice_id: &'a str,
    model_id: &'a str,
    stability: f32,
    similarity_boost: f32,
    speed: f32,
}

/// Synthesis over HTTP: JSON request, raw audio bytes back.
#[derive(Debug, Clone)]
pub struct HttpTts {
    /// Full endpoint URL for synthesis requests.
    pub endpoint: String,
    /// Bearer API key.
    pub api_key: String,
    pub settings: VoiceSettings,
    client: reqwest::blocking::Client,
}

impl HttpTts {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        settings: VoiceSettings,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            settings,
            client,
        })
    }
}

impl TtsBackend for HttpTts {
    fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let body = SynthesizeRequest {
            text,
            voice_id: &self.settings.voice_id,
            model_id: &self.settings.model_id,
            stability: self.settings.stability,
            similarity_boost: self.settings.similarity_boost,
            speed: self.settings.speed,
        };
        let res = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS failed ({status}): {body}")));
        }
        let bytes = res.bytes().map_err(|e| VoiceError::Tts(e.to_string()))?;
        debug!(audio_bytes = bytes.len(), "synthesis complete");
        Ok(bytes.to_vec())
    }
}
