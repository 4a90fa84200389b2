//! Configuration loaded from the environment, plus provider rate-limit tables.
//!
//! Limits are per-project and published by the provider per model tier. The
//! daily request counter resets at midnight in the provider's reference
//! timezone (Pacific); we use the fixed standard offset (UTC-8) rather than
//! tracking DST, which at worst shifts the reset boundary by one hour.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Provider-advertised limits for one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    /// Requests per minute.
    pub rpm: u32,
    /// Input tokens per minute.
    pub tpm: u32,
    /// Requests per day.
    pub rpd: u32,
}

/// Default generation model when none is configured.
pub const DEFAULT_GENERATION_MODEL: &str = "gemini-2.5-flash";

/// Fixed reference-timezone offset for the daily reset boundary (Pacific, UTC-8).
pub const RESET_TZ_OFFSET_MS: i64 = -8 * 60 * 60 * 1000;

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Look up limits for a model; unknown models fall back to the flash tier.
pub fn rate_limits_for(model: &str) -> RateLimits {
    match model {
        "gemini-2.5-flash" | "gemini-2.5-flash-lite" => RateLimits {
            rpm: 10,
            tpm: 250_000,
            rpd: 20,
        },
        _ => RateLimits {
            rpm: 10,
            tpm: 250_000,
            rpd: 20,
        },
    }
}

/// Day number in the reference timezone for an epoch-ms instant. Two instants
/// on the same reference-timezone calendar day share a day number; the daily
/// counters reset exactly when this value changes.
pub fn reference_day(epoch_ms: i64) -> i64 {
    (epoch_ms + RESET_TZ_OFFSET_MS).div_euclid(MS_PER_DAY)
}

/// Milliseconds until the next reference-timezone midnight.
pub fn ms_until_daily_reset(epoch_ms: i64) -> i64 {
    let next_midnight_local = (reference_day(epoch_ms) + 1) * MS_PER_DAY;
    next_midnight_local - RESET_TZ_OFFSET_MS - epoch_ms
}

/// Service configuration for the companion, loaded from environment.
///
/// | Env | Default | Description |
/// |-----|---------|--------------|
/// | SOLACE_GENERATION_API_URL | (provider default) | Generation endpoint base URL. |
/// | SOLACE_GENERATION_API_KEY | — | Bearer key for generation + crisis classification. |
/// | SOLACE_GENERATION_MODEL | gemini-2.5-flash | Model for rate-limit table lookup. |
/// | SOLACE_STT_API_URL / SOLACE_STT_API_KEY | — | Speech-to-text endpoint. |
/// | SOLACE_TTS_API_URL / SOLACE_TTS_API_KEY | — | Text-to-speech endpoint. |
/// | SOLACE_VOICE_ID | — | TTS voice id. |
/// | SOLACE_TTS_SPEED | 0.95 | Playback speed. |
/// | SOLACE_TTS_STABILITY | 50% | Accepts "50%" or 0.5. |
/// | SOLACE_TTS_SIMILARITY_BOOST | 75% | Accepts "75%" or 0.75. |
/// | SOLACE_USAGE_PATH | (in-memory) | JSON file for persisted rate-limit usage. |
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompanionConfig {
    pub generation_api_url: Option<String>,
    pub generation_api_key: Option<String>,
    pub generation_model: String,
    pub stt_api_url: Option<String>,
    pub stt_api_key: Option<String>,
    pub tts_api_url: Option<String>,
    pub tts_api_key: Option<String>,
    pub voice_id: Option<String>,
    pub tts_model_id: String,
    pub tts_speed: f32,
    pub tts_stability: f32,
    pub tts_similarity_boost: f32,
    pub usage_path: Option<PathBuf>,
}

impl CompanionConfig {
    /// Load from environment. Unset or invalid values fall back to defaults.
    pub fn from_env() -> Self {
        Self {
            generation_api_url: env_opt_string("SOLACE_GENERATION_API_URL"),
            generation_api_key: env_opt_string("SOLACE_GENERATION_API_KEY"),
            generation_model: env_opt_string("SOLACE_GENERATION_MODEL")
                .unwrap_or_else(|| DEFAULT_GENERATION_MODEL.to_string()),
            stt_api_url: env_opt_string("SOLACE_STT_API_URL"),
            stt_api_key: env_opt_string("SOLACE_STT_API_KEY"),
            tts_api_url: env_opt_string("SOLACE_TTS_API_URL"),
            tts_api_key: env_opt_string("SOLACE_TTS_API_KEY"),
            voice_id: env_opt_string("SOLACE_VOICE_ID"),
            tts_model_id: env_opt_string("SOLACE_TTS_MODEL_ID")
                .unwrap_or_else(|| "eleven_flash_v2_5".to_string()),
            tts_speed: env_f32("SOLACE_TTS_SPEED", 0.95),
            tts_stability: env_percentage("SOLACE_TTS_STABILITY", 0.5),
            tts_similarity_boost: env_percentage("SOLACE_TTS_SIMILARITY_BOOST", 0.75),
            usage_path: env_opt_string("SOLACE_USAGE_PATH").map(PathBuf::from),
        }
    }

    /// Limits table entry for the configured model.
    pub fn rate_limits(&self) -> RateLimits {
        rate_limits_for(&self.generation_model)
    }
}

/// Parse a voice-parameter percentage. Accepts "50%", "50", or "0.5"; values
/// above 1 are read as percentages. Invalid input yields the fallback.
pub fn parse_percentage(value: &str, fallback: f32) -> f32 {
    let cleaned = value.trim().trim_end_matches('%').trim();
    match cleaned.parse::<f32>() {
        Ok(parsed) if parsed > 1.0 => parsed / 100.0,
        Ok(parsed) if parsed >= 0.0 => parsed,
        _ => fallback,
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_f32(name: &str, default: f32) -> f32 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_percentage(name: &str, default: f32) -> f32 {
    match std::env::var(name) {
        Ok(v) => parse_percentage(&v, default),
        Err(_) => default,
    }
}
