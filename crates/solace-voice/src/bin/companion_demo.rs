//! Run the full companion loop against configured endpoints.
//!
//! Requires a microphone and speakers. Configure via `.env` or the
//! environment; see `CompanionConfig` for the variable table. With no STT/TTS
//! endpoints configured, placeholders keep the loop running silently.

use solace_core::{
    CacheConfig, CircuitBreaker, CircuitBreakerConfig, CompanionConfig, CooldownManager,
    CrisisClassifier, DispatchConfig, DispatchEngine, DispatchServices, GeminiClient,
    RateLimitTracker, ResponseCache,
};
use solace_voice::{
    CompanionEvent, CompanionOrchestrator, CompanionServices, HttpStt, HttpTts, OrchestratorConfig,
    PlaceholderStt, PlaceholderTts, SttBackend, TtsBackend, VoiceSettings,
};
use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = CompanionConfig::from_env();
    let api_url = config
        .generation_api_url
        .clone()
        .context("SOLACE_GENERATION_API_URL is required")?;
    let api_key = config
        .generation_api_key
        .clone()
        .context("SOLACE_GENERATION_API_KEY is required")?;

    let backend = Arc::new(GeminiClient::new(api_url, api_key));
    let tracker = match &config.usage_path {
        Some(path) => RateLimitTracker::with_persistence(config.rate_limits(), path.clone()),
        None => RateLimitTracker::new(config.rate_limits()),
    };
    let engine = DispatchEngine::new(
        backend.clone(),
        DispatchServices {
            tracker,
            breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
            cooldown: CooldownManager::new(),
            cache: ResponseCache::new(CacheConfig::default()),
        },
        DispatchConfig::default(),
    );

    let stt: Arc<dyn SttBackend> = match (&config.stt_api_url, &config.stt_api_key) {
        (Some(url), Some(key)) => Arc::new(HttpStt::new(url.clone(), key.clone())?),
        _ => {
            warn!("no STT endpoint configured, using placeholder");
            Arc::new(PlaceholderStt::new())
        }
    };
    let tts: Arc<dyn TtsBackend> = match (&config.tts_api_url, &config.tts_api_key) {
        (Some(url), Some(key)) => Arc::new(HttpTts::new(
            url.clone(),
            key.clone(),
            VoiceSettings::from_config(&config),
        )?),
        _ => {
            warn!("no TTS endpoint configured, using placeholder");
            Arc::new(PlaceholderTts)
        }
    };

    let services = CompanionServices {
        engine,
        classifier: CrisisClassifier::new(backend),
        stt,
        tts,
    };
    let (orchestrator, mut events) = CompanionOrchestrator::new(services, OrchestratorConfig::default());
    orchestrator.start()?;
    info!("companion listening; Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                orchestrator.stop();
                info!("stopped");
                return Ok(());
            }
            event = events.recv() => {
                match event {
                    Some(CompanionEvent::StateChanged(state)) => info!(state = state.as_str(), "state"),
                    Some(CompanionEvent::TranscriptUpdated(state)) => {
                        if let Some(last) = state.messages.last() {
                            info!(role = ?last.role, text = %last.text, "transcript");
                        }
                    }
                    Some(CompanionEvent::CrisisDetected(result)) => {
                        info!(level = result.level.as_u8(), confidence = result.confidence, "crisis check");
                    }
                    Some(CompanionEvent::Error(message)) => warn!(%message, "pipeline error"),
                    None => return Ok(()),
                }
            }
        }
    }
}
