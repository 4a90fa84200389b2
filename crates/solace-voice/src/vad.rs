//! Energy-threshold voice activity detection.
//!
//! Works on a 0-255 energy scale: each chunk is reduced to one RMS energy
//! level, compared against a threshold, and run through a debounce so that
//! brief dips inside an utterance do not end the turn. `SpeechStart` and
//! `SpeechEnd` each fire exactly once per transition; the end fires only
//! after the energy has stayed below the threshold for the full debounce
//! window. The transition logic is a pure function of (level, now) so it can
//! be tested without a microphone.

use std::time::{Duration, Instant};
use tracing::debug;

/// VAD tuning.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Energy above this (0-255 scale) counts as speech (default: 30).
    pub threshold: f32,

    /// Continuous sub-threshold time before speech is considered ended
    /// (default: 1500ms; up to ~2400ms for slow speakers).
    pub silence_duration: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 30.0,
            silence_duration: Duration::from_millis(1500),
        }
    }
}

/// Transition emitted by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart,
    SpeechEnd,
}

/// Energy-threshold detector with silence debounce.
#[derive(Debug)]
pub struct EnergyVad {
    config: VadConfig,
    speech_active: bool,
    silence_since: Option<Instant>,
}

impl EnergyVad {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            speech_active: false,
            silence_since: None,
        }
    }

    /// Reduce a chunk of samples to an energy level and advance the state
    /// machine.
    pub fn process_chunk(&mut self, samples: &[f32]) -> Option<VadEvent> {
        let level = chunk_energy(samples);
        self.process_level(level, Instant::now())
    }

    /// Advance the state machine with an explicit clock.
    ///
    /// Transitions: silence -> speech emits `SpeechStart` immediately;
    /// speech -> silence emits `SpeechEnd` only after `silence_duration` of
    /// continuous sub-threshold energy. Energy back above the threshold
    /// before the window elapses cancels the pending end.
    pub fn process_level(&mut self, level: f32, now: Instant) -> Option<VadEvent> {
        let speaking = level > self.config.threshold;
        if speaking {
            self.silence_since = None;
            if !self.speech_active {
                self.speech_active = true;
                debug!(level, "speech started");
                return Some(VadEvent::SpeechStart);
            }
            return None;
        }

        if !self.speech_active {
            return None;
        }
        match self.silence_since {
            None => {
                self.silence_since = Some(now);
                None
            }
            Some(since) if now.duration_since(since) >= self.config.silence_duration => {
                self.speech_active = false;
                self.silence_since = None;
                debug!("speech ended");
                Some(VadEvent::SpeechEnd)
            }
            Some(_) => None,
        }
    }

    /// Whether the detector currently considers speech in progress.
    pub fn is_active(&self) -> bool {
        self.speech_active
    }

    /// Forget all state. Safe to call repeatedly.
    pub fn reset(&mut self) {
        self.speech_active = false;
        self.silence_since = None;
    }
}

/// RMS energy of a chunk mapped onto the 0-255 scale.
pub fn chunk_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    let rms = (sum_sq / samples.len() as f32).sqrt();
    (rms * 255.0).min(255.0)
}
