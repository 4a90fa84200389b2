//! # Solace Voice - Companion Conversation Loop
//!
//! Real-time voice loop for the Solace companion: microphone capture,
//! energy-threshold VAD, turn commit, STT, rate-limited response dispatch
//! (via `solace-core`), TTS, and interruptible playback.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 Conversation Orchestrator                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐       │
//! │  │   Audio In   │→ │  Energy VAD  │→ │ Turn Commit  │       │
//! │  │    (cpal)    │  │ (1500ms gap) │  │ (500ms settle)│      │
//! │  └──────────────┘  └──────────────┘  └──────┬───────┘       │
//! │         ↓                                    ↓                │
//! │  ┌──────────────┐   barge-in stop   ┌──────────────┐        │
//! │  │  Audio Out   │←──────────────────│ STT→Dispatch │        │
//! │  │   (rodio)    │                   │    →TTS      │        │
//! │  └──────────────┘                   └──────────────┘        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod error;
pub mod orchestrator;
pub mod playback;
pub mod stt;
pub mod tts;
pub mod vad;

pub use capture::{AudioCapture, AudioChunk, AudioConfig, CaptureSession, CaptureStop};
pub use error::{VoiceError, VoiceResult};
pub use orchestrator::{
    CompanionEvent, CompanionOrchestrator, CompanionServices, CompanionState, OrchestratorConfig,
};
pub use playback::{AudioPlayback, PlaybackDone};
pub use stt::{pcm_to_wav, HttpStt, PlaceholderStt, SttBackend};
pub use tts::{HttpTts, PlaceholderTts, TtsBackend, VoiceSettings};
pub use vad::{chunk_energy, EnergyVad, VadConfig, VadEvent};
