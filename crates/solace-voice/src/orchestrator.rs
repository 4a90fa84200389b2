//! The conversation orchestrator: idle -> listening -> processing -> speaking.
//!
//! One orchestrator owns one conversation. While listening, captured chunks
//! accumulate in a turn buffer and feed the energy VAD; a speech-end followed
//! by a short settle window commits the buffer as a turn. A turn runs the
//! full pipeline: noise-floor check, transcription, crisis classification,
//! dispatch request, synthesis, playback. Speech detected while the
//! companion is speaking is a barge-in and stops playback immediately.
//!
//! `stop` releases the microphone and VAD synchronously and abandons any
//! queued turn, but lets playback already in progress finish naturally.
//! Consumers observe everything through a typed [`CompanionEvent`] channel.

use crate::capture::{AudioCapture, AudioConfig, CaptureStop};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::AudioPlayback;
use crate::stt::SttBackend;
use crate::tts::TtsBackend;
use crate::vad::{EnergyVad, VadConfig, VadEvent};
use solace_core::{
    ConversationState, CrisisClassifier, CrisisDetectionResult, CrisisMonitor, DispatchEngine,
    RequestPriority, Role,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Conversation lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionState {
    Idle,
    Listening,
    Processing,
    Speaking,
}

impl CompanionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompanionState::Idle => "idle",
            CompanionState::Listening => "listening",
            CompanionState::Processing => "processing",
            CompanionState::Speaking => "speaking",
        }
    }
}

/// Everything the orchestrator reports to its consumer.
#[derive(Debug, Clone)]
pub enum CompanionEvent {
    StateChanged(CompanionState),
    TranscriptUpdated(ConversationState),
    CrisisDetected(CrisisDetectionResult),
    /// Non-fatal pipeline error; the loop keeps running.
    Error(String),
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    /// Extra wait after VAD speech-end before committing the turn.
    pub settle_delay: Duration,
    /// Turns with fewer samples than this are discarded as noise.
    pub min_turn_samples: usize,
    /// Chunks of audio kept while silent, folded in when speech starts so the
    /// first word is not clipped.
    pub pre_roll_chunks: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            settle_delay: Duration::from_millis(500),
            // ~100ms at 16kHz; anything shorter is a pop or a door slam.
            min_turn_samples: 1600,
            // ~300ms at the default 30ms chunk size.
            pre_roll_chunks: 10,
        }
    }
}

/// Samples for the turn in progress. While the VAD is silent only a bounded
/// pre-roll is kept, so an idle microphone never grows the buffer; the
/// pre-roll is folded into the turn when speech starts.
struct TurnAccumulator {
    pre_roll: VecDeque<Vec<f32>>,
    max_pre_roll: usize,
    buffer: Vec<f32>,
}

impl TurnAccumulator {
    fn new(max_pre_roll: usize) -> Self {
        Self {
            pre_roll: VecDeque::new(),
            max_pre_roll,
            buffer: Vec::new(),
        }
    }

    fn push(&mut self, samples: &[f32], speech_active: bool) {
        if speech_active {
            for chunk in self.pre_roll.drain(..) {
                self.buffer.extend_from_slice(&chunk);
            }
            self.buffer.extend_from_slice(samples);
        } else {
            self.pre_roll.push_back(samples.to_vec());
            while self.pre_roll.len() > self.max_pre_roll {
                self.pre_roll.pop_front();
            }
        }
    }

    /// Hand back the committed turn and start accumulating the next one.
    fn take(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.buffer)
    }
}

/// Injected collaborators. The orchestrator owns no global state; everything
/// it talks to comes in here.
pub struct CompanionServices {
    pub engine: DispatchEngine,
    pub classifier: CrisisClassifier,
    pub stt: Arc<dyn SttBackend>,
    pub tts: Arc<dyn TtsBackend>,
}

struct Session {
    capture_stop: CaptureStop,
    listen_task: JoinHandle<()>,
}

struct Inner {
    engine: DispatchEngine,
    classifier: CrisisClassifier,
    stt: Arc<dyn SttBackend>,
    tts: Arc<dyn TtsBackend>,
    playback: AudioPlayback,
    config: OrchestratorConfig,
    events: mpsc::UnboundedSender<CompanionEvent>,
    state: Mutex<CompanionState>,
    conversation: Mutex<ConversationState>,
    monitor: Mutex<CrisisMonitor>,
    session: Mutex<Option<Session>>,
    is_processing: AtomicBool,
    manual_stop: AtomicBool,
    /// Bumped by `stop`; a pipeline that observes a newer epoch after any
    /// await abandons the turn instead of mutating state.
    turn_epoch: AtomicU64,
}

/// The conversation orchestrator. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct CompanionOrchestrator {
    inner: Arc<Inner>,
}

impl CompanionOrchestrator {
    /// Build an orchestrator and the event stream it reports through.
    pub fn new(
        services: CompanionServices,
        config: OrchestratorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<CompanionEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            engine: services.engine,
            classifier: services.classifier,
            stt: services.stt,
            tts: services.tts,
            playback: AudioPlayback::new(),
            config,
            events,
            state: Mutex::new(CompanionState::Idle),
            conversation: Mutex::new(ConversationState::new()),
            monitor: Mutex::new(CrisisMonitor::new()),
            session: Mutex::new(None),
            is_processing: AtomicBool::new(false),
            manual_stop: AtomicBool::new(false),
            turn_epoch: AtomicU64::new(0),
        });
        (Self { inner }, event_rx)
    }

    /// Begin (or resume) listening. No-op while a capture session is already
    /// live. Clears the manual-stop latch.
    pub fn start(&self) -> VoiceResult<()> {
        self.inner.clone().start()
    }

    /// Stop listening. Releases the microphone and VAD synchronously and
    /// abandons any turn not yet committed; playback already in progress is
    /// left to finish. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Stop the companion's voice mid-sentence (barge-in or UI mute).
    pub fn interrupt(&self) {
        self.inner.interrupt();
    }

    pub fn state(&self) -> CompanionState {
        *lock(&self.inner.state)
    }

    pub fn conversation(&self) -> ConversationState {
        lock(&self.inner.conversation).clone()
    }

    /// Highest crisis level observed this session.
    pub fn highest_crisis_level(&self) -> solace_core::CrisisLevel {
        lock(&self.inner.monitor).highest_level()
    }
}

impl Inner {
    fn start(self: Arc<Self>) -> VoiceResult<()> {
        self.manual_stop.store(false, Ordering::Release);
        self.clone().resume()?;
        self.set_state(CompanionState::Listening);
        Ok(())
    }

    /// Open the microphone and the listen loop without touching the state or
    /// the manual-stop latch. No-op while a session is already live.
    fn resume(self: Arc<Self>) -> VoiceResult<()> {
        {
            let session = lock(&self.session);
            if session.is_some() {
                debug!("resume ignored, capture already live");
                return Ok(());
            }
        }

        let capture = AudioCapture::new(self.config.audio.clone());
        let mut session = capture.start()?;
        let capture_stop = session.stop_handle();

        let inner = Arc::clone(&self);
        let listen_task = tokio::spawn(async move {
            let mut vad = EnergyVad::new(inner.config.vad.clone());
            let mut turn = TurnAccumulator::new(inner.config.pre_roll_chunks);
            let mut settle: Option<JoinHandle<()>> = None;

            while let Some(chunk) = session.recv_chunk().await {
                let event = vad.process_chunk(&chunk.samples);
                turn.push(&chunk.samples, vad.is_active());
                match event {
                    Some(VadEvent::SpeechStart) => {
                        debug!("speech start");
                        if *lock(&inner.state) == CompanionState::Speaking {
                            info!("barge-in, stopping playback");
                            inner.interrupt();
                        }
                    }
                    Some(VadEvent::SpeechEnd) => {
                        let samples = turn.take();
                        debug!(buffered = samples.len(), "speech end, settling before commit");
                        if let Some(previous) = settle.take() {
                            previous.abort();
                        }
                        let inner = Arc::clone(&inner);
                        settle = Some(tokio::spawn(async move {
                            tokio::time::sleep(inner.config.settle_delay).await;
                            if inner.manual_stop.load(Ordering::Acquire)
                                || inner.is_processing.load(Ordering::Acquire)
                            {
                                return;
                            }
                            inner.process_turn(samples).await;
                        }));
                    }
                    None => {}
                }
            }
            debug!("listen loop ended");
        });

        *lock(&self.session) = Some(Session {
            capture_stop,
            listen_task,
        });
        Ok(())
    }

    fn stop(&self) {
        self.manual_stop.store(true, Ordering::Release);
        // Invalidate any pipeline still awaiting STT, dispatch, or TTS.
        self.turn_epoch.fetch_add(1, Ordering::AcqRel);
        self.is_processing.store(false, Ordering::Release);
        self.release_capture();
        // Playback in progress is left alone; the companion finishes its
        // sentence even after the microphone is released.
        self.set_state(CompanionState::Idle);
        info!("orchestrator stopped");
    }

    fn interrupt(&self) {
        self.playback.stop();
        let mut state = lock(&self.state);
        if *state == CompanionState::Speaking {
            *state = CompanionState::Idle;
            drop(state);
            self.emit(CompanionEvent::StateChanged(CompanionState::Idle));
        }
    }

    fn release_capture(&self) {
        if let Some(session) = lock(&self.session).take() {
            session.capture_stop.stop();
            session.listen_task.abort();
        }
    }

    async fn process_turn(self: Arc<Self>, samples: Vec<f32>) {
        if self.is_processing.swap(true, Ordering::AcqRel) {
            return;
        }
        let epoch = self.turn_epoch.load(Ordering::Acquire);
        self.set_state(CompanionState::Processing);
        // Capture pauses during processing; resumed below unless manually
        // stopped in the meantime.
        self.release_capture();

        let outcome = self.clone().run_pipeline(samples, epoch).await;
        if self.abandoned(epoch) {
            debug!("turn abandoned by stop");
            return;
        }
        if let Err(e) = outcome {
            error!(error = %e, "turn pipeline failed");
            self.emit(CompanionEvent::Error(e.to_string()));
        }

        self.is_processing.store(false, Ordering::Release);
        self.resume_or_idle();
    }

    fn abandoned(&self, epoch: u64) -> bool {
        self.turn_epoch.load(Ordering::Acquire) != epoch
    }

    async fn run_pipeline(self: Arc<Self>, samples: Vec<f32>, epoch: u64) -> VoiceResult<()> {
        if samples.len() < self.config.min_turn_samples {
            debug!(samples = samples.len(), "turn below noise floor, discarded");
            return Ok(());
        }

        let stt = Arc::clone(&self.stt);
        let sample_rate = self.config.audio.sample_rate;
        let transcript = tokio::task::spawn_blocking(move || stt.transcribe(&samples, sample_rate))
            .await
            .map_err(|e| VoiceError::Stt(format!("transcription task failed: {e}")))??;
        if self.abandoned(epoch) {
            return Ok(());
        }
        if transcript.trim().is_empty() {
            debug!("empty transcript, discarded");
            return Ok(());
        }
        info!(chars = transcript.len(), "user turn transcribed");

        let context = {
            let mut conversation = lock(&self.conversation);
            conversation.add_message(Role::User, transcript);
            let snapshot = conversation.clone();
            let context = conversation.context_for_model();
            drop(conversation);
            self.emit(CompanionEvent::TranscriptUpdated(snapshot));
            context
        };

        // Crisis classification never takes the conversation down.
        let snapshot = lock(&self.conversation).clone();
        let crisis = self.classifier.classify(&snapshot).await;
        if self.abandoned(epoch) {
            return Ok(());
        }
        lock(&self.monitor).record(crisis.clone());
        self.emit(CompanionEvent::CrisisDetected(crisis));

        let response = self
            .engine
            .request(context, RequestPriority::Normal)
            .await
            .map_err(VoiceError::Dispatch)?;
        if self.abandoned(epoch) {
            return Ok(());
        }
        if response.trim().is_empty() {
            warn!("empty response from dispatch, skipping playback");
            return Ok(());
        }

        {
            let mut conversation = lock(&self.conversation);
            conversation.add_message(Role::Ai, response.clone());
            let snapshot = conversation.clone();
            drop(conversation);
            self.emit(CompanionEvent::TranscriptUpdated(snapshot));
        }

        let tts = Arc::clone(&self.tts);
        let spoken = response.clone();
        let audio = tokio::task::spawn_blocking(move || tts.synthesize(&spoken))
            .await
            .map_err(|e| VoiceError::Tts(format!("synthesis task failed: {e}")))??;
        if self.abandoned(epoch) {
            return Ok(());
        }
        if audio.is_empty() {
            debug!("synthesis returned no audio, skipping playback");
            return Ok(());
        }

        // Speaking only once audio is actually ready to play.
        self.set_state(CompanionState::Speaking);
        let done = self.playback.play(audio)?;
        // Reopen the microphone while speaking so a barge-in can interrupt.
        if !self.manual_stop.load(Ordering::Acquire) {
            if let Err(e) = self.clone().resume() {
                warn!(error = %e, "could not reopen microphone during playback");
            }
        }
        if done.finished().await {
            debug!("playback finished");
        } else {
            debug!("playback interrupted");
        }
        Ok(())
    }

    fn resume_or_idle(self: Arc<Self>) {
        if self.manual_stop.load(Ordering::Acquire) {
            self.set_state(CompanionState::Idle);
            return;
        }
        match self.clone().resume() {
            Ok(()) => self.set_state(CompanionState::Listening),
            Err(e) => {
                error!(error = %e, "failed to resume listening");
                self.emit(CompanionEvent::Error(format!(
                    "failed to resume listening: {e}"
                )));
                self.set_state(CompanionState::Idle);
            }
        }
    }

    fn set_state(&self, next: CompanionState) {
        {
            let mut state = lock(&self.state);
            if *state == next {
                return;
            }
            *state = next;
        }
        debug!(state = next.as_str(), "state changed");
        self.emit(CompanionEvent::StateChanged(next));
    }

    fn emit(&self, event: CompanionEvent) {
        let _ = self.events.send(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
