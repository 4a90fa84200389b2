//! Microphone capture via CPAL.
//!
//! The cpal `Stream` is not `Send`, so the stream lives on a dedicated thread
//! for its whole lifetime. Samples flow out through an unbounded channel in
//! fixed-size chunks; dropping or stopping the session tears the thread down
//! and closes the channel, which is how downstream consumers observe the end
//! of capture.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Capture configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Samples per emitted chunk (default: 480 for 30ms at 16kHz)
    pub chunk_samples: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            chunk_samples: 480, // 30ms at 16kHz
        }
    }
}

/// One chunk of captured samples.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,

    /// When the chunk was captured
    pub timestamp: Instant,
}

/// Microphone capture. `start` hands back a [`CaptureSession`]; the session
/// owns the device for its lifetime.
pub struct AudioCapture {
    config: AudioConfig,
}

impl AudioCapture {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }

    /// Open the default input device and start streaming chunks.
    ///
    /// Blocks briefly while the capture thread opens the device, so that a
    /// missing microphone or denied permission surfaces here as an error
    /// rather than a silent dead channel.
    pub fn start(self) -> VoiceResult<CaptureSession> {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<VoiceResult<()>>();
        let stopped = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stopped);
        let config = self.config;
        let thread_config = config.clone();

        thread::spawn(move || {
            let stream = match build_stream(&thread_config, chunk_tx) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // Keep the stream alive until stop.
            while !thread_stop.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(25));
            }
            drop(stream);
        });

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {
                info!(
                    sample_rate = config.sample_rate,
                    chunk_samples = config.chunk_samples,
                    "audio capture started"
                );
                Ok(CaptureSession { chunk_rx, stopped })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VoiceError::AudioStream(
                "capture thread did not report readiness".into(),
            )),
        }
    }

    /// List available input devices.
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

fn build_stream(
    config: &AudioConfig,
    chunk_tx: mpsc::UnboundedSender<AudioChunk>,
) -> VoiceResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;
    info!(
        device = device.name().unwrap_or_else(|_| "Unknown".to_string()),
        "using input device"
    );

    let stream_config = StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let chunk_samples = config.chunk_samples;
    let mut sample_buffer: Vec<f32> = Vec::with_capacity(chunk_samples);

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                sample_buffer.push(sample);
                if sample_buffer.len() >= chunk_samples {
                    let chunk = AudioChunk {
                        samples: std::mem::take(&mut sample_buffer),
                        timestamp: Instant::now(),
                    };
                    if chunk_tx.send(chunk).is_err() {
                        // Receiver gone; nothing to do until stop.
                        return;
                    }
                    sample_buffer.reserve(chunk_samples);
                }
            }
        },
        move |err| {
            warn!(error = %err, "audio capture stream error");
        },
        None,
    )?;
    stream.play()?;
    Ok(stream)
}

/// Live capture session. Drop it (or call [`CaptureSession::stop`]) to release
/// the microphone; stopping is idempotent.
pub struct CaptureSession {
    chunk_rx: mpsc::UnboundedReceiver<AudioChunk>,
    stopped: Arc<AtomicBool>,
}

impl CaptureSession {
    /// Receive the next chunk; `None` once capture has stopped.
    pub async fn recv_chunk(&mut self) -> Option<AudioChunk> {
        self.chunk_rx.recv().await
    }

    /// Release the microphone. Safe to call more than once.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            info!("audio capture stopped");
        }
    }

    /// Detachable stop handle, for releasing capture from another task.
    pub fn stop_handle(&self) -> CaptureStop {
        CaptureStop {
            stopped: Arc::clone(&self.stopped),
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stop handle detached from the session.
#[derive(Clone)]
pub struct CaptureStop {
    stopped: Arc<AtomicBool>,
}

impl CaptureStop {
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            info!("audio capture stopped");
        }
    }
}
