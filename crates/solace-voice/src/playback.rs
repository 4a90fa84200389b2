//! TTS playback with a FIFO overflow queue and an interruption kill-switch.
//!
//! Rodio's `OutputStream` is not `Send`, so all playback happens on one
//! worker thread that owns the device. One decoded buffer plays at a time;
//! `play` while something is already playing queues behind it. `stop` halts
//! the current buffer, clears the queue, and drops the pending completion
//! signals without firing them, which is how an awaiting caller observes an
//! interruption. The output device is opened lazily on the first real play,
//! so constructing a player never fails and machines without audio hardware
//! can still run everything except actual sound.

use crate::error::{VoiceError, VoiceResult};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

enum Command {
    Play {
        bytes: Vec<u8>,
        done: oneshot::Sender<()>,
    },
    Stop,
}

/// Resolves when the corresponding buffer finishes. A dropped sender (stop or
/// decode failure) reads as an interruption, not an error.
pub struct PlaybackDone {
    rx: oneshot::Receiver<()>,
}

impl PlaybackDone {
    /// Wait for the buffer to finish. `true` if it played to completion,
    /// `false` if it was stopped or never played.
    pub async fn finished(self) -> bool {
        self.rx.await.is_ok()
    }
}

/// Speaker output with a FIFO queue, served by a dedicated worker thread.
pub struct AudioPlayback {
    commands: Sender<Command>,
    playing: Arc<AtomicBool>,
}

impl AudioPlayback {
    pub fn new() -> Self {
        let (tx, rx) = std::sync::mpsc::channel();
        let playing = Arc::new(AtomicBool::new(false));
        let worker_flag = Arc::clone(&playing);
        thread::spawn(move || playback_worker(rx, worker_flag));
        Self {
            commands: tx,
            playing,
        }
    }

    /// Queue audio bytes (WAV/MP3) for playback. Returns a completion handle;
    /// playback starts immediately when idle, otherwise after everything
    /// already queued.
    pub fn play(&self, bytes: Vec<u8>) -> VoiceResult<PlaybackDone> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Play {
                bytes,
                done: done_tx,
            })
            .map_err(|_| VoiceError::Playback("playback worker is gone".into()))?;
        Ok(PlaybackDone { rx: done_rx })
    }

    /// Stop the current buffer and drop everything queued. Pending completion
    /// handles resolve as interrupted.
    pub fn stop(&self) {
        if self.commands.send(Command::Stop).is_err() {
            warn!("playback worker is gone, stop ignored");
        }
    }

    /// Whether a buffer is playing or queued. Read-only.
    pub fn is_currently_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }
}

impl Default for AudioPlayback {
    fn default() -> Self {
        Self::new()
    }
}

struct Output {
    _stream: OutputStream,
    _handle: OutputStreamHandle,
    sink: Sink,
}

fn open_output() -> Option<Output> {
    let (stream, handle) = match OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "no audio output device");
            return None;
        }
    };
    let sink = match Sink::try_new(&handle) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to create playback sink");
            return None;
        }
    };
    info!("audio output ready");
    Some(Output {
        _stream: stream,
        _handle: handle,
        sink,
    })
}

fn playback_worker(commands: Receiver<Command>, playing: Arc<AtomicBool>) {
    let mut output: Option<Output> = None;
    let mut queue: VecDeque<(Vec<u8>, oneshot::Sender<()>)> = VecDeque::new();
    let mut current: Option<oneshot::Sender<()>> = None;

    loop {
        match commands.recv_timeout(Duration::from_millis(25)) {
            Ok(Command::Play { bytes, done }) => {
                queue.push_back((bytes, done));
            }
            Ok(Command::Stop) => {
                if let Some(out) = &output {
                    out.sink.stop();
                }
                // Dropped senders signal interruption to the awaiters.
                queue.clear();
                current = None;
                playing.store(false, Ordering::Release);
                info!("playback stopped and queue cleared");
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(out) = &output {
                    out.sink.stop();
                }
                playing.store(false, Ordering::Release);
                return;
            }
        }

        let idle = output.as_ref().map(|o| o.sink.empty()).unwrap_or(true);
        if idle {
            if let Some(done) = current.take() {
                let _ = done.send(());
            }
            match queue.pop_front() {
                Some((bytes, done)) => {
                    if output.is_none() {
                        output = open_output();
                    }
                    match &output {
                        Some(out) => match start_buffer(out, &bytes) {
                            Ok(()) => {
                                current = Some(done);
                                playing.store(true, Ordering::Release);
                            }
                            Err(e) => {
                                warn!(error = %e, "failed to play buffer, skipping");
                            }
                        },
                        None => {
                            // No device; drop the completion as interrupted.
                            debug!("dropping buffer, no output device");
                        }
                    }
                }
                None => playing.store(false, Ordering::Release),
            }
        }
    }
}

fn start_buffer(output: &Output, bytes: &[u8]) -> VoiceResult<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    let cursor = Cursor::new(bytes.to_vec());
    let source = rodio::Decoder::new(cursor)
        .map_err(|e| VoiceError::Playback(format!("decode failed: {e}")))?;
    output.sink.append(source.convert_samples::<f32>());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        let playback = AudioPlayback::new();
        assert!(!playback.is_currently_playing());
    }

    #[test]
    fn stop_is_safe_when_idle() {
        let playback = AudioPlayback::new();
        playback.stop();
        playback.stop();
        assert!(!playback.is_currently_playing());
    }

    #[test]
    fn undecodable_bytes_resolve_as_interrupted() {
        let playback = AudioPlayback::new();
        let done = playback.play(vec![1, 2, 3, 4]).unwrap();
        // Decode failure (or missing device) drops the completion sender.
        assert!(!tokio_test::block_on(done.finished()));
    }

    #[test]
    fn stop_drops_queued_completions() {
        let playback = AudioPlayback::new();
        let a = playback.play(vec![0; 64]).unwrap();
        let b = playback.play(vec![0; 64]).unwrap();
        playback.stop();
        assert!(!tokio_test::block_on(a.finished()));
        assert!(!tokio_test::block_on(b.finished()));
    }
}
