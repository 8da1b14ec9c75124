use crate::backends::SpeechBackend;
use rodio::{Decoder, OutputStream, Sink, Source};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound on a blocking `speak` call.
const BLOCKING_SPEAK_LIMIT: Duration = Duration::from_secs(60);

/// Text-to-speech collaborator of the orchestrator.
pub trait SpeechSynthesizer: Send + Sync {
    /// Speak `text`. With `blocking`, return only after playback finished.
    fn speak(&self, text: &str, blocking: bool);
    /// Cut the current utterance and drop anything still queued.
    fn stop(&self);
    /// Stop and release the output device.
    fn cleanup(&self);
}

enum AudioCommand {
    Speak {
        text: String,
        generation: u64,
        // Dropped after playback, which wakes a blocking caller.
        _done: Option<Sender<()>>,
    },
    Shutdown,
}

#[derive(Default)]
struct Playback {
    current: Mutex<Option<Arc<Sink>>>,
    generation: AtomicU64,
}

/// Speaks through a dedicated audio thread that owns the output stream.
pub struct AudioEngine {
    tx: Mutex<Option<Sender<AudioCommand>>>,
    playback: Arc<Playback>,
    shut_down: AtomicBool,
}

impl AudioEngine {
    pub fn new(backend: Box<dyn SpeechBackend>, volume: f32) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<AudioCommand>();
        let playback = Arc::new(Playback::default());
        let shared = playback.clone();

        thread::Builder::new()
            .name("deskvox-audio".to_string())
            .spawn(move || audio_thread(rx, backend, volume, shared))?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            playback,
            shut_down: AtomicBool::new(false),
        })
    }

    fn send(&self, command: AudioCommand) -> bool {
        let guard = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }
}

impl SpeechSynthesizer for AudioEngine {
    fn speak(&self, text: &str, blocking: bool) {
        let text = text.trim();
        if text.is_empty() || self.shut_down.load(Ordering::SeqCst) {
            return;
        }

        let generation = self.playback.generation.load(Ordering::SeqCst);
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let sent = self.send(AudioCommand::Speak {
            text: text.to_string(),
            generation,
            _done: blocking.then_some(done_tx),
        });
        if !sent {
            warn!("audio thread gone, dropping utterance");
            return;
        }

        if blocking {
            // Returns once the sender is dropped after playback.
            let _ = done_rx.recv_timeout(BLOCKING_SPEAK_LIMIT);
        }
    }

    fn stop(&self) {
        self.playback.generation.fetch_add(1, Ordering::SeqCst);
        let current = self
            .playback
            .current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(sink) = current {
            sink.stop();
        }
    }

    fn cleanup(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop();
        self.send(AudioCommand::Shutdown);
        self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        info!("audio engine shut down");
    }
}

fn audio_thread(
    rx: Receiver<AudioCommand>,
    backend: Box<dyn SpeechBackend>,
    volume: f32,
    playback: Arc<Playback>,
) {
    // Audio stream must live on this thread
    let output = match OutputStream::try_default() {
        Ok(pair) => Some(pair),
        Err(e) => {
            error!("no audio output device, speech will only be logged: {e}");
            None
        }
    };

    while let Ok(command) = rx.recv() {
        let (text, generation) = match command {
            AudioCommand::Speak {
                text, generation, ..
            } => (text, generation),
            AudioCommand::Shutdown => break,
        };

        if generation < playback.generation.load(Ordering::SeqCst) {
            debug!(text = %text, "skipping utterance cancelled by stop");
            continue;
        }
        info!(text = %text, "speaking");

        let Some((_stream, handle)) = output.as_ref() else {
            continue;
        };

        let wav = match backend.synthesize(&text) {
            Ok(wav) => wav,
            Err(e) => {
                error!(backend = backend.id(), "synthesis failed: {e}");
                continue;
            }
        };

        let source = match Decoder::new(Cursor::new(wav)) {
            Ok(source) => source,
            Err(e) => {
                error!("failed to decode synthesized audio: {e}");
                continue;
            }
        };

        let sink = match Sink::try_new(handle) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                error!("failed to create sink: {e}");
                continue;
            }
        };
        sink.set_volume(volume);
        sink.append(source.convert_samples::<f32>());

        *playback.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(sink.clone());
        // A stop() between the generation check and here must still cut this.
        if generation < playback.generation.load(Ordering::SeqCst) {
            sink.stop();
        }
        sink.sleep_until_end();
        playback
            .current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
    }

    debug!("audio thread exiting");
}
