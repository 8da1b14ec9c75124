//! Trigger phrase detection.
//!
//! A background loop pulls utterances from a backend, counts consecutive
//! finalized utterances containing the trigger phrase, and fires the
//! registered callback on its own thread once the count is reached.

use crate::audio::{Microphone, SAMPLE_RATE};
use crate::config_loader::{Settings, WakeBackend};
use crate::ear::{self, capture_utterance, VadConfig, CHUNK_SAMPLES};
use crate::error::{AssistantError, Result};
use crate::worker::{spawn_worker, Worker};
use crate::wyoming::WyomingTranscriber;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use vosk::{DecodingState, Model, Recognizer};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
/// Pause after a failed read so a broken backend does not spin.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);
/// Trailing silence that ends a networked phrase capture.
const PHRASE_SILENCE: Duration = Duration::from_millis(700);

/// What a backend hands the detection loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Utterance {
    /// A completed utterance.
    Final(String),
    /// Interim text; never counts toward a trigger.
    Partial(String),
    /// Nothing recognized in this read.
    Silence,
}

/// One recognition backend for the detection loop.
pub trait UtteranceSource: Send {
    fn next_utterance(&mut self) -> Result<Utterance>;
}

/// Consecutive-match state machine.
#[derive(Debug, Clone)]
pub struct ConfirmationCounter {
    phrase: String,
    required: u32,
    consecutive: u32,
}

impl ConfirmationCounter {
    pub fn new(phrase: &str, required: u32) -> Self {
        Self {
            phrase: phrase.trim().to_lowercase(),
            required: required.max(1),
            consecutive: 0,
        }
    }

    /// Feed one utterance. Returns true when the trigger is confirmed; the
    /// count is then back at zero.
    pub fn observe(&mut self, utterance: &Utterance) -> bool {
        let Utterance::Final(text) = utterance else {
            return false;
        };

        if text.to_lowercase().contains(&self.phrase) {
            self.consecutive += 1;
            if self.consecutive >= self.required {
                self.consecutive = 0;
                return true;
            }
        } else {
            self.consecutive = 0;
        }
        false
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// A finished recognition is always a complete utterance, even when it
/// holds nothing but the grammar's `[unk]` token or no words at all, so it
/// breaks any running streak.
fn finalized(text: String) -> Utterance {
    Utterance::Final(text)
}

/// Offline spotter: Vosk over the microphone.
pub struct VoskSpotter {
    mic: Microphone,
    recognizer: Recognizer,
}

impl VoskSpotter {
    pub fn new(mic: Microphone, recognizer: Recognizer) -> Self {
        Self { mic, recognizer }
    }
}

/// Recognizer limited to the trigger phrase when the model accepts a grammar.
pub fn wake_recognizer(model: &Model, phrase: &str) -> Result<Recognizer> {
    let grammar = [phrase, "[unk]"];
    Recognizer::new_with_grammar(model, SAMPLE_RATE as f32, &grammar)
        .or_else(|| Recognizer::new(model, SAMPLE_RATE as f32))
        .ok_or_else(|| AssistantError::Model("could not create wake recognizer".into()))
}

impl UtteranceSource for VoskSpotter {
    fn next_utterance(&mut self) -> Result<Utterance> {
        let chunk = self.mic.read_chunk(CHUNK_SAMPLES, READ_TIMEOUT)?;
        let state = self
            .recognizer
            .accept_waveform(&chunk)
            .map_err(|e| AssistantError::Recognition(format!("{e:?}")))?;

        match state {
            DecodingState::Finalized => {
                let text = self
                    .recognizer
                    .result()
                    .single()
                    .map(|r| r.text.trim().to_string())
                    .unwrap_or_default();
                Ok(finalized(text))
            }
            DecodingState::Running => {
                let partial = self.recognizer.partial_result().partial.trim().to_string();
                if partial.is_empty() {
                    Ok(Utterance::Silence)
                } else {
                    Ok(Utterance::Partial(partial))
                }
            }
            DecodingState::Failed => Err(AssistantError::Recognition("decoding failed".into())),
        }
    }
}

/// Networked spotter: energy-gated phrase capture bounded by the phrase
/// limit, then one Wyoming transcription per phrase.
pub struct WyomingSpotter {
    mic: Microphone,
    transcriber: WyomingTranscriber,
    vad: VadConfig,
    phrase_limit: Duration,
    never_cancelled: AtomicBool,
}

impl WyomingSpotter {
    pub fn new(
        mic: Microphone,
        transcriber: WyomingTranscriber,
        vad: VadConfig,
        phrase_limit: Duration,
    ) -> Self {
        Self {
            mic,
            transcriber,
            vad,
            phrase_limit,
            never_cancelled: AtomicBool::new(false),
        }
    }
}

impl UtteranceSource for WyomingSpotter {
    fn next_utterance(&mut self) -> Result<Utterance> {
        let mic = &mut self.mic;
        let samples = capture_utterance(
            || mic.read_chunk(CHUNK_SAMPLES, READ_TIMEOUT),
            &self.vad,
            self.phrase_limit,
            PHRASE_SILENCE,
            &self.never_cancelled,
        )?;

        let Some(samples) = samples else {
            return Ok(Utterance::Silence);
        };
        let text = self.transcriber.transcribe(&samples, SAMPLE_RATE)?;
        Ok(finalized(text))
    }
}

/// Backend chosen once at construction.
pub enum DetectorBackend {
    Offline(VoskSpotter),
    Networked(WyomingSpotter),
    /// Any other source, e.g. a scripted one.
    Injected(Box<dyn UtteranceSource>),
}

impl DetectorBackend {
    /// Open the microphone and pick the backend. Offline falls back to
    /// networked when the model cannot be loaded; a missing microphone is
    /// fatal.
    pub fn select(settings: &Settings, model: Option<Arc<Model>>) -> Result<Self> {
        let mic = Microphone::open()?;
        info!(device = %mic.device_name(), "wake detector microphone open");

        if settings.wake_backend == WakeBackend::Offline {
            let model = match model {
                Some(model) => Ok(model),
                None => ear::load_model(&settings.vosk_model_path).map(Arc::new),
            };
            match model.and_then(|m| wake_recognizer(&m, &settings.wake_word_lower())) {
                Ok(recognizer) => {
                    info!("wake detector backend: offline");
                    return Ok(Self::Offline(VoskSpotter::new(mic, recognizer)));
                }
                Err(e) => {
                    warn!("offline wake detection unavailable ({e}), falling back to networked");
                }
            }
        }

        Self::networked(mic, settings)
    }

    fn networked(mic: Microphone, settings: &Settings) -> Result<Self> {
        let transcriber = WyomingTranscriber::new(
            &settings.wyoming_host,
            settings.wyoming_port,
            settings.wyoming_timeout(),
        )?;
        info!(address = %transcriber.address(), "wake detector backend: networked");
        Ok(Self::Networked(WyomingSpotter::new(
            mic,
            transcriber,
            VadConfig::from_settings(settings),
            settings.wake_phrase_limit(),
        )))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Offline(_) => "offline",
            Self::Networked(_) => "networked",
            Self::Injected(_) => "injected",
        }
    }

    fn next_utterance(&mut self) -> Result<Utterance> {
        match self {
            Self::Offline(spotter) => spotter.next_utterance(),
            Self::Networked(spotter) => spotter.next_utterance(),
            Self::Injected(source) => source.next_utterance(),
        }
    }
}

/// Shared view of the detector for status displays.
#[derive(Debug, Default)]
pub struct DetectorStatus {
    listening: AtomicBool,
    streak: AtomicU32,
}

impl DetectorStatus {
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Relaxed)
    }

    pub fn streak(&self) -> u32 {
        self.streak.load(Ordering::Relaxed)
    }
}

pub type TriggerCallback = Arc<dyn Fn() + Send + Sync>;

/// What the orchestrator needs from a trigger detector.
pub trait TriggerSource: Send {
    fn start(&mut self, callback: TriggerCallback) -> Result<()>;
    fn stop(&mut self);
    fn status(&self) -> Arc<DetectorStatus>;
}

pub struct TriggerDetector {
    phrase: String,
    confirmations: u32,
    join_timeout: Duration,
    backend: Option<DetectorBackend>,
    running: Arc<AtomicBool>,
    worker: Option<Worker<DetectorBackend>>,
    status: Arc<DetectorStatus>,
}

impl TriggerDetector {
    /// Acquire the microphone and select the backend from settings.
    pub fn new(settings: &Settings, model: Option<Arc<Model>>) -> Result<Self> {
        let backend = DetectorBackend::select(settings, model)?;
        Ok(Self::with_backend(
            backend,
            &settings.wake_word_lower(),
            settings.wake_confirmations,
            settings.join_timeout(),
        ))
    }

    pub fn with_backend(
        backend: DetectorBackend,
        phrase: &str,
        confirmations: u32,
        join_timeout: Duration,
    ) -> Self {
        Self {
            phrase: phrase.trim().to_lowercase(),
            confirmations: confirmations.max(1),
            join_timeout,
            backend: Some(backend),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            status: Arc::new(DetectorStatus::default()),
        }
    }

    pub fn backend_label(&self) -> Option<&'static str> {
        self.backend.as_ref().map(DetectorBackend::label)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl TriggerSource for TriggerDetector {
    fn start(&mut self, callback: TriggerCallback) -> Result<()> {
        if self.worker.is_some() {
            warn!("trigger detector already running");
            return Ok(());
        }
        let backend = self.backend.take().ok_or_else(|| {
            AssistantError::Lifecycle("detector backend lost after an unclean stop".into())
        })?;

        self.running.store(true, Ordering::SeqCst);
        let ctx = LoopContext {
            counter: ConfirmationCounter::new(&self.phrase, self.confirmations),
            running: self.running.clone(),
            status: self.status.clone(),
            callback,
        };
        let label = backend.label();

        // The backend comes back through the join so the detector can restart.
        let spawned = spawn_worker("deskvox-wake", move || {
            let mut backend = backend;
            detection_loop(&mut backend, ctx);
            backend
        });

        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                info!(phrase = %self.phrase, backend = label, "trigger detector started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(AssistantError::Io(e))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(worker) = self.worker.take() else {
            return;
        };
        match worker.join_timeout(self.join_timeout) {
            Some(backend) => {
                self.backend = Some(backend);
                info!("trigger detector stopped");
            }
            None => warn!("trigger detector did not stop cleanly; it cannot be restarted"),
        }
        self.status.listening.store(false, Ordering::Relaxed);
    }

    fn status(&self) -> Arc<DetectorStatus> {
        self.status.clone()
    }
}

impl Drop for TriggerDetector {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

struct LoopContext {
    counter: ConfirmationCounter,
    running: Arc<AtomicBool>,
    status: Arc<DetectorStatus>,
    callback: TriggerCallback,
}

fn detection_loop(backend: &mut DetectorBackend, mut ctx: LoopContext) {
    ctx.status.listening.store(true, Ordering::Relaxed);

    while ctx.running.load(Ordering::SeqCst) {
        let utterance = match backend.next_utterance() {
            Ok(utterance) => utterance,
            Err(e) => {
                // Transient: unintelligible audio, network hiccup, read timeout.
                // Counts as a non-matching utterance.
                debug!(error = %e, "wake recognition error ignored");
                ctx.counter.reset();
                ctx.status.streak.store(0, Ordering::Relaxed);
                thread::sleep(ERROR_BACKOFF);
                continue;
            }
        };

        match &utterance {
            Utterance::Final(text) => debug!(text = %text, "heard"),
            Utterance::Partial(text) => debug!(partial = %text, "partial"),
            Utterance::Silence => {}
        }

        let fired = ctx.counter.observe(&utterance);
        ctx.status
            .streak
            .store(ctx.counter.consecutive(), Ordering::Relaxed);

        if fired {
            info!("trigger phrase confirmed");
            let callback = ctx.callback.clone();
            let spawned = thread::Builder::new()
                .name("deskvox-trigger".to_string())
                .spawn(move || callback());
            if let Err(e) = spawned {
                error!("could not dispatch trigger callback: {e}");
            }
        }
    }

    ctx.status.listening.store(false, Ordering::Relaxed);
    ctx.status.streak.store(0, Ordering::Relaxed);
}
