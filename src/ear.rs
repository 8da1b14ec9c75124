//! Command recognition: capture one utterance after the trigger and turn it
//! into text.

use crate::audio::{self, Microphone, SAMPLE_RATE};
use crate::config_loader::{Settings, SttBackend};
use crate::error::{AssistantError, Result};
use crate::wyoming::WyomingTranscriber;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use vosk::{DecodingState, Model, Recognizer};

/// 100 ms of 16 kHz audio.
pub const CHUNK_SAMPLES: usize = 1600;
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Confidence assumed for a phrase whose words carry no confidence values.
pub const DEFAULT_PHRASE_CONFIDENCE: f32 = 0.7;

/// Chunks kept from before speech onset so the first syllable is not lost.
const PRE_ROLL_CHUNKS: usize = 3;

/// Recording budget and acceptance rules for one recognition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenPolicy {
    pub max_duration: Duration,
    pub silence_timeout: Duration,
    pub min_confidence: f32,
}

impl ListenPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_duration: settings.command_max_duration(),
            silence_timeout: settings.command_silence_timeout(),
            min_confidence: settings.command_min_confidence,
        }
    }
}

impl Default for ListenPolicy {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(10),
            silence_timeout: Duration::from_secs(2),
            min_confidence: 0.3,
        }
    }
}

/// Speech-to-text collaborator of the orchestrator.
///
/// `recognize` returns the recognized text, or an empty string when nothing
/// intelligible was heard. Errors are reserved for device and backend
/// failures.
pub trait SpeechRecognizer: Send + Sync {
    fn recognize(&self, policy: &ListenPolicy) -> Result<String>;
    /// Abort any capture in progress and release resources.
    fn cleanup(&self);
}

/// Energy thresholds for the simple voice activity detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VadConfig {
    pub speech_threshold: i16,
    pub silence_threshold: i16,
}

impl VadConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            speech_threshold: settings.vad_speech_threshold,
            silence_threshold: settings.vad_silence_threshold,
        }
    }
}

/// Mean word confidence, or [`DEFAULT_PHRASE_CONFIDENCE`] without words.
pub fn phrase_confidence(word_confidences: &[f32]) -> f32 {
    if word_confidences.is_empty() {
        DEFAULT_PHRASE_CONFIDENCE
    } else {
        word_confidences.iter().sum::<f32>() / word_confidences.len() as f32
    }
}

/// Collect one utterance by energy: wait for a chunk above the speech
/// threshold, then record until `silence_timeout` of audio below the silence
/// threshold or until `max_duration` of audio has been read.
///
/// Returns `None` if no speech started. Time is measured in audio, not wall
/// clock, so the same input always gives the same cut.
pub fn capture_utterance<F>(
    mut next_chunk: F,
    vad: &VadConfig,
    max_duration: Duration,
    silence_timeout: Duration,
    cancelled: &AtomicBool,
) -> Result<Option<Vec<i16>>>
where
    F: FnMut() -> Result<Vec<i16>>,
{
    let mut pre_roll: VecDeque<Vec<i16>> = VecDeque::with_capacity(PRE_ROLL_CHUNKS);
    let mut recorded: Vec<i16> = Vec::new();
    let mut started = false;
    let mut elapsed = Duration::ZERO;
    let mut silence = Duration::ZERO;

    while elapsed < max_duration {
        if cancelled.load(Ordering::SeqCst) {
            debug!("capture cancelled");
            break;
        }
        let chunk = next_chunk()?;
        let chunk_len =
            Duration::from_micros(chunk.len() as u64 * 1_000_000 / SAMPLE_RATE as u64);
        elapsed += chunk_len;
        let level = audio::rms(&chunk);

        if !started {
            if level >= vad.speech_threshold {
                started = true;
                recorded.extend(pre_roll.drain(..).flatten());
                recorded.extend_from_slice(&chunk);
            } else {
                if pre_roll.len() == PRE_ROLL_CHUNKS {
                    pre_roll.pop_front();
                }
                pre_roll.push_back(chunk);
            }
            continue;
        }

        recorded.extend_from_slice(&chunk);
        if level < vad.silence_threshold {
            silence += chunk_len;
            if silence >= silence_timeout {
                break;
            }
        } else {
            silence = Duration::ZERO;
        }
    }

    Ok(started.then_some(recorded))
}

enum Backend {
    Vosk(Arc<Model>),
    Wyoming {
        transcriber: WyomingTranscriber,
        vad: VadConfig,
    },
}

/// Microphone-backed recognizer. The device is opened per recognition and
/// released when it returns.
pub struct Ear {
    backend: Backend,
    cancelled: AtomicBool,
}

impl Ear {
    pub fn vosk(model: Arc<Model>) -> Self {
        Self {
            backend: Backend::Vosk(model),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn wyoming(transcriber: WyomingTranscriber, vad: VadConfig) -> Self {
        Self {
            backend: Backend::Wyoming { transcriber, vad },
            cancelled: AtomicBool::new(false),
        }
    }

    /// Build the backend named by `stt_backend`. A loaded Vosk model can be
    /// shared with the trigger detector.
    pub fn from_settings(settings: &Settings, model: Option<Arc<Model>>) -> Result<Self> {
        match settings.stt_backend {
            SttBackend::Vosk => {
                let model = match model {
                    Some(model) => model,
                    None => Arc::new(load_model(&settings.vosk_model_path)?),
                };
                info!("command recognizer: vosk");
                Ok(Self::vosk(model))
            }
            SttBackend::Wyoming => {
                let transcriber = WyomingTranscriber::new(
                    &settings.wyoming_host,
                    settings.wyoming_port,
                    settings.wyoming_timeout(),
                )?;
                info!(address = %transcriber.address(), "command recognizer: wyoming");
                Ok(Self::wyoming(transcriber, VadConfig::from_settings(settings)))
            }
        }
    }

    fn recognize_vosk(&self, model: &Model, policy: &ListenPolicy) -> Result<String> {
        let mut mic = Microphone::open()?;
        let mut recognizer = Recognizer::new(model, SAMPLE_RATE as f32)
            .ok_or_else(|| AssistantError::Recognition("could not create recognizer".into()))?;
        recognizer.set_words(true);

        let started = Instant::now();
        let mut last_voice: Option<Instant> = None;
        let mut phrases: Vec<String> = Vec::new();

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                debug!("recognition cancelled");
                break;
            }
            if started.elapsed() >= policy.max_duration {
                debug!("recording budget exhausted");
                break;
            }
            if let Some(at) = last_voice {
                if at.elapsed() >= policy.silence_timeout {
                    debug!("trailing silence, stopping capture");
                    break;
                }
            }

            let chunk = mic.read_chunk(CHUNK_SAMPLES, READ_TIMEOUT)?;
            let state = recognizer
                .accept_waveform(&chunk)
                .map_err(|e| AssistantError::Recognition(format!("{e:?}")))?;

            match state {
                DecodingState::Finalized => {
                    if let Some(phrase) = take_phrase(&mut recognizer, false, policy.min_confidence)
                    {
                        phrases.push(phrase);
                    }
                    last_voice = Some(Instant::now());
                }
                DecodingState::Running => {
                    if !recognizer.partial_result().partial.is_empty() {
                        last_voice = Some(Instant::now());
                    }
                }
                DecodingState::Failed => {
                    return Err(AssistantError::Recognition("decoding failed".into()));
                }
            }
        }

        if let Some(phrase) = take_phrase(&mut recognizer, true, policy.min_confidence) {
            phrases.push(phrase);
        }
        Ok(phrases.join(" "))
    }

    fn recognize_wyoming(
        &self,
        transcriber: &WyomingTranscriber,
        vad: &VadConfig,
        policy: &ListenPolicy,
    ) -> Result<String> {
        let mut mic = Microphone::open()?;
        let samples = capture_utterance(
            || mic.read_chunk(CHUNK_SAMPLES, READ_TIMEOUT),
            vad,
            policy.max_duration,
            policy.silence_timeout,
            &self.cancelled,
        )?;
        drop(mic);

        match samples {
            Some(samples) => transcriber.transcribe(&samples, SAMPLE_RATE),
            None => Ok(String::new()),
        }
    }
}

/// Pull the current (or final) result out of the recognizer and apply the
/// confidence floor.
fn take_phrase(recognizer: &mut Recognizer, flush: bool, min_confidence: f32) -> Option<String> {
    let result = if flush {
        recognizer.final_result()
    } else {
        recognizer.result()
    };
    let single = result.single()?;
    let text = single.text.trim();
    if text.is_empty() {
        return None;
    }

    let confidences: Vec<f32> = single.result.iter().map(|w| w.conf).collect();
    let confidence = phrase_confidence(&confidences);
    if confidence < min_confidence {
        debug!(text, confidence, "discarding low-confidence phrase");
        return None;
    }
    Some(text.to_string())
}

impl SpeechRecognizer for Ear {
    fn recognize(&self, policy: &ListenPolicy) -> Result<String> {
        self.cancelled.store(false, Ordering::SeqCst);
        let text = match &self.backend {
            Backend::Vosk(model) => self.recognize_vosk(model, policy)?,
            Backend::Wyoming { transcriber, vad } => {
                self.recognize_wyoming(transcriber, vad, policy)?
            }
        };
        let text = text.trim().to_string();
        info!(text = %text, "recognized");
        Ok(text)
    }

    fn cleanup(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

pub fn load_model(path: &str) -> Result<Model> {
    if !std::path::Path::new(path).is_dir() {
        warn!(path, "vosk model directory missing");
        return Err(AssistantError::Model(format!("no model directory at {path}")));
    }
    Model::new(path).ok_or_else(|| AssistantError::Model(format!("failed to load model at {path}")))
}
