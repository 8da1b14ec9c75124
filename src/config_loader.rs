use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which recognizer the trigger detector prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeBackend {
    Offline,
    Networked,
}

/// Which recognizer captures the command after the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttBackend {
    Vosk,
    Wyoming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Trigger detection
    pub wake_word: String,
    pub wake_confirmations: u32,
    pub wake_backend: WakeBackend,
    pub vosk_model_path: String,
    pub wake_phrase_limit_secs: u64,
    // Command recognition
    pub stt_backend: SttBackend,
    pub wyoming_host: String,
    pub wyoming_port: u16,
    pub wyoming_timeout_secs: u64,
    pub command_max_duration_secs: u64,
    pub command_silence_timeout_secs: u64,
    pub command_min_confidence: f32,
    pub vad_speech_threshold: i16,
    pub vad_silence_threshold: i16,
    // Synthesis
    pub tts_binary: String,
    pub speech_rate: u32,
    pub speech_volume: f32,
    // Execution and lifecycle
    pub queue_capacity: usize,
    pub worker_poll_ms: u64,
    pub join_timeout_ms: u64,
    pub idle_poll_ms: u64,
    pub exit_keywords: Vec<String>,
    // Control surface
    pub enable_dbus: bool,
    pub rate_limit_commands: u32, // typed commands per minute per sender
    pub log_dir: String,
    /// Extra launchable applications: spoken name -> program or path.
    #[serde(default)]
    pub apps: HashMap<String, String>,
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

impl Default for Settings {
    fn default() -> Self {
        let home = home();
        Self {
            wake_word: "desk".to_string(),
            wake_confirmations: 1,
            wake_backend: WakeBackend::Offline,
            vosk_model_path: home
                .join(".local/share/deskvox/model")
                .display()
                .to_string(),
            wake_phrase_limit_secs: 3,
            stt_backend: SttBackend::Vosk,
            wyoming_host: "127.0.0.1".to_string(),
            wyoming_port: 10300,
            wyoming_timeout_secs: 10,
            command_max_duration_secs: 10,
            command_silence_timeout_secs: 2,
            command_min_confidence: 0.3,
            vad_speech_threshold: 500,
            vad_silence_threshold: 400,
            tts_binary: "espeak-ng".to_string(),
            speech_rate: 150,
            speech_volume: 0.9,
            queue_capacity: 10,
            worker_poll_ms: 100,
            join_timeout_ms: 2000,
            idle_poll_ms: 500,
            exit_keywords: ["exit", "quit", "stop listening", "goodbye"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
            enable_dbus: true,
            rate_limit_commands: 30,
            log_dir: home
                .join(".local/state/deskvox/logs")
                .display()
                .to_string(),
            apps: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load from defaults, the usual config files and `DESKVOX_*` variables.
    pub fn new() -> Result<Self, config::ConfigError> {
        Self::load(None)
    }

    /// Like [`Settings::new`], with an extra file that must exist when given.
    pub fn load(explicit: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder()
            // Built-in defaults
            .add_source(Config::try_from(&Settings::default())?)
            // Local config file (if exists)
            .add_source(File::with_name("Deskvox").required(false))
            .add_source(
                File::with_name(&home().join(".config/deskvox/Deskvox").display().to_string())
                    .required(false),
            );

        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path).required(true));
        }

        // Environment variables (e.g. DESKVOX_WAKE_WORD)
        let builder = builder.add_source(Environment::with_prefix("DESKVOX"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.wake_word.trim().is_empty() {
            return Err(config::ConfigError::Message(
                "wake_word must not be empty".to_string(),
            ));
        }
        if self.wake_confirmations == 0 {
            return Err(config::ConfigError::Message(
                "wake_confirmations must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(config::ConfigError::Message(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.speech_volume) {
            return Err(config::ConfigError::Message(format!(
                "Invalid speech_volume: {}. Must be between 0.0 and 1.0",
                self.speech_volume
            )));
        }
        if !(0.0..=1.0).contains(&self.command_min_confidence) {
            return Err(config::ConfigError::Message(format!(
                "Invalid command_min_confidence: {}. Must be between 0.0 and 1.0",
                self.command_min_confidence
            )));
        }
        if self.vad_speech_threshold <= 0 {
            return Err(config::ConfigError::Message(
                "vad_speech_threshold must be positive".to_string(),
            ));
        }
        if self.vad_silence_threshold > self.vad_speech_threshold {
            return Err(config::ConfigError::Message(
                "vad_silence_threshold must not exceed vad_speech_threshold".to_string(),
            ));
        }
        if self.command_max_duration_secs == 0 || self.wake_phrase_limit_secs == 0 {
            return Err(config::ConfigError::Message(
                "capture durations must be greater than 0".to_string(),
            ));
        }
        if self.rate_limit_commands == 0 {
            return Err(config::ConfigError::Message(
                "rate_limit_commands must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn wake_word_lower(&self) -> String {
        self.wake_word.trim().to_lowercase()
    }

    pub fn command_max_duration(&self) -> Duration {
        Duration::from_secs(self.command_max_duration_secs)
    }

    pub fn command_silence_timeout(&self) -> Duration {
        Duration::from_secs(self.command_silence_timeout_secs)
    }

    pub fn wake_phrase_limit(&self) -> Duration {
        Duration::from_secs(self.wake_phrase_limit_secs)
    }

    pub fn wyoming_timeout(&self) -> Duration {
        Duration::from_secs(self.wyoming_timeout_secs)
    }

    pub fn worker_poll(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}
