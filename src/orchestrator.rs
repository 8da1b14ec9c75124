//! Top-level command pipeline and lifecycle.
//!
//! `Stopped -> Running -> Stopping -> Stopped`. While running, a single
//! `processing` flag gates pipeline passes: a trigger that arrives during a
//! pass is dropped.

use crate::action::ActionDescriptor;
use crate::config_loader::Settings;
use crate::ear::{ListenPolicy, SpeechRecognizer};
use crate::engine::SpeechSynthesizer;
use crate::error::{AssistantError, Result};
use crate::events::{ExitReason, PipelineEvent, StatusSink, TracingSink};
use crate::executor::ExecutionEngine;
use crate::intent::{normalize_text, IntentClassifier};
use crate::resolver::ActionResolver;
use crate::wake::{DetectorStatus, TriggerCallback, TriggerSource};
use crate::worker::panic_message;
use serde::Serialize;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

pub const READY_MESSAGE: &str = "Desk assistant is ready";
pub const LISTENING_MESSAGE: &str = "Yes, I'm listening";
pub const NOTHING_HEARD_MESSAGE: &str = "I didn't hear anything. Please try again.";
pub const FAREWELL_MESSAGE: &str = "Goodbye! Shutting down.";
pub const NOT_UNDERSTOOD_MESSAGE: &str = "Sorry, I didn't understand that command.";
pub const RECOGNITION_FAILED_MESSAGE: &str = "I encountered a problem. Please try again.";
pub const PASS_FAILED_MESSAGE: &str = "I encountered a problem while executing that.";
pub const QUEUE_FULL_MESSAGE: &str = "I'm busy with other commands. Please try again shortly.";

const TEARDOWN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Stopped = 0,
    Running = 1,
    Stopping = 2,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Lifecycle::Running,
            2 => Lifecycle::Stopping,
            _ => Lifecycle::Stopped,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Stopped => "stopped",
            Lifecycle::Running => "running",
            Lifecycle::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Point-in-time view for status displays. Fields may be mutually stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssistantStatus {
    pub lifecycle: Lifecycle,
    pub processing: bool,
    pub should_exit: bool,
    pub queued: usize,
    pub listening: bool,
    pub streak: u32,
}

/// Result of a typed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitOutcome {
    pub queued: bool,
    pub message: String,
}

impl SubmitOutcome {
    fn rejected(message: impl Into<String>) -> Self {
        Self {
            queued: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub policy: ListenPolicy,
    pub exit_keywords: Vec<String>,
    pub idle_poll: Duration,
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            policy: ListenPolicy::from_settings(settings),
            exit_keywords: settings.exit_keywords.clone(),
            idle_poll: settings.idle_poll(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// The collaborators the orchestrator drives.
pub struct Components {
    pub detector: Box<dyn TriggerSource>,
    pub executor: Arc<ExecutionEngine>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub classifier: Arc<dyn IntentClassifier>,
    pub resolver: Arc<dyn ActionResolver>,
}

struct Inner {
    lifecycle: AtomicU8,
    processing: AtomicBool,
    should_exit: AtomicBool,
    detector: Mutex<Box<dyn TriggerSource>>,
    detector_status: Arc<DetectorStatus>,
    executor: Arc<ExecutionEngine>,
    recognizer: Arc<dyn SpeechRecognizer>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    classifier: Arc<dyn IntentClassifier>,
    resolver: Arc<dyn ActionResolver>,
    sinks: RwLock<Vec<Arc<dyn StatusSink>>>,
    config: OrchestratorConfig,
}

/// Clears the processing flag however the pass ends.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(components: Components, config: OrchestratorConfig) -> Self {
        let detector_status = components.detector.status();
        Self {
            inner: Arc::new(Inner {
                lifecycle: AtomicU8::new(Lifecycle::Stopped as u8),
                processing: AtomicBool::new(false),
                should_exit: AtomicBool::new(false),
                detector: Mutex::new(components.detector),
                detector_status,
                executor: components.executor,
                recognizer: components.recognizer,
                synthesizer: components.synthesizer,
                classifier: components.classifier,
                resolver: components.resolver,
                sinks: RwLock::new(vec![Arc::new(TracingSink)]),
                config,
            }),
        }
    }

    pub fn add_sink(&self, sink: Arc<dyn StatusSink>) {
        self.inner
            .sinks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(sink);
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.inner.lifecycle.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::SeqCst)
    }

    pub fn should_exit(&self) -> bool {
        self.inner.should_exit.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> AssistantStatus {
        AssistantStatus {
            lifecycle: self.lifecycle(),
            processing: self.is_processing(),
            should_exit: self.should_exit(),
            queued: self.inner.executor.queued_len(),
            listening: self.inner.detector_status.is_listening(),
            streak: self.inner.detector_status.streak(),
        }
    }

    /// Run until an exit is requested or [`Orchestrator::stop`] is called,
    /// then tear down. Blocks the calling thread. No-op if already running.
    pub fn start(&self) -> Result<()> {
        if let Err(current) = self.inner.lifecycle.compare_exchange(
            Lifecycle::Stopped as u8,
            Lifecycle::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return match Lifecycle::from_u8(current) {
                Lifecycle::Running => {
                    info!("assistant already running");
                    Ok(())
                }
                other => Err(AssistantError::Lifecycle(format!(
                    "cannot start while {other}"
                ))),
            };
        }

        self.inner.should_exit.store(false, Ordering::SeqCst);
        self.emit(PipelineEvent::Started);

        if let Err(e) = self.inner.executor.start() {
            self.inner
                .lifecycle
                .store(Lifecycle::Stopped as u8, Ordering::SeqCst);
            return Err(e);
        }

        let started = self.lock_detector().start(self.trigger_callback());
        if let Err(e) = started {
            error!("trigger detector failed to start: {e}");
            self.stop();
            return Err(e);
        }

        self.inner.synthesizer.speak(READY_MESSAGE, false);
        self.emit(PipelineEvent::Ready);
        info!("assistant ready");

        while self.is_running() && !self.should_exit() {
            thread::sleep(self.inner.config.idle_poll);
        }

        self.stop();
        self.wait_stopped();
        Ok(())
    }

    /// A `stop` from another thread may still be tearing down; return only
    /// once it has finished. Every teardown step is itself bounded.
    fn wait_stopped(&self) {
        while self.lifecycle() == Lifecycle::Stopping {
            thread::sleep(TEARDOWN_POLL);
        }
    }

    /// Tear everything down. Each step runs even if an earlier one panics.
    /// No-op unless running.
    pub fn stop(&self) {
        if self
            .inner
            .lifecycle
            .compare_exchange(
                Lifecycle::Running as u8,
                Lifecycle::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        info!("assistant shutting down");
        self.emit(PipelineEvent::Stopping);

        self.teardown("trigger detector", || self.lock_detector().stop());
        self.teardown("execution engine", || self.inner.executor.stop());
        self.teardown("speech recognizer", || self.inner.recognizer.cleanup());
        self.teardown("speech synthesizer", || self.inner.synthesizer.cleanup());

        self.inner
            .lifecycle
            .store(Lifecycle::Stopped as u8, Ordering::SeqCst);
        self.emit(PipelineEvent::Stopped);
        info!("assistant shutdown complete");
    }

    /// Ask the run loop to exit; it stops everything on its next poll.
    pub fn request_exit(&self) {
        if !self.inner.should_exit.swap(true, Ordering::SeqCst) {
            self.emit(PipelineEvent::ExitRequested {
                reason: ExitReason::External,
            });
        }
    }

    /// Manual activation; runs one pass on the calling thread. Returns
    /// false if the trigger was dropped.
    pub fn trigger(&self) -> bool {
        self.handle_trigger()
    }

    /// Typed command: classify, resolve and hand the action to the queue.
    pub fn submit_text(&self, text: &str) -> SubmitOutcome {
        if !self.is_running() {
            return SubmitOutcome::rejected("The assistant is not running");
        }
        let text = text.trim();
        if text.is_empty() {
            return SubmitOutcome::rejected("No command given");
        }
        self.emit(PipelineEvent::Heard {
            text: text.to_string(),
        });

        if self.has_exit_keyword(text) {
            self.request_exit_for(ExitReason::Keyword);
            return SubmitOutcome::rejected(FAREWELL_MESSAGE);
        }

        let record = self.inner.classifier.classify(text);
        self.emit(PipelineEvent::Classified {
            intent: record.intent,
            confidence: record.confidence,
        });
        if record.is_unknown() {
            self.emit(PipelineEvent::NotUnderstood {
                text: text.to_string(),
            });
            return SubmitOutcome::rejected(NOT_UNDERSTOOD_MESSAGE);
        }

        let action = self.inner.resolver.resolve(&record);
        self.emit_resolved(&action);

        if action.is_exit() {
            self.request_exit_for(ExitReason::Action);
            return SubmitOutcome::rejected(action.message);
        }
        if action.kind.is_failure() {
            return SubmitOutcome::rejected(action.message);
        }

        let message = action.message.clone();
        if self.inner.executor.enqueue(action) {
            SubmitOutcome {
                queued: true,
                message,
            }
        } else {
            SubmitOutcome::rejected(QUEUE_FULL_MESSAGE)
        }
    }

    fn trigger_callback(&self) -> TriggerCallback {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                Orchestrator { inner }.handle_trigger();
            }
        })
    }

    fn handle_trigger(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        if self
            .inner
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.emit(PipelineEvent::TriggerDropped);
            return false;
        }
        let _guard = ProcessingGuard(&self.inner.processing);
        self.emit(PipelineEvent::TriggerAccepted);

        let pass = catch_unwind(AssertUnwindSafe(|| {
            self.inner.synthesizer.speak(LISTENING_MESSAGE, true);
            self.process_command();
        }));

        if let Err(panic) = pass {
            let cause = panic_message(panic.as_ref());
            error!(cause = %cause, "command pass failed");
            self.emit(PipelineEvent::PassFailed { cause });
            let _ = catch_unwind(AssertUnwindSafe(|| {
                self.inner.synthesizer.speak(PASS_FAILED_MESSAGE, false)
            }));
        }
        true
    }

    /// One pass: recognize, exit check, classify, resolve, execute, respond.
    fn process_command(&self) {
        let inner = &self.inner;

        self.emit(PipelineEvent::Listening);
        let text = match inner.recognizer.recognize(&inner.config.policy) {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                error!("recognition failed: {e}");
                self.emit(PipelineEvent::PassFailed {
                    cause: e.to_string(),
                });
                inner.synthesizer.speak(RECOGNITION_FAILED_MESSAGE, false);
                return;
            }
        };

        if text.is_empty() {
            self.emit(PipelineEvent::NothingHeard);
            inner.synthesizer.speak(NOTHING_HEARD_MESSAGE, false);
            return;
        }
        self.emit(PipelineEvent::Heard { text: text.clone() });

        if self.has_exit_keyword(&text) {
            inner.synthesizer.speak(FAREWELL_MESSAGE, true);
            self.request_exit_for(ExitReason::Keyword);
            return;
        }

        let record = inner.classifier.classify(&text);
        self.emit(PipelineEvent::Classified {
            intent: record.intent,
            confidence: record.confidence,
        });
        if record.is_unknown() {
            self.emit(PipelineEvent::NotUnderstood { text });
            inner.synthesizer.speak(NOT_UNDERSTOOD_MESSAGE, false);
            return;
        }

        let action = inner.resolver.resolve(&record);
        self.emit_resolved(&action);

        let result = inner.executor.execute_now(&action);
        self.emit(PipelineEvent::Executed {
            success: result.success,
            message: result.message.clone(),
        });

        let feedback = result.feedback();
        // The farewell must be heard before teardown cuts the audio.
        inner.synthesizer.speak(&feedback, action.is_exit());
        self.emit(PipelineEvent::Responded { text: feedback });

        if action.is_exit() {
            self.request_exit_for(ExitReason::Action);
        }
    }

    /// Whole-word match against the normalized text, so "exit" does not
    /// fire inside "exitool". Stricter than a plain substring test.
    fn has_exit_keyword(&self, text: &str) -> bool {
        let padded = format!(" {} ", normalize_text(text));
        self.inner.config.exit_keywords.iter().any(|keyword| {
            let keyword = normalize_text(keyword);
            !keyword.is_empty() && padded.contains(&format!(" {keyword} "))
        })
    }

    fn request_exit_for(&self, reason: ExitReason) {
        self.inner.should_exit.store(true, Ordering::SeqCst);
        self.emit(PipelineEvent::ExitRequested { reason });
    }

    fn emit_resolved(&self, action: &ActionDescriptor) {
        self.emit(PipelineEvent::Resolved {
            kind: action.kind,
            message: action.message.clone(),
        });
    }

    fn emit(&self, event: PipelineEvent) {
        let sinks = self
            .inner
            .sinks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for sink in sinks {
            if catch_unwind(AssertUnwindSafe(|| sink.on_event(&event))).is_err() {
                warn!("status sink panicked");
            }
        }
    }

    fn teardown(&self, name: &str, step: impl FnOnce()) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(step)) {
            error!(
                component = name,
                cause = %panic_message(panic.as_ref()),
                "teardown step failed"
            );
        }
    }

    fn lock_detector(&self) -> std::sync::MutexGuard<'_, Box<dyn TriggerSource>> {
        self.inner
            .detector
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }
}
