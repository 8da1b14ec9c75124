//! Stage events emitted by the orchestrator for status displays and logs.

use crate::action::ActionKind;
use crate::intent::Intent;
use serde::Serialize;
use tracing::{info, warn};

/// Why the assistant decided to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// The recognized text contained an exit keyword.
    Keyword,
    /// The resolved action was the exit action.
    Action,
    /// `stop()` or a shutdown request from outside the pipeline.
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Started,
    Ready,
    TriggerAccepted,
    /// A trigger arrived while a pass was running and was discarded.
    TriggerDropped,
    Listening,
    Heard { text: String },
    NothingHeard,
    ExitRequested { reason: ExitReason },
    Classified { intent: Intent, confidence: f32 },
    NotUnderstood { text: String },
    Resolved { kind: ActionKind, message: String },
    Executed { success: bool, message: String },
    Responded { text: String },
    PassFailed { cause: String },
    Stopping,
    Stopped,
}

/// Observer of pipeline stage transitions. Must not block.
pub trait StatusSink: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// Writes every event as a structured log record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::PassFailed { cause } => warn!(cause = %cause, "pipeline pass failed"),
            PipelineEvent::TriggerDropped => warn!("trigger dropped, already processing"),
            PipelineEvent::Heard { text } => info!(text = %text, "heard"),
            PipelineEvent::Classified { intent, confidence } => {
                info!(intent = %intent, confidence, "classified")
            }
            PipelineEvent::Resolved { kind, message } => {
                info!(kind = %kind, message = %message, "resolved")
            }
            PipelineEvent::Executed { success, message } => {
                info!(success, message = %message, "executed")
            }
            PipelineEvent::Responded { text } => info!(text = %text, "responded"),
            PipelineEvent::ExitRequested { reason } => info!(reason = ?reason, "exit requested"),
            PipelineEvent::NotUnderstood { text } => info!(text = %text, "not understood"),
            other => info!(event = ?other, "pipeline"),
        }
    }
}
