use serde::{Deserialize, Serialize};
use std::fmt;

/// What an action does once it reaches the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    App,
    Folder,
    System,
    Web,
    CloseApp,
    Info,
    Error,
    Unknown,
}

impl ActionKind {
    /// Kinds that never reach the OS and always fail.
    pub fn is_failure(self) -> bool {
        matches!(self, ActionKind::Error | ActionKind::Unknown)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::App => "app",
            ActionKind::Folder => "folder",
            ActionKind::System => "system",
            ActionKind::Web => "web",
            ActionKind::CloseApp => "close_app",
            ActionKind::Info => "info",
            ActionKind::Error => "error",
            ActionKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Payload of the system action that shuts the assistant down.
pub const EXIT_PAYLOAD: &str = "exit";

/// Resolved, executable representation of a classified intent.
///
/// `message` is always present and is the candidate feedback for the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub kind: ActionKind,
    pub payload: Option<String>,
    pub message: String,
}

impl ActionDescriptor {
    pub fn new(kind: ActionKind, payload: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            payload: Some(payload.into()),
            message: message.into(),
        }
    }

    /// An action with no payload, e.g. an error explanation.
    pub fn bare(kind: ActionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            payload: None,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::bare(ActionKind::Error, message)
    }

    /// The literal action that asks the assistant to exit.
    pub fn exit() -> Self {
        Self::new(ActionKind::System, EXIT_PAYLOAD, "Goodbye! Shutting down.")
    }

    pub fn is_exit(&self) -> bool {
        self.kind == ActionKind::System && self.payload.as_deref() == Some(EXIT_PAYLOAD)
    }
}

/// Outcome of running one action. `message` is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub message: String,
}

impl ExecutionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self::build(true, message.into(), "Done")
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::build(false, message.into(), "Action failed")
    }

    fn build(success: bool, message: String, fallback: &str) -> Self {
        let message = if message.trim().is_empty() {
            fallback.to_string()
        } else {
            message
        };
        Self { success, message }
    }

    /// The sentence spoken back to the user for this result.
    pub fn feedback(&self) -> String {
        if self.success {
            self.message.clone()
        } else {
            format!("Sorry, {}", self.message)
        }
    }
}
