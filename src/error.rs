//! Error types for the assistant daemon.

/// Top-level error type.
///
/// Only acquisition failures (device, model, configuration) are expected to
/// cross a component boundary; the pipeline converts everything else into a
/// result value or a spoken message where it happens.
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Recognition model could not be loaded.
    #[error("model error: {0}")]
    Model(String),

    /// Speech recognition failed mid-capture.
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Speech synthesis error.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Networked recognition service error.
    #[error("network error: {0}")]
    Network(String),

    /// A component was asked to do something its lifecycle does not allow.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    /// A built-in pattern failed to compile.
    #[error("pattern error: {0}")]
    Pattern(#[from] regex::Error),

    /// D-Bus error.
    #[error("bus error: {0}")]
    Bus(#[from] zbus::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AssistantError>;
