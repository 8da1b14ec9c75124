pub mod espeak;

/// A program that turns text into a WAV byte stream.
///
/// Backends are plain blocking calls; the audio engine runs them on its own
/// thread.
pub trait SpeechBackend: Send + Sync {
    /// WAV bytes for `text`, or the error the synthesis process reported.
    fn synthesize(&self, text: &str) -> std::io::Result<Vec<u8>>;

    /// Unique ID of the backend (e.g., "espeak-ng").
    fn id(&self) -> &'static str;
}
