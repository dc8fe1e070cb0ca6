//! Error type for the audio graph.

/// Errors raised by the audio engine and the decoders.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    /// The engine failed to start (after retries)
    #[error("audio engine failed to start: {0}")]
    EngineStart(String),

    /// No output device available
    #[error("no audio output device available")]
    NoOutputDevice,

    /// The hardware sample format is not supported
    #[error("unsupported output format: {0}")]
    UnsupportedFormat(String),

    /// IO error while reading an audio file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Decoding failed
    #[error("decoding error: {0}")]
    Decode(String),

    /// No audio track found in file
    #[error("no audio track found")]
    NoAudioTrack,

    /// Internal processing error
    #[error("audio processing error: {0}")]
    Processing(String),
}
