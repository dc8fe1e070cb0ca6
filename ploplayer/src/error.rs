//! Error surface of the player engine.

use plocache::DownloadError;
use ploapi::ApiError;
use ploaudio::AudioError;

/// What went wrong with the schedule itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleProblem {
    /// No spin covers the requested instant
    Empty,
    /// The schedule could not be refreshed and is no longer usable
    Stale,
}

/// Errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP status {0}")]
    Http(u16),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("schedule problem: {0:?}")]
    Schedule(ScheduleProblem),

    #[error("download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("file system error: {0}")]
    FileSystem(String),

    #[error("audio engine error: {0}")]
    AudioEngine(String),

    #[error("audio session error: {0}")]
    AudioSession(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ApiError> for PlayerError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Http(e) => Self::Network(e.to_string()),
            ApiError::Timeout => Self::Network("request timeout".to_string()),
            ApiError::Json(e) => Self::Decode(e.to_string()),
            ApiError::Status(code) => Self::Http(code),
            ApiError::Unauthorized => Self::Http(401),
            ApiError::Other(msg) => Self::Internal(msg),
        }
    }
}

impl From<AudioError> for PlayerError {
    fn from(e: AudioError) -> Self {
        match e {
            AudioError::Decode(msg) => Self::Decode(msg),
            AudioError::NoAudioTrack => Self::Decode("no audio track".to_string()),
            AudioError::Io(e) => Self::FileSystem(e.to_string()),
            other => Self::AudioEngine(other.to_string()),
        }
    }
}
