//! Error types for the download coordinator.

use std::io;

/// Errors terminating a download.
///
/// Each transport failure maps to a distinct variant so the scheduler can
/// decide between retrying, abandoning and surfacing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DownloadError {
    /// No network connectivity at all
    #[error("no connectivity")]
    NoConnectivity,

    /// The request timed out
    #[error("request timed out")]
    Timeout,

    /// The host could not be reached
    #[error("host unreachable")]
    HostUnreachable,

    /// The server answered with a non-success status
    #[error("HTTP status {0}")]
    HttpStatus(u16),

    /// The download was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Moving the finished file into the cache failed
    #[error("failed to move downloaded file: {0}")]
    MoveFailed(String),

    /// The cache directory disappeared under us
    #[error("cache directory missing")]
    DirectoryMissing,

    /// Anything else
    #[error("download failed: {0}")]
    Unknown(String),
}

impl DownloadError {
    /// Classifie une erreur reqwest dans la taxonomie ci-dessus.
    pub(crate) fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout;
        }
        if let Some(status) = e.status() {
            return Self::HttpStatus(status.as_u16());
        }
        if e.is_connect() {
            // Un échec de connexion sans réseau du tout se présente comme
            // une erreur io NotConnected / NetworkUnreachable.
            if let Some(io_err) = find_io_error(e) {
                if matches!(
                    io_err.kind(),
                    io::ErrorKind::NotConnected | io::ErrorKind::AddrNotAvailable
                ) {
                    return Self::NoConnectivity;
                }
            }
            return Self::HostUnreachable;
        }
        Self::Unknown(e.to_string())
    }
}

fn find_io_error(e: &reqwest::Error) -> Option<&io::Error> {
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        source = err.source();
    }
    None
}
