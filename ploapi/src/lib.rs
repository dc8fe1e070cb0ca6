//! Client for the Playola admin API.
//!
//! This crate owns the wire model of the station schedule (spins, audio
//! blocks, fades), the schedule fetcher, bearer-token coordination and
//! the listening-session telemetry client. It performs no scheduling of
//! its own: the player crates consume [`Schedule`] snapshots and decide
//! what to do with them.

pub mod auth;
pub mod client;
pub mod error;
pub mod models;
pub mod telemetry;

pub use auth::{AuthProvider, TokenCoordinator};
pub use client::{ScheduleClient, DEFAULT_BASE_URL};
pub use error::{ApiError, Result};
pub use models::{AudioBlock, BlockKind, Fade, Milliseconds, RelatedText, Schedule, Spin};
pub use telemetry::TelemetryClient;
