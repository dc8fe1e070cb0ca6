//! Moteur de radio continue côté client.
//!
//! Transforme le programme horodaté d'une station (une liste de spins)
//! en un flux audio continu, enchaîné sans trou et synchronisé sur
//! l'horloge murale. La lecture « historique » applique un décalage
//! uniforme au programme pour rejouer la station comme à un autre
//! instant.
//!
//! ```no_run
//! use ploplayer::PlayolaPlayer;
//! # use std::sync::Arc;
//! # async fn run(auth: Arc<dyn ploapi::AuthProvider>) -> Result<(), ploplayer::PlayerError> {
//! let player = PlayolaPlayer::configure(auth).build()?;
//! player.play("station-1", None).await?;
//! // ...
//! player.stop().await;
//! # Ok(())
//! # }
//! ```

mod engine;
mod error;
mod reporter;
mod scheduler;
mod session;
mod state;
mod telemetry;

pub use engine::{PlayerBuilder, PlayolaPlayer};
pub use error::{PlayerError, ScheduleProblem};
pub use reporter::{ErrorReport, ErrorReporter, ErrorReporterDelegate, Severity};
pub use scheduler::{PlayOutcome, SchedulerConfig};
pub use session::{AudioSession, NoopAudioSession};
pub use state::{PlayerDelegate, PlayerState};
pub use telemetry::BEACON_INTERVAL;

// Réexports pratiques pour les hôtes.
pub use ploapi::{AuthProvider, Schedule, Spin};
