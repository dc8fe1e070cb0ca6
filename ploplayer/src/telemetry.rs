//! Balise de session d'écoute
//!
//! Tant qu'une station est active, un POST « j'écoute toujours » part
//! toutes les 10 secondes ; l'arrêt envoie la fin de session. Les échecs
//! sont des Warnings, jamais fatals à la lecture.

use crate::reporter::{ErrorReporter, Severity};
use ploapi::TelemetryClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Période de la balise.
pub const BEACON_INTERVAL: Duration = Duration::from_secs(10);

/// Démarre la boucle de balise pour une station.
///
/// La boucle émet immédiatement, puis toutes les 10 s ; à l'annulation
/// elle envoie la fin de session et se termine.
pub fn spawn_beacon(
    client: TelemetryClient,
    station_id: String,
    reporter: Arc<ErrorReporter>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(BEACON_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Err(e) = client.report_end().await {
                        crate::report_error!(
                            reporter,
                            &e,
                            "ending listening session",
                            Severity::Warning
                        );
                    }
                    debug!("Telemetry: beacon for {} stopped", station_id);
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = client.report_listening(&station_id).await {
                        crate::report_error!(
                            reporter,
                            &e,
                            "listening session beacon",
                            Severity::Warning
                        );
                    }
                }
            }
        }
    })
}
