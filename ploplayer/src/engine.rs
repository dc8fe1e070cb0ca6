//! Façade publique du moteur
//!
//! `PlayolaPlayer` assemble le cache, le coordinateur de
//! téléchargements, le client d'API, le graphe audio et le superviseur,
//! puis expose `play` / `stop` et l'état observable. Le moteur est une
//! valeur possédée par l'application hôte ; rien ici n'exige de
//! singleton processus.

use crate::error::PlayerError;
use crate::reporter::ErrorReporter;
use crate::scheduler::{Command, PlayOutcome, SchedulerConfig, StationScheduler};
use crate::session::{AudioSession, NoopAudioSession};
use crate::state::{PlayerDelegate, PlayerState, StateNotifier};
use chrono::{DateTime, Utc};
use plocache::{Downloader, FileCache};
use ploapi::{AuthProvider, ScheduleClient, TelemetryClient, TokenCoordinator};
use ploaudio::{AudioGraph, AudioSink, CpalSink, NullSink};
use ploconfig::{Preferences, Settings};
use ploutils::{SystemTimeSource, TimeSource};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

/// Profondeur de la file de commandes de la façade.
const COMMAND_QUEUE: usize = 16;

/// Le moteur de lecture radio continue.
pub struct PlayolaPlayer {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<PlayerState>,
    notifier: Arc<StateNotifier>,
    reporter: Arc<ErrorReporter>,
    station_label: Arc<Mutex<Option<String>>>,
}

impl PlayolaPlayer {
    /// Point d'entrée : configuration avec un fournisseur de jetons.
    pub fn configure(auth_provider: Arc<dyn AuthProvider>) -> PlayerBuilder {
        PlayerBuilder::new(auth_provider)
    }

    /// Demande la lecture d'une station, en direct ou « comme à »
    /// l'instant donné.
    ///
    /// Résout `Started` une fois le programme résolu et le moteur
    /// lancé ; un `stop` ou un `play` concurrent résout `Cancelled`
    /// (jamais une erreur).
    pub async fn play(
        &self,
        station_id: impl Into<String>,
        at_date: Option<DateTime<Utc>>,
    ) -> Result<PlayOutcome, PlayerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Play {
                station_id: station_id.into(),
                at_date,
                reply,
            })
            .await
            .map_err(|_| PlayerError::Internal("engine supervisor is gone".to_string()))?;
        rx.await
            .map_err(|_| PlayerError::Internal("engine supervisor dropped reply".to_string()))?
    }

    /// Arrête la lecture. Idempotent.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// État courant.
    pub fn state(&self) -> PlayerState {
        self.state_rx.borrow().clone()
    }

    /// Abonnement au flux d'états.
    pub fn subscribe(&self) -> watch::Receiver<PlayerState> {
        self.state_rx.clone()
    }

    /// Station active, si une lecture est en cours.
    pub fn station_id(&self) -> Option<String> {
        self.station_label.lock().unwrap().clone()
    }

    /// Installe (ou retire) le délégué d'état.
    pub fn set_delegate(&self, delegate: Option<Arc<dyn PlayerDelegate>>) {
        self.notifier.set_delegate(delegate);
    }

    /// Collecteur d'erreurs du moteur (niveau, délégué).
    pub fn error_reporter(&self) -> &Arc<ErrorReporter> {
        &self.reporter
    }
}

/// Assemble un [`PlayolaPlayer`].
pub struct PlayerBuilder {
    auth_provider: Arc<dyn AuthProvider>,
    settings: Settings,
    time: Arc<dyn TimeSource>,
    sink: Option<Box<dyn AudioSink>>,
    session: Arc<dyn AudioSession>,
    delegate: Option<Arc<dyn PlayerDelegate>>,
}

impl PlayerBuilder {
    pub fn new(auth_provider: Arc<dyn AuthProvider>) -> Self {
        Self {
            auth_provider,
            settings: Settings::default(),
            time: Arc::new(SystemTimeSource::new()),
            sink: None,
            session: Arc::new(NoopAudioSession::new()),
            delegate: None,
        }
    }

    /// Remplace l'URL de base de l'API.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.settings.base_url = base_url.into();
        self
    }

    /// Remplace l'ensemble des réglages.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Injecte une source de temps (tests).
    pub fn time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Impose un puits audio (périphérique, nul...).
    pub fn sink(mut self, sink: Box<dyn AudioSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Branche la session audio de la plateforme.
    pub fn audio_session(mut self, session: Arc<dyn AudioSession>) -> Self {
        self.session = session;
        self
    }

    /// Installe le délégué d'état dès la construction.
    pub fn delegate(mut self, delegate: Arc<dyn PlayerDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Construit le moteur et démarre sa tâche superviseure.
    ///
    /// Seul un répertoire de cache inutilisable est fatal ici.
    pub fn build(self) -> Result<PlayolaPlayer, PlayerError> {
        let settings = self.settings;

        let cache = Arc::new(
            FileCache::new(settings.audio_files_dir(), settings.max_cache_bytes)
                .map_err(|e| PlayerError::FileSystem(e.to_string()))?,
        );
        let downloader = Downloader::new(Arc::clone(&cache));

        let tokens = Arc::new(TokenCoordinator::new(
            self.auth_provider,
            Arc::clone(&self.time),
        ));
        let client = ScheduleClient::builder()
            .base_url(settings.base_url.as_str())
            .tokens(Arc::clone(&tokens))
            .time_source(Arc::clone(&self.time))
            .build()
            .map_err(PlayerError::from)?;

        let device_id = device_identifier(&settings);
        let telemetry_client =
            TelemetryClient::new(settings.base_url.as_str(), tokens, device_id);

        let sink = match self.sink {
            Some(sink) => sink,
            None => match CpalSink::new() {
                Ok(sink) => Box::new(sink) as Box<dyn AudioSink>,
                Err(e) => {
                    warn!(
                        "PlayolaPlayer: no usable output device ({}), using null sink",
                        e
                    );
                    Box::new(NullSink::default())
                }
            },
        };
        let (graph, voice_events) = AudioGraph::new(sink, Arc::clone(&self.time));

        let (notifier, state_rx) = StateNotifier::new();
        let notifier = Arc::new(notifier);
        notifier.set_delegate(self.delegate);

        let reporter = Arc::new(ErrorReporter::new(Arc::clone(&self.time)));
        let station_label = Arc::new(Mutex::new(None));

        let config = SchedulerConfig {
            lookahead_secs: settings.lookahead_secs as i64,
            refresh_interval: std::time::Duration::from_secs(settings.refresh_interval_secs),
            ..SchedulerConfig::default()
        };

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let scheduler = StationScheduler::new(
            config,
            self.time,
            cache,
            downloader,
            client,
            telemetry_client,
            graph,
            voice_events,
            Arc::clone(&notifier),
            Arc::clone(&reporter),
            self.session,
            Arc::clone(&station_label),
            commands_rx,
        );
        tokio::spawn(scheduler.run());

        info!("PlayolaPlayer: engine ready ({})", settings.base_url);
        Ok(PlayolaPlayer {
            commands: commands_tx,
            state_rx,
            notifier,
            reporter,
            station_label,
        })
    }
}

/// Identifiant d'installation pour la télémétrie.
///
/// Persisté dans les préférences ; en cas d'échec d'écriture on
/// continue avec un identifiant de session (Warning, jamais fatal).
fn device_identifier(settings: &Settings) -> String {
    let mut preferences = Preferences::open(settings.preferences_path());
    match ploconfig::vendor_identifier(&mut preferences) {
        Ok(id) => id,
        Err(e) => {
            warn!("PlayolaPlayer: vendor identifier not persisted: {}", e);
            uuid::Uuid::new_v4().to_string()
        }
    }
}

impl std::fmt::Debug for PlayolaPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayolaPlayer")
            .field("state", &self.state())
            .field("station_id", &self.station_id())
            .finish()
    }
}
