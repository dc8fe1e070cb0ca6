//! Le chef d'orchestre : planificateur de station
//!
//! Une tâche superviseure unique possède tout l'état mutable : le
//! programme actif, le pool de voix, le graphe audio et les métadonnées
//! du cache. Les E/S (fetchs, téléchargements, décodage) partent en
//! tâches annexes et reviennent sous forme de messages ; le superviseur
//! ne bloque jamais sur un verrou.

use crate::error::{PlayerError, ScheduleProblem};
use crate::reporter::{ErrorReporter, Severity};
use crate::session::AudioSession;
use crate::state::{PlayerState, StateNotifier};
use crate::telemetry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use plocache::{DownloadError, DownloadEvent, Downloader, FileCache};
use ploapi::{Schedule, ScheduleClient, Spin, TelemetryClient};
use ploaudio::{AudioGraph, VoiceEvent, VoicePool};
use ploutils::TimeSource;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Paliers de backoff entre deux tentatives de téléchargement.
pub const RETRY_BACKOFF_MS: [u64; 4] = [250, 500, 1_000, 2_000];

/// Réglages du planificateur.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Fenêtre de préparation anticipée.
    pub lookahead_secs: i64,
    /// Période de rafraîchissement du programme.
    pub refresh_interval: std::time::Duration,
    /// Fenêtre au-delà de laquelle un rafraîchissement est abandonné.
    pub refresh_timeout: std::time::Duration,
    /// Nombre maximal de nouvelles tentatives de téléchargement.
    pub max_download_retries: u32,
    /// Marge avant l'airtime en deçà de laquelle on n'essaie plus.
    pub abandon_margin_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lookahead_secs: 360,
            refresh_interval: std::time::Duration::from_secs(30),
            refresh_timeout: std::time::Duration::from_secs(30),
            max_download_retries: 4,
            abandon_margin_secs: 2,
        }
    }
}

/// Résolution d'un appel à `play`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// La station démarre : programme résolu, moteur lancé.
    Started,
    /// L'appel a été remplacé par un `stop` ou un autre `play`.
    /// Jamais une erreur.
    Cancelled,
}

/// Commandes de la façade publique.
pub(crate) enum Command {
    Play {
        station_id: String,
        at_date: Option<DateTime<Utc>>,
        reply: oneshot::Sender<Result<PlayOutcome, PlayerError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Messages que les tâches annexes renvoient au superviseur.
enum InternalEvent {
    InitialSchedule {
        seq: u64,
        result: Result<Schedule, PlayerError>,
    },
    Refreshed {
        seq: u64,
        result: Result<Schedule, PlayerError>,
    },
    Download {
        spin_id: String,
        event: DownloadEvent,
    },
    RetryDownload {
        spin_id: String,
    },
}

struct ActiveStation {
    station_id: String,
    /// `at_date − now` au moment du play ; zéro en lecture directe.
    offset: ChronoDuration,
    schedule: Schedule,
    telemetry_cancel: CancellationToken,
}

struct PendingPlay {
    seq: u64,
    station_id: String,
    at_date: Option<DateTime<Utc>>,
    reply: oneshot::Sender<Result<PlayOutcome, PlayerError>>,
}

pub(crate) struct StationScheduler {
    config: SchedulerConfig,
    time: Arc<dyn TimeSource>,
    cache: Arc<FileCache>,
    downloader: Downloader,
    client: ScheduleClient,
    telemetry_client: TelemetryClient,
    graph: AudioGraph,
    pool: VoicePool,
    notifier: Arc<StateNotifier>,
    reporter: Arc<ErrorReporter>,
    session: Arc<dyn AudioSession>,
    station_label: Arc<Mutex<Option<String>>>,

    commands: mpsc::Receiver<Command>,
    voice_events: mpsc::UnboundedReceiver<VoiceEvent>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: mpsc::UnboundedReceiver<InternalEvent>,

    active: Option<ActiveStation>,
    pending: Option<PendingPlay>,
    fetch_seq: u64,
    applied_seq: u64,
    retry_counts: HashMap<String, u32>,
    /// Spin dont la progression de téléchargement alimente `Loading`.
    loading_spin: Option<String>,
}

impl StationScheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: SchedulerConfig,
        time: Arc<dyn TimeSource>,
        cache: Arc<FileCache>,
        downloader: Downloader,
        client: ScheduleClient,
        telemetry_client: TelemetryClient,
        graph: AudioGraph,
        voice_events: mpsc::UnboundedReceiver<VoiceEvent>,
        notifier: Arc<StateNotifier>,
        reporter: Arc<ErrorReporter>,
        session: Arc<dyn AudioSession>,
        station_label: Arc<Mutex<Option<String>>>,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            config,
            time,
            cache,
            downloader,
            client,
            telemetry_client,
            graph,
            pool: VoicePool::new(),
            notifier,
            reporter,
            session,
            station_label,
            commands,
            voice_events,
            internal_tx,
            internal_rx,
            active: None,
            pending: None,
            fetch_seq: 0,
            applied_seq: 0,
            retry_counts: HashMap::new(),
            loading_spin: None,
        }
    }

    /// Boucle principale du superviseur.
    pub(crate) async fn run(mut self) {
        let period = self.config.refresh_interval;
        let mut refresh =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Play { station_id, at_date, reply }) => {
                        self.handle_play(station_id, at_date, reply).await;
                    }
                    Some(Command::Stop { reply }) => {
                        self.cancel_pending();
                        self.shutdown_station().await;
                        let _ = reply.send(());
                    }
                    None => {
                        // La façade est tombée : nettoyage et sortie.
                        self.cancel_pending();
                        self.shutdown_station().await;
                        break;
                    }
                },
                Some(event) = self.voice_events.recv() => {
                    self.handle_voice_event(event).await;
                }
                Some(event) = self.internal_rx.recv() => {
                    self.handle_internal(event).await;
                }
                _ = refresh.tick(), if self.active.is_some() => {
                    self.start_refresh();
                }
            }
        }
        debug!("StationScheduler: supervisor loop ended");
    }

    // ── play / stop ────────────────────────────────────────────────

    async fn handle_play(
        &mut self,
        station_id: String,
        at_date: Option<DateTime<Utc>>,
        reply: oneshot::Sender<Result<PlayOutcome, PlayerError>>,
    ) {
        // play pendant Loading/Playing ≡ stop puis play
        self.cancel_pending();
        self.shutdown_station().await;

        info!(
            "StationScheduler: play {} (at_date: {:?})",
            station_id, at_date
        );
        *self.station_label.lock().unwrap() = Some(station_id.clone());
        self.notifier.set(PlayerState::Loading(0.0));

        self.fetch_seq += 1;
        let seq = self.fetch_seq;
        self.pending = Some(PendingPlay {
            seq,
            station_id: station_id.clone(),
            at_date,
            reply,
        });
        self.spawn_fetch(seq, station_id, true);
    }

    /// Résout un `play` en attente comme annulé (jamais une erreur).
    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Ok(PlayOutcome::Cancelled));
        }
    }

    /// Arrêt complet de la station courante. Idempotent.
    async fn shutdown_station(&mut self) {
        self.downloader.cancel_all();
        self.retry_counts.clear();
        self.loading_spin = None;

        if let Some(active) = self.active.take() {
            info!("StationScheduler: stopping {}", active.station_id);
            // La boucle de balise envoie la fin de session puis s'arrête,
            // sans retenir l'arrêt de la lecture.
            active.telemetry_cancel.cancel();
        }

        self.pool.recycle_all();
        self.graph.mixer().detach_all();
        self.graph.stop();
        self.cache.unpin_all();

        if let Err(e) = self.session.deactivate().await {
            crate::report_error!(
                self.reporter,
                &e,
                "deactivating audio session",
                Severity::Warning
            );
        }

        *self.station_label.lock().unwrap() = None;
        self.notifier.set(PlayerState::Idle);
    }

    // ── fetchs de programme ────────────────────────────────────────

    fn spawn_fetch(&self, seq: u64, station_id: String, initial: bool) {
        let client = self.client.clone();
        let tx = self.internal_tx.clone();
        let timeout = self.config.refresh_timeout;

        tokio::spawn(async move {
            let result =
                match tokio::time::timeout(timeout, client.fetch_schedule(&station_id)).await {
                    Ok(Ok(schedule)) => Ok(schedule),
                    Ok(Err(e)) => Err(PlayerError::from(e)),
                    Err(_) => Err(PlayerError::Network("schedule fetch timed out".to_string())),
                };
            let event = if initial {
                InternalEvent::InitialSchedule { seq, result }
            } else {
                InternalEvent::Refreshed { seq, result }
            };
            let _ = tx.send(event);
        });
    }

    fn start_refresh(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        self.fetch_seq += 1;
        debug!(
            "StationScheduler: refreshing schedule for {} (seq {})",
            active.station_id, self.fetch_seq
        );
        self.spawn_fetch(self.fetch_seq, active.station_id.clone(), false);
    }

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::InitialSchedule { seq, result } => {
                self.handle_initial_schedule(seq, result).await;
            }
            InternalEvent::Refreshed { seq, result } => {
                self.handle_refreshed(seq, result);
            }
            InternalEvent::Download { spin_id, event } => {
                self.handle_download(spin_id, event).await;
            }
            InternalEvent::RetryDownload { spin_id } => {
                self.handle_retry(spin_id);
            }
        }
    }

    async fn handle_initial_schedule(
        &mut self,
        seq: u64,
        result: Result<Schedule, PlayerError>,
    ) {
        let Some(pending) = self.pending.take() else {
            // Annulé entre-temps : résultat sans preneur.
            debug!("StationScheduler: discarding initial schedule (no pending play)");
            return;
        };
        if pending.seq != seq {
            // Fetch d'un play précédent : on le jette, le play courant
            // attend le sien.
            self.pending = Some(pending);
            return;
        }

        let schedule = match result {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!("StationScheduler: initial schedule fetch failed: {}", e);
                *self.station_label.lock().unwrap() = None;
                self.notifier.set(PlayerState::Idle);
                let _ = pending.reply.send(Err(e));
                return;
            }
        };

        let now = self.time.now();
        let offset = pending
            .at_date
            .map(|d| d - now)
            .unwrap_or_else(ChronoDuration::zero);

        if schedule.now_playing(now, offset).is_none() {
            // Rien à l'antenne à l'instant demandé.
            *self.station_label.lock().unwrap() = None;
            self.notifier.set(PlayerState::Idle);
            let _ = pending
                .reply
                .send(Err(PlayerError::Schedule(ScheduleProblem::Empty)));
            return;
        }

        // Session plateforme : les échecs sont des Warnings, la lecture
        // tente sa chance.
        if let Err(e) = self.session.configure_for_playback().await {
            crate::report_error!(
                self.reporter,
                &e,
                "configuring audio session",
                Severity::Warning
            );
        }
        if let Err(e) = self.session.activate().await {
            crate::report_error!(
                self.reporter,
                &e,
                "activating audio session",
                Severity::Warning
            );
        }

        if let Err(e) = self.graph.start().await {
            crate::report_error!(self.reporter, &e, "starting audio engine", Severity::Error);
            *self.station_label.lock().unwrap() = None;
            self.notifier.set(PlayerState::Idle);
            let _ = pending.reply.send(Err(e.into()));
            return;
        }

        let playing = schedule
            .now_playing(now, offset)
            .map(|s| s.id.clone())
            .unwrap_or_default();
        self.loading_spin = Some(playing);

        let telemetry_cancel = CancellationToken::new();
        telemetry::spawn_beacon(
            self.telemetry_client.clone(),
            pending.station_id.clone(),
            Arc::clone(&self.reporter),
            telemetry_cancel.clone(),
        );

        self.active = Some(ActiveStation {
            station_id: pending.station_id,
            offset,
            schedule,
            telemetry_cancel,
        });
        self.applied_seq = seq;

        self.prefetch_window();
        let _ = pending.reply.send(Ok(PlayOutcome::Started));
    }

    fn handle_refreshed(&mut self, seq: u64, result: Result<Schedule, PlayerError>) {
        if self.active.is_none() {
            return;
        }
        if seq <= self.applied_seq {
            // Un rafraîchissement plus récent est déjà appliqué.
            debug!("StationScheduler: discarding stale refresh (seq {})", seq);
            return;
        }

        match result {
            Ok(schedule) => {
                self.applied_seq = seq;
                self.apply_refresh(schedule);
            }
            Err(e) => {
                // L'ancien programme reste valable.
                crate::report_error!(self.reporter, &e, "schedule refresh", Severity::Warning);
            }
        }
    }

    /// Remplace atomiquement le programme actif et réconcilie les voix
    /// déjà préparées.
    fn apply_refresh(&mut self, schedule: Schedule) {
        for spin_id in self.pool.spin_ids() {
            let Some(old_spin) = self.pool.get(&spin_id).map(|v| v.spin().clone()) else {
                continue;
            };
            let old_url = old_spin.audio_block.download_url.clone();

            match schedule.spins.iter().find(|s| s.id == spin_id) {
                None => {
                    debug!("StationScheduler: {} removed by refresh", spin_id);
                    self.downloader.cancel_for(&old_url);
                    self.pool.recycle(&spin_id);
                    self.cache.unpin(&old_url);
                    self.retry_counts.remove(&spin_id);
                }
                Some(new_spin) => {
                    let changed = new_spin.airtime != old_spin.airtime
                        || new_spin.audio_block.download_url != old_url
                        || new_spin.fades != old_spin.fades;
                    if changed {
                        info!("StationScheduler: {} changed, re-preparing", spin_id);
                        if new_spin.audio_block.download_url != old_url {
                            self.downloader.cancel_for(&old_url);
                        }
                        self.pool.recycle(&spin_id);
                        self.cache.unpin(&old_url);
                        self.retry_counts.remove(&spin_id);
                    }
                }
            }
        }

        if let Some(active) = self.active.as_mut() {
            active.schedule = schedule;
        }
        self.prefetch_window();
    }

    // ── préparation des voix ───────────────────────────────────────

    /// Prépare une voix pour chaque spin de la fenêtre d'anticipation
    /// qui n'en a pas encore.
    fn prefetch_window(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        let now = self.time.now();
        let offset = active.offset;
        let horizon = now + ChronoDuration::seconds(self.config.lookahead_secs);

        let upcoming: Vec<Spin> = active
            .schedule
            .current(now, offset)
            .into_iter()
            .filter(|s| s.airtime_shifted(offset) <= horizon)
            .cloned()
            .collect();

        for spin in upcoming {
            if self.pool.contains(&spin.id) {
                continue;
            }
            debug!(
                "StationScheduler: prefetching {} ({})",
                spin.id, spin.audio_block.title
            );
            let url = spin.audio_block.download_url.clone();
            self.cache.pin(&url);
            self.pool.get_or_create(&spin);
            self.start_download(spin.id.clone(), url);
        }
    }

    /// Relaie le flux d'événements d'un téléchargement vers le
    /// superviseur.
    fn start_download(&self, spin_id: String, url: String) {
        let (_id, mut rx) = self.downloader.download(&url);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let terminal = event.is_terminal();
                let _ = tx.send(InternalEvent::Download {
                    spin_id: spin_id.clone(),
                    event,
                });
                if terminal {
                    break;
                }
            }
        });
    }

    async fn handle_download(&mut self, spin_id: String, event: DownloadEvent) {
        match event {
            DownloadEvent::Progress(fraction) => {
                if self.loading_spin.as_deref() == Some(spin_id.as_str())
                    && matches!(self.notifier.current(), PlayerState::Loading(_))
                {
                    self.notifier.set(PlayerState::Loading(fraction));
                }
            }
            DownloadEvent::Completed(path) => {
                self.retry_counts.remove(&spin_id);
                self.finish_prepare(spin_id, path).await;
            }
            DownloadEvent::Failed(err) => {
                self.handle_download_failure(spin_id, err);
            }
            DownloadEvent::Cancelled => {
                // Annulation venue d'un refresh ou d'un stop : la voix
                // correspondante a déjà été recyclée.
                debug!("StationScheduler: download cancelled for {}", spin_id);
            }
        }
    }

    /// Fichier en cache : décodage, câblage dans le graphe, armement.
    async fn finish_prepare(&mut self, spin_id: String, path: PathBuf) {
        let Some(active) = &self.active else {
            return;
        };
        let offset = active.offset;
        let rate = self.graph.sample_rate();

        let Some(voice) = self.pool.get_mut(&spin_id) else {
            // Recyclée par un refresh pendant le téléchargement.
            return;
        };

        match voice.load(path, rate).await {
            Ok(()) => {
                let now = self.time.now();
                let events = self.graph.events_sender();
                self.graph.attach(voice);
                voice.arm(&self.graph, now, offset, &events);

                let excluded = self.pooled_paths();
                self.cache.prune_to_limit(&excluded);
            }
            Err(e) => {
                crate::report_error!(
                    self.reporter,
                    &e,
                    &format!("preparing audio for {}", spin_id),
                    Severity::Error
                );
                self.abandon_spin(&spin_id);
            }
        }
    }

    fn handle_download_failure(&mut self, spin_id: String, err: DownloadError) {
        let Some(active) = &self.active else {
            return;
        };
        let offset = active.offset;
        let Some(spin) = self.pool.get(&spin_id).map(|v| v.spin().clone()) else {
            return;
        };

        let attempt = {
            let count = self.retry_counts.entry(spin_id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let now = self.time.now();
        let deadline = spin.airtime_shifted(offset)
            - ChronoDuration::seconds(self.config.abandon_margin_secs);

        if attempt <= self.config.max_download_retries && now < deadline {
            let delay = RETRY_BACKOFF_MS[(attempt as usize - 1).min(RETRY_BACKOFF_MS.len() - 1)];
            debug!(
                "StationScheduler: download of {} failed ({}), retry {} in {} ms",
                spin_id, err, attempt, delay
            );
            let tx = self.internal_tx.clone();
            let spin_id = spin_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                let _ = tx.send(InternalEvent::RetryDownload { spin_id });
            });
        } else {
            // Trop tard ou trop d'échecs : on passe au spin suivant.
            self.retry_counts.remove(&spin_id);
            crate::report_error!(
                self.reporter,
                &err,
                &format!("download exhausted for {}", spin_id),
                Severity::Warning
            );
            self.abandon_spin(&spin_id);
        }
    }

    fn handle_retry(&mut self, spin_id: String) {
        if self.active.is_none() {
            return;
        }
        let Some(url) = self
            .pool
            .get(&spin_id)
            .map(|v| v.spin().audio_block.download_url.clone())
        else {
            return;
        };
        debug!("StationScheduler: retrying download for {}", spin_id);
        self.start_download(spin_id, url);
    }

    fn abandon_spin(&mut self, spin_id: &str) {
        if let Some(url) = self
            .pool
            .get(spin_id)
            .map(|v| v.spin().audio_block.download_url.clone())
        {
            self.pool.recycle(spin_id);
            self.cache.unpin(&url);
        }
        if self.loading_spin.as_deref() == Some(spin_id) {
            self.loading_spin = None;
        }
    }

    fn pooled_paths(&self) -> HashSet<PathBuf> {
        self.pool
            .spin_ids()
            .iter()
            .filter_map(|id| self.pool.get(id))
            .map(|v| {
                self.cache
                    .local_path_for(&v.spin().audio_block.download_url)
            })
            .collect()
    }

    // ── événements des voix ────────────────────────────────────────

    async fn handle_voice_event(&mut self, event: VoiceEvent) {
        match event {
            VoiceEvent::Started { spin } => {
                if self.active.is_none() {
                    return;
                }
                if let Some(voice) = self.pool.get_mut(&spin.id) {
                    voice.mark_playing();
                }
                self.loading_spin = None;
                info!(
                    "StationScheduler: now playing {} ({} - {})",
                    spin.id, spin.audio_block.artist, spin.audio_block.title
                );
                self.notifier.set(PlayerState::Playing(spin));
                // Chaque démarrage de voix déclenche un rafraîchissement.
                self.start_refresh();
            }
            VoiceEvent::Finished { spin_id } => {
                // La voix se recycle d'elle-même via son timer.
                debug!("StationScheduler: voice {} finished", spin_id);
            }
            VoiceEvent::Cleared { spin_id } => {
                if let Some(url) = self
                    .pool
                    .get(&spin_id)
                    .map(|v| v.spin().audio_block.download_url.clone())
                {
                    self.pool.recycle(&spin_id);
                    self.cache.unpin(&url);
                }
                self.retry_counts.remove(&spin_id);
                self.maybe_go_idle().await;
            }
        }
    }

    /// Retour à Idle quand le programme est épuisé et que plus aucune
    /// voix ne vit.
    async fn maybe_go_idle(&mut self) {
        let exhausted = match &self.active {
            Some(active) => {
                let now = self.time.now();
                self.pool.is_empty()
                    && active.schedule.current(now, active.offset).is_empty()
            }
            None => false,
        };
        if exhausted {
            info!("StationScheduler: schedule exhausted, going idle");
            self.shutdown_station().await;
        }
    }
}
