//! Le graphe audio : moteur, mixeur principal, planification des voix
//!
//! Toutes les conversions horloge murale → horloge audio se font ici, au
//! point de planification. Les mutations du graphe (attach/detach) sont
//! sûres moteur en marche.

use crate::clock::AudioClock;
use crate::mixer::{FadeStep, Mixer, VoiceEvent};
use crate::sink::AudioSink;
use crate::voice::SpinVoice;
use crate::{AudioError, FADE_RAMP_STEPS, SCHEDULE_EPSILON_MS};
use chrono::{DateTime, Utc};
use ploutils::TimeSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Nombre de tentatives de démarrage du moteur.
const START_ATTEMPTS: u32 = 3;

/// Pause entre deux tentatives de démarrage.
const START_BACKOFF: Duration = Duration::from_millis(100);

pub struct AudioGraph {
    clock: Arc<AudioClock>,
    mixer: Arc<Mixer>,
    sink: Box<dyn AudioSink>,
    events_tx: mpsc::UnboundedSender<VoiceEvent>,
    running: bool,
}

impl AudioGraph {
    /// Construit le graphe autour d'un puits.
    ///
    /// Retourne aussi le flux d'événements des voix (démarrages capturés
    /// par le tap, fins de buffer, timers de nettoyage).
    pub fn new(
        sink: Box<dyn AudioSink>,
        time: Arc<dyn TimeSource>,
    ) -> (Self, mpsc::UnboundedReceiver<VoiceEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let clock = Arc::new(AudioClock::new(sink.sample_rate(), time));
        let mixer = Arc::new(Mixer::new(Arc::clone(&clock), events_tx.clone()));

        (
            Self {
                clock,
                mixer,
                sink,
                events_tx,
                running: false,
            },
            events_rx,
        )
    }

    pub fn sample_rate(&self) -> u32 {
        self.clock.sample_rate()
    }

    pub fn clock(&self) -> &Arc<AudioClock> {
        &self.clock
    }

    pub fn mixer(&self) -> &Arc<Mixer> {
        &self.mixer
    }

    pub fn events_sender(&self) -> mpsc::UnboundedSender<VoiceEvent> {
        self.events_tx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Démarre le moteur, avec 3 tentatives espacées de 100 ms.
    pub async fn start(&mut self) -> Result<(), AudioError> {
        if self.running {
            return Ok(());
        }

        let mut last_error = None;
        for attempt in 1..=START_ATTEMPTS {
            match self.sink.start(Arc::clone(&self.mixer)) {
                Ok(()) => {
                    self.running = true;
                    info!("AudioGraph: engine started (attempt {})", attempt);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "AudioGraph: engine start attempt {}/{} failed: {}",
                        attempt, START_ATTEMPTS, e
                    );
                    last_error = Some(e);
                    if attempt < START_ATTEMPTS {
                        tokio::time::sleep(START_BACKOFF).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| AudioError::EngineStart("engine did not start".to_string())))
    }

    /// Arrête le moteur et détache toutes les voix.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.sink.stop();
        self.mixer.detach_all();
        self.clock.reset();
        self.running = false;
        info!("AudioGraph: engine stopped");
    }

    /// Branche la voix sur le mixeur principal.
    pub fn attach(&self, voice: &SpinVoice) {
        self.mixer.attach(voice.render_handle());
        debug!("AudioGraph: attached voice {}", voice.spin_id());
    }

    /// Débranche la voix du mixeur principal.
    pub fn detach(&self, voice: &SpinVoice) {
        self.mixer.detach(&voice.render_handle());
        debug!("AudioGraph: detached voice {}", voice.spin_id());
    }

    /// Arme le départ de la voix à un instant absolu.
    pub fn schedule_start(&self, voice: &mut SpinVoice, at: DateTime<Utc>) {
        let start_frame = self.clock.wall_to_frames(at);
        let starting_volume = voice.spin().starting_volume.clamp(0.0, 1.0);

        {
            let render = voice.render_handle();
            let mut render = render.lock().unwrap();
            render.start_frame = Some(start_frame);
            render.file_offset_frames = 0;
            render.volume = starting_volume;
            render.steps.clear();
            render.next_step = 0;
        }
        voice.note_armed(at, starting_volume);
        debug!(
            "AudioGraph: scheduled {} at frame {} (volume {:.2})",
            voice.spin_id(),
            start_frame,
            starting_volume
        );
    }

    /// Démarre la voix immédiatement, depuis une position dans le
    /// fichier (prise d'un spin déjà en cours de diffusion).
    pub fn play_now(&self, voice: &mut SpinVoice, now: DateTime<Utc>, from_offset_seconds: f64) {
        let start_frame = self.clock.now_frames() + self.clock.ms_to_frames(SCHEDULE_EPSILON_MS);
        let file_offset = self.clock.seconds_to_frames(from_offset_seconds);

        {
            let render = voice.render_handle();
            let mut render = render.lock().unwrap();
            render.start_frame = Some(start_frame);
            render.file_offset_frames = file_offset;
            // Prise en cours de route : volume plein, les fades passés
            // sont derrière nous.
            render.volume = 1.0;
            render.steps.clear();
            render.next_step = 0;
        }
        voice.note_armed(now, 1.0);
        debug!(
            "AudioGraph: playing {} now from {:.2}s",
            voice.spin_id(),
            from_offset_seconds
        );
    }

    /// Arme une rampe de volume : paliers discrets, linéaires en
    /// amplitude, sur `ramp_seconds`.
    ///
    /// Les positions sont relatives au départ de la voix ; si le tap
    /// capture un départ réel différent, toute l'automation se recale
    /// d'elle-même.
    pub fn schedule_fade(
        &self,
        voice: &mut SpinVoice,
        at: DateTime<Utc>,
        to_volume: f32,
        ramp_seconds: f64,
    ) {
        let Some(start_instant) = voice.start_instant() else {
            warn!(
                "AudioGraph: fade for {} ignored, voice not armed",
                voice.spin_id()
            );
            return;
        };

        let rel_ms = (at - start_instant).num_milliseconds();
        if rel_ms < 0 {
            // Fade entièrement dans le passé (prise en cours de route)
            debug!("AudioGraph: skipping past fade for {}", voice.spin_id());
            return;
        }

        let to_volume = to_volume.clamp(0.0, 1.0);
        let from = voice.last_fade_target();
        let base_frames = self.clock.ms_to_frames(rel_ms) as i64;
        let ramp_frames = self.clock.seconds_to_frames(ramp_seconds) as i64;

        let render = voice.render_handle();
        let mut render = render.lock().unwrap();
        for i in 1..=FADE_RAMP_STEPS {
            let t = i as f32 / FADE_RAMP_STEPS as f32;
            render.steps.push(FadeStep {
                at_frames: base_frames + (ramp_frames as f32 * t) as i64,
                volume: from + (to_volume - from) * t,
            });
        }
        render.steps.sort_by_key(|s| s.at_frames);
        drop(render);

        voice.set_last_fade_target(to_volume);
        debug!(
            "AudioGraph: fade {} -> {:.2} at +{} ms over {:.1}s ({} steps)",
            voice.spin_id(),
            to_volume,
            rel_ms,
            ramp_seconds,
            FADE_RAMP_STEPS
        );
    }
}

impl Drop for AudioGraph {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::NullSink;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use ploutils::ManualTimeSource;

    struct FailingSink {
        attempts: Arc<std::sync::atomic::AtomicU32>,
    }

    impl AudioSink for FailingSink {
        fn sample_rate(&self) -> u32 {
            48_000
        }

        fn start(&mut self, _mixer: Arc<Mixer>) -> Result<(), AudioError> {
            self.attempts
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(AudioError::EngineStart("synthetic failure".to_string()))
        }

        fn stop(&mut self) {}
    }

    fn manual_time() -> Arc<ManualTimeSource> {
        Arc::new(ManualTimeSource::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_start_retries_three_times() {
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let sink = FailingSink {
            attempts: Arc::clone(&attempts),
        };
        let (mut graph, _events) = AudioGraph::new(Box::new(sink), manual_time());

        let started = std::time::Instant::now();
        let result = graph.start().await;
        assert!(result.is_err());
        assert!(!graph.is_running());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
        // Deux pauses de 100 ms entre trois tentatives
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_start_with_null_sink() {
        let (mut graph, _events) = AudioGraph::new(Box::new(NullSink::new(48_000)), manual_time());
        graph.start().await.unwrap();
        assert!(graph.is_running());
        // Idempotent
        graph.start().await.unwrap();
        graph.stop();
        assert!(!graph.is_running());
    }

    #[tokio::test]
    async fn test_schedule_fade_requires_armed_voice() {
        let time = manual_time();
        let (graph, _events) = AudioGraph::new(Box::new(NullSink::new(48_000)), time.clone());

        let spin = crate::pool::tests_support::spin_at("a", time.now());
        let mut voice = SpinVoice::new(spin, None);

        // Pas armée : le fade est ignoré sans paniquer
        graph.schedule_fade(&mut voice, time.now(), 0.5, 1.5);

        graph.schedule_start(&mut voice, time.now() + ChronoDuration::seconds(5));
        graph.schedule_fade(
            &mut voice,
            time.now() + ChronoDuration::seconds(7),
            0.5,
            1.5,
        );

        let render = voice.render_handle();
        let render = render.lock().unwrap();
        assert_eq!(render.steps.len(), FADE_RAMP_STEPS as usize);
        // Premier palier après le début du fade (2 s après le départ)
        assert!(render.steps[0].at_frames > 2 * 48_000 as i64);
        // Dernier palier : cible atteinte au bout de la rampe
        let last = render.steps.last().unwrap();
        assert!((last.volume - 0.5).abs() < 1e-6);
        assert_eq!(last.at_frames, (2.0 * 48_000.0 + 1.5 * 48_000.0) as i64);
    }
}
