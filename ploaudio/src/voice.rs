//! Voix : un spin préparé, câblé dans le graphe
//!
//! Une voix possède le fichier décodé, son gain de normalisation, son
//! départ planifié et son automation de volume. Cycle de vie :
//! `Available → Loading → Loaded → Playing → Available` (recyclée par le
//! pool après son timer de nettoyage).

use crate::graph::AudioGraph;
use crate::mixer::{RenderState, VoiceEvent};
use crate::normalize::{decode_for_playback, NormalizationCalculator};
use crate::AudioError;
use chrono::{DateTime, Duration, Utc};
use ploapi::Spin;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Délai de grâce entre la fin d'un spin et le recyclage de sa voix.
pub const CLEANUP_GRACE_SECONDS: i64 = 1;

/// État supervisé d'une voix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Available,
    Loading,
    Loaded,
    Playing,
}

/// Un spin préparé pour lecture.
pub struct SpinVoice {
    spin: Spin,
    state: VoiceState,
    calculator: NormalizationCalculator,
    render: Arc<Mutex<RenderState>>,
    start_instant: Option<DateTime<Utc>>,
    last_fade_target: f32,
    clear_task: Option<JoinHandle<()>>,
}

impl SpinVoice {
    /// Crée une voix pour un spin, en réutilisant au besoin une coquille
    /// de rendu recyclée par le pool.
    pub fn new(spin: Spin, shell: Option<Arc<Mutex<RenderState>>>) -> Self {
        let render = match shell {
            Some(render) => {
                render.lock().unwrap().reset(spin.id.clone());
                render
            }
            None => Arc::new(Mutex::new(RenderState::new(spin.id.clone()))),
        };

        Self {
            spin,
            state: VoiceState::Loading,
            calculator: NormalizationCalculator::from_peak(1.0),
            render,
            start_instant: None,
            last_fade_target: 1.0,
            clear_task: None,
        }
    }

    pub fn spin(&self) -> &Spin {
        &self.spin
    }

    pub fn spin_id(&self) -> &str {
        &self.spin.id
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn calculator(&self) -> NormalizationCalculator {
        self.calculator
    }

    pub(crate) fn render_handle(&self) -> Arc<Mutex<RenderState>> {
        Arc::clone(&self.render)
    }

    pub(crate) fn start_instant(&self) -> Option<DateTime<Utc>> {
        self.start_instant
    }

    pub(crate) fn note_armed(&mut self, start_instant: DateTime<Utc>, volume: f32) {
        self.start_instant = Some(start_instant);
        self.last_fade_target = volume;
    }

    pub(crate) fn last_fade_target(&self) -> f32 {
        self.last_fade_target
    }

    pub(crate) fn set_last_fade_target(&mut self, target: f32) {
        self.last_fade_target = target;
    }

    /// Ouvre et décode le fichier, mesure le gain de normalisation.
    ///
    /// Le décodage se fait sur le pool bloquant ; le superviseur reste
    /// libre pendant ce temps.
    pub async fn load(&mut self, path: PathBuf, target_rate: u32) -> Result<(), AudioError> {
        self.state = VoiceState::Loading;
        let decoded =
            tokio::task::spawn_blocking(move || decode_for_playback(&path, target_rate))
                .await
                .map_err(|e| AudioError::Processing(format!("decoder task failed: {e}")))??;

        self.calculator = NormalizationCalculator::from_peak(decoded.peak);

        {
            let mut render = self.render.lock().unwrap();
            render.spin = Some(Box::new(self.spin.clone()));
            render.samples = Arc::new(decoded.samples);
            render.gain = decoded.gain;
        }

        self.state = VoiceState::Loaded;
        debug!(
            "SpinVoice: loaded {} (gain {:.3})",
            self.spin.id,
            self.calculator.gain()
        );
        Ok(())
    }

    /// Arme la voix selon sa position par rapport à `now` :
    /// - spin en cours de diffusion : lecture immédiate depuis l'offset
    ///   courant, volume 1.0 (les fades déjà passés sont sautés) ;
    /// - spin futur : départ planifié à l'airtime, volume de départ du
    ///   spin.
    ///
    /// Arme ensuite chaque fade et le timer de nettoyage à
    /// `endtime + 1 s`.
    pub fn arm(
        &mut self,
        graph: &AudioGraph,
        now: DateTime<Utc>,
        offset: Duration,
        events: &mpsc::UnboundedSender<VoiceEvent>,
    ) {
        let airtime = self.spin.airtime_shifted(offset);
        let endtime = self.spin.endtime_shifted(offset);

        if self.spin.is_airing_shifted(now, offset) {
            let elapsed = (now - airtime).num_milliseconds() as f64 / 1000.0;
            graph.play_now(self, now, elapsed);
        } else {
            graph.schedule_start(self, airtime);
        }

        for fade in self.spin.sorted_fades() {
            let at = airtime + Duration::milliseconds(fade.at_ms);
            graph.schedule_fade(self, at, fade.to_volume, crate::FADE_RAMP_SECONDS);
        }

        self.schedule_clear(now, endtime, events);
    }

    /// Planifie le retour de la voix au pool après la fin du spin.
    fn schedule_clear(
        &mut self,
        now: DateTime<Utc>,
        endtime: DateTime<Utc>,
        events: &mpsc::UnboundedSender<VoiceEvent>,
    ) {
        self.cancel_clear();

        let delay_ms = (endtime + Duration::seconds(CLEANUP_GRACE_SECONDS) - now)
            .num_milliseconds()
            .max(0) as u64;
        let spin_id = self.spin.id.clone();
        let events = events.clone();

        self.clear_task = Some(tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            let _ = events.send(VoiceEvent::Cleared { spin_id });
        }));
    }

    pub(crate) fn cancel_clear(&mut self) {
        if let Some(task) = self.clear_task.take() {
            task.abort();
        }
    }

    /// Passage en lecture, sur notification du tap de démarrage.
    pub fn mark_playing(&mut self) {
        self.state = VoiceState::Playing;
    }

    /// Sort la voix du graphe et annule son timer de nettoyage.
    pub fn deactivate(&mut self) {
        self.cancel_clear();
        self.render.lock().unwrap().detached = true;
        self.state = VoiceState::Available;
    }
}

impl Drop for SpinVoice {
    fn drop(&mut self) {
        self.cancel_clear();
    }
}
