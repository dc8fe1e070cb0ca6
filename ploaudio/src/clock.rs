//! Horloge audio en domaine échantillons
//!
//! L'horloge compte les frames rendues depuis le démarrage du moteur.
//! La conversion d'un instant mural vers une position d'échantillon se
//! fait ici, et seulement ici :
//! `position = rendu + (instant − maintenant) × fréquence`.

use chrono::{DateTime, Utc};
use ploutils::TimeSource;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::SCHEDULE_EPSILON_MS;

pub struct AudioClock {
    sample_rate: u32,
    rendered_frames: AtomicU64,
    late_schedules: AtomicU64,
    time: Arc<dyn TimeSource>,
}

impl AudioClock {
    pub fn new(sample_rate: u32, time: Arc<dyn TimeSource>) -> Self {
        Self {
            sample_rate,
            rendered_frames: AtomicU64::new(0),
            late_schedules: AtomicU64::new(0),
            time,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Position courante de l'horloge audio, en frames.
    pub fn now_frames(&self) -> u64 {
        self.rendered_frames.load(Ordering::Acquire)
    }

    /// Avance l'horloge après un rendu (thread de rendu uniquement).
    pub fn advance(&self, frames: u64) {
        self.rendered_frames.fetch_add(frames, Ordering::AcqRel);
    }

    /// Remet l'horloge à zéro (redémarrage du moteur).
    pub fn reset(&self) {
        self.rendered_frames.store(0, Ordering::Release);
    }

    /// Convertit un instant mural en position d'échantillon.
    ///
    /// Un instant déjà passé (ou à moins de 10 ms) est ramené à
    /// `maintenant + 10 ms` ; la planification tardive est comptée et
    /// loggée.
    pub fn wall_to_frames(&self, instant: DateTime<Utc>) -> u64 {
        let now = self.time.now();
        let mut delta_ms = (instant - now).num_milliseconds();
        if delta_ms < SCHEDULE_EPSILON_MS {
            self.late_schedules.fetch_add(1, Ordering::Relaxed);
            warn!(
                "AudioClock: late schedule ({} ms in the past), clamping",
                SCHEDULE_EPSILON_MS - delta_ms
            );
            delta_ms = SCHEDULE_EPSILON_MS;
        }
        self.now_frames() + self.ms_to_frames(delta_ms)
    }

    /// Nombre de planifications tardives depuis le démarrage.
    pub fn late_schedule_count(&self) -> u64 {
        self.late_schedules.load(Ordering::Relaxed)
    }

    pub fn ms_to_frames(&self, ms: i64) -> u64 {
        ((ms.max(0) as u128 * self.sample_rate as u128) / 1000) as u64
    }

    pub fn seconds_to_frames(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.sample_rate as f64).round() as u64
    }
}
