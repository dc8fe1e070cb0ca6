//! Source de temps injectable
//!
//! Toute l'arithmétique de planification du player s'exprime en instants
//! absolus UTC obtenus via ce trait. Les tests injectent une horloge
//! contrôlable au lieu de l'horloge système.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

/// Fournit l'instant courant.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Horloge système (murale).
#[derive(Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Horloge contrôlable pour les tests.
///
/// Clonable : tous les clones partagent le même instant courant.
#[derive(Clone)]
pub struct ManualTimeSource {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualTimeSource {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Positionne l'instant courant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap() = instant;
    }

    /// Avance (ou recule, delta négatif) l'instant courant.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
