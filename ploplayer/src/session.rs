//! Session audio de la plateforme hôte.
//!
//! Le moteur ne connaît de la session audio du système que ces quatre
//! opérations ; chaque plateforme fournit son implémentation.

use crate::error::PlayerError;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cycle de vie de la session audio de la plateforme.
#[async_trait::async_trait]
pub trait AudioSession: Send + Sync {
    async fn configure_for_playback(&self) -> Result<(), PlayerError>;
    async fn activate(&self) -> Result<(), PlayerError>;
    async fn deactivate(&self) -> Result<(), PlayerError>;
    fn is_configured(&self) -> bool;
}

/// Session sans effet, pour les plateformes sans gestion de session et
/// pour les tests.
#[derive(Default)]
pub struct NoopAudioSession {
    configured: AtomicBool,
}

impl NoopAudioSession {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AudioSession for NoopAudioSession {
    async fn configure_for_playback(&self) -> Result<(), PlayerError> {
        self.configured.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn activate(&self) -> Result<(), PlayerError> {
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), PlayerError> {
        Ok(())
    }

    fn is_configured(&self) -> bool {
        self.configured.load(Ordering::SeqCst)
    }
}
