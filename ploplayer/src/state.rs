//! État observable du player
//!
//! Une variable d'état unique diffusée sur un channel `watch`, plus un
//! délégué optionnel qui reçoit chaque changement une fois. La livraison
//! est best-effort, sur la tâche superviseure.

use ploapi::Spin;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

/// État du moteur, la surface observable publique.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PlayerState {
    /// Aucune station sélectionnée.
    #[default]
    Idle,
    /// Téléchargement du premier spin ; fraction dans [0, 1].
    Loading(f32),
    /// Le spin le plus récemment parti à l'antenne.
    Playing(Box<Spin>),
}

impl PlayerState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, Self::Playing(_))
    }
}

/// Délégué optionnel notifié à chaque changement d'état.
pub trait PlayerDelegate: Send + Sync {
    fn on_state_change(&self, state: &PlayerState);
}

/// Publie l'état : un watch pour les abonnés, un délégué au plus.
pub struct StateNotifier {
    tx: watch::Sender<PlayerState>,
    delegate: Mutex<Option<Arc<dyn PlayerDelegate>>>,
}

impl StateNotifier {
    pub fn new() -> (Self, watch::Receiver<PlayerState>) {
        let (tx, rx) = watch::channel(PlayerState::Idle);
        (
            Self {
                tx,
                delegate: Mutex::new(None),
            },
            rx,
        )
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn PlayerDelegate>>) {
        *self.delegate.lock().unwrap() = delegate;
    }

    pub fn current(&self) -> PlayerState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerState> {
        self.tx.subscribe()
    }

    /// Publie un nouvel état (sans effet s'il est identique).
    pub fn set(&self, state: PlayerState) {
        let changed = {
            let current = self.tx.borrow();
            *current != state
        };
        if !changed {
            return;
        }

        debug!("StateNotifier: -> {:?}", brief(&state));
        let _ = self.tx.send(state.clone());

        let delegate = self.delegate.lock().unwrap().clone();
        if let Some(delegate) = delegate {
            delegate.on_state_change(&state);
        }
    }
}

fn brief(state: &PlayerState) -> String {
    match state {
        PlayerState::Idle => "Idle".to_string(),
        PlayerState::Loading(p) => format!("Loading({:.2})", p),
        PlayerState::Playing(spin) => format!("Playing({})", spin.id),
    }
}
