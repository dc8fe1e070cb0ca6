//! Pool de voix, indexé par identifiant de spin
//!
//! Garantit une voix au plus par spin et recycle les coquilles de rendu
//! pour limiter les allocations.

use crate::mixer::RenderState;
use crate::voice::SpinVoice;
use ploapi::Spin;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Nombre maximal de coquilles gardées au repos.
const MAX_IDLE_SHELLS: usize = 8;

#[derive(Default)]
pub struct VoicePool {
    active: HashMap<String, SpinVoice>,
    idle_shells: Vec<Arc<Mutex<RenderState>>>,
}

impl VoicePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retourne la voix existante du spin, ou en alloue une.
    ///
    /// Jamais deux voix actives pour le même identifiant de spin.
    pub fn get_or_create(&mut self, spin: &Spin) -> &mut SpinVoice {
        self.active.entry(spin.id.clone()).or_insert_with(|| {
            let shell = self.idle_shells.pop();
            debug!(
                "VoicePool: allocating voice for {} (shell reuse: {})",
                spin.id,
                shell.is_some()
            );
            SpinVoice::new(spin.clone(), shell)
        })
    }

    pub fn contains(&self, spin_id: &str) -> bool {
        self.active.contains_key(spin_id)
    }

    pub fn get(&self, spin_id: &str) -> Option<&SpinVoice> {
        self.active.get(spin_id)
    }

    pub fn get_mut(&mut self, spin_id: &str) -> Option<&mut SpinVoice> {
        self.active.get_mut(spin_id)
    }

    pub fn spin_ids(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Retire la voix d'un spin et recycle sa coquille de rendu.
    pub fn recycle(&mut self, spin_id: &str) -> bool {
        match self.active.remove(spin_id) {
            Some(mut voice) => {
                voice.deactivate();
                if self.idle_shells.len() < MAX_IDLE_SHELLS {
                    let shell = voice.render_handle();
                    shell.lock().unwrap().reset(String::new());
                    self.idle_shells.push(shell);
                }
                debug!("VoicePool: recycled voice for {}", spin_id);
                true
            }
            None => false,
        }
    }

    /// Vide l'ensemble actif (arrêt de la station).
    pub fn recycle_all(&mut self) {
        let ids = self.spin_ids();
        for id in ids {
            self.recycle(&id);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use chrono::{DateTime, Utc};
    use ploapi::{AudioBlock, BlockKind, Spin};

    /// Spin de test minimal, 30 s de long.
    pub fn spin_at(id: &str, airtime: DateTime<Utc>) -> Spin {
        Spin {
            id: id.to_string(),
            station_id: "station-1".to_string(),
            airtime,
            starting_volume: 1.0,
            audio_block: AudioBlock {
                id: format!("block-{}", id),
                title: "Title".to_string(),
                artist: "Artist".to_string(),
                album: None,
                kind: BlockKind::Song,
                duration_ms: 30_000,
                end_of_message_ms: 30_000,
                beginning_of_outro_ms: 0,
                end_of_intro_ms: 0,
                length_of_outro_ms: 0,
                download_url: format!("https://cdn.example.com/{}.mp3", id),
                image_url: None,
            },
            fades: Vec::new(),
            created_at: None,
            updated_at: None,
            related_texts: Vec::new(),
        }
    }
}
