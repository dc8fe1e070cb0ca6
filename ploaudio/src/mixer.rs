//! Mixeur principal et état de rendu des voix
//!
//! Le thread de rendu (callback cpal ou puits nul) appelle
//! [`Mixer::render`] ; le superviseur mute l'état des voix de son côté.
//! Le partage se fait par mutex standard à sections critiques courtes,
//! entre le monde async et le callback temps réel.

use crate::clock::AudioClock;
use crate::AUDIBLE_RMS_THRESHOLD;
use ploapi::Spin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

/// Événement émis par le chemin de rendu, dans l'ordre de l'horloge
/// audio (un seul thread de rendu, un seul channel).
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    /// Premier buffer audible rendu pour ce spin (tap de démarrage).
    Started { spin: Box<Spin> },
    /// Le buffer de la voix est épuisé.
    Finished { spin_id: String },
    /// Le timer de nettoyage a rendu la voix au pool.
    Cleared { spin_id: String },
}

/// Palier discret d'automation de volume.
///
/// Position exprimée en frames relatives au départ (capturé) de la voix.
#[derive(Debug, Clone, Copy)]
pub struct FadeStep {
    pub at_frames: i64,
    pub volume: f32,
}

/// État d'une voix vu du thread de rendu.
pub struct RenderState {
    pub spin_id: String,
    pub spin: Option<Box<Spin>>,
    /// Stéréo entrelacé à la fréquence du graphe.
    pub samples: Arc<Vec<f32>>,
    /// Gain de normalisation, pré-fader.
    pub gain: f32,
    /// Volume courant du sous-mixeur.
    pub volume: f32,
    /// Position d'horloge où la lecture démarre.
    pub start_frame: Option<u64>,
    /// Décalage dans le fichier quand on rejoint un spin en cours.
    pub file_offset_frames: u64,
    /// Paliers triés par position croissante.
    pub steps: Vec<FadeStep>,
    pub next_step: usize,
    /// Position réelle du premier buffer audible (tap).
    pub captured_start: Option<u64>,
    pub playing: bool,
    pub finished: bool,
    pub detached: bool,
}

impl RenderState {
    pub fn new(spin_id: String) -> Self {
        Self {
            spin_id,
            spin: None,
            samples: Arc::new(Vec::new()),
            gain: 1.0,
            volume: 1.0,
            start_frame: None,
            file_offset_frames: 0,
            steps: Vec::new(),
            next_step: 0,
            captured_start: None,
            playing: false,
            finished: false,
            detached: true,
        }
    }

    /// Réinitialise l'état pour réutilisation par un autre spin.
    pub fn reset(&mut self, spin_id: String) {
        *self = Self::new(spin_id);
    }

    fn total_frames(&self) -> u64 {
        (self.samples.len() / 2) as u64
    }

    /// Mixe la contribution de la voix dans `out` (stéréo entrelacé),
    /// `buffer_start` étant la position d'horloge du premier frame.
    fn mix_into(&mut self, out: &mut [f32], buffer_start: u64) -> Vec<VoiceEvent> {
        let mut events = Vec::new();
        if self.detached || self.finished || self.samples.is_empty() {
            return events;
        }
        let Some(start) = self.start_frame else {
            return events;
        };

        let frames = out.len() / 2;
        let total = self.total_frames();
        // L'indexation du fichier reste relative au départ planifié ;
        // seule l'automation se recale sur le départ capturé.
        let automation_base = self.captured_start.unwrap_or(start);

        let mut sum_squares: f64 = 0.0;
        let mut contributed: usize = 0;
        let mut first_audible: Option<u64> = None;

        for i in 0..frames {
            let pos = buffer_start + i as u64;
            if pos < start {
                continue;
            }

            let file_index = (pos - start) + self.file_offset_frames;
            if file_index >= total {
                self.finished = true;
                events.push(VoiceEvent::Finished {
                    spin_id: self.spin_id.clone(),
                });
                break;
            }

            if pos >= automation_base {
                let rel = (pos - automation_base) as i64;
                while self.next_step < self.steps.len()
                    && self.steps[self.next_step].at_frames <= rel
                {
                    self.volume = self.steps[self.next_step].volume;
                    self.next_step += 1;
                }
            }

            let idx = (file_index * 2) as usize;
            let amp = self.gain * self.volume;
            let l = self.samples[idx] * amp;
            let r = self.samples[idx + 1] * amp;
            out[i * 2] += l;
            out[i * 2 + 1] += r;

            sum_squares += (l * l + r * r) as f64;
            contributed += 1;
            if first_audible.is_none() && (l != 0.0 || r != 0.0) {
                first_audible = Some(pos);
            }
        }

        if !self.playing && contributed > 0 {
            let rms = (sum_squares / (contributed as f64 * 2.0)).sqrt() as f32;
            if rms > AUDIBLE_RMS_THRESHOLD {
                // Tap une seule fois : position de départ réelle
                // capturée, notification, puis le tap se retire.
                let captured = first_audible.unwrap_or(buffer_start.max(start));
                self.playing = true;
                self.captured_start = Some(captured);
                if let Some(spin) = &self.spin {
                    events.push(VoiceEvent::Started { spin: spin.clone() });
                }
                trace!(
                    "RenderState: captured start of {} at frame {}",
                    self.spin_id,
                    captured
                );
            }
        }

        events
    }
}

/// Mixeur principal : somme les sous-mixes de toutes les voix attachées.
pub struct Mixer {
    clock: Arc<AudioClock>,
    voices: Mutex<Vec<Arc<Mutex<RenderState>>>>,
    events: mpsc::UnboundedSender<VoiceEvent>,
}

impl Mixer {
    pub fn new(clock: Arc<AudioClock>, events: mpsc::UnboundedSender<VoiceEvent>) -> Self {
        Self {
            clock,
            voices: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn clock(&self) -> &Arc<AudioClock> {
        &self.clock
    }

    pub(crate) fn attach(&self, render: Arc<Mutex<RenderState>>) {
        render.lock().unwrap().detached = false;
        let mut voices = self.voices.lock().unwrap();
        voices.retain(|v| !Arc::ptr_eq(v, &render));
        voices.push(render);
    }

    pub(crate) fn detach(&self, render: &Arc<Mutex<RenderState>>) {
        render.lock().unwrap().detached = true;
        self.voices.lock().unwrap().retain(|v| !Arc::ptr_eq(v, render));
    }

    pub fn detach_all(&self) {
        let mut voices = self.voices.lock().unwrap();
        for voice in voices.iter() {
            voice.lock().unwrap().detached = true;
        }
        voices.clear();
    }

    /// Nombre de voix attachées.
    pub fn voice_count(&self) -> usize {
        self.voices.lock().unwrap().len()
    }

    /// Rend `out.len() / 2` frames stéréo et avance l'horloge.
    ///
    /// Appelé exclusivement par le thread de rendu du puits audio.
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        let buffer_start = self.clock.now_frames();

        let voices: Vec<_> = self.voices.lock().unwrap().clone();
        for voice in voices {
            let events = voice.lock().unwrap().mix_into(out, buffer_start);
            for event in events {
                let _ = self.events.send(event);
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.clock.advance((out.len() / 2) as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ploutils::ManualTimeSource;

    fn mixer() -> (Arc<Mixer>, mpsc::UnboundedReceiver<VoiceEvent>) {
        let time = ManualTimeSource::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        let clock = Arc::new(AudioClock::new(1_000, Arc::new(time)));
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Mixer::new(clock, tx)), rx)
    }

    fn voice_with_samples(id: &str, samples: Vec<f32>) -> Arc<Mutex<RenderState>> {
        let mut state = RenderState::new(id.to_string());
        state.samples = Arc::new(samples);
        state.detached = false;
        Arc::new(Mutex::new(state))
    }

    #[test]
    fn test_render_before_start_is_silent() {
        let (mixer, _rx) = mixer();
        let voice = voice_with_samples("a", vec![0.5; 2_000]);
        voice.lock().unwrap().start_frame = Some(500);
        mixer.attach(Arc::clone(&voice));

        let mut out = vec![0.0f32; 200]; // 100 frames, positions 0..100
        mixer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_render_mixes_after_start() {
        let (mixer, _rx) = mixer();
        let voice = voice_with_samples("a", vec![0.25; 2_000]);
        voice.lock().unwrap().start_frame = Some(0);
        mixer.attach(Arc::clone(&voice));

        let mut out = vec![0.0f32; 200];
        mixer.render(&mut out);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_overlapping_voices_sum() {
        // Pas de crossfade synthétique : le chevauchement s'additionne.
        let (mixer, _rx) = mixer();
        for id in ["a", "b"] {
            let voice = voice_with_samples(id, vec![0.25; 2_000]);
            voice.lock().unwrap().start_frame = Some(0);
            mixer.attach(voice);
        }

        let mut out = vec![0.0f32; 200];
        mixer.render(&mut out);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_output_is_clamped() {
        let (mixer, _rx) = mixer();
        for id in ["a", "b", "c"] {
            let voice = voice_with_samples(id, vec![0.9; 2_000]);
            voice.lock().unwrap().start_frame = Some(0);
            mixer.attach(voice);
        }

        let mut out = vec![0.0f32; 200];
        mixer.render(&mut out);
        assert!(out.iter().all(|&s| s <= 1.0));
    }

    #[test]
    fn test_started_event_once_on_first_audible_buffer() {
        let (mixer, mut rx) = mixer();
        let voice = voice_with_samples("a", vec![0.5; 2_000]);
        {
            let mut state = voice.lock().unwrap();
            state.start_frame = Some(0);
            state.spin = Some(Box::new(test_spin("a")));
        }
        mixer.attach(voice);

        let mut out = vec![0.0f32; 200];
        mixer.render(&mut out);
        mixer.render(&mut out);

        let event = rx.try_recv().unwrap();
        assert!(matches!(event, VoiceEvent::Started { spin } if spin.id == "a"));
        // Un seul Started : le tap s'est retiré
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_silent_preroll_does_not_trigger_start() {
        let (mixer, mut rx) = mixer();
        // 150 frames de silence puis du signal
        let mut samples = vec![0.0f32; 300];
        samples.extend(vec![0.5f32; 1_000]);
        let voice = voice_with_samples("a", samples);
        {
            let mut state = voice.lock().unwrap();
            state.start_frame = Some(0);
            state.spin = Some(Box::new(test_spin("a")));
        }
        mixer.attach(Arc::clone(&voice));

        let mut out = vec![0.0f32; 200]; // 100 frames : que du silence
        mixer.render(&mut out);
        assert!(rx.try_recv().is_err());

        mixer.render(&mut out); // frames 100..200 : le signal commence à 150
        let event = rx.try_recv().unwrap();
        match event {
            VoiceEvent::Started { spin } => assert_eq!(spin.id, "a"),
            other => panic!("expected Started, got {:?}", other),
        }
        // Le départ capturé est la vraie position audible, pas la
        // position planifiée.
        assert_eq!(voice.lock().unwrap().captured_start, Some(150));
    }

    #[test]
    fn test_finished_event_when_buffer_exhausted() {
        let (mixer, mut rx) = mixer();
        let voice = voice_with_samples("a", vec![0.5; 100]); // 50 frames
        {
            let mut state = voice.lock().unwrap();
            state.start_frame = Some(0);
            state.spin = Some(Box::new(test_spin("a")));
        }
        mixer.attach(voice);

        let mut out = vec![0.0f32; 200];
        mixer.render(&mut out);

        let started = rx.try_recv().unwrap();
        assert!(matches!(started, VoiceEvent::Started { .. }));
        let finished = rx.try_recv().unwrap();
        assert!(matches!(finished, VoiceEvent::Finished { spin_id } if spin_id == "a"));
    }

    #[test]
    fn test_fade_steps_apply_in_order() {
        let (mixer, _rx) = mixer();
        let voice = voice_with_samples("a", vec![1.0; 2_000]);
        {
            let mut state = voice.lock().unwrap();
            state.start_frame = Some(0);
            state.volume = 1.0;
            state.steps = vec![
                FadeStep {
                    at_frames: 50,
                    volume: 0.5,
                },
                FadeStep {
                    at_frames: 80,
                    volume: 0.0,
                },
            ];
        }
        mixer.attach(voice);

        let mut out = vec![0.0f32; 200];
        mixer.render(&mut out);

        assert!((out[0] - 1.0).abs() < 1e-6); // avant le premier palier
        assert!((out[2 * 60] - 0.5).abs() < 1e-6); // entre les deux
        assert!(out[2 * 90].abs() < 1e-6); // après le second
    }

    fn test_spin(id: &str) -> Spin {
        use ploapi::{AudioBlock, BlockKind};
        Spin {
            id: id.to_string(),
            station_id: "station-1".to_string(),
            airtime: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
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
                download_url: "https://cdn.example.com/a.mp3".to_string(),
                image_url: None,
            },
            fades: Vec::new(),
            created_at: None,
            updated_at: None,
            related_texts: Vec::new(),
        }
    }
}
