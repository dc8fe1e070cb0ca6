//! Graphe audio du player
//!
//! Un moteur longue durée avec un mixeur principal dont la sortie est le
//! périphérique. Chaque spin préparé devient une voix : source décodée →
//! sous-mixeur (gain de normalisation + automation de volume) → mixeur
//! principal. Les événements audio sont planifiés dans le domaine des
//! échantillons ; la conversion horloge murale → horloge audio se fait
//! une seule fois, au point de planification.

mod clock;
mod error;
mod graph;
mod mixer;
mod normalize;
mod pool;
mod sink;
mod voice;

pub use clock::AudioClock;
pub use error::AudioError;
pub use graph::AudioGraph;
pub use mixer::{Mixer, RenderState, VoiceEvent};
pub use normalize::{decode_for_playback, DecodedAudio, NormalizationCalculator};
pub use pool::VoicePool;
pub use sink::{AudioSink, CpalSink, NullSink};
pub use voice::{SpinVoice, VoiceState};

/// Marge de planification : un événement demandé plus tôt que
/// `maintenant + EPSILON` est ramené à cette borne.
pub const SCHEDULE_EPSILON_MS: i64 = 10;

/// Durée d'une rampe de fade.
pub const FADE_RAMP_SECONDS: f64 = 1.5;

/// Nombre de paliers discrets par rampe.
pub const FADE_RAMP_STEPS: u32 = 48;

/// Seuil RMS au-dessus duquel un buffer est considéré audible.
pub const AUDIBLE_RMS_THRESHOLD: f32 = 1e-6;
