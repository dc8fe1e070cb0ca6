//! Décodage et normalisation par crête
//!
//! Le fichier est décodé en entier une seule fois : le même passage sert
//! à mesurer la crête (gain de normalisation appliqué en pré-fader) et à
//! produire le buffer stéréo entrelacé joué par la voix. Un éventuel
//! ré-échantillonnage vers la fréquence du graphe se fait ici, par
//! interpolation linéaire, jamais dans le chemin de rendu.

use crate::AudioError;
use std::fs::File;
use std::path::Path;
use tracing::debug;

/// Résultat d'un décodage complet.
pub struct DecodedAudio {
    /// Échantillons stéréo entrelacés, à la fréquence du graphe.
    pub samples: Vec<f32>,
    /// Crête absolue mesurée avant normalisation.
    pub peak: f32,
    /// Gain de normalisation (pré-fader).
    pub gain: f32,
    /// Fréquence d'échantillonnage du fichier source.
    pub source_rate: u32,
}

impl DecodedAudio {
    pub fn frames(&self) -> u64 {
        (self.samples.len() / 2) as u64
    }
}

/// Calculateur de normalisation d'une voix.
///
/// `adjusted_volume` et `player_volume` sont inverses l'un de l'autre :
/// composer les deux redonne l'identité.
#[derive(Debug, Clone, Copy)]
pub struct NormalizationCalculator {
    gain: f32,
}

impl NormalizationCalculator {
    /// Gain depuis une crête mesurée : `1 / max(|sample|)`.
    ///
    /// Une crête nulle (fichier muet ou échec de lecture) donne un gain
    /// neutre de 1.0. Une crête déjà à 1.0 donne aussi 1.0 : la
    /// normalisation est alors un no-op, pas un saut de traitement.
    pub fn from_peak(peak: f32) -> Self {
        let gain = if peak <= f32::EPSILON { 1.0 } else { 1.0 / peak };
        Self { gain }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Volume effectif au sous-mixeur pour un volume demandé.
    pub fn adjusted_volume(&self, player: f32) -> f32 {
        player * self.gain
    }

    /// Volume demandé correspondant à un volume effectif.
    pub fn player_volume(&self, adjusted: f32) -> f32 {
        adjusted / self.gain
    }
}

/// Décode un fichier audio complet pour lecture.
///
/// Sortie : stéréo entrelacé à `target_rate`, crête et gain mesurés sur
/// l'intégralité des échantillons décodés.
pub fn decode_for_playback(path: &Path, target_rate: u32) -> Result<DecodedAudio, AudioError> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
    use symphonia::core::errors::Error as SymphoniaError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| AudioError::Decode(format!("failed to probe format: {e}")))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(AudioError::NoAudioTrack)?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AudioError::Decode(format!("failed to create decoder: {e}")))?;

    let channels = track
        .codec_params
        .channels
        .ok_or_else(|| AudioError::Decode("missing channel info".to_string()))?
        .count();

    let source_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| AudioError::Decode("missing sample rate".to_string()))?;

    let track_id = track.id;
    let mut interleaved = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(SymphoniaError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(AudioError::Decode(format!("decode error: {e}"))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let duration = decoded.capacity() as u64;
                let mut sample_buf = SampleBuffer::<f32>::new(duration, spec);
                sample_buf.copy_interleaved_ref(decoded);
                interleaved.extend_from_slice(sample_buf.samples());
            }
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(AudioError::Decode(format!("decode error: {e}"))),
        }
    }

    if interleaved.is_empty() {
        return Err(AudioError::Decode("no samples decoded".to_string()));
    }

    let peak = interleaved.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    let gain = NormalizationCalculator::from_peak(peak).gain();

    let stereo = to_stereo(&interleaved, channels);
    let samples = if source_rate == target_rate {
        stereo
    } else {
        resample_stereo(&stereo, source_rate, target_rate)
    };

    debug!(
        "decode_for_playback: {:?} {} ch @ {} Hz -> {} frames @ {} Hz (peak {:.4}, gain {:.4})",
        path.file_name().unwrap_or_default(),
        channels,
        source_rate,
        samples.len() / 2,
        target_rate,
        peak,
        gain
    );

    Ok(DecodedAudio {
        samples,
        peak,
        gain,
        source_rate,
    })
}

/// Réarrange un buffer entrelacé quelconque en stéréo.
///
/// Mono dupliqué, multicanal réduit à ses deux premiers canaux.
fn to_stereo(interleaved: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => {
            let mut out = Vec::with_capacity(interleaved.len() * 2);
            for &s in interleaved {
                out.push(s);
                out.push(s);
            }
            out
        }
        2 => interleaved.to_vec(),
        n => {
            let frames = interleaved.len() / n;
            let mut out = Vec::with_capacity(frames * 2);
            for frame in 0..frames {
                out.push(interleaved[frame * n]);
                out.push(interleaved[frame * n + 1]);
            }
            out
        }
    }
}

/// Interpolation linéaire d'un buffer stéréo entrelacé.
fn resample_stereo(stereo: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    let in_frames = stereo.len() / 2;
    if in_frames == 0 {
        return Vec::new();
    }
    let out_frames =
        ((in_frames as u64 * target_rate as u64) / source_rate as u64).max(1) as usize;
    let ratio = source_rate as f64 / target_rate as f64;

    let mut out = Vec::with_capacity(out_frames * 2);
    for i in 0..out_frames {
        let pos = i as f64 * ratio;
        let idx = pos.floor() as usize;
        let frac = (pos - idx as f64) as f32;
        let idx2 = (idx + 1).min(in_frames - 1);

        let l = stereo[idx * 2] * (1.0 - frac) + stereo[idx2 * 2] * frac;
        let r = stereo[idx * 2 + 1] * (1.0 - frac) + stereo[idx2 * 2 + 1] * frac;
        out.push(l);
        out.push(r);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Écrit un WAV PCM 16 bits minimal.
    fn write_wav(path: &Path, samples: &[i16], channels: u16, sample_rate: u32) {
        let data_len = (samples.len() * 2) as u32;
        let byte_rate = sample_rate * channels as u32 * 2;
        let block_align = channels * 2;

        let mut file = File::create(path).unwrap();
        file.write_all(b"RIFF").unwrap();
        file.write_all(&(36 + data_len).to_le_bytes()).unwrap();
        file.write_all(b"WAVE").unwrap();
        file.write_all(b"fmt ").unwrap();
        file.write_all(&16u32.to_le_bytes()).unwrap();
        file.write_all(&1u16.to_le_bytes()).unwrap(); // PCM
        file.write_all(&channels.to_le_bytes()).unwrap();
        file.write_all(&sample_rate.to_le_bytes()).unwrap();
        file.write_all(&byte_rate.to_le_bytes()).unwrap();
        file.write_all(&block_align.to_le_bytes()).unwrap();
        file.write_all(&16u16.to_le_bytes()).unwrap();
        file.write_all(b"data").unwrap();
        file.write_all(&data_len.to_le_bytes()).unwrap();
        for s in samples {
            file.write_all(&s.to_le_bytes()).unwrap();
        }
    }

    #[test]
    fn test_normalization_gain_from_peak() {
        assert_eq!(NormalizationCalculator::from_peak(0.5).gain(), 2.0);
        // Crête à 1.0 : no-op, gain neutre
        assert_eq!(NormalizationCalculator::from_peak(1.0).gain(), 1.0);
        // Silence : repli neutre
        assert_eq!(NormalizationCalculator::from_peak(0.0).gain(), 1.0);
    }

    #[test]
    fn test_adjusted_and_player_volume_are_inverse() {
        let calc = NormalizationCalculator::from_peak(0.25);
        for v in [0.0f32, 0.3, 0.7, 1.0] {
            let roundtrip = calc.adjusted_volume(calc.player_volume(v));
            assert!((roundtrip - v).abs() < 1e-6);
        }
    }

    #[test]
    fn test_decode_mono_wav_measures_peak() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");

        // Demi-amplitude : crête ~0.5, gain ~2
        let samples: Vec<i16> = (0..4800)
            .map(|i| ((i as f32 * 0.05).sin() * 16384.0) as i16)
            .collect();
        write_wav(&path, &samples, 1, 48_000);

        let decoded = decode_for_playback(&path, 48_000).unwrap();
        assert_eq!(decoded.source_rate, 48_000);
        assert_eq!(decoded.frames(), 4800);
        assert!((decoded.peak - 0.5).abs() < 0.01);
        assert!((decoded.gain - 2.0).abs() < 0.05);

        // Mono dupliqué sur les deux canaux
        assert_eq!(decoded.samples[0], decoded.samples[1]);
    }

    #[test]
    fn test_decode_resamples_to_graph_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone44.wav");

        let samples: Vec<i16> = (0..44_100)
            .map(|i| ((i as f32 * 0.01).sin() * 8192.0) as i16)
            .collect();
        write_wav(&path, &samples, 1, 44_100);

        let decoded = decode_for_playback(&path, 48_000).unwrap();
        // Une seconde de son reste une seconde après ré-échantillonnage
        let frames = decoded.frames();
        assert!((47_900..=48_100).contains(&frames), "frames = {}", frames);
    }

    #[test]
    fn test_decode_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = decode_for_playback(&dir.path().join("absent.wav"), 48_000);
        assert!(result.is_err());
    }

    #[test]
    fn test_to_stereo_downmixes_first_two_channels() {
        // 2 frames de 4 canaux
        let quad = [0.1, 0.2, 0.9, 0.9, 0.3, 0.4, 0.9, 0.9];
        let stereo = to_stereo(&quad, 4);
        assert_eq!(stereo, vec![0.1, 0.2, 0.3, 0.4]);
    }
}
