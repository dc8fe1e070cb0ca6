//! Puits audio : sortie périphérique (cpal) ou sortie nulle
//!
//! Le puits tire les frames du mixeur depuis son propre thread. Le
//! `Stream` cpal n'étant pas `Send`, il vit entièrement dans le thread
//! dédié ; l'arrêt passe par un channel std.

use crate::error::AudioError;
use crate::mixer::Mixer;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Sortie du graphe audio.
pub trait AudioSink: Send {
    /// Fréquence d'échantillonnage de la sortie.
    fn sample_rate(&self) -> u32;

    /// Démarre le rendu : le puits tire désormais du mixeur.
    fn start(&mut self, mixer: Arc<Mixer>) -> Result<(), AudioError>;

    /// Arrête le rendu. Idempotent.
    fn stop(&mut self);
}

/// Puits branché sur le périphérique de sortie par défaut.
pub struct CpalSink {
    sample_rate: u32,
    channels: u16,
    sample_format: cpal::SampleFormat,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalSink {
    /// Interroge le périphérique par défaut et mémorise sa configuration.
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;
        let config = device
            .default_output_config()
            .map_err(|e| AudioError::EngineStart(format!("failed to get output config: {e}")))?;

        debug!(
            "CpalSink: {} ch, {} Hz, {:?}",
            config.channels(),
            config.sample_rate().0,
            config.sample_format()
        );

        Ok(Self {
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
            sample_format: config.sample_format(),
            stop_tx: None,
            thread: None,
        })
    }
}

impl AudioSink for CpalSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, mixer: Arc<Mixer>) -> Result<(), AudioError> {
        if self.stop_tx.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();
        let channels = self.channels as usize;
        let sample_format = self.sample_format;

        // Le Stream cpal n'est pas Send : il naît et meurt dans ce thread.
        let handle = thread::spawn(move || {
            let host = cpal::default_host();
            let Some(device) = host.default_output_device() else {
                let _ = ready_tx.send(Err(AudioError::NoOutputDevice));
                return;
            };
            let config = match device.default_output_config() {
                Ok(c) => c,
                Err(e) => {
                    let _ = ready_tx.send(Err(AudioError::EngineStart(e.to_string())));
                    return;
                }
            };

            let mut scratch: Vec<f32> = Vec::new();
            let stream = match sample_format {
                cpal::SampleFormat::F32 => device.build_output_stream(
                    &config.into(),
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let frames = data.len() / channels;
                        render_stereo(&mixer, &mut scratch, frames);
                        for (i, frame) in data.chunks_mut(channels).enumerate() {
                            write_frame_f32(frame, scratch[i * 2], scratch[i * 2 + 1]);
                        }
                    },
                    |err| error!("CpalSink: stream error: {}", err),
                    None,
                ),
                cpal::SampleFormat::I16 => device.build_output_stream(
                    &config.into(),
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        let frames = data.len() / channels;
                        render_stereo(&mixer, &mut scratch, frames);
                        for (i, frame) in data.chunks_mut(channels).enumerate() {
                            let l = (scratch[i * 2] * 32767.0).clamp(-32768.0, 32767.0) as i16;
                            let r =
                                (scratch[i * 2 + 1] * 32767.0).clamp(-32768.0, 32767.0) as i16;
                            write_frame_i16(frame, l, r);
                        }
                    },
                    |err| error!("CpalSink: stream error: {}", err),
                    None,
                ),
                cpal::SampleFormat::U16 => device.build_output_stream(
                    &config.into(),
                    move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                        let frames = data.len() / channels;
                        render_stereo(&mixer, &mut scratch, frames);
                        for (i, frame) in data.chunks_mut(channels).enumerate() {
                            let l =
                                ((scratch[i * 2] + 1.0) * 32767.5).clamp(0.0, 65535.0) as u16;
                            let r = ((scratch[i * 2 + 1] + 1.0) * 32767.5).clamp(0.0, 65535.0)
                                as u16;
                            write_frame_u16(frame, l, r);
                        }
                    },
                    |err| error!("CpalSink: stream error: {}", err),
                    None,
                ),
                other => {
                    let _ = ready_tx.send(Err(AudioError::UnsupportedFormat(format!(
                        "{:?}",
                        other
                    ))));
                    return;
                }
            };

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(AudioError::EngineStart(e.to_string())));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(AudioError::EngineStart(e.to_string())));
                return;
            }

            let _ = ready_tx.send(Ok(()));
            debug!("CpalSink: stream thread running");

            // Le stream se ferme quand il est droppé, à la réception de
            // l'ordre d'arrêt (ou à la fermeture du channel).
            let _ = stop_rx.recv();
            debug!("CpalSink: stream thread exiting");
        });

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {
                self.stop_tx = Some(stop_tx);
                self.thread = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(AudioError::EngineStart(
                "audio thread did not come up".to_string(),
            )),
        }
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn render_stereo(mixer: &Mixer, scratch: &mut Vec<f32>, frames: usize) {
    scratch.resize(frames * 2, 0.0);
    mixer.render(scratch);
}

fn write_frame_f32(frame: &mut [f32], l: f32, r: f32) {
    match frame.len() {
        0 => {}
        1 => frame[0] = (l + r) * 0.5,
        _ => {
            frame[0] = l;
            frame[1] = r;
            for extra in &mut frame[2..] {
                *extra = 0.0;
            }
        }
    }
}

fn write_frame_i16(frame: &mut [i16], l: i16, r: i16) {
    match frame.len() {
        0 => {}
        1 => frame[0] = ((l as i32 + r as i32) / 2) as i16,
        _ => {
            frame[0] = l;
            frame[1] = r;
            for extra in &mut frame[2..] {
                *extra = 0;
            }
        }
    }
}

fn write_frame_u16(frame: &mut [u16], l: u16, r: u16) {
    match frame.len() {
        0 => {}
        1 => frame[0] = ((l as u32 + r as u32) / 2) as u16,
        _ => {
            frame[0] = l;
            frame[1] = r;
            for extra in &mut frame[2..] {
                *extra = 32768;
            }
        }
    }
}

/// Puits sans périphérique : consomme le mixeur au rythme réel.
///
/// Utilisé par les hôtes sans sortie audio et par les tests. Le rendu
/// est cadencé par tranches de 10 ms pour que l'horloge audio avance
/// comme avec un vrai périphérique.
pub struct NullSink {
    sample_rate: u32,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl NullSink {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            stop_tx: None,
            thread: None,
        }
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new(48_000)
    }
}

impl AudioSink for NullSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, mixer: Arc<Mixer>) -> Result<(), AudioError> {
        if self.stop_tx.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let chunk_frames = (self.sample_rate / 100).max(1) as usize;
        let chunk_duration = Duration::from_millis(10);

        let handle = thread::spawn(move || {
            let mut scratch = vec![0.0f32; chunk_frames * 2];
            let mut next_deadline = Instant::now();
            loop {
                match stop_rx.try_recv() {
                    Ok(()) | Err(std_mpsc::TryRecvError::Disconnected) => break,
                    Err(std_mpsc::TryRecvError::Empty) => {}
                }
                mixer.render(&mut scratch);
                next_deadline += chunk_duration;
                let now = Instant::now();
                if next_deadline > now {
                    thread::sleep(next_deadline - now);
                } else {
                    // En retard : on repart d'ici plutôt que de rattraper
                    next_deadline = now;
                }
            }
            debug!("NullSink: render thread exiting");
        });

        self.stop_tx = Some(stop_tx);
        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NullSink {
    fn drop(&mut self) {
        self.stop();
    }
}
