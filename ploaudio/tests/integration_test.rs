//! Tests d'intégration du graphe audio : décodage réel, armement,
//! capture de départ et automation, en pompant le mixeur à la main pour
//! rester déterministe.

use chrono::{DateTime, Duration, TimeZone, Utc};
use ploapi::{AudioBlock, BlockKind, Fade, Spin};
use ploaudio::{AudioGraph, NullSink, SpinVoice, VoiceEvent, VoiceState};
use ploutils::{ManualTimeSource, TimeSource};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

const RATE: u32 = 48_000;

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
    file.write_all(&1u16.to_le_bytes()).unwrap();
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

/// Deux secondes de signal constant à mi-amplitude.
fn write_test_tone(path: &Path) {
    write_tone_seconds(path, 2);
}

fn write_tone_seconds(path: &Path, seconds: u32) {
    let samples = vec![16384i16; (RATE * seconds) as usize];
    write_wav(path, &samples, 1, RATE);
}

fn spin(id: &str, airtime: DateTime<Utc>, end_of_message_ms: i64, fades: Vec<Fade>) -> Spin {
    Spin {
        id: id.to_string(),
        station_id: "station-1".to_string(),
        airtime,
        starting_volume: 1.0,
        audio_block: AudioBlock {
            id: format!("block-{}", id),
            title: "Tone".to_string(),
            artist: "Test".to_string(),
            album: None,
            kind: BlockKind::Song,
            duration_ms: 2_000,
            end_of_message_ms,
            beginning_of_outro_ms: 0,
            end_of_intro_ms: 0,
            length_of_outro_ms: 0,
            download_url: format!("https://cdn.example.com/{}.wav", id),
            image_url: None,
        },
        fades,
        created_at: None,
        updated_at: None,
        related_texts: Vec::new(),
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

/// Pompe `frames` frames à travers le mixeur, par paquets de 480.
fn pump(graph: &AudioGraph, frames: usize) -> Vec<f32> {
    let mut rendered = Vec::new();
    let mut remaining = frames;
    let mut chunk = vec![0.0f32; 480 * 2];
    while remaining > 0 {
        let n = remaining.min(480);
        chunk.resize(n * 2, 0.0);
        graph.mixer().render(&mut chunk);
        rendered.extend_from_slice(&chunk);
        remaining -= n;
    }
    rendered
}

#[tokio::test]
async fn test_scheduled_voice_starts_at_its_airtime() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("tone.wav");
    write_test_tone(&wav);

    let time = Arc::new(ManualTimeSource::new(t0()));
    let (graph, mut events) = AudioGraph::new(Box::new(NullSink::new(RATE)), time.clone());

    // Spin dans une seconde
    let spin = spin("a", t0() + Duration::seconds(1), 2_000, Vec::new());
    let mut voice = SpinVoice::new(spin, None);
    voice.load(wav, RATE).await.unwrap();
    assert_eq!(voice.state(), VoiceState::Loaded);

    graph.attach(&voice);
    let events_tx = graph.events_sender();
    voice.arm(&graph, time.now(), Duration::zero(), &events_tx);

    // La première demi-seconde est silencieuse
    let out = pump(&graph, (RATE / 2) as usize);
    assert!(out.iter().all(|&s| s == 0.0));
    assert!(events.try_recv().is_err());

    // À une seconde, la voix démarre
    let out = pump(&graph, RATE as usize);
    assert!(out.iter().any(|&s| s != 0.0));
    let event = events.try_recv().unwrap();
    match event {
        VoiceEvent::Started { spin } => assert_eq!(spin.id, "a"),
        other => panic!("expected Started, got {:?}", other),
    }
}

#[tokio::test]
async fn test_join_mid_spin_plays_from_offset() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("tone.wav");
    write_test_tone(&wav);

    let time = Arc::new(ManualTimeSource::new(t0()));
    let (graph, mut events) = AudioGraph::new(Box::new(NullSink::new(RATE)), time.clone());

    // Le spin a démarré il y a 1.5 s, il en reste 0.5
    let spin = spin("a", t0() - Duration::milliseconds(1_500), 2_000, Vec::new());
    let mut voice = SpinVoice::new(spin, None);
    voice.load(wav, RATE).await.unwrap();

    graph.attach(&voice);
    let events_tx = graph.events_sender();
    voice.arm(&graph, time.now(), Duration::zero(), &events_tx);

    // Lecture quasi immédiate (epsilon de 10 ms), volume plein
    let out = pump(&graph, (RATE / 10) as usize);
    assert!(out.iter().any(|&s| s != 0.0));
    assert!(matches!(
        events.try_recv().unwrap(),
        VoiceEvent::Started { .. }
    ));

    // Il ne reste qu'une demi-seconde de fichier : la voix s'épuise
    pump(&graph, RATE as usize);
    let mut saw_finished = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, VoiceEvent::Finished { ref spin_id } if spin_id == "a") {
            saw_finished = true;
        }
    }
    assert!(saw_finished);
}

#[tokio::test]
async fn test_fade_ramps_down_the_voice() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("tone.wav");
    write_tone_seconds(&wav, 3);

    let time = Arc::new(ManualTimeSource::new(t0()));
    let (graph, _events) = AudioGraph::new(Box::new(NullSink::new(RATE)), time.clone());

    // Fade vers 0.1 à 400 ms : la rampe de 1.5 s se termine à 2.0 s
    let spin = spin(
        "a",
        t0() + Duration::milliseconds(100),
        2_000,
        vec![Fade {
            at_ms: 400,
            to_volume: 0.1,
        }],
    );
    let mut voice = SpinVoice::new(spin, None);
    voice.load(wav, RATE).await.unwrap();

    graph.attach(&voice);
    let events_tx = graph.events_sender();
    voice.arm(&graph, time.now(), Duration::zero(), &events_tx);

    // 3 s de rendu : départ +0.1 s, fade +0.5 s, rampe finie +2.0 s
    let out = pump(&graph, 3 * RATE as usize);

    let frame_at = |seconds: f64| out[(seconds * RATE as f64) as usize * 2].abs();

    let before_fade = frame_at(0.4);
    let after_fade = frame_at(2.3);
    assert!(before_fade > 0.2, "before fade: {}", before_fade);
    // Cible 0.1 sur un signal normalisé à 1.0
    assert!(
        (after_fade - 0.1).abs() < 0.02,
        "after fade: {}",
        after_fade
    );
}

#[tokio::test(start_paused = true)]
async fn test_clear_timer_fires_after_grace() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("tone.wav");
    write_test_tone(&wav);

    let time = Arc::new(ManualTimeSource::new(t0()));
    let (graph, mut events) = AudioGraph::new(Box::new(NullSink::new(RATE)), time.clone());

    let spin = spin("a", t0(), 2_000, Vec::new());
    let mut voice = SpinVoice::new(spin, None);
    voice.load(wav.clone(), RATE).await.unwrap();

    graph.attach(&voice);
    let events_tx = graph.events_sender();
    voice.arm(&graph, time.now(), Duration::zero(), &events_tx);

    // endtime + 1 s de grâce : le timer envoie Cleared
    tokio::time::sleep(std::time::Duration::from_millis(3_100)).await;

    let mut saw_cleared = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, VoiceEvent::Cleared { ref spin_id } if spin_id == "a") {
            saw_cleared = true;
        }
    }
    assert!(saw_cleared);
}

#[tokio::test]
async fn test_normalization_applies_pre_fader() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("quiet.wav");
    // Quart d'amplitude : gain de normalisation x4
    let samples = vec![8192i16; RATE as usize];
    write_wav(&wav, &samples, 1, RATE);

    let time = Arc::new(ManualTimeSource::new(t0()));
    let (graph, _events) = AudioGraph::new(Box::new(NullSink::new(RATE)), time.clone());

    let spin = spin("a", t0() + Duration::milliseconds(100), 1_000, Vec::new());
    let mut voice = SpinVoice::new(spin, None);
    voice.load(wav, RATE).await.unwrap();

    let gain = voice.calculator().gain();
    assert!((gain - 4.0).abs() < 0.05, "gain = {}", gain);

    graph.attach(&voice);
    let events_tx = graph.events_sender();
    voice.arm(&graph, time.now(), Duration::zero(), &events_tx);

    let out = pump(&graph, RATE as usize);
    // Le signal sort normalisé autour de la pleine amplitude
    let peak = out.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    assert!(peak > 0.95, "peak = {}", peak);
}
