//! Session runner: a playback thread writing a test tone and a capture
//! thread reporting processed input levels.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O; level reports
//! reach async code through a tokio channel.

use std::f32::consts::TAU;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use super::device::{AudioDevice, StreamConfig};
use super::preprocess::EffectHandle;
use super::stream::{AudioStream, CaptureEndpoint, PlaybackEndpoint};
use crate::config::SessionConfig;

/// What a session plays and how it captures.
#[derive(Clone)]
pub struct SessionOptions {
    pub tone_hz: u32,
    /// 0.0 ..= 1.0 of full scale
    pub tone_amplitude: f32,
    /// Rate requested by the capture stream
    pub capture_rate: u32,
    /// Application buffer length on both streams
    pub chunk_ms: u32,
    /// Attached to the capture stream in order
    pub preprocessors: Vec<EffectHandle>,
}

impl SessionOptions {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            tone_hz: config.tone_hz,
            tone_amplitude: config.tone_amplitude,
            capture_rate: config.capture_rate,
            chunk_ms: config.chunk_ms,
            preprocessors: Vec::new(),
        }
    }
}

/// Level of one processed capture buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelReport {
    pub frames: usize,
    pub rms: f32,
    pub peak: i16,
}

impl LevelReport {
    pub fn measure(samples: &[i16]) -> Self {
        let peak = samples
            .iter()
            .map(|s| s.saturating_abs())
            .max()
            .unwrap_or(0);
        let energy: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        let rms = if samples.is_empty() {
            0.0
        } else {
            (energy / samples.len() as f64).sqrt() as f32
        };
        Self {
            frames: samples.len(),
            rms,
            peak,
        }
    }
}

/// Playback and capture running in dedicated OS threads.
///
/// - Playback thread: sine generator → `OutputStream::write`
/// - Capture thread: `InputStream::read` → level → `level_tx`
pub struct AudioSystem {
    running: Arc<AtomicBool>,
    record_handle: Option<JoinHandle<()>>,
    play_handle: Option<JoinHandle<()>>,
}

impl AudioSystem {
    pub fn start(
        device: Arc<AudioDevice>,
        options: SessionOptions,
        level_tx: mpsc::Sender<LevelReport>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));

        log::info!(
            "AudioSystem starting: tone {} Hz, capture {} Hz, chunk {} ms, {} preprocessors",
            options.tone_hz,
            options.capture_rate,
            options.chunk_ms,
            options.preprocessors.len(),
        );

        let play_handle = {
            let running = running.clone();
            let device = device.clone();
            let options = options.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    if let Err(e) = play_thread(&device, &options, &running) {
                        log::error!("Playback thread error: {:#}", e);
                    }
                })
                .context("Failed to spawn playback thread")?
        };

        let record_handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-record".into())
                .spawn(move || {
                    if let Err(e) = record_thread(&device, &options, level_tx, &running) {
                        log::error!("Recording thread error: {:#}", e);
                    }
                })
                .context("Failed to spawn recording thread")?
        };

        Ok(Self {
            running,
            record_handle: Some(record_handle),
            play_handle: Some(play_handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal threads to stop and wait for them to finish.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.play_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.record_handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for AudioSystem {
    fn drop(&mut self) {
        self.stop();
    }
}

// ======================== Playback thread ========================

fn play_thread(device: &AudioDevice, options: &SessionOptions, running: &AtomicBool) -> Result<()> {
    let mut config = StreamConfig::default();
    let stream = device
        .open_output_stream(&mut config)
        .context("Failed to open output stream")?;

    let channels = config.channels as usize;
    let frames = (config.sample_rate * options.chunk_ms / 1000).max(1) as usize;
    let mut buf = vec![0i16; frames * channels];
    let step = TAU * options.tone_hz as f32 / config.sample_rate as f32;
    let amplitude = options.tone_amplitude.clamp(0.0, 1.0) * i16::MAX as f32;
    let mut phase = 0.0f32;

    log::info!(
        "Playback started: rate={}, ch={}, chunk={} frames, latency={} ms",
        config.sample_rate,
        channels,
        frames,
        stream.latency_ms(),
    );

    while running.load(Ordering::Relaxed) {
        for frame in buf.chunks_exact_mut(channels) {
            frame.fill((phase.sin() * amplitude) as i16);
            phase = (phase + step) % TAU;
        }
        stream.write(&buf).context("Playback write failed")?;
    }

    device.close_output_stream(stream);
    log::info!("Playback stopped");
    Ok(())
}

// ======================== Recording thread ========================

fn record_thread(
    device: &AudioDevice,
    options: &SessionOptions,
    level_tx: mpsc::Sender<LevelReport>,
    running: &AtomicBool,
) -> Result<()> {
    let mut config = StreamConfig {
        sample_rate: options.capture_rate,
        channels: 1,
    };
    let stream = device
        .open_input_stream(&mut config)
        .context("Failed to open input stream")?;

    for effect in &options.preprocessors {
        stream
            .add_preprocessor(effect.clone())
            .context("Failed to attach preprocessor")?;
    }

    let frames = (config.sample_rate * options.chunk_ms / 1000).max(1) as usize;
    let mut buf = vec![0i16; frames * config.channels as usize];

    log::info!(
        "Recording started: rate={}, ch={}, chunk={} frames, buffer_size={} bytes",
        config.sample_rate,
        config.channels,
        frames,
        stream.buffer_size(),
    );

    while running.load(Ordering::Relaxed) {
        stream.read(&mut buf).context("Capture read failed")?;
        if level_tx.blocking_send(LevelReport::measure(&buf)).is_err() {
            log::warn!("Level receiver dropped, stopping capture");
            break;
        }
    }

    for effect in &options.preprocessors {
        if let Err(e) = stream.remove_preprocessor(effect) {
            log::warn!("Failed to detach preprocessor: {}", e);
        }
    }
    device.close_input_stream(stream);
    log::info!("Recording stopped");
    Ok(())
}
