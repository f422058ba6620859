use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::mpsc;

use shuttle_audio_rs::audio::{
    AlsaDriver, AlsaMixer, AudioDevice, AudioSystem, Backend, EffectHandle, LevelReport,
    SessionOptions, SpeexConverterFactory, SpeexEchoCanceller, SpeexPreprocessor,
};
use shuttle_audio_rs::config::HalConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置：编译时默认值 + 可选文件 + SHUTTLE__* 环境变量
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = HalConfig::load(config_path.as_deref())?;

    log::info!(
        "{} {} starting on card {}",
        env!("APP_NAME"),
        env!("APP_VERSION"),
        config.card
    );

    let mixer = AlsaMixer::open(&config.mixer_device).context("Failed to open mixer")?;
    let backend = Backend::new(
        Arc::new(AlsaDriver::new(config.pcm_device_prefix.clone())),
        Box::new(mixer),
        Arc::new(SpeexConverterFactory),
    );

    let session = config.session.clone();
    let device = Arc::new(AudioDevice::open(config, backend).context("Failed to open audio device")?);

    // 预处理器按帧处理，帧长与应用缓冲一致
    let frame_size = (session.capture_rate * session.chunk_ms / 1000) as usize;
    let mut options = SessionOptions::from_config(&session);
    if session.echo_cancel {
        let aec: EffectHandle = Arc::new(Mutex::new(SpeexEchoCanceller::new(
            frame_size,
            session.capture_rate,
        )?));
        options.preprocessors.push(aec);
    }
    if session.noise_suppress {
        let ns: EffectHandle = Arc::new(Mutex::new(SpeexPreprocessor::noise_suppressor(
            frame_size,
            session.capture_rate,
        )?));
        options.preprocessors.push(ns);
    }
    if session.auto_gain {
        let agc: EffectHandle = Arc::new(Mutex::new(SpeexPreprocessor::agc(
            frame_size,
            session.capture_rate,
        )?));
        options.preprocessors.push(agc);
    }

    // 电平上报通道
    let (tx_level, mut rx_level) = mpsc::channel::<LevelReport>(100);
    let mut audio = AudioSystem::start(device.clone(), options, tx_level)?;

    let mut reports: u64 = 0;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Ctrl+C received, shutting down");
                break;
            }
            report = rx_level.recv() => {
                let Some(report) = report else {
                    log::warn!("Audio threads exited");
                    break;
                };
                reports += 1;
                // 每秒左右打印一次
                if reports % 50 == 0 {
                    log::info!(
                        "capture level: rms={:.1} peak={} ({} frames)",
                        report.rms,
                        report.peak,
                        report.frames
                    );
                }
            }
        }
    }

    // 先关闭接收端，录音线程的 blocking_send 才不会阻塞
    drop(rx_level);
    tokio::task::spawn_blocking(move || audio.stop())
        .await
        .context("Failed to stop audio system")?;
    log::info!("Audio session stopped");
    Ok(())
}
