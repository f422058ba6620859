use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::audio::PcmConfig;

/// Settings for the demo session run by the `shuttle-audio` binary.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SessionConfig {
    pub tone_hz: u32,
    pub tone_amplitude: f32,
    /// Rate requested by the capture stream (the port runs at `capture.rate`)
    pub capture_rate: u32,
    pub chunk_ms: u32,
    pub echo_cancel: bool,
    pub noise_suppress: bool,
    pub auto_gain: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HalConfig {
    // 声卡
    pub card: u32,
    pub mixer_device: String,
    pub pcm_device_prefix: String,

    // 端口几何参数（每种端口固定，不随流变化）
    pub playback: PcmConfig,
    pub short_period_count: usize,
    pub long_period_count: usize,
    pub capture: PcmConfig,
    pub sco: PcmConfig,

    // 写入节奏控制
    pub min_write_sleep_us: u64,
    pub retry_backoff: bool,

    /// Full-scale value of the codec gain controls (0..1 maps onto 0..max)
    pub gain_range_max: i32,

    pub session: SessionConfig,
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("Failed to parse {} (value: {:?})", name, value))
}

impl HalConfig {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self> {
        let out_period: usize = parse_env("OUT_PERIOD_SIZE", env!("OUT_PERIOD_SIZE"))?;
        let short_count: usize = parse_env("OUT_SHORT_PERIOD_COUNT", env!("OUT_SHORT_PERIOD_COUNT"))?;
        let long_count: usize = parse_env("OUT_LONG_PERIOD_COUNT", env!("OUT_LONG_PERIOD_COUNT"))?;
        let in_period: usize = parse_env("IN_PERIOD_SIZE", env!("IN_PERIOD_SIZE"))?;
        let in_count: usize = parse_env("IN_PERIOD_COUNT", env!("IN_PERIOD_COUNT"))?;

        Ok(Self {
            card: parse_env("CARD_INDEX", env!("CARD_INDEX"))?,
            mixer_device: env!("CARD_MIXER_DEVICE").to_string(),
            pcm_device_prefix: env!("CARD_PCM_PREFIX").to_string(),

            playback: PcmConfig {
                channels: parse_env("OUT_CHANNELS", env!("OUT_CHANNELS"))?,
                rate: parse_env("OUT_RATE", env!("OUT_RATE"))?,
                period_size: out_period,
                period_count: long_count,
                start_threshold: out_period * short_count,
                stop_threshold: 0,
            },
            short_period_count: short_count,
            long_period_count: long_count,
            capture: PcmConfig {
                channels: parse_env("IN_CHANNELS", env!("IN_CHANNELS"))?,
                rate: parse_env("IN_RATE", env!("IN_RATE"))?,
                period_size: in_period,
                period_count: in_count,
                start_threshold: 1,
                stop_threshold: in_period * in_count,
            },
            sco: PcmConfig {
                channels: parse_env("SCO_CHANNELS", env!("SCO_CHANNELS"))?,
                rate: parse_env("SCO_RATE", env!("SCO_RATE"))?,
                period_size: parse_env("SCO_PERIOD_SIZE", env!("SCO_PERIOD_SIZE"))?,
                period_count: parse_env("SCO_PERIOD_COUNT", env!("SCO_PERIOD_COUNT"))?,
                start_threshold: 0,
                stop_threshold: 0,
            },

            min_write_sleep_us: parse_env("MIN_WRITE_SLEEP_US", env!("MIN_WRITE_SLEEP_US"))?,
            retry_backoff: parse_env("RETRY_BACKOFF", env!("RETRY_BACKOFF"))?,
            gain_range_max: parse_env("GAIN_RANGE_MAX", env!("GAIN_RANGE_MAX"))?,

            session: SessionConfig {
                tone_hz: parse_env("SESSION_TONE_HZ", env!("SESSION_TONE_HZ"))?,
                tone_amplitude: parse_env("SESSION_TONE_AMPLITUDE", env!("SESSION_TONE_AMPLITUDE"))?,
                capture_rate: parse_env("SESSION_CAPTURE_RATE", env!("SESSION_CAPTURE_RATE"))?,
                chunk_ms: parse_env("SESSION_CHUNK_MS", env!("SESSION_CHUNK_MS"))?,
                echo_cancel: parse_env("SESSION_ECHO_CANCEL", env!("SESSION_ECHO_CANCEL"))?,
                noise_suppress: parse_env("SESSION_NOISE_SUPPRESS", env!("SESSION_NOISE_SUPPRESS"))?,
                auto_gain: parse_env("SESSION_AUTO_GAIN", env!("SESSION_AUTO_GAIN"))?,
            },
        })
    }

    /// Layer an optional TOML file and `SHUTTLE__*` environment variables
    /// over the build-time defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Self::new()?;
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&defaults).context("Failed to seed configuration defaults")?,
        );
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix("SHUTTLE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Sleep cap of the playback pace controller, in microseconds.
    pub fn max_write_sleep_us(&self) -> u64 {
        (self.playback.period_size * self.short_period_count) as u64 * 1_000_000
            / self.playback.rate as u64
    }
}

impl Default for HalConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create default HalConfig from build-time environment variables")
    }
}
