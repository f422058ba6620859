use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    card: Card,
    playback: Playback,
    capture: Port,
    sco: Port,
    pacing: Pacing,
    mixer: Mixer,
    session: Session,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Card {
    index: u32,
    mixer_device: String,
    pcm_device_prefix: String,
}

#[derive(Deserialize)]
struct Playback {
    channels: u32,
    rate: u32,
    period_size: usize,
    short_period_count: usize,
    long_period_count: usize,
}

#[derive(Deserialize)]
struct Port {
    channels: u32,
    rate: u32,
    period_size: usize,
    period_count: usize,
}

#[derive(Deserialize)]
struct Pacing {
    min_write_sleep_us: u64,
    retry_backoff: bool,
}

#[derive(Deserialize)]
struct Mixer {
    gain_range_max: i32,
}

#[derive(Deserialize)]
struct Session {
    tone_hz: u32,
    tone_amplitude: f32,
    capture_rate: u32,
    chunk_ms: u32,
    echo_cancel: bool,
    noise_suppress: bool,
    auto_gain: bool,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    println!("cargo:rustc-env=CARD_INDEX={}", config.card.index);
    println!("cargo:rustc-env=CARD_MIXER_DEVICE={}", config.card.mixer_device);
    println!("cargo:rustc-env=CARD_PCM_PREFIX={}", config.card.pcm_device_prefix);

    println!("cargo:rustc-env=OUT_CHANNELS={}", config.playback.channels);
    println!("cargo:rustc-env=OUT_RATE={}", config.playback.rate);
    println!("cargo:rustc-env=OUT_PERIOD_SIZE={}", config.playback.period_size);
    println!("cargo:rustc-env=OUT_SHORT_PERIOD_COUNT={}", config.playback.short_period_count);
    println!("cargo:rustc-env=OUT_LONG_PERIOD_COUNT={}", config.playback.long_period_count);

    println!("cargo:rustc-env=IN_CHANNELS={}", config.capture.channels);
    println!("cargo:rustc-env=IN_RATE={}", config.capture.rate);
    println!("cargo:rustc-env=IN_PERIOD_SIZE={}", config.capture.period_size);
    println!("cargo:rustc-env=IN_PERIOD_COUNT={}", config.capture.period_count);

    println!("cargo:rustc-env=SCO_CHANNELS={}", config.sco.channels);
    println!("cargo:rustc-env=SCO_RATE={}", config.sco.rate);
    println!("cargo:rustc-env=SCO_PERIOD_SIZE={}", config.sco.period_size);
    println!("cargo:rustc-env=SCO_PERIOD_COUNT={}", config.sco.period_count);

    println!("cargo:rustc-env=MIN_WRITE_SLEEP_US={}", config.pacing.min_write_sleep_us);
    println!("cargo:rustc-env=RETRY_BACKOFF={}", config.pacing.retry_backoff);
    println!("cargo:rustc-env=GAIN_RANGE_MAX={}", config.mixer.gain_range_max);

    println!("cargo:rustc-env=SESSION_TONE_HZ={}", config.session.tone_hz);
    println!("cargo:rustc-env=SESSION_TONE_AMPLITUDE={}", config.session.tone_amplitude);
    println!("cargo:rustc-env=SESSION_CAPTURE_RATE={}", config.session.capture_rate);
    println!("cargo:rustc-env=SESSION_CHUNK_MS={}", config.session.chunk_ms);
    println!("cargo:rustc-env=SESSION_ECHO_CANCEL={}", config.session.echo_cancel);
    println!("cargo:rustc-env=SESSION_NOISE_SUPPRESS={}", config.session.noise_suppress);
    println!("cargo:rustc-env=SESSION_AUTO_GAIN={}", config.session.auto_gain);

    if std::env::var("CARGO_FEATURE_SPEEX").is_ok() {
        link_speexdsp();
    }
}

fn link_speexdsp() {
    let target = std::env::var("TARGET").unwrap_or_default();

    if target.contains("musl") {
        // musl 目标：使用手动编译的静态库，不依赖 pkg-config
        if let Ok(sysroot) = std::env::var("MUSL_SYSROOT") {
            println!("cargo:rustc-link-search=native={}/usr/lib", sysroot);
        }
        println!("cargo:rustc-link-lib=static=speexdsp");
        return;
    }

    pkg_config::Config::new()
        .probe("speexdsp")
        .expect("Failed to find speexdsp. Please install libspeexdsp-dev.");
}
