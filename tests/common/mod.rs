//! Mock collaborators shared by the endpoint and device tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shuttle_audio_rs::audio::{
    AudioDevice, AudioEffect, Backend, BufferDepth, ConverterFactory, EFFECT_TYPE_AEC,
    EFFECT_TYPE_NS, EffectDescriptor, EffectParam, HalError, HalResult, Mixer, MixerCtl,
    PcmConfig, PcmDirection, PcmDriver, PcmPort, PortId, RateConverter, Sleeper, default_route,
};
use shuttle_audio_rs::config::HalConfig;

// ======================== PCM driver ========================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenRecord {
    pub port: PortId,
    pub direction: PcmDirection,
    pub config: PcmConfig,
}

#[derive(Debug)]
pub struct DriverState {
    pub opens: Vec<OpenRecord>,
    pub fail_open: bool,
    /// Writes left to fail with `Underrun`
    pub underruns: usize,
    pub fail_io: bool,
    pub frames_written: usize,
    pub last_write: Vec<i16>,
    pub frames_read: usize,
    /// Sample value handed out by capture reads
    pub capture_value: i16,
    /// Hand out the running frame index instead of `capture_value`
    pub capture_ramp: bool,
    /// Playback free space reported by `buffer_depth`; `None` = empty buffer
    pub avail: Option<usize>,
    pub timestamps: bool,
    pub clock: Duration,
}

impl Default for DriverState {
    fn default() -> Self {
        Self {
            opens: Vec::new(),
            fail_open: false,
            underruns: 0,
            fail_io: false,
            frames_written: 0,
            last_write: Vec::new(),
            frames_read: 0,
            capture_value: 1000,
            capture_ramp: false,
            avail: None,
            timestamps: true,
            clock: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Default)]
pub struct MockDriver {
    pub state: Arc<Mutex<DriverState>>,
}

impl MockDriver {
    pub fn with<R>(&self, f: impl FnOnce(&mut DriverState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn opens(&self) -> Vec<OpenRecord> {
        self.with(|s| s.opens.clone())
    }
}

impl PcmDriver for MockDriver {
    fn open(
        &self,
        _card: u32,
        port: PortId,
        direction: PcmDirection,
        config: &PcmConfig,
    ) -> HalResult<Box<dyn PcmPort>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_open {
            return Err(HalError::PortOpenFailed {
                port,
                reason: "mock".into(),
            });
        }
        state.opens.push(OpenRecord {
            port,
            direction,
            config: *config,
        });
        Ok(Box::new(MockPort {
            config: *config,
            state: self.state.clone(),
        }))
    }
}

pub struct MockPort {
    config: PcmConfig,
    state: Arc<Mutex<DriverState>>,
}

impl PcmPort for MockPort {
    fn config(&self) -> &PcmConfig {
        &self.config
    }

    fn read(&mut self, buf: &mut [i16]) -> HalResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_io {
            return Err(HalError::Io("mock read".into()));
        }
        let channels = self.config.channels as usize;
        if state.capture_ramp {
            let first = state.frames_read;
            for (i, frame) in buf.chunks_exact_mut(channels).enumerate() {
                frame.fill((first + i) as i16);
            }
        } else {
            buf.fill(state.capture_value);
        }
        let frames = buf.len() / channels;
        state.frames_read += frames;
        state.clock += Duration::from_nanos(frames as u64 * 1_000_000_000 / self.config.rate as u64);
        Ok(())
    }

    fn write(&mut self, buf: &[i16]) -> HalResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.underruns > 0 {
            state.underruns -= 1;
            return Err(HalError::Underrun);
        }
        if state.fail_io {
            return Err(HalError::Io("mock write".into()));
        }
        state.frames_written += buf.len() / self.config.channels as usize;
        state.last_write = buf.to_vec();
        Ok(())
    }

    fn buffer_depth(&mut self) -> HalResult<BufferDepth> {
        let state = self.state.lock().unwrap();
        if !state.timestamps {
            return Err(HalError::HardwareTimestampUnavailable);
        }
        Ok(BufferDepth {
            avail: state.avail.unwrap_or(self.config.buffer_frames()),
            timestamp: state.clock,
        })
    }

    fn capacity(&self) -> usize {
        self.config.buffer_frames()
    }
}

// ======================== Mixer ========================

#[derive(Default)]
pub struct MixerLog {
    pub names: Vec<String>,
    pub values: HashMap<String, Vec<i32>>,
    pub writes: usize,
}

/// Codec with every control the default route names, two values each.
#[derive(Clone)]
pub struct MockMixer {
    pub log: Arc<Mutex<MixerLog>>,
}

impl MockMixer {
    pub fn new() -> Self {
        let mut log = MixerLog::default();
        for setting in default_route(31) {
            log.names.push(setting.ctl_name.to_string());
            log.values.insert(setting.ctl_name.to_string(), vec![0, 0]);
        }
        Self {
            log: Arc::new(Mutex::new(log)),
        }
    }

    pub fn value(&self, name: &str) -> Vec<i32> {
        self.log.lock().unwrap().values[name].clone()
    }

    pub fn writes(&self) -> usize {
        self.log.lock().unwrap().writes
    }
}

impl Mixer for MockMixer {
    fn find(&self, name: &str) -> Option<MixerCtl> {
        self.log
            .lock()
            .unwrap()
            .names
            .iter()
            .position(|n| n == name)
            .map(MixerCtl)
    }

    fn num_values(&self, _ctl: MixerCtl) -> usize {
        2
    }

    fn set_value(&mut self, ctl: MixerCtl, index: usize, value: i32) -> HalResult<()> {
        let mut log = self.log.lock().unwrap();
        let name = log.names[ctl.0].clone();
        log.values.get_mut(&name).unwrap()[index] = value;
        log.writes += 1;
        Ok(())
    }

    fn set_enum(&mut self, _ctl: MixerCtl, _item: &str) -> HalResult<()> {
        Ok(())
    }
}

// ======================== Rate converter ========================

/// Nearest-neighbour converter; enough to check frame accounting.
pub struct NearestConverter {
    channels: u32,
    in_rate: u32,
    out_rate: u32,
}

impl RateConverter for NearestConverter {
    fn channels(&self) -> u32 {
        self.channels
    }

    fn rates(&self) -> (u32, u32) {
        (self.in_rate, self.out_rate)
    }

    fn convert(
        &mut self,
        input: &[i16],
        in_frames: &mut usize,
        output: &mut [i16],
        out_frames: &mut usize,
    ) -> HalResult<()> {
        let ch = self.channels as usize;
        let (in_rate, out_rate) = (self.in_rate as usize, self.out_rate as usize);
        let avail = (*in_frames).min(input.len() / ch);
        let cap = (*out_frames).min(output.len() / ch);
        let possible = avail * out_rate / in_rate;
        let produced = possible.min(cap);
        for i in 0..produced {
            let src = (i * in_rate / out_rate).min(avail.saturating_sub(1));
            output[i * ch..(i + 1) * ch].copy_from_slice(&input[src * ch..(src + 1) * ch]);
        }
        let consumed = if produced < possible {
            (produced * in_rate).div_ceil(out_rate).min(avail)
        } else {
            avail
        };
        *in_frames = consumed;
        *out_frames = produced;
        Ok(())
    }

    fn delay_ns(&self) -> i64 {
        0
    }
}

#[derive(Default)]
pub struct CountingConverters {
    pub created: AtomicUsize,
    pub requests: Mutex<Vec<(u32, u32, u32)>>,
}

impl CountingConverters {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ConverterFactory for CountingConverters {
    fn create(
        &self,
        in_rate: u32,
        out_rate: u32,
        channels: u32,
        _quality: u32,
    ) -> HalResult<Box<dyn RateConverter>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push((in_rate, out_rate, channels));
        Ok(Box::new(NearestConverter {
            channels,
            in_rate,
            out_rate,
        }))
    }
}

// ======================== Effects ========================

#[derive(Debug, Default)]
pub struct EffectLog {
    pub processed_frames: usize,
    pub reverse_frames: usize,
    pub reverse_calls: usize,
    pub last_delay_us: Option<i32>,
    pub last_reference: Vec<i16>,
}

/// Mono block effect: buffers input until `block` frames are queued, then
/// passes them through. Records what reaches it.
pub struct MockEffect {
    pub descriptor: EffectDescriptor,
    pub block: usize,
    pub log: Arc<Mutex<EffectLog>>,
    pending: Vec<i16>,
    ready: VecDeque<i16>,
}

impl MockEffect {
    pub fn echo_canceller(block: usize) -> Self {
        Self::new(EFFECT_TYPE_AEC, "mock aec", block)
    }

    pub fn noise_suppressor(block: usize) -> Self {
        Self::new(EFFECT_TYPE_NS, "mock ns", block)
    }

    fn new(type_uuid: uuid::Uuid, name: &str, block: usize) -> Self {
        Self {
            descriptor: EffectDescriptor {
                type_uuid,
                name: name.into(),
            },
            block: block.max(1),
            log: Arc::new(Mutex::new(EffectLog::default())),
            pending: Vec::new(),
            ready: VecDeque::new(),
        }
    }
}

impl AudioEffect for MockEffect {
    fn descriptor(&self) -> HalResult<EffectDescriptor> {
        Ok(self.descriptor.clone())
    }

    fn process(
        &mut self,
        input: &[i16],
        in_frames: &mut usize,
        output: &mut [i16],
        out_frames: &mut usize,
    ) -> HalResult<()> {
        self.pending.extend_from_slice(&input[..*in_frames]);
        let blocks = self.pending.len() / self.block;
        let n = blocks * self.block;
        self.ready.extend(self.pending.drain(..n));
        self.log.lock().unwrap().processed_frames += n;

        let given = (*out_frames).min(self.ready.len());
        for (dst, src) in output.iter_mut().zip(self.ready.drain(..given)) {
            *dst = src;
        }
        *out_frames = given;
        Ok(())
    }

    fn supports_reverse(&self) -> bool {
        self.descriptor.type_uuid == EFFECT_TYPE_AEC
    }

    fn process_reverse(&mut self, reference: &[i16], frames: usize) -> HalResult<()> {
        let mut log = self.log.lock().unwrap();
        log.reverse_frames += frames;
        log.reverse_calls += 1;
        log.last_reference = reference[..frames].to_vec();
        Ok(())
    }

    fn set_parameter(&mut self, param: EffectParam) -> HalResult<()> {
        let EffectParam::EchoDelay(us) = param;
        self.log.lock().unwrap().last_delay_us = Some(us);
        Ok(())
    }
}

/// Pass-through effect that takes nothing until `min_input` frames are
/// offered, then at most `max_take` frames per call.
pub struct ThresholdEffect {
    pub min_input: usize,
    pub max_take: usize,
    pub refusals: Arc<AtomicUsize>,
}

impl ThresholdEffect {
    pub fn new(min_input: usize, max_take: usize) -> Self {
        Self {
            min_input,
            max_take,
            refusals: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl AudioEffect for ThresholdEffect {
    fn descriptor(&self) -> HalResult<EffectDescriptor> {
        Ok(EffectDescriptor {
            type_uuid: EFFECT_TYPE_NS,
            name: "threshold".into(),
        })
    }

    fn process(
        &mut self,
        input: &[i16],
        in_frames: &mut usize,
        output: &mut [i16],
        out_frames: &mut usize,
    ) -> HalResult<()> {
        if *in_frames < self.min_input {
            self.refusals.fetch_add(1, Ordering::SeqCst);
            *in_frames = 0;
            *out_frames = 0;
            return Ok(());
        }
        let n = (*in_frames).min(self.max_take).min(*out_frames);
        output[..n].copy_from_slice(&input[..n]);
        *in_frames = n;
        *out_frames = n;
        Ok(())
    }
}

// ======================== Sleeper ========================

#[derive(Default)]
pub struct RecordingSleeper {
    pub sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn total(&self) -> Duration {
        self.sleeps.lock().unwrap().iter().sum()
    }

    pub fn count(&self) -> usize {
        self.sleeps.lock().unwrap().len()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

// ======================== Harness ========================

pub struct Harness {
    pub device: AudioDevice,
    pub driver: MockDriver,
    pub mixer: MockMixer,
    pub converters: Arc<CountingConverters>,
    pub sleeper: Arc<RecordingSleeper>,
}

pub fn open_device() -> Harness {
    open_device_with(HalConfig::new().unwrap())
}

pub fn open_device_with(config: HalConfig) -> Harness {
    let driver = MockDriver::default();
    let mixer = MockMixer::new();
    let converters = Arc::new(CountingConverters::default());
    let sleeper = Arc::new(RecordingSleeper::default());
    let backend = Backend::new(
        Arc::new(driver.clone()),
        Box::new(mixer.clone()),
        converters.clone(),
    )
    .with_sleeper(sleeper.clone());
    let device = AudioDevice::open(config, backend).unwrap();
    Harness {
        device,
        driver,
        mixer,
        converters,
        sleeper,
    }
}
