//! Playback endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use super::device::{DeviceShared, DeviceState, PortSelection};
use super::devices::DeviceMask;
use super::echo_reference::{EchoReferenceFormat, EchoWriteBuffer, SharedEchoReference};
use super::converter::{DEFAULT_QUALITY, RateConverter};
use super::error::{HalError, HalResult};
use super::lock;
use super::mixer::gain_to_control;
use super::pace::{BufferType, PaceController};
use super::params::{PARAM_ROUTING, StrParms};
use super::pcm::{PcmConfig, PcmDirection, PcmPort, PortId, frames_to_ns, rates_conflict};
use super::stream::{AudioStream, PlaybackEndpoint};

pub struct OutputStream {
    device: Arc<DeviceShared>,
    this: Weak<OutputStream>,
    sample_rate: u32,
    channels: u32,
    /// Only flipped with the device lock held.
    in_standby: AtomicBool,
    inner: Mutex<OutputInner>,
}

struct OutputInner {
    port: Option<Box<dyn PcmPort>>,
    port_id: PortId,
    config: PcmConfig,
    converter: Option<Box<dyn RateConverter>>,
    /// Converter output, `buffer_frames` port frames
    buffer: Vec<i16>,
    buffer_frames: usize,
    downmix: Vec<i16>,
    echo_reference: Option<SharedEchoReference>,
    pace: PaceController,
}

impl OutputStream {
    pub(crate) fn new(device: Arc<DeviceShared>, sample_rate: u32, channels: u32) -> Arc<Self> {
        let inner = OutputInner {
            port: None,
            port_id: PortId::Main,
            config: device.config.playback,
            converter: None,
            buffer: Vec::new(),
            buffer_frames: 0,
            downmix: Vec::new(),
            echo_reference: None,
            pace: PaceController::new(device.pace_params()),
        };
        Arc::new_cyclic(|this| Self {
            device,
            this: this.clone(),
            sample_rate,
            channels,
            in_standby: AtomicBool::new(true),
            inner: Mutex::new(inner),
        })
    }

    /// Format of the frames this stream feeds to an echo reference.
    pub(crate) fn echo_write_format(&self) -> EchoReferenceFormat {
        EchoReferenceFormat {
            channels: self.channels,
            rate: self.sample_rate,
        }
    }

    pub(crate) fn add_echo_reference(&self, reference: SharedEchoReference) {
        lock(&self.inner).echo_reference = Some(reference);
    }

    pub(crate) fn remove_echo_reference(&self, reference: &SharedEchoReference) {
        let mut inner = lock(&self.inner);
        let attached = inner
            .echo_reference
            .as_ref()
            .is_some_and(|r| Arc::ptr_eq(r, reference));
        if attached {
            if let Err(e) = lock(reference).write(None) {
                log::debug!("echo reference stop failed: {}", e);
            }
            inner.echo_reference = None;
        }
    }

    /// Put this stream in standby if its port cannot share a clock with a
    /// port running at `rate`. Caller holds the device lock.
    pub(crate) fn standby_if_conflicting(&self, state: &mut DeviceState, rate: u32) {
        let mut inner = lock(&self.inner);
        if rates_conflict(rate, inner.config.rate) {
            log::info!(
                "output at {} Hz conflicts with {} Hz capture, forcing standby",
                inner.config.rate,
                rate
            );
            self.do_standby(state, &mut inner);
        }
    }

    pub(crate) fn enter_standby(&self) {
        let mut state = self.device.lock_state();
        let mut inner = lock(&self.inner);
        self.do_standby(&mut state, &mut inner);
    }

    fn do_standby(&self, state: &mut DeviceState, inner: &mut OutputInner) {
        if self.in_standby.load(Ordering::Acquire) {
            return;
        }
        inner.port = None;
        if state
            .active_out
            .as_ref()
            .is_some_and(|active| active.ptr_eq(&self.this))
        {
            state.active_out = None;
        }
        if let Some(reference) = inner.echo_reference.take() {
            if let Err(e) = lock(&reference).write(None) {
                log::debug!("echo reference stop failed: {}", e);
            }
        }
        inner.converter = None;
        inner.buffer = Vec::new();
        inner.buffer_frames = 0;
        self.in_standby.store(true, Ordering::Release);
        log::debug!("output stream in standby");
    }

    fn start(
        &self,
        state: &mut DeviceState,
        inner: &mut OutputInner,
        selection: PortSelection,
    ) -> HalResult<()> {
        let shared = &self.device;
        let config = selection.config;

        inner.port_id = selection.port;
        inner.config = config;
        if selection.port != PortId::Sco {
            inner.pace.reset();
        }

        log::debug!(
            "start_output_stream: port={:?}, rate={}",
            selection.port,
            config.rate
        );
        let port = shared
            .driver
            .open(shared.config.card, selection.port, PcmDirection::Playback, &config)?;

        if self.sample_rate != config.rate {
            let converter = shared.converters.create(
                self.sample_rate,
                config.rate,
                config.channels,
                DEFAULT_QUALITY,
            )?;
            inner.buffer_frames = shared.config.playback.period_size * config.rate as usize
                / self.sample_rate as usize
                + 1;
            inner.buffer = vec![0; inner.buffer_frames * config.channels as usize];
            inner.converter = Some(converter);
        }
        inner.port = Some(port);

        if let Some(reference) = state.echo_reference.as_ref() {
            inner.echo_reference = Some(reference.clone());
        }
        state.active_out = Some(self.this.clone());
        self.in_standby.store(false, Ordering::Release);
        Ok(())
    }

    /// Downmix, convert, feed the echo reference, pace, then write.
    fn transfer(
        &self,
        inner: &mut OutputInner,
        frames: &[i16],
        buffer_type: BufferType,
        sco_on: bool,
    ) -> HalResult<()> {
        // SCO keeps its own blocking geometry
        if !sco_on {
            inner.pace.set_buffer_type(buffer_type);
        }

        let OutputInner {
            port,
            config,
            converter,
            buffer,
            buffer_frames,
            downmix,
            echo_reference,
            pace,
            ..
        } = inner;
        let port = port.as_mut().ok_or(HalError::NoDevice)?;
        let stream_channels = self.channels as usize;
        let port_channels = config.channels as usize;
        let mut in_frames = frames.len() / stream_channels;

        let source: &[i16] = if stream_channels > port_channels {
            downmix.clear();
            downmix.extend(
                frames
                    .chunks_exact(stream_channels)
                    .flat_map(|frame| frame[..port_channels].iter().copied()),
            );
            &downmix[..]
        } else {
            frames
        };

        let (data, out_frames): (&[i16], usize) = match converter.as_mut() {
            Some(converter) => {
                let mut out_frames = *buffer_frames;
                converter.convert(source, &mut in_frames, &mut buffer[..], &mut out_frames)?;
                (&buffer[..out_frames * port_channels], out_frames)
            }
            None => (source, in_frames),
        };

        if let Some(reference) = echo_reference.as_ref() {
            let (timestamp, delay_ns) = playback_delay(&mut **port, config.rate, out_frames);
            let written = EchoWriteBuffer {
                frames,
                frame_count: in_frames,
                timestamp,
                delay_ns,
            };
            if let Err(e) = lock(reference).write(Some(&written)) {
                log::debug!("echo reference write failed: {}", e);
            }
        }

        if !sco_on {
            pace.pace(&mut **port, self.device.sleeper.as_ref());
        }

        port.write(data)
    }

    pub fn port_id(&self) -> PortId {
        lock(&self.inner).port_id
    }

    pub fn has_converter(&self) -> bool {
        lock(&self.inner).converter.is_some()
    }

    /// Frames of the converter scratch buffer, 0 without a converter.
    pub fn converter_buffer_frames(&self) -> usize {
        lock(&self.inner).buffer_frames
    }

    pub fn has_echo_reference(&self) -> bool {
        lock(&self.inner).echo_reference.is_some()
    }

    pub fn buffer_type(&self) -> BufferType {
        lock(&self.inner).pace.buffer_type()
    }

    /// `(target, current)` write thresholds in frames.
    pub fn write_thresholds(&self) -> (usize, usize) {
        let inner = lock(&self.inner);
        (inner.pace.write_threshold(), inner.pace.cur_write_threshold())
    }
}

/// Time until the last of `frames` more frames is rendered, with the
/// timestamp of the measurement. Zero when the port cannot tell.
fn playback_delay(port: &mut dyn PcmPort, rate: u32, frames: usize) -> (Duration, i64) {
    match port.buffer_depth() {
        Ok(depth) => {
            let kernel_frames = port.capacity().saturating_sub(depth.avail);
            (depth.timestamp, frames_to_ns(kernel_frames + frames, rate))
        }
        Err(e) => {
            log::trace!("playback delay unavailable: {}", e);
            (Duration::ZERO, 0)
        }
    }
}

impl AudioStream for OutputStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u32 {
        self.channels
    }

    fn buffer_size(&self) -> usize {
        self.device.config.playback.period_size * self.frame_size()
    }

    fn standby(&self) {
        self.enter_standby();
    }

    fn is_standby(&self) -> bool {
        self.in_standby.load(Ordering::Acquire)
    }

    /// `routing=<mask>` replaces the output device bits. Moving onto or off
    /// SCO or digital out needs another port, so the stream goes to standby.
    fn set_parameters(&self, kvpairs: &str) -> HalResult<()> {
        let parms = StrParms::parse(kvpairs);
        let Some(requested) = parms.get_u32(PARAM_ROUTING)?.map(DeviceMask) else {
            return Ok(());
        };

        let mut state = self.device.lock_state();
        if requested.is_empty() || state.devices & DeviceMask::OUT_ALL == requested {
            return Ok(());
        }

        let flipped = |mask: DeviceMask| (requested & mask) != (state.devices & mask);
        if flipped(DeviceMask::OUT_ALL_SCO) || flipped(DeviceMask::OUT_AUX_DIGITAL) {
            let mut inner = lock(&self.inner);
            self.do_standby(&mut state, &mut inner);
        }

        state.devices = (state.devices & !DeviceMask::OUT_ALL) | requested;
        log::debug!("output routing -> {}", state.devices);
        state.apply_routes()
    }
}

impl PlaybackEndpoint for OutputStream {
    fn write(&self, frames: &[i16]) -> HalResult<usize> {
        let channels = self.channels as usize;
        if frames.len() % channels != 0 {
            return Err(HalError::InvalidArgument(format!(
                "{} samples is not a whole number of {}-channel frames",
                frames.len(),
                channels
            )));
        }
        let bytes = frames.len() * 2;
        let in_frames = frames.len() / channels;
        let shared = &self.device;

        let mut state = shared.lock_state();
        let mut inner = if self.in_standby.load(Ordering::Acquire) {
            let selection = shared.select_output_port(state.devices);
            if let Some(input) = state.active_in() {
                if let Some(reference) = input.standby_if_conflicting(&mut state, selection.config.rate) {
                    state.put_echo_reference(&reference);
                }
            }

            let mut inner = lock(&self.inner);
            if let Err(e) = self.start(&mut state, &mut inner, selection) {
                log::error!("Failed to start output stream: {}", e);
                drop(inner);
                drop(state);
                shared
                    .backoff
                    .after_failure(shared.sleeper.as_ref(), in_frames, self.sample_rate);
                return Ok(bytes);
            }
            inner
        } else {
            lock(&self.inner)
        };

        let buffer_type = if state.screen_off && state.active_in().is_none() {
            BufferType::Long
        } else {
            BufferType::Short
        };
        let sco_on = state.sco_on();
        drop(state);

        let result = self.transfer(&mut inner, frames, buffer_type, sco_on);
        drop(inner);

        match result {
            Ok(()) => {}
            // refill as fast as possible
            Err(HalError::Underrun) => log::warn!("playback underrun"),
            Err(e) => {
                log::error!("playback write failed: {}", e);
                shared
                    .backoff
                    .after_failure(shared.sleeper.as_ref(), in_frames, self.sample_rate);
            }
        }
        Ok(bytes)
    }

    fn latency_ms(&self) -> u32 {
        let config = &self.device.config;
        let state = self.device.lock_state();
        let period_count = if state.screen_off && state.active_in().is_none() && !state.sco_on() {
            config.long_period_count
        } else {
            config.short_period_count
        };
        (config.playback.period_size * period_count * 1000 / config.playback.rate as usize) as u32
    }

    /// Speaker and headphone volumes, per channel.
    fn set_volume(&self, left: f32, right: f32) -> HalResult<()> {
        log::debug!("set_volume: left={}, right={}", left, right);
        let max = self.device.config.gain_range_max;
        let mut state = self.device.lock_state();
        let controls = state.controls;
        for ctl in [controls.speaker_volume, controls.headset_volume] {
            state.mixer.set_value(ctl, 0, gain_to_control(left, max))?;
            state.mixer.set_value(ctl, 1, gain_to_control(right, max))?;
        }
        Ok(())
    }
}
