//! Capture endpoint: pull-style hardware reads, optional rate conversion,
//! and the preprocessing chain fed with the echo reference.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use super::converter::{BufferProvider, DEFAULT_QUALITY, RateConverter};
use super::device::{DeviceShared, DeviceState, PortSelection, input_buffer_bytes};
use super::devices::DeviceMask;
use super::echo_reference::{EchoReadBuffer, EchoReferenceFormat, SharedEchoReference};
use super::error::{HalError, HalResult};
use super::lock;
use super::mixer::gain_to_control;
use super::params::{PARAM_ROUTING, StrParms};
use super::pcm::{PcmConfig, PcmDirection, PcmPort, PortId, frames_to_ns, rates_conflict};
use super::preprocess::{EffectHandle, PreprocessorChain};
use super::stream::{AudioStream, CaptureEndpoint};

pub struct InputStream {
    device: Arc<DeviceShared>,
    this: Weak<InputStream>,
    requested_rate: u32,
    channels: u32,
    /// Only flipped with the device lock held.
    in_standby: AtomicBool,
    /// Set while an echo canceller is attached; device lock held to change.
    need_echo_reference: AtomicBool,
    inner: Mutex<InputInner>,
}

impl std::fmt::Debug for InputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputStream")
            .field("requested_rate", &self.requested_rate)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

/// Hardware side of the capture path. Reads one period at a time and hands
/// out the first `stream_channels` channels of each frame.
struct CaptureSource {
    port: Option<Box<dyn PcmPort>>,
    config: PcmConfig,
    stream_channels: usize,
    buffer: Vec<i16>,
    /// Frames of the last period not yet consumed
    frames_in: usize,
}

impl BufferProvider for CaptureSource {
    fn next_buffer(&mut self, max_frames: usize) -> HalResult<&[i16]> {
        let port = self.port.as_mut().ok_or(HalError::NoDevice)?;
        let period = self.config.period_size;
        let port_channels = self.config.channels as usize;
        let channels = self.stream_channels;

        if self.frames_in == 0 {
            self.buffer.resize(period * port_channels, 0);
            port.read(&mut self.buffer).inspect_err(|e| {
                log::error!("capture read failed: {}", e);
            })?;
            self.frames_in = period;
            if port_channels > channels {
                // keep the leading channels, in place
                for i in 0..period {
                    for ch in 0..channels {
                        self.buffer[i * channels + ch] = self.buffer[i * port_channels + ch];
                    }
                }
            }
        }

        let start = period - self.frames_in;
        let frames = max_frames.min(self.frames_in);
        Ok(&self.buffer[start * channels..(start + frames) * channels])
    }

    fn release_buffer(&mut self, frames: usize) {
        self.frames_in -= frames.min(self.frames_in);
    }
}

struct InputInner {
    source: CaptureSource,
    port_id: PortId,
    converter: Option<Box<dyn RateConverter>>,
    echo_reference: Option<SharedEchoReference>,
    chain: PreprocessorChain,
    proc_buf: Vec<i16>,
    proc_frames_in: usize,
    ref_buf: Vec<i16>,
    ref_frames_in: usize,
    /// Scratch for direct reads from a port with more channels than the stream
    raw: Vec<i16>,
}

/// Fill `out` with `frames` frames at the stream rate, through the converter
/// when there is one.
fn read_frames(
    source: &mut CaptureSource,
    converter: &mut Option<Box<dyn RateConverter>>,
    out: &mut [i16],
    frames: usize,
) -> HalResult<usize> {
    let channels = source.stream_channels;
    let mut written = 0;

    while written < frames {
        let mut chunk = frames - written;
        let dst = &mut out[written * channels..frames * channels];
        match converter.as_mut() {
            Some(converter) => converter.convert_from_provider(source, dst, &mut chunk)?,
            None => {
                let buf = source.next_buffer(chunk)?;
                chunk = buf.len() / channels;
                dst[..buf.len()].copy_from_slice(buf);
                source.release_buffer(chunk);
            }
        }
        written += chunk;
    }
    Ok(written)
}

impl InputInner {
    /// Capture timestamp and the delay between the sound reaching the mic and
    /// the first frame of the next processed buffer.
    fn capture_delay(&mut self) -> (Duration, i64) {
        let Some(port) = self.source.port.as_mut() else {
            return (Duration::ZERO, 0);
        };
        let depth = match port.buffer_depth() {
            Ok(depth) => depth,
            Err(e) => {
                log::warn!("capture delay unavailable: {}", e);
                return (Duration::ZERO, 0);
            }
        };
        let rate = self.source.config.rate;
        let kernel_delay = frames_to_ns(depth.avail, rate);
        let buf_delay = frames_to_ns(self.source.frames_in + self.proc_frames_in, rate);
        let converter_delay = self.converter.as_ref().map_or(0, |c| c.delay_ns());
        (depth.timestamp, kernel_delay + buf_delay + converter_delay)
    }

    /// Top up `ref_buf` to `frames` frames from the echo reference. Returns
    /// the echo path delay reported by the reference.
    fn update_echo_reference(&mut self, frames: usize) -> i64 {
        let channels = self.source.stream_channels;
        if self.ref_frames_in >= frames {
            log::trace!("reference buffer already holds {} frames", self.ref_frames_in);
            return 0;
        }
        let Some(reference) = self.echo_reference.clone() else {
            return 0;
        };

        if self.ref_buf.len() < frames * channels {
            self.ref_buf.resize(frames * channels, 0);
        }
        let (timestamp, capture_delay) = self.capture_delay();

        let start = self.ref_frames_in;
        let mut request = EchoReadBuffer {
            frames: &mut self.ref_buf[start * channels..frames * channels],
            frame_count: frames - start,
            timestamp,
            delay_ns: capture_delay,
        };
        match lock(&reference).read(Some(&mut request)) {
            Ok(()) => {
                self.ref_frames_in += request.frame_count;
                request.delay_ns
            }
            Err(e) => {
                log::trace!("echo reference read: {}", e);
                request.delay_ns
            }
        }
    }

    /// Hand up to `frames` reference frames to the preprocessors and keep the
    /// rest for the next call.
    fn push_echo_reference(&mut self, frames: usize) {
        let delay_us = (self.update_echo_reference(frames) / 1000) as i32;
        let channels = self.source.stream_channels;
        let frames = frames.min(self.ref_frames_in);

        self.chain
            .process_reverse(&self.ref_buf[..frames * channels], frames, delay_us);

        self.ref_frames_in -= frames;
        if self.ref_frames_in > 0 {
            self.ref_buf.copy_within(
                frames * channels..(frames + self.ref_frames_in) * channels,
                0,
            );
        }
    }

    /// Accumulate, push the reference, run the chain, until `frames` processed
    /// frames are in `out`.
    fn process_frames(&mut self, out: &mut [i16], frames: usize) -> HalResult<usize> {
        let channels = self.source.stream_channels;
        let mut written = 0;
        // grows when a pass produces nothing, so the next pass sees more input
        let mut target = frames;

        while written < frames {
            if self.proc_frames_in < target {
                if self.proc_buf.len() < target * channels {
                    self.proc_buf.resize(target * channels, 0);
                }
                let start = self.proc_frames_in;
                let read = read_frames(
                    &mut self.source,
                    &mut self.converter,
                    &mut self.proc_buf[start * channels..target * channels],
                    target - start,
                )?;
                self.proc_frames_in += read;
            }

            if self.echo_reference.is_some() {
                self.push_echo_reference(self.proc_frames_in);
            }

            let mut consumed = self.proc_frames_in;
            let mut produced = frames - written;
            self.chain.process(
                channels,
                &self.proc_buf[..self.proc_frames_in * channels],
                &mut consumed,
                &mut out[written * channels..frames * channels],
                &mut produced,
            )?;

            let consumed = consumed.min(self.proc_frames_in);
            self.proc_frames_in -= consumed;
            if self.proc_frames_in > 0 {
                self.proc_buf.copy_within(
                    consumed * channels..(consumed + self.proc_frames_in) * channels,
                    0,
                );
            }

            if produced == 0 {
                target = self.proc_frames_in + (frames - written);
                continue;
            }
            written += produced;
        }
        Ok(written)
    }

    fn read_into(&mut self, out: &mut [i16], frames: usize) -> HalResult<()> {
        if !self.chain.is_empty() {
            self.process_frames(out, frames)?;
        } else if self.converter.is_some() {
            read_frames(&mut self.source, &mut self.converter, out, frames)?;
        } else {
            let channels = self.source.stream_channels;
            // frames left over from a period read go out first
            let carried = self.source.frames_in.min(frames);
            if carried > 0 {
                read_frames(&mut self.source, &mut self.converter, out, carried)?;
            }
            if carried == frames {
                return Ok(());
            }

            let port_channels = self.source.config.channels as usize;
            let rest = frames - carried;
            let dst = &mut out[carried * channels..frames * channels];
            let port = self.source.port.as_mut().ok_or(HalError::NoDevice)?;
            if port_channels > channels {
                self.raw.resize(rest * port_channels, 0);
                port.read(&mut self.raw)?;
                for (dst, frame) in dst
                    .chunks_exact_mut(channels)
                    .zip(self.raw.chunks_exact(port_channels))
                {
                    dst.copy_from_slice(&frame[..channels]);
                }
            } else {
                port.read(dst)?;
            }
        }
        Ok(())
    }
}

impl InputStream {
    pub(crate) fn new(device: Arc<DeviceShared>, requested_rate: u32, channels: u32) -> Arc<Self> {
        let inner = InputInner {
            source: CaptureSource {
                port: None,
                config: device.config.capture,
                stream_channels: channels as usize,
                buffer: Vec::new(),
                frames_in: 0,
            },
            port_id: PortId::Main,
            converter: None,
            echo_reference: None,
            chain: PreprocessorChain::default(),
            proc_buf: Vec::new(),
            proc_frames_in: 0,
            ref_buf: Vec::new(),
            ref_frames_in: 0,
            raw: Vec::new(),
        };
        Arc::new_cyclic(|this| Self {
            device,
            this: this.clone(),
            requested_rate,
            channels,
            in_standby: AtomicBool::new(true),
            need_echo_reference: AtomicBool::new(false),
            inner: Mutex::new(inner),
        })
    }

    /// Put this stream in standby if its port cannot share a clock with a
    /// port running at `rate`. Caller holds the device lock and must release
    /// the returned reference through the device.
    pub(crate) fn standby_if_conflicting(
        &self,
        state: &mut DeviceState,
        rate: u32,
    ) -> Option<SharedEchoReference> {
        let mut inner = lock(&self.inner);
        if rates_conflict(rate, inner.source.config.rate) {
            log::info!(
                "capture at {} Hz conflicts with {} Hz playback, forcing standby",
                inner.source.config.rate,
                rate
            );
            self.do_standby(state, &mut inner)
        } else {
            None
        }
    }

    pub(crate) fn enter_standby(&self) {
        let mut state = self.device.lock_state();
        let mut inner = lock(&self.inner);
        let released = self.do_standby(&mut state, &mut inner);
        drop(inner);
        if let Some(reference) = released {
            state.put_echo_reference(&reference);
        }
    }

    /// Close the port. The echo reference this stream read from is returned
    /// so the caller can release it once this stream's lock is dropped.
    fn do_standby(
        &self,
        state: &mut DeviceState,
        inner: &mut InputInner,
    ) -> Option<SharedEchoReference> {
        if self.in_standby.load(Ordering::Acquire) {
            return None;
        }
        inner.source.port = None;
        inner.source.frames_in = 0;
        if state
            .active_in
            .as_ref()
            .is_some_and(|active| active.ptr_eq(&self.this))
        {
            state.active_in = None;
        }

        let released = inner.echo_reference.take();
        if let Some(reference) = released.as_ref() {
            if let Err(e) = lock(reference).read(None) {
                log::debug!("echo reference stop failed: {}", e);
            }
        }
        inner.ref_frames_in = 0;
        inner.proc_frames_in = 0;
        inner.converter = None;
        inner.source.buffer = Vec::new();
        inner.raw = Vec::new();
        self.in_standby.store(true, Ordering::Release);
        log::debug!("input stream in standby");
        released
    }

    fn start(
        &self,
        state: &mut DeviceState,
        inner: &mut InputInner,
        selection: PortSelection,
        echo_reference: Option<SharedEchoReference>,
    ) -> HalResult<()> {
        let shared = &self.device;
        let config = selection.config;

        inner.port_id = selection.port;
        inner.source.config = config;
        inner.echo_reference = echo_reference;

        log::debug!(
            "start_input_stream: port={:?}, rate={}, requested={}",
            selection.port,
            config.rate,
            self.requested_rate
        );
        let port = shared
            .driver
            .open(shared.config.card, selection.port, PcmDirection::Capture, &config)?;

        if self.requested_rate != config.rate {
            inner.converter = Some(shared.converters.create(
                config.rate,
                self.requested_rate,
                self.channels,
                DEFAULT_QUALITY,
            )?);
        }

        inner.source.port = Some(port);
        inner.source.frames_in = 0;
        inner.source.buffer = vec![0; config.period_size * config.channels as usize];
        state.active_in = Some(self.this.clone());
        self.in_standby.store(false, Ordering::Release);
        Ok(())
    }

    pub fn port_id(&self) -> PortId {
        lock(&self.inner).port_id
    }

    pub fn has_converter(&self) -> bool {
        lock(&self.inner).converter.is_some()
    }

    pub fn has_echo_reference(&self) -> bool {
        lock(&self.inner).echo_reference.is_some()
    }

    pub fn needs_echo_reference(&self) -> bool {
        self.need_echo_reference.load(Ordering::Acquire)
    }

    pub fn preprocessor_count(&self) -> usize {
        lock(&self.inner).chain.len()
    }

    /// Reference frames held back for the next processing pass.
    pub fn reference_carry(&self) -> usize {
        lock(&self.inner).ref_frames_in
    }

    /// Toggle the echo reference requirement and restart so the next read
    /// re-evaluates attachment. Device and stream locks are held by the
    /// caller; the reference to release is returned.
    fn set_need_echo_reference(
        &self,
        state: &mut DeviceState,
        inner: &mut InputInner,
        need: bool,
    ) -> Option<SharedEchoReference> {
        self.need_echo_reference.store(need, Ordering::Release);
        self.do_standby(state, inner)
    }
}

impl AudioStream for InputStream {
    fn sample_rate(&self) -> u32 {
        self.requested_rate
    }

    fn channels(&self) -> u32 {
        self.channels
    }

    fn buffer_size(&self) -> usize {
        let config = lock(&self.inner).source.config;
        input_buffer_bytes(&config, self.requested_rate, self.channels)
    }

    fn standby(&self) {
        self.enter_standby();
    }

    fn is_standby(&self) -> bool {
        self.in_standby.load(Ordering::Acquire)
    }

    /// `routing=<mask>` replaces the input device bits; switching SCO or
    /// digital in puts the stream in standby.
    fn set_parameters(&self, kvpairs: &str) -> HalResult<()> {
        let parms = StrParms::parse(kvpairs);
        let Some(requested) = parms.get_u32(PARAM_ROUTING)?.map(DeviceMask) else {
            return Ok(());
        };

        let mut state = self.device.lock_state();
        if requested.is_empty() || state.devices & DeviceMask::IN_ALL == requested {
            return Ok(());
        }

        let flipped = |mask: DeviceMask| (requested & mask) != (state.devices & mask);
        if flipped(DeviceMask::IN_ALL_SCO) || flipped(DeviceMask::IN_AUX_DIGITAL) {
            let mut inner = lock(&self.inner);
            let released = self.do_standby(&mut state, &mut inner);
            drop(inner);
            if let Some(reference) = released {
                state.put_echo_reference(&reference);
            }
        }

        state.devices = (state.devices & !DeviceMask::IN_ALL) | requested;
        log::debug!("input routing -> {}", state.devices);
        state.apply_routes()
    }
}

impl CaptureEndpoint for InputStream {
    fn read(&self, frames: &mut [i16]) -> HalResult<usize> {
        let channels = self.channels as usize;
        let bytes = frames.len() * 2;
        let frames_rq = frames.len() / channels;
        let shared = &self.device;

        let mut state = shared.lock_state();
        let mut inner = if self.in_standby.load(Ordering::Acquire) {
            let selection = shared.select_input_port(state.devices);
            if let Some(out) = state.active_out() {
                out.standby_if_conflicting(&mut state, selection.config.rate);
            }

            let echo_reference = if self.need_echo_reference.load(Ordering::Acquire) {
                shared.get_echo_reference(
                    &mut state,
                    EchoReferenceFormat {
                        channels: self.channels,
                        rate: self.requested_rate,
                    },
                )
            } else {
                None
            };

            let mut inner = lock(&self.inner);
            if let Err(e) = self.start(&mut state, &mut inner, selection, echo_reference) {
                log::error!("Failed to start input stream: {}", e);
                inner.source.port = None;
                inner.converter = None;
                let released = inner.echo_reference.take();
                drop(inner);
                if let Some(reference) = released {
                    state.put_echo_reference(&reference);
                }
                drop(state);
                frames.fill(0);
                shared
                    .backoff
                    .after_failure(shared.sleeper.as_ref(), frames_rq, self.requested_rate);
                return Ok(bytes);
            }
            inner
        } else {
            lock(&self.inner)
        };
        let mute = state.mic_mute;
        drop(state);

        let result = inner.read_into(frames, frames_rq);
        drop(inner);

        match result {
            Ok(()) => {
                if mute {
                    frames.fill(0);
                }
            }
            Err(e) => {
                log::error!("capture failed: {}", e);
                frames.fill(0);
                shared
                    .backoff
                    .after_failure(shared.sleeper.as_ref(), frames_rq, self.requested_rate);
            }
        }
        Ok(bytes)
    }

    /// Mic capture volume on both channels.
    fn set_gain(&self, gain: f32) -> HalResult<()> {
        let value = gain_to_control(gain, self.device.config.gain_range_max);
        let mut state = self.device.lock_state();
        let ctl = state.controls.mic_volume;
        for channel in 0..2 {
            state.mixer.set_value(ctl, channel, value)?;
        }
        Ok(())
    }

    fn add_preprocessor(&self, effect: EffectHandle) -> HalResult<()> {
        let mut state = self.device.lock_state();
        let mut inner = lock(&self.inner);
        let is_aec = inner.chain.add(effect)?;
        let released = if is_aec {
            self.set_need_echo_reference(&mut state, &mut inner, true)
        } else {
            None
        };
        drop(inner);
        if let Some(reference) = released {
            state.put_echo_reference(&reference);
        }
        Ok(())
    }

    fn remove_preprocessor(&self, effect: &EffectHandle) -> HalResult<()> {
        let mut state = self.device.lock_state();
        let mut inner = lock(&self.inner);
        let was_aec = inner.chain.remove(effect)?;
        let released = if was_aec {
            self.set_need_echo_reference(&mut state, &mut inner, false)
        } else {
            None
        };
        drop(inner);
        if let Some(reference) = released {
            state.put_echo_reference(&reference);
        }
        Ok(())
    }
}
