//! Device coordinator: owns the mixer, the routing state and the shared echo
//! reference, and hands out the playback and capture endpoints.
//!
//! Lock order is device, then the active sibling stream, then the calling
//! stream. A stream never takes the device lock while holding its own.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::backoff::{RetryBackoff, Sleeper, ThreadSleeper};
use super::converter::ConverterFactory;
use super::devices::{AudioMode, DeviceMask, Orientation};
use super::echo_reference::{
    EchoReferenceFactory, EchoReferenceFormat, FifoEchoReferenceFactory, SharedEchoReference,
};
use super::error::{HalError, HalResult};
use super::lock;
use super::mixer::{
    Mixer, MixerControls, MixerCtl, default_route, gain_to_control, select_devices,
    set_route_by_array,
};
use super::pace::PaceParams;
use super::params::{PARAM_ORIENTATION, PARAM_SCREEN_STATE, StrParms, VALUE_ON};
use super::pcm::{PcmConfig, PcmDriver, PortId};
use super::stream_in::InputStream;
use super::stream_out::OutputStream;
use crate::config::HalConfig;

/// External collaborators the device runs on.
pub struct Backend {
    pub driver: Arc<dyn PcmDriver>,
    pub mixer: Box<dyn Mixer>,
    pub converters: Arc<dyn ConverterFactory>,
    pub echo_references: Arc<dyn EchoReferenceFactory>,
    pub sleeper: Arc<dyn Sleeper>,
}

impl Backend {
    /// In-process echo references (converted through `converters`) and real
    /// thread sleeps.
    pub fn new(
        driver: Arc<dyn PcmDriver>,
        mixer: Box<dyn Mixer>,
        converters: Arc<dyn ConverterFactory>,
    ) -> Self {
        Self {
            driver,
            mixer,
            echo_references: Arc::new(FifoEchoReferenceFactory::new(converters.clone())),
            converters,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_echo_references(mut self, factory: Arc<dyn EchoReferenceFactory>) -> Self {
        self.echo_references = factory;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }
}

/// Format requested when opening a stream; rewritten with what was granted.
/// A zero rate asks for the port rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub channels: u32,
}

/// Port picked for a stream coming out of standby.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PortSelection {
    pub port: PortId,
    pub config: PcmConfig,
}

pub(crate) struct DeviceState {
    pub mixer: Box<dyn Mixer>,
    pub controls: MixerControls,
    pub devices: DeviceMask,
    pub mode: AudioMode,
    pub mic_mute: bool,
    pub screen_off: bool,
    pub orientation: Orientation,
    pub echo_reference: Option<SharedEchoReference>,
    pub active_out: Option<Weak<OutputStream>>,
    pub active_in: Option<Weak<InputStream>>,
}

impl DeviceState {
    pub fn active_out(&self) -> Option<Arc<OutputStream>> {
        self.active_out.as_ref().and_then(Weak::upgrade)
    }

    pub fn active_in(&self) -> Option<Arc<InputStream>> {
        self.active_in.as_ref().and_then(Weak::upgrade)
    }

    pub fn sco_on(&self) -> bool {
        self.devices.intersects(DeviceMask::OUT_ALL_SCO)
    }

    pub fn apply_routes(&mut self) -> HalResult<()> {
        select_devices(self.mixer.as_mut(), self.devices).map(|_| ())
    }

    /// Drop the device's echo reference if it is `reference`, detaching it
    /// from the active output first. Locks the active output.
    pub fn put_echo_reference(&mut self, reference: &SharedEchoReference) {
        let is_current = self
            .echo_reference
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, reference));
        if !is_current {
            return;
        }
        if let Some(out) = self.active_out() {
            out.remove_echo_reference(reference);
        }
        self.echo_reference = None;
        log::debug!("echo reference released");
    }
}

/// State shared by the device handle and every stream it opened.
pub(crate) struct DeviceShared {
    pub config: HalConfig,
    pub driver: Arc<dyn PcmDriver>,
    pub converters: Arc<dyn ConverterFactory>,
    pub echo_references: Arc<dyn EchoReferenceFactory>,
    pub sleeper: Arc<dyn Sleeper>,
    pub backoff: RetryBackoff,
    state: Mutex<DeviceState>,
}

impl DeviceShared {
    pub fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        lock(&self.state)
    }

    pub fn select_output_port(&self, devices: DeviceMask) -> PortSelection {
        if devices.intersects(DeviceMask::OUT_ALL_SCO) {
            PortSelection { port: PortId::Sco, config: self.config.sco }
        } else if devices.intersects(DeviceMask::OUT_AUX_DIGITAL) {
            PortSelection { port: PortId::Spdif, config: self.config.playback }
        } else {
            PortSelection { port: PortId::Main, config: self.config.playback }
        }
    }

    pub fn select_input_port(&self, devices: DeviceMask) -> PortSelection {
        if devices.intersects(DeviceMask::IN_ALL_SCO) {
            PortSelection { port: PortId::Sco, config: self.config.sco }
        } else if devices.intersects(DeviceMask::IN_AUX_DIGITAL) {
            PortSelection { port: PortId::Spdif, config: self.config.capture }
        } else {
            PortSelection { port: PortId::Main, config: self.config.capture }
        }
    }

    pub fn pace_params(&self) -> PaceParams {
        PaceParams {
            period_size: self.config.playback.period_size,
            rate: self.config.playback.rate,
            short_period_count: self.config.short_period_count,
            long_period_count: self.config.long_period_count,
            min_sleep: std::time::Duration::from_micros(self.config.min_write_sleep_us),
            max_sleep: std::time::Duration::from_micros(self.config.max_write_sleep_us()),
        }
    }

    /// Replace the device's echo reference with a new one reading in
    /// `read_format` and written by the active output. Without an active
    /// output, or if creation fails, no reference exists afterwards.
    /// Locks the active output.
    pub fn get_echo_reference(
        &self,
        state: &mut DeviceState,
        read_format: EchoReferenceFormat,
    ) -> Option<SharedEchoReference> {
        if let Some(previous) = state.echo_reference.clone() {
            state.put_echo_reference(&previous);
        }

        let out = state.active_out()?;
        let write_format = out.echo_write_format();
        match self.echo_references.create(read_format, write_format) {
            Ok(reference) => {
                let reference: SharedEchoReference = Arc::new(Mutex::new(reference));
                out.add_echo_reference(reference.clone());
                state.echo_reference = Some(reference.clone());
                Some(reference)
            }
            Err(e) => {
                log::warn!("Echo reference unavailable: {}", e);
                None
            }
        }
    }
}

/// Stands in for the codec once the device is gone.
struct ClosedMixer;

impl Mixer for ClosedMixer {
    fn find(&self, _name: &str) -> Option<MixerCtl> {
        None
    }

    fn num_values(&self, _ctl: MixerCtl) -> usize {
        0
    }

    fn set_value(&mut self, _ctl: MixerCtl, _index: usize, _value: i32) -> HalResult<()> {
        Err(HalError::NoDevice)
    }

    fn set_enum(&mut self, _ctl: MixerCtl, _item: &str) -> HalResult<()> {
        Err(HalError::NoDevice)
    }
}

/// One sound card. Dropping it puts the active streams in standby and
/// releases the mixer; streams that outlive it can no longer touch mixer
/// controls.
pub struct AudioDevice {
    shared: Arc<DeviceShared>,
}

impl AudioDevice {
    /// Resolve the codec controls and apply the default route. A missing
    /// control makes the device unusable.
    pub fn open(config: HalConfig, backend: Backend) -> HalResult<Self> {
        let Backend {
            driver,
            mut mixer,
            converters,
            echo_references,
            sleeper,
        } = backend;

        log::info!("Opening audio device: card {}", config.card);

        let controls = MixerControls::resolve(mixer.as_ref())?;
        set_route_by_array(mixer.as_mut(), &default_route(config.gain_range_max), true)?;

        let state = DeviceState {
            mixer,
            controls,
            devices: DeviceMask::OUT_SPEAKER | DeviceMask::IN_BUILTIN_MIC,
            mode: AudioMode::Normal,
            mic_mute: false,
            screen_off: false,
            orientation: Orientation::Undefined,
            echo_reference: None,
            active_out: None,
            active_in: None,
        };

        Ok(Self {
            shared: Arc::new(DeviceShared {
                backoff: RetryBackoff {
                    enabled: config.retry_backoff,
                },
                config,
                driver,
                converters,
                echo_references,
                sleeper,
                state: Mutex::new(state),
            }),
        })
    }

    pub fn config(&self) -> &HalConfig {
        &self.shared.config
    }

    pub fn init_check(&self) -> HalResult<()> {
        Ok(())
    }

    pub fn supported_devices(&self) -> DeviceMask {
        DeviceMask::supported()
    }

    pub fn devices(&self) -> DeviceMask {
        self.shared.lock_state().devices
    }

    /// Playback streams are stereo; a zero rate takes the port rate.
    pub fn open_output_stream(&self, config: &mut StreamConfig) -> HalResult<Arc<OutputStream>> {
        config.channels = self.shared.config.playback.channels;
        if config.sample_rate == 0 {
            config.sample_rate = self.shared.config.playback.rate;
        }
        log::info!(
            "open_output_stream: rate={}, channels={}",
            config.sample_rate,
            config.channels
        );
        Ok(OutputStream::new(
            self.shared.clone(),
            config.sample_rate,
            config.channels,
        ))
    }

    pub fn close_output_stream(&self, stream: Arc<OutputStream>) {
        log::info!("close_output_stream");
        stream.enter_standby();
    }

    /// Capture streams are mono only. Any other channel count is answered by
    /// rewriting `config` to mono and failing.
    pub fn open_input_stream(&self, config: &mut StreamConfig) -> HalResult<Arc<InputStream>> {
        if config.channels != 1 {
            log::warn!(
                "open_input_stream: {} channels requested, only mono is supported",
                config.channels
            );
            config.channels = 1;
            return Err(HalError::InvalidArgument(
                "capture streams must be mono".into(),
            ));
        }
        if config.sample_rate == 0 {
            config.sample_rate = self.shared.config.capture.rate;
        }
        log::info!("open_input_stream: rate={}", config.sample_rate);
        Ok(InputStream::new(
            self.shared.clone(),
            config.sample_rate,
            config.channels,
        ))
    }

    pub fn close_input_stream(&self, stream: Arc<InputStream>) {
        log::info!("close_input_stream");
        stream.enter_standby();
    }

    /// Accepts `orientation=<landscape|portrait|square>` and
    /// `screen_state=<on|off>`.
    pub fn set_parameters(&self, kvpairs: &str) -> HalResult<()> {
        log::debug!("set_parameters: {}", kvpairs);
        let parms = StrParms::parse(kvpairs);

        if let Some(value) = parms.get(PARAM_ORIENTATION) {
            let orientation = Orientation::from_param(value);
            let mut state = self.shared.lock_state();
            if orientation != state.orientation {
                state.orientation = orientation;
                // routes are not reapplied on input open, do it now
                state.apply_routes()?;
            }
        }

        if let Some(value) = parms.get(PARAM_SCREEN_STATE) {
            self.shared.lock_state().screen_off = value != VALUE_ON;
        }
        Ok(())
    }

    pub fn get_parameters(&self, _keys: &str) -> String {
        String::new()
    }

    pub fn set_voice_volume(&self, volume: f32) -> HalResult<()> {
        log::debug!("set_voice_volume: {}", volume);
        Err(HalError::Unsupported("voice volume"))
    }

    /// Drives the PCM playback volume on both channels.
    pub fn set_master_volume(&self, volume: f32) -> HalResult<()> {
        log::debug!("set_master_volume: {}", volume);
        let mut state = self.shared.lock_state();
        let ctl = state.controls.pcm_volume;
        let value = gain_to_control(volume, self.shared.config.gain_range_max);
        state.mixer.set_value(ctl, 0, value)?;
        state.mixer.set_value(ctl, 1, value)
    }

    pub fn set_mode(&self, mode: AudioMode) -> HalResult<()> {
        log::debug!("set_mode: {:?}", mode);
        self.shared.lock_state().mode = mode;
        Ok(())
    }

    pub fn mode(&self) -> AudioMode {
        self.shared.lock_state().mode
    }

    /// Muting also turns the mic capture switches off.
    pub fn set_mic_mute(&self, mute: bool) -> HalResult<()> {
        log::debug!("set_mic_mute: {}", mute);
        let mut state = self.shared.lock_state();
        state.mic_mute = mute;
        let switch = if mute { 0 } else { 1 };
        let (left, right) = (state.controls.mic_switch_left, state.controls.mic_switch_right);
        state.mixer.set_value(left, 0, switch)?;
        state.mixer.set_value(right, 0, switch)
    }

    pub fn mic_mute(&self) -> bool {
        self.shared.lock_state().mic_mute
    }

    /// Bytes per capture buffer at `config`: one port period scaled to the
    /// requested rate, rounded up to a multiple of 16 frames.
    pub fn input_buffer_size(&self, config: &StreamConfig) -> usize {
        input_buffer_bytes(&self.shared.config.capture, config.sample_rate, config.channels)
    }

    pub fn has_echo_reference(&self) -> bool {
        self.shared.lock_state().echo_reference.is_some()
    }
}

impl Drop for AudioDevice {
    fn drop(&mut self) {
        log::info!("Closing audio device: card {}", self.shared.config.card);
        let (out, input) = {
            let state = self.shared.lock_state();
            (state.active_out(), state.active_in())
        };
        if let Some(input) = input {
            input.enter_standby();
        }
        if let Some(out) = out {
            out.enter_standby();
        }
        self.shared.lock_state().mixer = Box::new(ClosedMixer);
    }
}

pub(crate) fn input_buffer_bytes(port: &PcmConfig, sample_rate: u32, channels: u32) -> usize {
    let frames = port.period_size * sample_rate as usize / port.rate.max(1) as usize;
    let frames = frames.div_ceil(16) * 16;
    frames * channels as usize * 2
}
