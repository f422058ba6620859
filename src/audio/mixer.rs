//! Codec gain controls and the static output route tables.

use super::devices::DeviceMask;
use super::error::{HalError, HalResult};

pub const MIXER_PCM_PLAYBACK_VOLUME: &str = "PCM Playback Volume";
pub const MIXER_HEADSET_PLAYBACK_VOLUME: &str = "Headphone Playback Volume";
pub const MIXER_SPEAKER_PLAYBACK_VOLUME: &str = "Speaker Playback Volume";
pub const MIXER_MIC_CAPTURE_VOLUME: &str = "Mic 2 Capture Volume";

pub const MIXER_HEADSET_PLAYBACK_SWITCH: &str = "Headphone Playback Switch";
pub const MIXER_SPEAKER_PLAYBACK_SWITCH: &str = "Speaker Playback Switch";
pub const MIXER_MIC_LEFT_CAPTURE_SWITCH: &str = "Left Record Mixer Mic2L Capture Switch";
pub const MIXER_MIC_RIGHT_CAPTURE_SWITCH: &str = "Right Record Mixer Mic2R Capture Switch";

pub const HEADPHONE_JACK_SWITCH: &str = "Headphone Jack Switch";
pub const INTERNAL_SPEAKER_SWITCH: &str = "Internal Speaker Switch";
pub const INTERNAL_MIC_SWITCH: &str = "Internal Mic Switch";

/// Handle of a resolved mixer control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MixerCtl(pub usize);

/// Named hardware controls of the codec.
pub trait Mixer: Send {
    fn find(&self, name: &str) -> Option<MixerCtl>;
    /// Number of values (sub-channels) of the control.
    fn num_values(&self, ctl: MixerCtl) -> usize;
    fn set_value(&mut self, ctl: MixerCtl, index: usize, value: i32) -> HalResult<()>;
    fn set_enum(&mut self, ctl: MixerCtl, item: &str) -> HalResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteValue {
    Int(i32),
    Enum(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSetting {
    pub ctl_name: &'static str,
    pub value: RouteValue,
}

const fn int(ctl_name: &'static str, value: i32) -> RouteSetting {
    RouteSetting {
        ctl_name,
        value: RouteValue::Int(value),
    }
}

/// Values that never change after the device is opened. Volumes are filled
/// in with the configured full-scale gain by [`default_route`].
pub const DEFAULT_SWITCHES: &[RouteSetting] = &[
    int(MIXER_HEADSET_PLAYBACK_SWITCH, 0),
    int(HEADPHONE_JACK_SWITCH, 0),
    int(MIXER_SPEAKER_PLAYBACK_SWITCH, 1),
    int(INTERNAL_SPEAKER_SWITCH, 0),
    int(MIXER_MIC_LEFT_CAPTURE_SWITCH, 1),
    int(MIXER_MIC_RIGHT_CAPTURE_SWITCH, 1),
    int(INTERNAL_MIC_SWITCH, 1),
];

pub fn default_route(gain_range_max: i32) -> Vec<RouteSetting> {
    let mut route = vec![
        int(MIXER_PCM_PLAYBACK_VOLUME, gain_range_max),
        int(MIXER_HEADSET_PLAYBACK_VOLUME, gain_range_max),
        int(MIXER_SPEAKER_PLAYBACK_VOLUME, gain_range_max),
        int(MIXER_MIC_CAPTURE_VOLUME, gain_range_max),
    ];
    route.extend_from_slice(DEFAULT_SWITCHES);
    route
}

pub const HEADPHONE_ROUTE: &[RouteSetting] = &[
    int(HEADPHONE_JACK_SWITCH, 1),
    int(MIXER_HEADSET_PLAYBACK_SWITCH, 1),
    int(INTERNAL_SPEAKER_SWITCH, 0),
    int(MIXER_SPEAKER_PLAYBACK_SWITCH, 0),
];

pub const SPEAKER_ROUTE: &[RouteSetting] = &[
    int(HEADPHONE_JACK_SWITCH, 0),
    int(MIXER_HEADSET_PLAYBACK_SWITCH, 0),
    int(INTERNAL_SPEAKER_SWITCH, 1),
    int(MIXER_SPEAKER_PLAYBACK_SWITCH, 1),
];

pub const SPEAKER_HEADPHONE_ROUTE: &[RouteSetting] = &[
    int(HEADPHONE_JACK_SWITCH, 1),
    int(MIXER_HEADSET_PLAYBACK_SWITCH, 1),
    int(INTERNAL_SPEAKER_SWITCH, 1),
    int(MIXER_SPEAKER_PLAYBACK_SWITCH, 1),
];

pub const NO_OUT_ROUTE: &[RouteSetting] = &[
    int(HEADPHONE_JACK_SWITCH, 0),
    int(MIXER_HEADSET_PLAYBACK_SWITCH, 0),
    int(INTERNAL_SPEAKER_SWITCH, 0),
    int(MIXER_SPEAKER_PLAYBACK_SWITCH, 0),
];

/// Walk `route` and apply every entry. With `enable == false` integers are
/// driven to 0 and enumerations to "Off". Stops at the first unknown control;
/// entries before it stay applied.
pub fn set_route_by_array(
    mixer: &mut dyn Mixer,
    route: &[RouteSetting],
    enable: bool,
) -> HalResult<()> {
    for setting in route {
        let ctl = mixer
            .find(setting.ctl_name)
            .ok_or_else(|| HalError::ControlNotFound(setting.ctl_name.to_string()))?;

        match setting.value {
            RouteValue::Enum(item) => {
                mixer.set_enum(ctl, if enable { item } else { "Off" })?;
            }
            RouteValue::Int(value) => {
                // multi-valued (stereo) controls move together
                for index in 0..mixer.num_values(ctl) {
                    mixer.set_value(ctl, index, if enable { value } else { 0 })?;
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRoute {
    None,
    Speaker,
    Headphone,
    SpeakerHeadphone,
}

impl OutputRoute {
    pub fn from_devices(devices: DeviceMask) -> Self {
        let speaker = devices.intersects(DeviceMask::OUT_SPEAKER);
        let headphone = devices.intersects(DeviceMask::OUT_WIRED_HEADPHONE);
        match (speaker, headphone) {
            (false, false) => OutputRoute::None,
            (true, false) => OutputRoute::Speaker,
            (false, true) => OutputRoute::Headphone,
            (true, true) => OutputRoute::SpeakerHeadphone,
        }
    }

    pub fn table(self) -> &'static [RouteSetting] {
        match self {
            OutputRoute::None => NO_OUT_ROUTE,
            OutputRoute::Speaker => SPEAKER_ROUTE,
            OutputRoute::Headphone => HEADPHONE_ROUTE,
            OutputRoute::SpeakerHeadphone => SPEAKER_HEADPHONE_ROUTE,
        }
    }
}

/// Switch between speaker and headphone according to `devices`.
pub fn select_devices(mixer: &mut dyn Mixer, devices: DeviceMask) -> HalResult<OutputRoute> {
    let route = OutputRoute::from_devices(devices);
    set_route_by_array(mixer, route.table(), true)?;

    log::debug!(
        "Headphone out:{}, Speaker out:{}, HDMI out:{}, BT out:{}",
        yes_no(devices.intersects(DeviceMask::OUT_WIRED_HEADPHONE)),
        yes_no(devices.intersects(DeviceMask::OUT_SPEAKER)),
        yes_no(devices.intersects(DeviceMask::OUT_AUX_DIGITAL)),
        yes_no(devices.intersects(DeviceMask::OUT_ALL_SCO)),
    );
    Ok(route)
}

fn yes_no(flag: bool) -> char {
    if flag { 'Y' } else { 'N' }
}

/// Controls driven directly by volume, gain and mute requests.
#[derive(Debug, Clone, Copy)]
pub struct MixerControls {
    pub pcm_volume: MixerCtl,
    pub headset_volume: MixerCtl,
    pub speaker_volume: MixerCtl,
    pub mic_volume: MixerCtl,
    pub mic_switch_left: MixerCtl,
    pub mic_switch_right: MixerCtl,
}

impl MixerControls {
    pub fn resolve(mixer: &dyn Mixer) -> HalResult<Self> {
        let find = |name: &str| {
            mixer.find(name).ok_or_else(|| {
                log::error!("Unable to find '{}' mixer control", name);
                HalError::ControlNotFound(name.to_string())
            })
        };
        Ok(Self {
            mic_volume: find(MIXER_MIC_CAPTURE_VOLUME)?,
            pcm_volume: find(MIXER_PCM_PLAYBACK_VOLUME)?,
            headset_volume: find(MIXER_HEADSET_PLAYBACK_VOLUME)?,
            speaker_volume: find(MIXER_SPEAKER_PLAYBACK_VOLUME)?,
            mic_switch_left: find(MIXER_MIC_LEFT_CAPTURE_SWITCH)?,
            mic_switch_right: find(MIXER_MIC_RIGHT_CAPTURE_SWITCH)?,
        })
    }
}

/// Map a 0..1 gain onto the codec's integer range.
pub fn gain_to_control(gain: f32, gain_range_max: i32) -> i32 {
    (gain.clamp(0.0, 1.0) * gain_range_max as f32) as i32
}
