//! audio - Adaptive low-latency audio I/O core
//!
//! Sits between application streams and a fixed-period kernel PCM driver.
//! Handles stream standby, rate conversion, echo reference delivery to the
//! capture preprocessors, and adaptive playback write pacing. ALSA and
//! SpeexDSP backends are behind the `alsa` and `speex` features.

use std::sync::{Mutex, MutexGuard, PoisonError};

mod audio_system;
mod backoff;
mod converter;
mod device;
mod devices;
mod echo_reference;
mod error;
mod mixer;
mod pace;
mod params;
mod pcm;
mod preprocess;
mod stream;
mod stream_in;
mod stream_out;

#[cfg(feature = "alsa")]
mod alsa_device;
#[cfg(feature = "alsa")]
mod alsa_mixer;
#[cfg(feature = "speex")]
mod speex;

pub use audio_system::{AudioSystem, LevelReport, SessionOptions};
pub use backoff::{RetryBackoff, Sleeper, ThreadSleeper};
pub use converter::{BufferProvider, ConverterFactory, DEFAULT_QUALITY, NoConverters, RateConverter};
pub use device::{AudioDevice, Backend, StreamConfig};
pub use devices::{AudioMode, DeviceMask, Orientation};
pub use echo_reference::{
    EchoReadBuffer, EchoReference, EchoReferenceFactory, EchoReferenceFormat, EchoWriteBuffer,
    FifoEchoReference, FifoEchoReferenceFactory, SharedEchoReference,
};
pub use error::{HalError, HalResult};
pub use mixer::{
    Mixer, MixerControls, MixerCtl, OutputRoute, RouteSetting, RouteValue, default_route,
    select_devices, set_route_by_array,
};
pub use pace::{BufferType, PaceController, PaceParams, PaceReport};
pub use params::{PARAM_ORIENTATION, PARAM_ROUTING, PARAM_SCREEN_STATE, StrParms};
pub use pcm::{
    BufferDepth, PcmConfig, PcmDirection, PcmDriver, PcmPort, PortId, frames_to_ns, rates_conflict,
};
pub use preprocess::{
    AudioEffect, EFFECT_TYPE_AEC, EFFECT_TYPE_AGC, EFFECT_TYPE_NS, EffectDescriptor, EffectHandle,
    EffectParam, MAX_PREPROCESSORS,
};
pub use stream::{AudioStream, CaptureEndpoint, PlaybackEndpoint, SampleFormat};
pub use stream_in::InputStream;
pub use stream_out::OutputStream;

#[cfg(feature = "alsa")]
pub use alsa_device::AlsaDriver;
#[cfg(feature = "alsa")]
pub use alsa_mixer::AlsaMixer;
#[cfg(feature = "speex")]
pub use speex::{SpeexConverterFactory, SpeexEchoCanceller, SpeexPreprocessor};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
