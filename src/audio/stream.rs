//! Stream-facing capability sets shared by the playback and capture endpoints.

use super::error::{HalError, HalResult};
use super::preprocess::EffectHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Signed 16-bit, native endianness
    Pcm16,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Pcm16 => 2,
        }
    }
}

pub trait AudioStream: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// The negotiated rate is fixed for the life of the stream.
    fn set_sample_rate(&self, _rate: u32) -> HalResult<()> {
        Err(HalError::Unsupported("set_sample_rate"))
    }

    fn format(&self) -> SampleFormat {
        SampleFormat::Pcm16
    }

    fn set_format(&self, _format: SampleFormat) -> HalResult<()> {
        Err(HalError::Unsupported("set_format"))
    }

    fn channels(&self) -> u32;

    /// Bytes per application buffer.
    fn buffer_size(&self) -> usize;

    fn frame_size(&self) -> usize {
        self.channels() as usize * self.format().bytes_per_sample()
    }

    fn standby(&self);

    fn is_standby(&self) -> bool;

    fn set_parameters(&self, kvpairs: &str) -> HalResult<()>;

    fn get_parameters(&self, _keys: &str) -> String {
        String::new()
    }
}

pub trait PlaybackEndpoint: AudioStream {
    /// Write interleaved frames. Always reports the whole buffer as
    /// consumed, even when the port failed.
    fn write(&self, frames: &[i16]) -> HalResult<usize>;

    fn latency_ms(&self) -> u32;

    fn set_volume(&self, left: f32, right: f32) -> HalResult<()>;

    fn render_position(&self) -> HalResult<u32> {
        Err(HalError::Unsupported("render_position"))
    }
}

pub trait CaptureEndpoint: AudioStream {
    /// Fill `frames` completely. Failures and mute produce silence.
    fn read(&self, frames: &mut [i16]) -> HalResult<usize>;

    fn set_gain(&self, gain: f32) -> HalResult<()>;

    fn add_preprocessor(&self, effect: EffectHandle) -> HalResult<()>;

    fn remove_preprocessor(&self, effect: &EffectHandle) -> HalResult<()>;

    fn input_frames_lost(&self) -> u32 {
        0
    }
}
