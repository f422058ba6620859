//! Rate converter capability and the pull-style buffer provider protocol.

use super::error::{HalError, HalResult};

/// Quality handed to [`ConverterFactory::create`] by the endpoints.
pub const DEFAULT_QUALITY: u32 = 4;

/// Source of input frames for a pull-style conversion.
pub trait BufferProvider {
    /// View of at most `max_frames` interleaved frames. May return fewer.
    fn next_buffer(&mut self, max_frames: usize) -> HalResult<&[i16]>;

    /// Mark `frames` of the last view as consumed.
    fn release_buffer(&mut self, frames: usize);
}

/// A sample-rate converter instance. Released on drop.
pub trait RateConverter: Send {
    fn channels(&self) -> u32;

    /// `(in_rate, out_rate)`
    fn rates(&self) -> (u32, u32);

    /// Push-style conversion. On return `in_frames` holds the frames consumed
    /// and `out_frames` the frames produced.
    fn convert(
        &mut self,
        input: &[i16],
        in_frames: &mut usize,
        output: &mut [i16],
        out_frames: &mut usize,
    ) -> HalResult<()>;

    /// Delay introduced by the converter's internal buffering.
    fn delay_ns(&self) -> i64;

    /// Pull-style conversion drawing from `provider` until `frames` output
    /// frames are produced. On return `frames` holds the frames produced; the
    /// remainder of `output` is zeroed if the provider fails.
    fn convert_from_provider(
        &mut self,
        provider: &mut dyn BufferProvider,
        output: &mut [i16],
        frames: &mut usize,
    ) -> HalResult<()> {
        let channels = self.channels() as usize;
        let (in_rate, out_rate) = self.rates();
        let wanted = *frames;
        let mut produced = 0;

        while produced < wanted {
            let remaining = wanted - produced;
            let needed = (remaining as u64 * in_rate as u64).div_ceil(out_rate.max(1) as u64) as usize + 1;

            let result = provider.next_buffer(needed).and_then(|input| {
                let mut in_frames = input.len() / channels;
                let mut out_frames = remaining;
                self.convert(
                    input,
                    &mut in_frames,
                    &mut output[produced * channels..wanted * channels],
                    &mut out_frames,
                )?;
                Ok((in_frames, out_frames))
            });

            match result {
                Ok((consumed, made)) => {
                    provider.release_buffer(consumed);
                    if consumed == 0 && made == 0 {
                        output[produced * channels..wanted * channels].fill(0);
                        *frames = produced;
                        return Err(HalError::Io("rate converter made no progress".into()));
                    }
                    produced += made;
                }
                Err(e) => {
                    output[produced * channels..wanted * channels].fill(0);
                    *frames = produced;
                    return Err(e);
                }
            }
        }

        *frames = produced;
        Ok(())
    }
}

pub trait ConverterFactory: Send + Sync {
    fn create(
        &self,
        in_rate: u32,
        out_rate: u32,
        channels: u32,
        quality: u32,
    ) -> HalResult<Box<dyn RateConverter>>;
}

/// Factory for hosts without a resampler. Any request fails, so endpoints
/// only work at the port rates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoConverters;

impl ConverterFactory for NoConverters {
    fn create(
        &self,
        in_rate: u32,
        out_rate: u32,
        _channels: u32,
        _quality: u32,
    ) -> HalResult<Box<dyn RateConverter>> {
        Err(HalError::ConverterCreateFailed(format!(
            "no resampler available for {} -> {} Hz",
            in_rate, out_rate
        )))
    }
}
