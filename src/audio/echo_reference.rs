//! Far-end reference signal shared between playback and capture.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::converter::{ConverterFactory, DEFAULT_QUALITY, RateConverter};
use super::error::{HalError, HalResult};

/// Channel count and rate of one side of an echo reference. Samples are
/// always 16-bit PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReferenceFormat {
    pub channels: u32,
    pub rate: u32,
}

/// Playback frames handed to the reference before conversion.
#[derive(Debug)]
pub struct EchoWriteBuffer<'a> {
    pub frames: &'a [i16],
    pub frame_count: usize,
    pub timestamp: Duration,
    /// Time until the last frame of `frames` is rendered
    pub delay_ns: i64,
}

/// Destination of a reference read. `frame_count` is the request on entry
/// and the frames delivered on return. `delay_ns` carries the capture delay
/// on entry and the total echo path delay on return.
#[derive(Debug)]
pub struct EchoReadBuffer<'a> {
    pub frames: &'a mut [i16],
    pub frame_count: usize,
    pub timestamp: Duration,
    pub delay_ns: i64,
}

pub trait EchoReference: Send {
    /// `None` signals that the writer stopped.
    fn write(&mut self, buffer: Option<&EchoWriteBuffer<'_>>) -> HalResult<()>;

    /// `None` signals that the reader stopped.
    fn read(&mut self, buffer: Option<&mut EchoReadBuffer<'_>>) -> HalResult<()>;
}

pub trait EchoReferenceFactory: Send + Sync {
    fn create(
        &self,
        read_format: EchoReferenceFormat,
        write_format: EchoReferenceFormat,
    ) -> HalResult<Box<dyn EchoReference>>;
}

/// Handle held by the device and the active output at the same time.
pub type SharedEchoReference = Arc<Mutex<Box<dyn EchoReference>>>;

/// One second of reference audio at most, older frames are dropped.
const MAX_BUFFERED_MS: usize = 1000;

/// In-process echo reference: a FIFO of reference frames stored in the read
/// format. Channel counts are adapted by keeping the first channel or
/// duplicating it; rates through an optional converter.
pub struct FifoEchoReference {
    read_format: EchoReferenceFormat,
    write_format: EchoReferenceFormat,
    converter: Option<Box<dyn RateConverter>>,
    fifo: VecDeque<i16>,
    scratch: Vec<i16>,
    converted: Vec<i16>,
    writing: bool,
    last_write_timestamp: Duration,
    last_write_delay_ns: i64,
}

impl FifoEchoReference {
    pub fn new(
        read_format: EchoReferenceFormat,
        write_format: EchoReferenceFormat,
        converter: Option<Box<dyn RateConverter>>,
    ) -> HalResult<Self> {
        if read_format.channels == 0 || write_format.channels == 0 {
            return Err(HalError::EchoReferenceCreateFailed(
                "zero channel count".into(),
            ));
        }
        if read_format.rate != write_format.rate && converter.is_none() {
            return Err(HalError::EchoReferenceCreateFailed(format!(
                "{} Hz -> {} Hz needs a converter",
                write_format.rate, read_format.rate
            )));
        }
        Ok(Self {
            read_format,
            write_format,
            converter,
            fifo: VecDeque::new(),
            scratch: Vec::new(),
            converted: Vec::new(),
            writing: false,
            last_write_timestamp: Duration::ZERO,
            last_write_delay_ns: 0,
        })
    }

    /// Frames currently queued for the reader.
    pub fn buffered_frames(&self) -> usize {
        self.fifo.len() / self.read_format.channels as usize
    }

    fn capacity_samples(&self) -> usize {
        self.read_format.rate as usize * MAX_BUFFERED_MS / 1000 * self.read_format.channels as usize
    }

    /// Re-channel `frames` (write channels) into `self.scratch` (read channels).
    fn adapt_channels(&mut self, frames: &[i16], frame_count: usize) {
        let in_ch = self.write_format.channels as usize;
        let out_ch = self.read_format.channels as usize;
        self.scratch.clear();
        self.scratch.reserve(frame_count * out_ch);
        for frame in frames.chunks_exact(in_ch).take(frame_count) {
            for ch in 0..out_ch {
                self.scratch.push(frame[ch.min(in_ch - 1)]);
            }
        }
    }

    fn push_samples(&mut self, samples_from_converted: bool) {
        let samples = if samples_from_converted {
            &self.converted
        } else {
            &self.scratch
        };
        self.fifo.extend(samples.iter().copied());
        let cap = self.capacity_samples();
        if self.fifo.len() > cap {
            let excess = self.fifo.len() - cap;
            // keep whole frames
            let excess = excess.div_ceil(self.read_format.channels as usize)
                * self.read_format.channels as usize;
            self.fifo.drain(..excess.min(self.fifo.len()));
        }
    }
}

impl EchoReference for FifoEchoReference {
    fn write(&mut self, buffer: Option<&EchoWriteBuffer<'_>>) -> HalResult<()> {
        let Some(buffer) = buffer else {
            log::debug!("echo reference: writer stopped");
            self.writing = false;
            self.fifo.clear();
            return Ok(());
        };

        self.writing = true;
        self.last_write_timestamp = buffer.timestamp;
        self.last_write_delay_ns = buffer.delay_ns;

        let frame_count = buffer
            .frame_count
            .min(buffer.frames.len() / self.write_format.channels as usize);
        self.adapt_channels(buffer.frames, frame_count);

        match self.converter.as_mut() {
            None => self.push_samples(false),
            Some(converter) => {
                let channels = self.read_format.channels as usize;
                let (in_rate, out_rate) = converter.rates();
                let out_capacity =
                    (frame_count as u64 * out_rate as u64).div_ceil(in_rate.max(1) as u64) as usize + 1;
                self.converted.resize(out_capacity * channels, 0);

                let mut in_frames = frame_count;
                let mut out_frames = out_capacity;
                converter.convert(
                    &self.scratch,
                    &mut in_frames,
                    &mut self.converted,
                    &mut out_frames,
                )?;
                self.converted.truncate(out_frames * channels);
                self.push_samples(true);
            }
        }
        Ok(())
    }

    fn read(&mut self, buffer: Option<&mut EchoReadBuffer<'_>>) -> HalResult<()> {
        let Some(buffer) = buffer else {
            log::debug!("echo reference: reader stopped");
            self.fifo.clear();
            return Ok(());
        };

        if !self.writing {
            buffer.frame_count = 0;
            return Err(HalError::Io("echo reference has no writer".into()));
        }

        let channels = self.read_format.channels as usize;
        let frames = buffer
            .frame_count
            .min(self.buffered_frames())
            .min(buffer.frames.len() / channels);
        for (dst, src) in buffer.frames.iter_mut().zip(self.fifo.drain(..frames * channels)) {
            *dst = src;
        }
        buffer.frame_count = frames;

        // the playback delay reported at write time shrinks by the time
        // elapsed until this capture timestamp
        let elapsed_ns = if buffer.timestamp.is_zero() || self.last_write_timestamp.is_zero() {
            0
        } else {
            buffer
                .timestamp
                .saturating_sub(self.last_write_timestamp)
                .as_nanos() as i64
        };
        let playback_ns = (self.last_write_delay_ns - elapsed_ns).max(0);
        buffer.delay_ns += playback_ns;
        Ok(())
    }
}

/// Builds [`FifoEchoReference`]s, with a rate converter from `converters`
/// when the two sides run at different rates.
pub struct FifoEchoReferenceFactory {
    converters: Arc<dyn ConverterFactory>,
}

impl FifoEchoReferenceFactory {
    pub fn new(converters: Arc<dyn ConverterFactory>) -> Self {
        Self { converters }
    }
}

impl EchoReferenceFactory for FifoEchoReferenceFactory {
    fn create(
        &self,
        read_format: EchoReferenceFormat,
        write_format: EchoReferenceFormat,
    ) -> HalResult<Box<dyn EchoReference>> {
        let converter = if read_format.rate != write_format.rate {
            let converter = self
                .converters
                .create(
                    write_format.rate,
                    read_format.rate,
                    read_format.channels,
                    DEFAULT_QUALITY,
                )
                .map_err(|e| HalError::EchoReferenceCreateFailed(e.to_string()))?;
            Some(converter)
        } else {
            None
        };
        log::info!(
            "Echo reference created: write {}ch/{}Hz -> read {}ch/{}Hz",
            write_format.channels,
            write_format.rate,
            read_format.channels,
            read_format.rate
        );
        Ok(Box::new(FifoEchoReference::new(read_format, write_format, converter)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::converter::NoConverters;

    fn mono(rate: u32) -> EchoReferenceFormat {
        EchoReferenceFormat { channels: 1, rate }
    }

    fn stereo(rate: u32) -> EchoReferenceFormat {
        EchoReferenceFormat { channels: 2, rate }
    }

    #[test]
    fn stereo_writes_are_read_back_as_first_channel() {
        let mut er = FifoEchoReference::new(mono(44100), stereo(44100), None).unwrap();
        let frames = [1, -1, 2, -2, 3, -3];
        er.write(Some(&EchoWriteBuffer {
            frames: &frames,
            frame_count: 3,
            timestamp: Duration::ZERO,
            delay_ns: 0,
        }))
        .unwrap();

        let mut out = [0i16; 3];
        let mut read = EchoReadBuffer {
            frames: &mut out,
            frame_count: 3,
            timestamp: Duration::ZERO,
            delay_ns: 0,
        };
        er.read(Some(&mut read)).unwrap();
        assert_eq!(read.frame_count, 3);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(er.buffered_frames(), 0);
    }

    #[test]
    fn read_delay_adds_remaining_playback_delay() {
        let mut er = FifoEchoReference::new(mono(8000), mono(8000), None).unwrap();
        er.write(Some(&EchoWriteBuffer {
            frames: &[0; 8],
            frame_count: 8,
            timestamp: Duration::from_millis(100),
            delay_ns: 30_000_000,
        }))
        .unwrap();

        let mut out = [0i16; 4];
        let mut read = EchoReadBuffer {
            frames: &mut out,
            frame_count: 4,
            timestamp: Duration::from_millis(110),
            delay_ns: 5_000_000,
        };
        er.read(Some(&mut read)).unwrap();
        assert_eq!(read.delay_ns, 25_000_000);
        assert_eq!(er.buffered_frames(), 4);
    }

    #[test]
    fn stopped_writer_yields_nothing() {
        let mut er = FifoEchoReference::new(mono(8000), mono(8000), None).unwrap();
        er.write(Some(&EchoWriteBuffer {
            frames: &[5; 4],
            frame_count: 4,
            timestamp: Duration::ZERO,
            delay_ns: 0,
        }))
        .unwrap();
        er.write(None).unwrap();

        let mut out = [0i16; 4];
        let mut read = EchoReadBuffer {
            frames: &mut out,
            frame_count: 4,
            timestamp: Duration::ZERO,
            delay_ns: 0,
        };
        assert!(er.read(Some(&mut read)).is_err());
        assert_eq!(read.frame_count, 0);
    }

    #[test]
    fn fifo_is_bounded() {
        let mut er = FifoEchoReference::new(mono(1000), mono(1000), None).unwrap();
        let frames = vec![1i16; 600];
        for _ in 0..3 {
            er.write(Some(&EchoWriteBuffer {
                frames: &frames,
                frame_count: frames.len(),
                timestamp: Duration::ZERO,
                delay_ns: 0,
            }))
            .unwrap();
        }
        assert_eq!(er.buffered_frames(), 1000);
    }

    #[test]
    fn rate_mismatch_without_resampler_fails() {
        let factory = FifoEchoReferenceFactory::new(Arc::new(NoConverters));
        assert!(matches!(
            factory.create(mono(16000), stereo(44100)),
            Err(HalError::EchoReferenceCreateFailed(_))
        ));
        assert!(factory.create(mono(44100), stereo(44100)).is_ok());
    }
}
