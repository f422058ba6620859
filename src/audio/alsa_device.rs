//! ALSA-backed PCM ports for playback and capture.

use std::time::Duration;

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use nix::libc;

use super::error::{HalError, HalResult};
use super::pcm::{BufferDepth, PcmConfig, PcmDirection, PcmDriver, PcmPort, PortId};

/// Opens `{prefix}:{card},{device}` ports, e.g. `hw:0,1` for SCO.
#[derive(Debug, Clone)]
pub struct AlsaDriver {
    prefix: String,
}

impl AlsaDriver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn device_name(&self, card: u32, port: PortId) -> String {
        format!("{}:{},{}", self.prefix, card, port.device_number())
    }
}

fn io_error(context: &str, e: alsa::Error) -> HalError {
    if e.errno() == libc::EPIPE {
        HalError::Underrun
    } else {
        HalError::Io(format!("{}: {}", context, e))
    }
}

/// `config` with the period geometry the hardware settled on.
fn negotiated(config: &PcmConfig, period_size: usize, buffer_frames: usize) -> PcmConfig {
    let mut granted = *config;
    if period_size > 0 {
        granted.period_size = period_size;
        granted.period_count = buffer_frames / period_size;
    }
    granted
}

/// Open and configure a PCM. Returns it with the period and buffer sizes the
/// hardware actually granted.
fn open_pcm(
    name: &str,
    port: PortId,
    direction: PcmDirection,
    config: &PcmConfig,
) -> alsa::Result<(PCM, PcmConfig, usize)> {
    let dir = match direction {
        PcmDirection::Playback => Direction::Playback,
        PcmDirection::Capture => Direction::Capture,
    };
    let pcm = PCM::new(name, dir, false)?;

    {
        let hwp = HwParams::any(&pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::s16())?;
        hwp.set_channels(config.channels)?;
        hwp.set_rate(config.rate, ValueOr::Nearest)?;
        hwp.set_period_size_near(config.period_size as alsa::pcm::Frames, ValueOr::Nearest)?;
        hwp.set_buffer_size_near(config.buffer_frames() as alsa::pcm::Frames)?;
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let (period_size, buffer_frames) = {
        let hwp = pcm.hw_params_current()?;
        (hwp.get_period_size()? as usize, hwp.get_buffer_size()? as usize)
    };
    let granted = negotiated(config, period_size, buffer_frames);

    {
        let swp = pcm.sw_params_current()?;
        if config.start_threshold > 0 {
            swp.set_start_threshold(config.start_threshold as alsa::pcm::Frames)?;
        }
        if config.stop_threshold > 0 {
            swp.set_stop_threshold(config.stop_threshold as alsa::pcm::Frames)?;
        }
        swp.set_tstamp_mode(true)?;
        pcm.sw_params(&swp)?;
    }
    pcm.prepare()?;

    if period_size != config.period_size || buffer_frames != config.buffer_frames() {
        log::warn!(
            "ALSA {}: asked for {}x{} frames, got period={} buffer={}",
            name,
            config.period_size,
            config.period_count,
            period_size,
            buffer_frames,
        );
    }
    log::info!(
        "ALSA {:?} {:?}: device={}, rate={}, channels={}, period_size={}, buffer={}",
        port,
        direction,
        name,
        config.rate,
        config.channels,
        period_size,
        buffer_frames,
    );
    Ok((pcm, granted, buffer_frames))
}

impl PcmDriver for AlsaDriver {
    fn open(
        &self,
        card: u32,
        port: PortId,
        direction: PcmDirection,
        config: &PcmConfig,
    ) -> HalResult<Box<dyn PcmPort>> {
        let name = self.device_name(card, port);
        let (pcm, granted, buffer_frames) = open_pcm(&name, port, direction, config).map_err(|e| {
            log::error!("Failed to open PCM device '{}': {}", name, e);
            HalError::PortOpenFailed {
                port,
                reason: e.to_string(),
            }
        })?;
        Ok(Box::new(AlsaPort {
            pcm,
            config: granted,
            buffer_frames,
        }))
    }
}

struct AlsaPort {
    pcm: PCM,
    /// Requested format with the period geometry the hardware granted
    config: PcmConfig,
    buffer_frames: usize,
}

impl AlsaPort {
    fn recover(&self, context: &str, e: alsa::Error) -> HalError {
        if let Err(e2) = self.pcm.prepare() {
            log::error!("{}: prepare after error failed: {}", context, e2);
        }
        io_error(context, e)
    }
}

impl PcmPort for AlsaPort {
    fn config(&self) -> &PcmConfig {
        &self.config
    }

    fn read(&mut self, buf: &mut [i16]) -> HalResult<()> {
        let channels = self.config.channels as usize;
        let frames = buf.len() / channels;
        let mut done = 0;
        while done < frames {
            let io = self.pcm.io_i16().map_err(|e| io_error("capture io", e))?;
            match io.readi(&mut buf[done * channels..frames * channels]) {
                Ok(n) => done += n,
                // overrun: reprepare and report, the caller backs off
                Err(e) => return Err(self.recover("readi", e)),
            }
        }
        Ok(())
    }

    fn write(&mut self, buf: &[i16]) -> HalResult<()> {
        let channels = self.config.channels as usize;
        let frames = buf.len() / channels;
        let mut done = 0;
        while done < frames {
            let io = self.pcm.io_i16().map_err(|e| io_error("playback io", e))?;
            match io.writei(&buf[done * channels..frames * channels]) {
                Ok(n) => done += n,
                Err(e) => return Err(self.recover("writei", e)),
            }
        }
        Ok(())
    }

    fn buffer_depth(&mut self) -> HalResult<BufferDepth> {
        let status = self.pcm.status().map_err(|e| io_error("status", e))?;
        let ts = status.get_htstamp();
        if ts.tv_sec == 0 && ts.tv_nsec == 0 {
            return Err(HalError::HardwareTimestampUnavailable);
        }
        Ok(BufferDepth {
            avail: status.get_avail().max(0) as usize,
            timestamp: Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32),
        })
    }

    fn capacity(&self) -> usize {
        self.buffer_frames
    }
}
