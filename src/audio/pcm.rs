//! Capability traits for the fixed-period kernel PCM driver.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::HalResult;

/// Geometry of a hardware port. Fixed per port type, never per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmConfig {
    pub channels: u32,
    pub rate: u32,
    /// Period size in frames
    pub period_size: usize,
    pub period_count: usize,
    /// 0 = driver default
    pub start_threshold: usize,
    /// 0 = driver default
    pub stop_threshold: usize,
}

impl PcmConfig {
    /// Total ring buffer size in frames.
    pub fn buffer_frames(&self) -> usize {
        self.period_size * self.period_count
    }
}

/// Sub-devices of the sound card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortId {
    /// Codec port (speaker / headphone / built-in mic)
    Main,
    /// Bluetooth SCO / cellular voice port
    Sco,
    /// S/PDIF (HDMI) port
    Spdif,
}

impl PortId {
    pub fn device_number(self) -> u32 {
        match self {
            PortId::Main => 0,
            PortId::Sco => 1,
            PortId::Spdif => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmDirection {
    Playback,
    Capture,
}

/// Result of a hardware buffer level query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferDepth {
    /// Frames available to the application: free space on playback,
    /// frames ready to read on capture.
    pub avail: usize,
    /// Monotonic hardware timestamp of the measurement
    pub timestamp: Duration,
}

/// An open PCM port. Closing happens on drop.
pub trait PcmPort: Send {
    fn config(&self) -> &PcmConfig;

    /// Blocking read filling `buf` completely (interleaved, port channels).
    fn read(&mut self, buf: &mut [i16]) -> HalResult<()>;

    /// Blocking write of the whole of `buf`. Reports `HalError::Underrun`
    /// separately from other failures.
    fn write(&mut self, buf: &[i16]) -> HalResult<()>;

    /// Fails with `HalError::HardwareTimestampUnavailable` when the driver
    /// cannot report it.
    fn buffer_depth(&mut self) -> HalResult<BufferDepth>;

    /// Ring buffer capacity in frames.
    fn capacity(&self) -> usize;
}

pub trait PcmDriver: Send + Sync {
    fn open(
        &self,
        card: u32,
        port: PortId,
        direction: PcmDirection,
        config: &PcmConfig,
    ) -> HalResult<Box<dyn PcmPort>>;
}

/// Two rates conflict when the clock group of `rate` cannot serve `other`:
/// group 1 is 11.025/22.05/44.1 kHz, group 2 is 8/16/32/48 kHz.
pub fn rates_conflict(rate: u32, other: u32) -> bool {
    (rate % 8000 == 0 && other % 8000 != 0) || (rate % 11025 == 0 && other % 11025 != 0)
}

pub fn frames_to_ns(frames: usize, rate: u32) -> i64 {
    if rate == 0 {
        return 0;
    }
    (frames as i64 * 1_000_000_000) / rate as i64
}

pub fn frames_to_duration(frames: usize, rate: u32) -> Duration {
    Duration::from_nanos(frames_to_ns(frames, rate).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sco_and_main_rates_conflict_both_ways() {
        assert!(rates_conflict(8000, 44100));
        assert!(rates_conflict(44100, 8000));
        assert!(rates_conflict(44100, 16000));
    }

    #[test]
    fn same_group_rates_do_not_conflict() {
        assert!(!rates_conflict(44100, 22050));
        assert!(!rates_conflict(8000, 48000));
        assert!(!rates_conflict(44100, 44100));
    }

    #[test]
    fn frame_durations() {
        assert_eq!(frames_to_ns(44100, 44100), 1_000_000_000);
        assert_eq!(frames_to_duration(441, 44100), Duration::from_millis(10));
        assert_eq!(frames_to_ns(10, 0), 0);
    }
}
