//! Playback write pacing.
//!
//! Before each write the controller sleeps until the kernel buffer drains to
//! the current write threshold, then moves that threshold toward the target
//! picked by the buffer type (short periods with the screen on or capture
//! running, long periods otherwise).

use std::time::Duration;

use super::backoff::Sleeper;
use super::pcm::PcmPort;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferType {
    /// Set on leaving standby; the next classification also resets the
    /// current threshold.
    #[default]
    Unknown,
    Short,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaceParams {
    pub period_size: usize,
    pub rate: u32,
    pub short_period_count: usize,
    pub long_period_count: usize,
    /// Below this a sleep is not worth issuing
    pub min_sleep: Duration,
    /// Total sleep allowed in one write call
    pub max_sleep: Duration,
}

impl PaceParams {
    fn quarter_period(&self) -> usize {
        self.period_size / 4
    }
}

/// What one pacing pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaceReport {
    pub slept: Duration,
    /// Last measured kernel fill, `None` when the query failed
    pub kernel_frames: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct PaceController {
    params: PaceParams,
    buffer_type: BufferType,
    write_threshold: usize,
    cur_write_threshold: usize,
}

impl PaceController {
    pub fn new(params: PaceParams) -> Self {
        let write_threshold = params.period_size * params.short_period_count;
        Self {
            params,
            buffer_type: BufferType::Unknown,
            write_threshold,
            cur_write_threshold: write_threshold,
        }
    }

    pub fn params(&self) -> &PaceParams {
        &self.params
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    pub fn write_threshold(&self) -> usize {
        self.write_threshold
    }

    pub fn cur_write_threshold(&self) -> usize {
        self.cur_write_threshold
    }

    /// Forget the buffer type; called whenever the main port is (re)opened.
    pub fn reset(&mut self) {
        self.buffer_type = BufferType::Unknown;
    }

    /// Apply a new classification. The target moves immediately; the current
    /// threshold only jumps when coming out of standby.
    pub fn set_buffer_type(&mut self, buffer_type: BufferType) {
        if buffer_type == self.buffer_type || buffer_type == BufferType::Unknown {
            return;
        }
        let period_count = match buffer_type {
            BufferType::Long => self.params.long_period_count,
            _ => self.params.short_period_count,
        };
        self.write_threshold = self.params.period_size * period_count;
        if self.buffer_type == BufferType::Unknown {
            self.cur_write_threshold = self.write_threshold;
        }
        log::debug!(
            "buffer type {:?} -> {:?}, write threshold {}",
            self.buffer_type,
            buffer_type,
            self.write_threshold
        );
        self.buffer_type = buffer_type;
    }

    /// Hold the caller until at most `cur_write_threshold` frames are queued
    /// in the kernel, then step the threshold. A failed buffer query ends the
    /// pass without touching the thresholds.
    pub fn pace(&mut self, port: &mut dyn PcmPort, sleeper: &dyn Sleeper) -> PaceReport {
        let rate = self.params.rate.max(1) as u64;
        let mut slept = Duration::ZERO;
        let mut kernel_frames;

        loop {
            let depth = match port.buffer_depth() {
                Ok(depth) => depth,
                Err(e) => {
                    log::trace!("pacing skipped: {}", e);
                    return PaceReport { slept, kernel_frames: None };
                }
            };
            kernel_frames = port.capacity().saturating_sub(depth.avail);

            if kernel_frames <= self.cur_write_threshold {
                break;
            }

            let excess = (kernel_frames - self.cur_write_threshold) as u64;
            let mut sleep_time = Duration::from_micros(excess * 1_000_000 / rate);
            if sleep_time < self.params.min_sleep {
                break;
            }

            let remaining = self.params.max_sleep.saturating_sub(slept);
            if sleep_time >= remaining {
                log::warn!(
                    "write pacing limited: {:?} requested, {:?} left",
                    slept + sleep_time,
                    remaining
                );
                sleep_time = remaining;
            }
            if !sleep_time.is_zero() {
                sleeper.sleep(sleep_time);
            }
            slept += sleep_time;
            if slept >= self.params.max_sleep {
                break;
            }
        }

        self.step_threshold(kernel_frames);
        PaceReport {
            slept,
            kernel_frames: Some(kernel_frames),
        }
    }

    /// Move `cur_write_threshold` a quarter period toward the target, or snap
    /// it just above the measured fill when the kernel buffer ran far below
    /// target.
    fn step_threshold(&mut self, kernel_frames: usize) {
        let step = self.params.quarter_period();
        let period = self.params.period_size.max(1);

        if self.cur_write_threshold > self.write_threshold {
            self.cur_write_threshold = self
                .cur_write_threshold
                .saturating_sub(step)
                .max(self.write_threshold);
        } else if self.cur_write_threshold < self.write_threshold {
            self.cur_write_threshold = (self.cur_write_threshold + step).min(self.write_threshold);
        } else if kernel_frames < self.write_threshold
            && self.write_threshold - kernel_frames > period * self.params.short_period_count
        {
            self.cur_write_threshold = (kernel_frames / period + 1) * period + step;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use proptest::prelude::*;

    use super::*;
    use crate::audio::error::{HalError, HalResult};
    use crate::audio::pcm::{BufferDepth, PcmConfig};

    const PERIOD: usize = 880;

    fn params() -> PaceParams {
        PaceParams {
            period_size: PERIOD,
            rate: 44100,
            short_period_count: 2,
            long_period_count: 8,
            min_sleep: Duration::from_micros(2000),
            max_sleep: Duration::from_micros(39909),
        }
    }

    /// Port whose fill level never changes, or whose queries fail.
    struct FixedFill {
        config: PcmConfig,
        kernel_frames: usize,
        broken: bool,
    }

    impl FixedFill {
        fn new(kernel_frames: usize) -> Self {
            Self {
                config: PcmConfig {
                    channels: 2,
                    rate: 44100,
                    period_size: PERIOD,
                    period_count: 8,
                    start_threshold: PERIOD * 2,
                    stop_threshold: 0,
                },
                kernel_frames,
                broken: false,
            }
        }
    }

    impl PcmPort for FixedFill {
        fn config(&self) -> &PcmConfig {
            &self.config
        }

        fn read(&mut self, _buf: &mut [i16]) -> HalResult<()> {
            Ok(())
        }

        fn write(&mut self, _buf: &[i16]) -> HalResult<()> {
            Ok(())
        }

        fn buffer_depth(&mut self) -> HalResult<BufferDepth> {
            if self.broken {
                return Err(HalError::HardwareTimestampUnavailable);
            }
            Ok(BufferDepth {
                avail: self.capacity().saturating_sub(self.kernel_frames),
                timestamp: Duration::from_millis(1),
            })
        }

        fn capacity(&self) -> usize {
            self.config.buffer_frames()
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Duration>>);

    impl Recorder {
        fn total(&self) -> Duration {
            self.0.lock().unwrap().iter().sum()
        }
    }

    impl Sleeper for Recorder {
        fn sleep(&self, duration: Duration) {
            self.0.lock().unwrap().push(duration);
        }
    }

    #[test]
    fn leaving_standby_resets_current_threshold() {
        let mut pace = PaceController::new(params());
        pace.set_buffer_type(BufferType::Long);
        assert_eq!(pace.write_threshold(), PERIOD * 8);
        assert_eq!(pace.cur_write_threshold(), PERIOD * 8);

        // later switches only move the target
        pace.set_buffer_type(BufferType::Short);
        assert_eq!(pace.write_threshold(), PERIOD * 2);
        assert_eq!(pace.cur_write_threshold(), PERIOD * 8);

        pace.reset();
        pace.set_buffer_type(BufferType::Short);
        assert_eq!(pace.cur_write_threshold(), PERIOD * 2);
    }

    #[test]
    fn small_excess_is_not_slept() {
        let mut pace = PaceController::new(params());
        pace.set_buffer_type(BufferType::Short);
        // 50 frames over threshold is ~1.1 ms, under the 2 ms floor
        let mut port = FixedFill::new(PERIOD * 2 + 50);
        let sleeper = Recorder::default();
        let report = pace.pace(&mut port, &sleeper);
        assert_eq!(report.slept, Duration::ZERO);
        assert!(sleeper.0.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_query_leaves_thresholds_alone() {
        let mut pace = PaceController::new(params());
        pace.set_buffer_type(BufferType::Long);
        pace.set_buffer_type(BufferType::Short);
        let before = pace.cur_write_threshold();

        let mut port = FixedFill::new(0);
        port.broken = true;
        let report = pace.pace(&mut port, &Recorder::default());
        assert_eq!(report.kernel_frames, None);
        assert_eq!(pace.cur_write_threshold(), before);
    }

    #[test]
    fn depleted_buffer_snaps_threshold_above_fill() {
        let mut pace = PaceController::new(params());
        pace.set_buffer_type(BufferType::Long);
        let mut port = FixedFill::new(100);
        pace.pace(&mut port, &Recorder::default());
        assert_eq!(pace.cur_write_threshold(), PERIOD + PERIOD / 4);
    }

    #[test]
    fn over_filled_buffer_hits_the_cap() {
        let mut pace = PaceController::new(params());
        pace.set_buffer_type(BufferType::Short);
        let mut port = FixedFill::new(PERIOD * 8);
        let sleeper = Recorder::default();
        let report = pace.pace(&mut port, &sleeper);
        assert_eq!(report.slept, params().max_sleep);
        assert_eq!(sleeper.total(), params().max_sleep);
    }

    proptest! {
        #[test]
        fn cumulative_sleep_never_exceeds_cap(
            fills in proptest::collection::vec(0usize..PERIOD * 8, 1..40),
            long in any::<bool>(),
        ) {
            let mut pace = PaceController::new(params());
            pace.set_buffer_type(if long { BufferType::Long } else { BufferType::Short });
            for fill in fills {
                let sleeper = Recorder::default();
                let report = pace.pace(&mut FixedFill::new(fill), &sleeper);
                prop_assert!(report.slept <= params().max_sleep);
                prop_assert!(sleeper.total() <= params().max_sleep);
            }
        }

        #[test]
        fn threshold_converges_in_bounded_steps(
            start_long in any::<bool>(),
        ) {
            let mut pace = PaceController::new(params());
            let (first, second) = if start_long {
                (BufferType::Long, BufferType::Short)
            } else {
                (BufferType::Short, BufferType::Long)
            };
            pace.set_buffer_type(first);
            pace.set_buffer_type(second);

            let target = pace.write_threshold();
            let initial = pace.cur_write_threshold();
            let bound = 4 * target.abs_diff(initial) / PERIOD;

            for _ in 0..bound {
                let before = pace.cur_write_threshold();
                // hardware sitting exactly at the current threshold
                pace.pace(&mut FixedFill::new(before), &Recorder::default());
                let after = pace.cur_write_threshold();
                prop_assert!(after.abs_diff(before) <= PERIOD / 4);
                prop_assert!(
                    (initial <= target && after <= target) || (initial >= target && after >= target)
                );
            }
            prop_assert_eq!(pace.cur_write_threshold(), target);
        }
    }
}
