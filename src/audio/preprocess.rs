//! Capture preprocessors (echo canceller, noise suppressor, AGC) and the
//! ordered chain an input stream runs them in.

use std::sync::{Arc, Mutex};

use uuid::Uuid;

use super::error::{HalError, HalResult};
use super::lock;

/// Most effects a single input stream may carry.
pub const MAX_PREPROCESSORS: usize = 3;

/// Effect type of acoustic echo cancellers.
pub const EFFECT_TYPE_AEC: Uuid = Uuid::from_u128(0x7b491460_8d4d_11e0_bd61_0002a5d5c51b);
/// Effect type of noise suppressors.
pub const EFFECT_TYPE_NS: Uuid = Uuid::from_u128(0x58b4b260_8e06_11e0_aa8e_0002a5d5c51b);
/// Effect type of automatic gain controls.
pub const EFFECT_TYPE_AGC: Uuid = Uuid::from_u128(0x0a8abfe0_654c_11e0_ba26_0002a5d5c51b);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectDescriptor {
    pub type_uuid: Uuid,
    pub name: String,
}

impl EffectDescriptor {
    pub fn is_echo_canceller(&self) -> bool {
        self.type_uuid == EFFECT_TYPE_AEC
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectParam {
    /// Echo path delay in microseconds
    EchoDelay(i32),
}

pub trait AudioEffect: Send {
    fn descriptor(&self) -> HalResult<EffectDescriptor>;

    /// Process interleaved 16-bit frames. `in_frames` and `out_frames` carry
    /// the maximum to consume and produce, and on return the actual counts.
    fn process(
        &mut self,
        input: &[i16],
        in_frames: &mut usize,
        output: &mut [i16],
        out_frames: &mut usize,
    ) -> HalResult<()>;

    /// Whether the effect consumes a far-end reference.
    fn supports_reverse(&self) -> bool {
        false
    }

    fn process_reverse(&mut self, _reference: &[i16], _frames: usize) -> HalResult<()> {
        Err(HalError::Unsupported("process_reverse"))
    }

    fn set_parameter(&mut self, _param: EffectParam) -> HalResult<()> {
        Err(HalError::Unsupported("set_parameter"))
    }
}

/// Effects are owned by whoever attaches them; the stream only holds a
/// shared handle.
pub type EffectHandle = Arc<Mutex<dyn AudioEffect>>;

fn same_effect(a: &EffectHandle, b: &EffectHandle) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Ordered preprocessor list; insertion order is processing order.
#[derive(Default)]
pub struct PreprocessorChain {
    effects: Vec<EffectHandle>,
    stage_in: Vec<i16>,
    stage_out: Vec<i16>,
}

impl PreprocessorChain {
    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Append `effect`. Returns whether it is an echo canceller.
    pub fn add(&mut self, effect: EffectHandle) -> HalResult<bool> {
        if self.effects.len() >= MAX_PREPROCESSORS {
            return Err(HalError::TooManyPreprocessors(MAX_PREPROCESSORS));
        }
        let desc = lock(&effect).descriptor()?;
        log::info!("Adding preprocessor '{}' ({})", desc.name, desc.type_uuid);
        self.effects.push(effect);
        Ok(desc.is_echo_canceller())
    }

    /// Remove `effect`. Returns whether it was an echo canceller.
    pub fn remove(&mut self, effect: &EffectHandle) -> HalResult<bool> {
        if self.effects.is_empty() {
            return Err(HalError::Unsupported("no preprocessor attached"));
        }
        let pos = self
            .effects
            .iter()
            .position(|e| same_effect(e, effect))
            .ok_or_else(|| HalError::InvalidArgument("preprocessor not attached".into()))?;
        self.effects.remove(pos);

        let desc = lock(effect).descriptor()?;
        log::info!("Removed preprocessor '{}'", desc.name);
        Ok(desc.is_echo_canceller())
    }

    /// Feed `reference` to every effect with a reverse path and update its
    /// echo delay.
    pub fn process_reverse(&self, reference: &[i16], frames: usize, delay_us: i32) {
        for effect in &self.effects {
            let mut fx = lock(effect);
            if !fx.supports_reverse() {
                continue;
            }
            if let Err(e) = fx.process_reverse(reference, frames) {
                log::debug!("process_reverse failed: {}", e);
            }
            if let Err(e) = fx.set_parameter(EffectParam::EchoDelay(delay_us)) {
                log::debug!("Failed to set echo delay: {}", e);
            }
        }
    }

    /// Run `input` through every effect in order. The first stage decides how
    /// much of `input` is consumed (`in_frames`); the last stage writes into
    /// `output` (`out_frames`). Frames an intermediate stage produced but the
    /// next one did not take are dropped.
    pub fn process(
        &mut self,
        channels: usize,
        input: &[i16],
        in_frames: &mut usize,
        output: &mut [i16],
        out_frames: &mut usize,
    ) -> HalResult<()> {
        if self.effects.is_empty() {
            let n = (*in_frames).min(*out_frames);
            output[..n * channels].copy_from_slice(&input[..n * channels]);
            *in_frames = n;
            *out_frames = n;
            return Ok(());
        }

        let max_out = *out_frames;
        if self.effects.len() > 1 {
            if self.stage_in.len() < max_out * channels {
                self.stage_in.resize(max_out * channels, 0);
            }
            if self.stage_out.len() < max_out * channels {
                self.stage_out.resize(max_out * channels, 0);
            }
        }

        let mut cur = std::mem::take(&mut self.stage_in);
        let mut next = std::mem::take(&mut self.stage_out);
        let result = self.run_stages(channels, input, in_frames, output, out_frames, &mut cur, &mut next);
        self.stage_in = cur;
        self.stage_out = next;
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn run_stages(
        &self,
        channels: usize,
        input: &[i16],
        in_frames: &mut usize,
        output: &mut [i16],
        out_frames: &mut usize,
        cur: &mut Vec<i16>,
        next: &mut Vec<i16>,
    ) -> HalResult<()> {
        let max_out = *out_frames;
        let count = self.effects.len();
        let mut avail = *in_frames;

        for (i, effect) in self.effects.iter().enumerate() {
            let last = i + 1 == count;
            let src: &[i16] = if i == 0 {
                &input[..avail * channels]
            } else {
                &cur[..avail * channels]
            };
            let dst: &mut [i16] = if last {
                &mut output[..max_out * channels]
            } else {
                &mut next[..max_out * channels]
            };

            let mut consumed = avail;
            let mut produced = max_out;
            lock(effect).process(src, &mut consumed, dst, &mut produced)?;

            if i == 0 {
                *in_frames = consumed;
            }
            avail = produced;
            if !last {
                std::mem::swap(cur, next);
            }
        }

        *out_frames = avail;
        Ok(())
    }
}
