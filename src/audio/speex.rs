//! SpeexDSP-backed rate converter, noise suppressor/AGC and echo canceller.

use std::collections::VecDeque;
use std::ffi::{c_int, c_void};

use super::converter::{ConverterFactory, RateConverter};
use super::error::{HalError, HalResult};
use super::preprocess::{
    AudioEffect, EFFECT_TYPE_AEC, EFFECT_TYPE_AGC, EFFECT_TYPE_NS, EffectDescriptor, EffectParam,
};

// ======================== FFI declarations ========================

/// Opaque type for SpeexPreprocessState
#[repr(C)]
pub struct SpeexPreprocessState {
    _private: [u8; 0],
}

/// Opaque type for SpeexResamplerState
#[repr(C)]
pub struct SpeexResamplerState {
    _private: [u8; 0],
}

/// Opaque type for SpeexEchoState
#[repr(C)]
pub struct SpeexEchoState {
    _private: [u8; 0],
}

// Preprocessor request constants
const SPEEX_PREPROCESS_SET_DENOISE: c_int = 0;
const SPEEX_PREPROCESS_SET_AGC: c_int = 2;
const SPEEX_PREPROCESS_SET_AGC_LEVEL: c_int = 6;
const SPEEX_PREPROCESS_SET_NOISE_SUPPRESS: c_int = 8;

const SPEEX_ECHO_SET_SAMPLING_RATE: c_int = 24;

const RESAMPLER_ERR_SUCCESS: c_int = 0;

/// Suppression applied by the noise suppressor, in dB
const NOISE_SUPPRESS_DB: i32 = -25;
const AGC_LEVEL: f32 = 24000.0;
/// Echo tail covered by the canceller
const ECHO_TAIL_MS: u32 = 200;

unsafe extern "C" {
    fn speex_preprocess_state_init(frame_size: c_int, sampling_rate: c_int)
        -> *mut SpeexPreprocessState;
    fn speex_preprocess_state_destroy(st: *mut SpeexPreprocessState);
    fn speex_preprocess_run(st: *mut SpeexPreprocessState, x: *mut i16) -> c_int;
    fn speex_preprocess_ctl(
        st: *mut SpeexPreprocessState,
        request: c_int,
        ptr: *mut c_void,
    ) -> c_int;

    fn speex_resampler_init(
        nb_channels: u32,
        in_rate: u32,
        out_rate: u32,
        quality: c_int,
        err: *mut c_int,
    ) -> *mut SpeexResamplerState;
    fn speex_resampler_destroy(st: *mut SpeexResamplerState);
    fn speex_resampler_process_interleaved_int(
        st: *mut SpeexResamplerState,
        in_: *const i16,
        in_len: *mut u32,
        out: *mut i16,
        out_len: *mut u32,
    ) -> c_int;
    fn speex_resampler_get_input_latency(st: *mut SpeexResamplerState) -> c_int;

    fn speex_echo_state_init(frame_size: c_int, filter_length: c_int) -> *mut SpeexEchoState;
    fn speex_echo_state_destroy(st: *mut SpeexEchoState);
    fn speex_echo_cancellation(
        st: *mut SpeexEchoState,
        rec: *const i16,
        play: *const i16,
        out: *mut i16,
    );
    fn speex_echo_ctl(st: *mut SpeexEchoState, request: c_int, ptr: *mut c_void) -> c_int;
}

/// Re-blocks a mono stream into the fixed `frame_size` blocks SpeexDSP
/// works on. Input is always taken whole; output is handed out as blocks
/// complete.
struct BlockBuffer {
    frame_size: usize,
    pending: Vec<i16>,
    block: Vec<i16>,
    ready: VecDeque<i16>,
}

impl BlockBuffer {
    fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size * 2),
            block: vec![0; frame_size],
            ready: VecDeque::new(),
        }
    }

    fn process(
        &mut self,
        input: &[i16],
        in_frames: &mut usize,
        output: &mut [i16],
        out_frames: &mut usize,
        mut run: impl FnMut(&[i16], &mut [i16]),
    ) {
        let taken = (*in_frames).min(input.len());
        self.pending.extend_from_slice(&input[..taken]);

        let fs = self.frame_size;
        let mut start = 0;
        while self.pending.len() - start >= fs {
            run(&self.pending[start..start + fs], &mut self.block);
            self.ready.extend(self.block.iter().copied());
            start += fs;
        }
        self.pending.drain(..start);

        let given = (*out_frames).min(output.len()).min(self.ready.len());
        for (dst, src) in output.iter_mut().zip(self.ready.drain(..given)) {
            *dst = src;
        }
        *in_frames = taken;
        *out_frames = given;
    }
}

// ======================== Resampler ========================

/// Interleaved SpeexDSP resampler.
pub struct SpeexResampler {
    state: *mut SpeexResamplerState,
    channels: u32,
    in_rate: u32,
    out_rate: u32,
}

// SpeexResamplerState is used from a single thread at a time
unsafe impl Send for SpeexResampler {}

impl SpeexResampler {
    pub fn new(channels: u32, in_rate: u32, out_rate: u32, quality: u32) -> HalResult<Self> {
        let mut err: c_int = 0;
        let state = unsafe {
            speex_resampler_init(channels, in_rate, out_rate, quality as c_int, &mut err)
        };
        if err != RESAMPLER_ERR_SUCCESS || state.is_null() {
            return Err(HalError::ConverterCreateFailed(format!(
                "speex resampler {} -> {} Hz: err={}",
                in_rate, out_rate, err
            )));
        }
        Ok(Self {
            state,
            channels,
            in_rate,
            out_rate,
        })
    }
}

impl RateConverter for SpeexResampler {
    fn channels(&self) -> u32 {
        self.channels
    }

    fn rates(&self) -> (u32, u32) {
        (self.in_rate, self.out_rate)
    }

    fn convert(
        &mut self,
        input: &[i16],
        in_frames: &mut usize,
        output: &mut [i16],
        out_frames: &mut usize,
    ) -> HalResult<()> {
        let mut in_len = *in_frames as u32;
        let mut out_len = *out_frames as u32;
        let err = unsafe {
            speex_resampler_process_interleaved_int(
                self.state,
                input.as_ptr(),
                &mut in_len,
                output.as_mut_ptr(),
                &mut out_len,
            )
        };
        if err != RESAMPLER_ERR_SUCCESS {
            return Err(HalError::Io(format!("speex resampler error: {}", err)));
        }
        *in_frames = in_len as usize;
        *out_frames = out_len as usize;
        Ok(())
    }

    fn delay_ns(&self) -> i64 {
        let latency = unsafe { speex_resampler_get_input_latency(self.state) };
        latency.max(0) as i64 * 1_000_000_000 / self.in_rate.max(1) as i64
    }
}

impl Drop for SpeexResampler {
    fn drop(&mut self) {
        unsafe {
            speex_resampler_destroy(self.state);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SpeexConverterFactory;

impl ConverterFactory for SpeexConverterFactory {
    fn create(
        &self,
        in_rate: u32,
        out_rate: u32,
        channels: u32,
        quality: u32,
    ) -> HalResult<Box<dyn RateConverter>> {
        log::debug!("speex resampler {} -> {} Hz, {} ch", in_rate, out_rate, channels);
        Ok(Box::new(SpeexResampler::new(channels, in_rate, out_rate, quality)?))
    }
}

// ======================== Preprocessor (denoise + AGC) ========================

/// Mono noise suppressor or AGC.
pub struct SpeexPreprocessor {
    state: *mut SpeexPreprocessState,
    blocks: BlockBuffer,
    descriptor: EffectDescriptor,
}

unsafe impl Send for SpeexPreprocessor {}

impl SpeexPreprocessor {
    fn new(frame_size: usize, sample_rate: u32, descriptor: EffectDescriptor) -> HalResult<Self> {
        let state =
            unsafe { speex_preprocess_state_init(frame_size as c_int, sample_rate as c_int) };
        if state.is_null() {
            return Err(HalError::Effect("Failed to initialize speex preprocessor".into()));
        }
        let mut pre = Self {
            state,
            blocks: BlockBuffer::new(frame_size),
            descriptor,
        };
        pre.ctl(SPEEX_PREPROCESS_SET_DENOISE, 0);
        pre.ctl(SPEEX_PREPROCESS_SET_AGC, 0);
        Ok(pre)
    }

    pub fn noise_suppressor(frame_size: usize, sample_rate: u32) -> HalResult<Self> {
        let mut pre = Self::new(
            frame_size,
            sample_rate,
            EffectDescriptor {
                type_uuid: EFFECT_TYPE_NS,
                name: "Speex Noise Suppressor".into(),
            },
        )?;
        pre.ctl(SPEEX_PREPROCESS_SET_DENOISE, 1);
        pre.ctl(SPEEX_PREPROCESS_SET_NOISE_SUPPRESS, NOISE_SUPPRESS_DB);
        Ok(pre)
    }

    pub fn agc(frame_size: usize, sample_rate: u32) -> HalResult<Self> {
        let mut pre = Self::new(
            frame_size,
            sample_rate,
            EffectDescriptor {
                type_uuid: EFFECT_TYPE_AGC,
                name: "Speex AGC".into(),
            },
        )?;
        pre.ctl(SPEEX_PREPROCESS_SET_AGC, 1);
        let mut level: f32 = AGC_LEVEL;
        unsafe {
            speex_preprocess_ctl(
                pre.state,
                SPEEX_PREPROCESS_SET_AGC_LEVEL,
                &mut level as *mut f32 as *mut c_void,
            );
        }
        Ok(pre)
    }

    fn ctl(&mut self, request: c_int, value: i32) {
        let mut val: c_int = value;
        unsafe {
            speex_preprocess_ctl(self.state, request, &mut val as *mut c_int as *mut c_void);
        }
    }
}

impl AudioEffect for SpeexPreprocessor {
    fn descriptor(&self) -> HalResult<EffectDescriptor> {
        Ok(self.descriptor.clone())
    }

    fn process(
        &mut self,
        input: &[i16],
        in_frames: &mut usize,
        output: &mut [i16],
        out_frames: &mut usize,
    ) -> HalResult<()> {
        let state = self.state;
        self.blocks.process(input, in_frames, output, out_frames, |src, dst| {
            dst.copy_from_slice(src);
            unsafe {
                speex_preprocess_run(state, dst.as_mut_ptr());
            }
        });
        Ok(())
    }
}

impl Drop for SpeexPreprocessor {
    fn drop(&mut self) {
        unsafe {
            speex_preprocess_state_destroy(self.state);
        }
    }
}

// ======================== Echo canceller ========================

/// Mono acoustic echo canceller fed with the playback reference through the
/// reverse path.
pub struct SpeexEchoCanceller {
    state: *mut SpeexEchoState,
    blocks: BlockBuffer,
    reference: VecDeque<i16>,
    /// Most reference samples kept waiting for capture
    max_reference: usize,
    reference_block: Vec<i16>,
}

unsafe impl Send for SpeexEchoCanceller {}

impl SpeexEchoCanceller {
    pub fn new(frame_size: usize, sample_rate: u32) -> HalResult<Self> {
        let tail = (sample_rate * ECHO_TAIL_MS / 1000) as c_int;
        let state = unsafe { speex_echo_state_init(frame_size as c_int, tail) };
        if state.is_null() {
            return Err(HalError::Effect("Failed to initialize speex echo canceller".into()));
        }
        let mut rate: c_int = sample_rate as c_int;
        unsafe {
            speex_echo_ctl(
                state,
                SPEEX_ECHO_SET_SAMPLING_RATE,
                &mut rate as *mut c_int as *mut c_void,
            );
        }
        Ok(Self {
            state,
            blocks: BlockBuffer::new(frame_size),
            reference: VecDeque::new(),
            max_reference: sample_rate as usize,
            reference_block: vec![0; frame_size],
        })
    }
}

impl AudioEffect for SpeexEchoCanceller {
    fn descriptor(&self) -> HalResult<EffectDescriptor> {
        Ok(EffectDescriptor {
            type_uuid: EFFECT_TYPE_AEC,
            name: "Speex Echo Canceller".into(),
        })
    }

    fn process(
        &mut self,
        input: &[i16],
        in_frames: &mut usize,
        output: &mut [i16],
        out_frames: &mut usize,
    ) -> HalResult<()> {
        let state = self.state;
        let reference = &mut self.reference;
        let block = &mut self.reference_block;
        self.blocks.process(input, in_frames, output, out_frames, |src, dst| {
            // missing reference is treated as silence
            for sample in block.iter_mut() {
                *sample = reference.pop_front().unwrap_or(0);
            }
            unsafe {
                speex_echo_cancellation(state, src.as_ptr(), block.as_ptr(), dst.as_mut_ptr());
            }
        });
        Ok(())
    }

    fn supports_reverse(&self) -> bool {
        true
    }

    fn process_reverse(&mut self, reference: &[i16], frames: usize) -> HalResult<()> {
        self.reference.extend(&reference[..frames.min(reference.len())]);
        let excess = self.reference.len().saturating_sub(self.max_reference);
        self.reference.drain(..excess);
        Ok(())
    }

    fn set_parameter(&mut self, param: EffectParam) -> HalResult<()> {
        match param {
            // reference blocks are paired in arrival order
            EffectParam::EchoDelay(us) => log::trace!("echo delay {} us", us),
        }
        Ok(())
    }
}

impl Drop for SpeexEchoCanceller {
    fn drop(&mut self) {
        unsafe {
            speex_echo_state_destroy(self.state);
        }
    }
}
