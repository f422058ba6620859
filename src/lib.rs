//! Adaptive low-latency audio I/O core for fixed-period PCM hardware.

pub mod audio;
pub mod config;
