//! DSP primitives for specflow - forward transforms with power output
//! and rolling vector averaging.
//!
//! This crate provides the math under the stream engine:
//! - RealPsd / ComplexPsd: fixed-length forward FFT producing complex
//!   spectral bins alongside the element-wise power spectrum
//! - VectorMean: running mean over the last K vectors

mod averager;
mod fft;

pub use averager::VectorMean;
pub use fft::{ComplexPsd, RealPsd, TransformError};
