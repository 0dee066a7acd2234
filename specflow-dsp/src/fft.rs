//! Fixed-length forward FFT with power-spectrum output.
//!
//! Two variants mirror the two sample interpretations on the wire: RealPsd
//! consumes N real samples and keeps only the non-redundant N/2+1 bins,
//! ComplexPsd consumes N interleaved complex samples and produces N bins.
//! Both keep their plan and workspace buffers across calls; `set_length`
//! replans and is a no-op for the current length.

use realfft::{RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the transform primitives
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("input length {got} does not match transform length {expected}")]
    InputLength { expected: usize, got: usize },
    #[error("fft kernel error: {0}")]
    Kernel(#[from] realfft::FftError),
}

/// Forward FFT over real samples with squared-magnitude output.
///
/// No window function is applied; framing is rectangular and the bins are
/// unnormalized (a constant input of 1.0 puts N^2 into PSD bin 0).
pub struct RealPsd {
    size: usize,
    fft: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    psd: Vec<f32>,
}

impl RealPsd {
    /// Create a transform of length `size` (N real samples in, N/2+1 bins out)
    pub fn new(size: usize) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(size);
        let spectrum = fft.make_output_vec();
        let scratch = fft.make_scratch_vec();
        let bins = spectrum.len();
        Self {
            size,
            fft,
            input: vec![0.0; size],
            spectrum,
            scratch,
            psd: vec![0.0; bins],
        }
    }

    /// Transform length N
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of output bins (N/2 + 1)
    pub fn bins(&self) -> usize {
        self.size / 2 + 1
    }

    /// Replan for a new length. Idempotent; existing output is discarded.
    pub fn set_length(&mut self, size: usize) {
        if size != self.size {
            *self = Self::new(size);
        }
    }

    /// Run the transform over `samples`, filling the spectrum and PSD buffers
    pub fn run(&mut self, samples: &[f32]) -> Result<(), TransformError> {
        if samples.len() != self.size {
            return Err(TransformError::InputLength {
                expected: self.size,
                got: samples.len(),
            });
        }
        self.input.copy_from_slice(samples);
        self.fft
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)?;
        for (p, bin) in self.psd.iter_mut().zip(&self.spectrum) {
            *p = bin.norm_sqr();
        }
        Ok(())
    }

    /// Complex bins from the last `run`, DC first
    pub fn spectrum(&self) -> &[Complex<f32>] {
        &self.spectrum
    }

    /// Squared magnitudes from the last `run`
    pub fn psd(&self) -> &[f32] {
        &self.psd
    }
}

/// Forward FFT over interleaved complex samples with squared-magnitude output.
///
/// Output bins are rotated so that index `j` carries frequency
/// `(j - (N/2 - 1)) * df`: the lowest bin sits at `-(N/2 - 1) * df` and DC
/// lands at index N/2 - 1.
pub struct ComplexPsd {
    size: usize,
    fft: Arc<dyn Fft<f32>>,
    work: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    spectrum: Vec<Complex<f32>>,
    psd: Vec<f32>,
}

impl ComplexPsd {
    /// Create a transform of length `size` (N complex samples in, N bins out)
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        let scratch = vec![Complex::default(); fft.get_inplace_scratch_len()];
        Self {
            size,
            fft,
            work: vec![Complex::default(); size],
            scratch,
            spectrum: vec![Complex::default(); size],
            psd: vec![0.0; size],
        }
    }

    /// Transform length N
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of output bins (N)
    pub fn bins(&self) -> usize {
        self.size
    }

    /// Replan for a new length. Idempotent; existing output is discarded.
    pub fn set_length(&mut self, size: usize) {
        if size != self.size {
            *self = Self::new(size);
        }
    }

    /// Run the transform over `interleaved` (re, im pairs, 2N floats)
    pub fn run(&mut self, interleaved: &[f32]) -> Result<(), TransformError> {
        if interleaved.len() != 2 * self.size {
            return Err(TransformError::InputLength {
                expected: 2 * self.size,
                got: interleaved.len(),
            });
        }
        for (w, pair) in self.work.iter_mut().zip(interleaved.chunks_exact(2)) {
            *w = Complex::new(pair[0], pair[1]);
        }
        self.fft.process_with_scratch(&mut self.work, &mut self.scratch);

        // Rotate so bin 0 is the most negative frequency and DC sits at N/2-1
        let n = self.size;
        let shift = n / 2 + 1;
        for j in 0..n {
            self.spectrum[j] = self.work[(j + shift) % n];
        }
        for (p, bin) in self.psd.iter_mut().zip(&self.spectrum) {
            *p = bin.norm_sqr();
        }
        Ok(())
    }

    /// Complex bins from the last `run`, most negative frequency first
    pub fn spectrum(&self) -> &[Complex<f32>] {
        &self.spectrum
    }

    /// Squared magnitudes from the last `run`
    pub fn psd(&self) -> &[f32] {
        &self.psd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    #[test]
    fn test_real_constant_input_concentrates_in_dc() {
        let n = 16;
        let mut psd = RealPsd::new(n);
        psd.run(&vec![1.0; n]).unwrap();

        assert_eq!(psd.psd().len(), n / 2 + 1);
        assert!((psd.psd()[0] - (n * n) as f32).abs() < 1e-3);
        for &bin in &psd.psd()[1..] {
            assert!(bin.abs() < 1e-3, "leakage in bin: {}", bin);
        }
    }

    #[test]
    fn test_real_tone_lands_in_expected_bin() {
        let n = 64;
        let sample_rate = 8000.0;
        let freq = 1000.0; // exactly bin 8 for n=64
        let samples: Vec<f32> = (0..n)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate).sin())
            .collect();

        let mut psd = RealPsd::new(n);
        psd.run(&samples).unwrap();

        let argmax = psd
            .psd()
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        let bin_width = sample_rate / n as f32;
        assert!((argmax as f32 * bin_width - freq).abs() <= bin_width / 2.0);
    }

    #[test]
    fn test_complex_dc_lands_at_center_bin() {
        let n = 8;
        let mut psd = ComplexPsd::new(n);
        let interleaved: Vec<f32> = (0..n).flat_map(|_| [1.0, 0.0]).collect();
        psd.run(&interleaved).unwrap();

        assert_eq!(psd.psd().len(), n);
        // DC sits at index N/2-1 under the rotated layout
        assert!((psd.psd()[n / 2 - 1] - (n * n) as f32).abs() < 1e-3);
        for (i, &bin) in psd.psd().iter().enumerate() {
            if i != n / 2 - 1 {
                assert!(bin.abs() < 1e-3, "leakage in bin {}: {}", i, bin);
            }
        }
    }

    #[test]
    fn test_complex_positive_tone_above_center() {
        let n = 16;
        // exp(+2*pi*i * 2t/n): frequency +2 bins
        let interleaved: Vec<f32> = (0..n)
            .flat_map(|t| {
                let phase = 2.0 * PI * 2.0 * t as f32 / n as f32;
                [phase.cos(), phase.sin()]
            })
            .collect();
        let mut psd = ComplexPsd::new(n);
        psd.run(&interleaved).unwrap();

        let argmax = psd
            .psd()
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(argmax, (n / 2 - 1) + 2);
    }

    #[test]
    fn test_set_length_idempotent_and_resizing() {
        let mut psd = RealPsd::new(16);
        psd.set_length(16);
        assert_eq!(psd.size(), 16);
        psd.set_length(32);
        assert_eq!(psd.size(), 32);
        assert_eq!(psd.bins(), 17);
        psd.run(&vec![0.5; 32]).unwrap();
        assert_eq!(psd.psd().len(), 17);
    }

    #[test]
    fn test_length_mismatch_is_an_error() {
        let mut psd = RealPsd::new(16);
        assert!(psd.run(&[0.0; 8]).is_err());

        let mut cpsd = ComplexPsd::new(8);
        assert!(cpsd.run(&[0.0; 8]).is_err()); // needs 16 floats
    }
}
