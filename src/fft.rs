//! Real-input FFTs with reusable buffers

use crate::common::{check_len, Result};
use num_complex::Complex64;
use realfft::RealFftPlanner;

/// Forward and inverse real FFTs of any even length.
///
/// Plans are cached by the planner, so asking for the same length repeatedly
/// is cheap. Spectra are the `n / 2 + 1` non-negative frequency bins.
pub struct Transformer {
    planner: RealFftPlanner<f64>,
    real: Vec<f64>,
    complex: Vec<Complex64>,
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer").finish_non_exhaustive()
    }
}

impl Transformer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            planner: RealFftPlanner::new(),
            real: vec![],
            complex: vec![],
        }
    }

    /// Unnormalized forward transform of `input` into `output`
    pub fn forward(&mut self, input: &[f64], output: &mut [Complex64]) -> Result<()> {
        check_len(input.len() / 2 + 1, output.len())?;
        let fft = self.planner.plan_fft_forward(input.len());
        // The transform clobbers its input
        self.real.clear();
        self.real.extend_from_slice(input);
        fft.process(&mut self.real, output)?;
        Ok(())
    }

    /// Forward transform into a new buffer
    pub fn forward_vec(&mut self, input: &[f64]) -> Result<Vec<Complex64>> {
        let mut out = vec![Complex64::default(); input.len() / 2 + 1];
        self.forward(input, &mut out)?;
        Ok(out)
    }

    /// Inverse transform of a half spectrum, normalized by `1 / n`.
    ///
    /// The imaginary parts of the DC and Nyquist bins are dropped, which is
    /// the real part of the full complex inverse.
    #[allow(clippy::cast_precision_loss)]
    pub fn inverse(&mut self, input: &[Complex64], output: &mut [f64]) -> Result<()> {
        check_len(output.len() / 2 + 1, input.len())?;
        let n = output.len();
        let ifft = self.planner.plan_fft_inverse(n);
        self.complex.clear();
        self.complex.extend_from_slice(input);
        self.complex[0].im = 0.0;
        if n % 2 == 0 {
            self.complex[n / 2].im = 0.0;
        }
        ifft.process(&mut self.complex, output)?;
        let scale = 1.0 / n as f64;
        output.iter_mut().for_each(|v| *v *= scale);
        Ok(())
    }

    /// Inverse transform into a new buffer of length `2 (bins - 1)`
    pub fn inverse_vec(&mut self, input: &[Complex64]) -> Result<Vec<f64>> {
        let mut out = vec![0.0; 2 * (input.len().saturating_sub(1))];
        self.inverse(input, &mut out)?;
        Ok(out)
    }
}
