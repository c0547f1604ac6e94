//! Diagnostic spectra of the ADC channels

use crate::{
    common::{Error, Result},
    device::Registers,
    oscillo::Oscillo,
};
use ndarray::Array2;
use num_complex::Complex64;

impl<R: Registers> Oscillo<R> {
    /// Complex spectrum of the latest capture, bins `[0, n / 2)` of each channel
    pub fn get_spectrum(&mut self) -> Result<&Array2<Complex64>> {
        let mut bins = vec![Complex64::default(); self.sampling.n_freqs()];
        for (adc, mut spectrum) in self.adc.outer_iter().zip(self.spectrum.outer_iter_mut()) {
            let samples = adc
                .to_slice()
                .expect("rows of a standard layout array are contiguous");
            self.fft.forward(samples, &mut bins)?;
            spectrum
                .iter_mut()
                .zip(&bins)
                .for_each(|(s, b)| *s = *b);
        }
        Ok(&self.spectrum)
    }

    /// Incoherent average of `n_avg` fresh captures: the mean of `|FFT|` over bins `[0, n / 2)`.
    ///
    /// Stops at the first faulted capture, keeping the previous average.
    #[allow(clippy::cast_precision_loss)]
    pub fn get_avg_spectrum(&mut self, n_avg: usize) -> Result<&Array2<f64>> {
        if n_avg == 0 {
            return Err(Error::NoAverages);
        }
        let mut sum: Array2<f64> = Array2::zeros(self.avg_spectrum.raw_dim());
        let mut bins = vec![Complex64::default(); self.sampling.n_freqs()];
        for _ in 0..n_avg {
            if let Some(fault) = self.acquire()? {
                return Err(Error::Fault(fault));
            }
            for (adc, mut avg) in self.adc.outer_iter().zip(sum.outer_iter_mut()) {
                let samples = adc
                    .to_slice()
                    .expect("rows of a standard layout array are contiguous");
                self.fft.forward(samples, &mut bins)?;
                avg.iter_mut()
                    .zip(&bins)
                    .for_each(|(a, b)| *a += b.norm());
            }
        }
        sum /= n_avg as f64;
        self.avg_spectrum = sum;
        Ok(&self.avg_spectrum)
    }

    /// Result of the last [`Oscillo::get_avg_spectrum`]
    #[must_use]
    pub fn avg_spectrum(&self) -> &Array2<f64> {
        &self.avg_spectrum
    }

    /// Result of the last [`Oscillo::get_spectrum`]
    #[must_use]
    pub fn spectrum(&self) -> &Array2<Complex64> {
        &self.spectrum
    }
}
