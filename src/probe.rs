//! Band-limited white noise used to probe the DAC → ADC path

use crate::{
    common::{Error, Result},
    fft::Transformer,
};
use num_complex::Complex64;
use rand::{
    distributions::{Distribution, Uniform},
    Rng,
};
use std::f64::consts::PI;

/// Value the DC bin is pinned to
const DC_BIN: f64 = 0.01;
/// Value the Nyquist bin is pinned to
const NYQUIST_BIN: f64 = 1.0;
/// Peak of the probe is `1 / HEADROOM` of DAC full scale
pub const HEADROOM: f64 = 1.7;

/// Generate a flat-amplitude, random-phase waveform of length `2 (n_freqs - 1)`.
///
/// Bins `[0, n_stop)` have unit amplitude and the rest are silent. The DC and
/// Nyquist bins are then pinned to small real values so the probe never has
/// an exactly empty edge bin.
pub fn white_noise<R: Rng + ?Sized>(
    rng: &mut R,
    fft: &mut Transformer,
    n_freqs: usize,
    n_stop: usize,
) -> Result<Vec<f64>> {
    if n_freqs < 2 || n_stop > n_freqs {
        return Err(Error::InvalidProbe { n_freqs, n_stop });
    }
    let phase = Uniform::new(0.0, 2.0 * PI);
    let spectrum: Vec<_> = (0..n_freqs)
        .map(|i| {
            let amplitude = if i < n_stop { 1.0 } else { 0.0 };
            Complex64::from_polar(amplitude, phase.sample(rng))
        })
        .collect();
    let noise = fft.inverse_vec(&spectrum)?;
    // Back to the frequency domain to pin the edges
    let mut spectrum = fft.forward_vec(&noise)?;
    spectrum[0] = Complex64::new(DC_BIN, 0.0);
    spectrum[n_freqs - 1] = Complex64::new(NYQUIST_BIN, 0.0);
    let mut noise = fft.inverse_vec(&spectrum)?;
    let peak = noise.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    noise.iter_mut().for_each(|v| *v /= HEADROOM * peak);
    Ok(noise)
}
