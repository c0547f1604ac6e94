//! Common types shared between modules

use crate::device::DeviceError;
use std::time::Duration;

/// Number of samples per channel (set by the bitstream)
pub const SAMPLES: usize = 8192;
/// ADC/DAC sampling rate in Hz
pub const SAMPLING_RATE: f64 = 125e6;
/// Number of ADC and DAC channels
pub const CHANNELS: usize = 2;
/// Standard deviation of the correction window, in Hz
pub const GAUSSIAN_SIGMA: f64 = 5e6;

/// The time/frequency grid of the device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub n: usize,
    pub fs: f64,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            n: SAMPLES,
            fs: SAMPLING_RATE,
        }
    }
}

impl Sampling {
    /// Number of bins in a real-input spectrum (DC up to and including Nyquist)
    #[must_use]
    pub fn n_freqs(&self) -> usize {
        self.n / 2 + 1
    }

    /// Frequency of every FFT bin, in the usual order `0, df, .., -df`
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn f_fft(&self) -> Vec<f64> {
        let df = self.fs / self.n as f64;
        let half = (self.n - 1) / 2 + 1;
        (0..self.n)
            .map(|i| {
                if i < half {
                    i as f64 * df
                } else {
                    (i as f64 - self.n as f64) * df
                }
            })
            .collect()
    }

    /// Gaussian window over the FFT grid, centered on DC
    #[must_use]
    pub fn gaussian_filter(&self, sigma: f64) -> Vec<f64> {
        self.f_fft()
            .into_iter()
            .map(|f| (-f * f / (2.0 * sigma * sigma)).exp())
            .collect()
    }
}

/// Open-loop settling times. There is no completion signal from the gateware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleDelays {
    /// Time between asserting the strobe and reading the ADC buffers
    pub capture: Duration,
    /// Time between commanding a new DAC waveform and acquiring the response
    pub probe: Duration,
}

impl Default for SettleDelays {
    fn default() -> Self {
        Self {
            capture: Duration::from_millis(1),
            probe: Duration::from_millis(10),
        }
    }
}

impl SettleDelays {
    /// No waiting at all, for simulated devices
    #[must_use]
    pub fn none() -> Self {
        Self {
            capture: Duration::ZERO,
            probe: Duration::ZERO,
        }
    }
}

/// Faults recorded by an acquisition. These are state, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The first sample of a channel came back as NaN
    Reception,
    /// Averaging is on but the gateware reported zero averages
    AveragingCount,
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Reception => write!(f, "reception failure (NaN in ADC buffer)"),
            Fault::AveragingCount => write!(f, "averaging count register read zero"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors that can be produced by the controller
pub enum Error {
    #[error("Register access failed - {0}")]
    Device(#[from] DeviceError),
    #[error("FFT failed - {0}")]
    Fft(#[from] realfft::FftError),
    #[error("Expected a buffer of length {expected}, found {found}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("Channel {0} does not exist")]
    InvalidChannel(usize),
    #[error("Invalid probe: {n_freqs} bins with {n_stop} in band")]
    InvalidProbe { n_freqs: usize, n_stop: usize },
    #[error("Probe has no energy in bin {bin}, refusing to divide by it")]
    DegenerateProbe { bin: usize },
    #[error("Transfer function vanishes at bin {bin}, cannot invert")]
    SingularTransferFunction { bin: usize },
    #[error("At least one trial is needed to estimate the transfer function")]
    NoTrials,
    #[error("At least one acquisition is needed to average a spectrum")]
    NoAverages,
    #[error("Acquisition faulted - {0}")]
    Fault(Fault),
    #[error("Amplitude error is not finite at sample {index}")]
    NonFiniteError { index: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Check that a buffer has the expected length
pub(crate) fn check_len(expected: usize, found: usize) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(Error::LengthMismatch { expected, found })
    }
}

/// Check that a channel index is valid
pub(crate) fn check_channel(channel: usize) -> Result<()> {
    if channel < CHANNELS {
        Ok(())
    } else {
        Err(Error::InvalidChannel(channel))
    }
}
