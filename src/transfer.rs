//! Estimating the DAC → ADC transfer function and pre-distorting the DAC to undo it

use crate::{
    common::{check_channel, check_len, Error, Result},
    device::Registers,
    fft::Transformer,
    oscillo::Oscillo,
    probe::white_noise,
};
use num_complex::Complex64;
use std::thread::sleep;
use tracing::{debug, info, warn};

/// Inverse-filter `amplitude_error` by `transfer_function`, returning the time-domain correction.
///
/// The DC bin is dropped, as an offset can't be corrected through the DAC, and
/// the quotient is weighted by `gaussian_filter` (a window over the full FFT
/// grid, of which the non-negative half is used) to keep noise from being
/// amplified where the transfer function is small.
pub fn correction(
    fft: &mut Transformer,
    amplitude_error: &[f64],
    transfer_function: &[Complex64],
    gaussian_filter: &[f64],
) -> Result<Vec<f64>> {
    let n = amplitude_error.len();
    check_len(n / 2 + 1, transfer_function.len())?;
    check_len(n, gaussian_filter.len())?;
    let mut spectrum = fft.forward_vec(amplitude_error)?;
    for (bin, ((x, h), g)) in spectrum
        .iter_mut()
        .zip(transfer_function)
        .zip(gaussian_filter)
        .enumerate()
        .skip(1)
    {
        if h.norm() < f64::EPSILON {
            return Err(Error::SingularTransferFunction { bin });
        }
        *x = *x / *h * *g;
    }
    spectrum[0] = Complex64::default();
    let mut out = vec![0.0; n];
    fft.inverse(&spectrum, &mut out)?;
    Ok(out)
}

impl<R: Registers> Oscillo<R> {
    /// Measure the transfer function from DAC `channel_out` to ADC `channel_in`.
    ///
    /// Every trial drives a fresh white-noise probe and accumulates the
    /// per-bin ratio of response to probe; the result is the mean of those
    /// ratios with the DC bin defined as unity. The DAC channel is silenced
    /// afterwards, also when a capture faults. The stored transfer function is
    /// only replaced when every trial succeeds.
    pub fn estimate_transfer_function(
        &mut self,
        channel_out: usize,
        channel_in: usize,
        trials: usize,
    ) -> Result<()> {
        check_channel(channel_out)?;
        check_channel(channel_in)?;
        if trials == 0 {
            return Err(Error::NoTrials);
        }
        info!("Estimating transfer function from DAC {channel_out} to ADC {channel_in} over {trials} trials");
        let result = self.accumulate_transfer_function(channel_out, channel_in, trials);
        self.dac.row_mut(channel_out).fill(0.0);
        let silenced = self.set_dac();
        match result {
            Ok(transfer_function) => {
                self.amplitude_transfer_function = transfer_function;
                silenced
            }
            Err(e) => {
                if let Err(cleanup) = silenced {
                    warn!("Could not silence DAC {channel_out} after a failed estimate - {cleanup}");
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn accumulate_transfer_function(
        &mut self,
        channel_out: usize,
        channel_in: usize,
        trials: usize,
    ) -> Result<Vec<Complex64>> {
        let n_freqs = self.sampling.n_freqs();
        let mut sum = vec![Complex64::default(); n_freqs];
        let mut probe_spectrum = vec![Complex64::default(); n_freqs];
        let mut response_spectrum = vec![Complex64::default(); n_freqs];

        for trial in 0..trials {
            let probe = white_noise(&mut self.rng, &mut self.fft, n_freqs, n_freqs)?;
            self.fft.forward(&probe, &mut probe_spectrum)?;
            if let Some(bin) = probe_spectrum.iter().position(|p| p.norm() < f64::EPSILON) {
                return Err(Error::DegenerateProbe { bin });
            }
            self.dac
                .row_mut(channel_out)
                .iter_mut()
                .zip(&probe)
                .for_each(|(d, p)| *d = *p);
            self.set_dac()?;
            sleep(self.delays.probe);
            if let Some(fault) = self.acquire()? {
                return Err(Error::Fault(fault));
            }
            let response = self
                .adc
                .row(channel_in)
                .to_slice()
                .expect("rows of a standard layout array are contiguous");
            self.fft.forward(response, &mut response_spectrum)?;
            for ((h, r), p) in sum
                .iter_mut()
                .zip(&response_spectrum)
                .zip(&probe_spectrum)
            {
                *h += r / p;
            }
            debug!("Transfer function trial {} of {trials} done", trial + 1);
        }

        let trials = trials as f64;
        sum.iter_mut().for_each(|h| *h /= trials);
        sum[0] = Complex64::new(1.0, 0.0);
        Ok(sum)
    }

    /// Correction of the current amplitude error through the stored transfer function
    pub fn get_correction(&mut self, amplitude_error: &[f64]) -> Result<Vec<f64>> {
        correction(
            &mut self.fft,
            amplitude_error,
            &self.amplitude_transfer_function,
            &self.gaussian_filter,
        )
    }

    /// One step of pre-distortion: `dac[channel] -= alpha * correction(error)`.
    ///
    /// The error is ADC 1 with its mean removed minus the ideal waveform. The
    /// new DAC waveform is not pushed; call [`Oscillo::set_dac`]. Returns the
    /// RMS of the error that was corrected.
    ///
    /// Refuses to step while a fault is latched or when the error holds NaN,
    /// leaving the DAC waveform untouched.
    #[allow(clippy::cast_precision_loss)]
    pub fn optimize_amplitude(&mut self, alpha: f64, channel: usize) -> Result<f64> {
        check_channel(channel)?;
        if let Some(fault) = self.fault() {
            return Err(Error::Fault(fault));
        }
        let adc = self.adc.row(0);
        let mean = adc.mean().unwrap_or(0.0);
        let amplitude_error: Vec<f64> = adc
            .iter()
            .zip(&self.ideal_amplitude_waveform)
            .map(|(a, ideal)| (a - mean) - ideal)
            .collect();
        if let Some(index) = amplitude_error.iter().position(|e| !e.is_finite()) {
            return Err(Error::NonFiniteError { index });
        }
        let rms = (amplitude_error.iter().map(|e| e * e).sum::<f64>()
            / amplitude_error.len() as f64)
            .sqrt();
        let correction = self.get_correction(&amplitude_error)?;
        self.dac
            .row_mut(channel)
            .iter_mut()
            .zip(&correction)
            .for_each(|(d, c)| *d -= alpha * c);
        debug!("Amplitude error RMS {rms:.4}");
        Ok(rms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::{Fault, Sampling, SettleDelays},
        device::{DeviceError, MemoryMap},
        oscillo::OscilloConfig,
        sim::SimDevice,
    };
    use approx::assert_abs_diff_eq;
    use std::result::Result;

    /// A board whose DAC stops accepting writes once an ADC readout is lost
    struct DeadAfterDrop {
        sim: SimDevice,
        dead: bool,
    }

    impl Registers for DeadAfterDrop {
        fn set_bit(&mut self, map: MemoryMap, offset: u32, bit: u32) -> Result<(), DeviceError> {
            self.sim.set_bit(map, offset, bit)
        }

        fn clear_bit(&mut self, map: MemoryMap, offset: u32, bit: u32) -> Result<(), DeviceError> {
            self.sim.clear_bit(map, offset, bit)
        }

        fn read(&mut self, map: MemoryMap, offset: u32) -> Result<u32, DeviceError> {
            self.sim.read(map, offset)
        }

        fn read_buffer(
            &mut self,
            map: MemoryMap,
            offset: u32,
            out: &mut [f64],
        ) -> Result<(), DeviceError> {
            self.sim.read_buffer(map, offset, out)?;
            self.dead |= out[0].is_nan();
            Ok(())
        }

        fn write_buffer(
            &mut self,
            map: MemoryMap,
            offset: u32,
            data: &[u32],
        ) -> Result<(), DeviceError> {
            if self.dead {
                return Err(DeviceError::Simulation("DAC unreachable".into()));
            }
            self.sim.write_buffer(map, offset, data)
        }
    }

    fn osc(sim: SimDevice) -> Oscillo<SimDevice> {
        let config = OscilloConfig {
            delays: SettleDelays::none(),
            seed: Some(42),
            ..Default::default()
        };
        Oscillo::new(sim, config).unwrap()
    }

    #[test]
    fn dc_bin_is_unity() {
        for trials in [1, 3] {
            let mut osc = osc(SimDevice::new(Sampling::default()));
            osc.estimate_transfer_function(0, 0, trials).unwrap();
            assert_eq!(osc.transfer_function()[0], Complex64::new(1.0, 0.0));
        }
    }

    #[test]
    fn recovers_simulated_response() {
        let sim = SimDevice::new(Sampling::default()).with_lowpass(20e6, 0.8);
        let expected = sim.transfer_function();
        let mut osc = osc(sim);
        osc.estimate_transfer_function(1, 1, 2).unwrap();
        let tf = osc.transfer_function();
        assert_eq!(tf.len(), 4097);
        for (h, e) in tf.iter().zip(&expected).skip(1) {
            assert!((h - e).norm() / e.norm() < 1e-2, "{h} vs {e}");
        }
        // Output left quiet
        assert!(osc.dac(1).iter().all(|v| *v == 0.0));
        assert!(osc.registers().dac(1).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn zero_trials_rejected() {
        let mut osc = osc(SimDevice::new(Sampling::default()));
        assert!(matches!(
            osc.estimate_transfer_function(0, 0, 0),
            Err(Error::NoTrials)
        ));
        assert!(osc.estimate_transfer_function(2, 0, 1).is_err());
    }

    #[test]
    fn faulted_capture_aborts_estimation() {
        let mut osc = osc(SimDevice::new(Sampling::default()));
        let mut raw = vec![0.0; 8192];
        raw[0] = f64::NAN;
        osc.registers_mut().inject_raw(1, raw);
        assert!(matches!(
            osc.estimate_transfer_function(0, 0, 4),
            Err(Error::Fault(Fault::Reception))
        ));
        assert!(osc.is_failed());
        assert!(osc.dac(0).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn failed_estimate_keeps_previous_transfer_function() {
        let mut osc = osc(SimDevice::new(Sampling::default()));
        let mut previous = vec![Complex64::new(2.0, 0.5); 4097];
        previous[0] = Complex64::new(1.0, 0.0);
        osc.set_transfer_function(previous.clone()).unwrap();
        // Second trial loses its capture
        osc.registers_mut().drop_capture_after(1);
        assert!(matches!(
            osc.estimate_transfer_function(0, 0, 4),
            Err(Error::Fault(Fault::Reception))
        ));
        assert_eq!(osc.transfer_function(), previous.as_slice());
        assert!(osc.dac(0).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn fault_outranks_failed_cleanup() {
        let config = OscilloConfig {
            delays: SettleDelays::none(),
            seed: Some(42),
            ..Default::default()
        };
        let regs = DeadAfterDrop {
            sim: SimDevice::new(Sampling::default()),
            dead: false,
        };
        let mut osc = Oscillo::new(regs, config).unwrap();
        osc.registers_mut().sim.drop_capture_after(0);
        assert!(matches!(
            osc.estimate_transfer_function(0, 0, 2),
            Err(Error::Fault(Fault::Reception))
        ));
        assert!(osc.registers().dead);
    }

    #[test]
    fn optimize_refuses_faulted_capture() {
        let mut osc = osc(SimDevice::new(Sampling::default()));
        let mut raw = vec![0.0; 8192];
        raw[0] = f64::NAN;
        osc.registers_mut().inject_raw(0, raw);
        assert_eq!(osc.acquire().unwrap(), Some(Fault::Reception));
        assert!(matches!(
            osc.optimize_amplitude(0.5, 1),
            Err(Error::Fault(Fault::Reception))
        ));
        // Without the latched fault the NaN is still caught
        osc.clear_fault();
        assert!(matches!(
            osc.optimize_amplitude(0.5, 1),
            Err(Error::NonFiniteError { index: 0 })
        ));
        assert!(osc.dac(1).iter().all(|v| *v == 0.0));
        osc.set_dac().unwrap();
        assert!(osc.registers().dac(1).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn correction_has_no_dc() {
        let s = Sampling { n: 256, fs: 125e6 };
        let mut fft = Transformer::new();
        let error: Vec<f64> = (0..256)
            .map(|i| 3.0 + (f64::from(i) * 0.3).sin() + 0.1 * f64::from(i % 7))
            .collect();
        let tf: Vec<_> = (0..129)
            .map(|k| Complex64::new(2.0, 0.1 * f64::from(k)))
            .collect();
        let c = correction(&mut fft, &error, &tf, &s.gaussian_filter(20e6)).unwrap();
        assert_eq!(c.len(), 256);
        let dc: f64 = c.iter().sum();
        assert_abs_diff_eq!(dc, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn correction_inverts_flat_gain() {
        // With a flat transfer function of 2 and a wide window, a zero-mean
        // error comes back halved.
        let s = Sampling { n: 64, fs: 64.0 };
        let mut fft = Transformer::new();
        let error: Vec<f64> = (0..64)
            .map(|i| (2.0 * std::f64::consts::PI * 5.0 * f64::from(i) / 64.0).cos())
            .collect();
        let tf = vec![Complex64::new(2.0, 0.0); 33];
        let c = correction(&mut fft, &error, &tf, &s.gaussian_filter(1e9)).unwrap();
        for (c, e) in c.iter().zip(&error) {
            assert_abs_diff_eq!(*c, e / 2.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn singular_transfer_function_rejected() {
        let s = Sampling { n: 16, fs: 16.0 };
        let mut fft = Transformer::new();
        let mut tf = vec![Complex64::new(1.0, 0.0); 9];
        tf[0] = Complex64::default();
        // A zero DC bin is fine, it is dropped anyway
        assert!(correction(&mut fft, &[1.0; 16], &tf, &s.gaussian_filter(4.0)).is_ok());
        tf[3] = Complex64::default();
        assert!(matches!(
            correction(&mut fft, &[1.0; 16], &tf, &s.gaussian_filter(4.0)),
            Err(Error::SingularTransferFunction { bin: 3 })
        ));
    }

    #[test]
    fn optimize_steps_against_error() {
        let mut osc = osc(SimDevice::new(Sampling::default()));
        osc.set_transfer_function(vec![Complex64::new(1.0, 0.0); 4097])
            .unwrap();
        let ideal: Vec<f64> = (0..8192)
            .map(|i| (2.0 * std::f64::consts::PI * 4.0 * f64::from(i) / 8192.0).sin())
            .collect();
        osc.set_ideal_waveform(ideal.clone()).unwrap();
        // ADC reads all zeros so the error is -ideal
        osc.registers_mut().inject_raw(0, vec![0.0; 8192]);
        osc.registers_mut().inject_raw(1, vec![0.0; 8192]);
        osc.acquire().unwrap();
        let rms = osc.optimize_amplitude(0.5, 1).unwrap();
        assert_abs_diff_eq!(rms, 0.5_f64.sqrt(), epsilon = 1e-9);
        // Low frequency content passes the window untouched
        for (d, i) in osc.dac(1).iter().zip(&ideal) {
            assert_abs_diff_eq!(*d, 0.5 * i, epsilon = 1e-4);
        }
        assert!(osc.dac(0).iter().all(|v| *v == 0.0));
    }
}
