//! Closed-loop amplitude calibration: measure the transfer function, then
//! pre-distort the DAC until ADC 1 follows the ideal waveform

use crate::{common::Error, device::Registers, oscillo::Oscillo};
use std::{fmt::Display, fs, path::Path};
use tracing::{info, warn};

/// Parameters of a calibration run
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// DAC channel being pre-distorted
    pub channel: usize,
    /// Probes averaged into the transfer function. Zero reuses the stored one.
    pub trials: usize,
    /// Pre-distortion steps
    pub iterations: usize,
    /// Step size of each pre-distortion step
    pub alpha: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            channel: 0,
            trials: 100,
            iterations: 20,
            alpha: 1.0,
        }
    }
}

/// Amplitude error RMS before every pre-distortion step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    pub error_rms: Vec<f64>,
}

impl Report {
    #[must_use]
    pub fn initial(&self) -> Option<f64> {
        self.error_rms.first().copied()
    }

    #[must_use]
    pub fn last(&self) -> Option<f64> {
        self.error_rms.last().copied()
    }
}

pub fn write_to_file<T: Display>(
    data: impl IntoIterator<Item = T>,
    filename: &Path,
) -> std::io::Result<()> {
    fs::write(
        filename,
        data.into_iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// Save the transfer function (magnitude and phase), the DAC waveform and the error history
pub fn save<R: Registers>(
    osc: &Oscillo<R>,
    report: &Report,
    channel: usize,
    dir: &Path,
) -> eyre::Result<()> {
    fs::create_dir_all(dir)?;
    let tf = osc.transfer_function();
    write_to_file(tf.iter().map(|h| h.norm()), &dir.join("transfer_magnitude"))?;
    write_to_file(tf.iter().map(|h| h.arg()), &dir.join("transfer_phase"))?;
    write_to_file(osc.dac(channel).iter(), &dir.join("dac"))?;
    write_to_file(&report.error_rms, &dir.join("error_rms"))?;
    info!("Calibration results written to {}", dir.display());
    Ok(())
}

pub fn calibrate<R: Registers>(
    osc: &mut Oscillo<R>,
    settings: &Settings,
) -> eyre::Result<Report> {
    info!("Calibrating amplitude on DAC {}", settings.channel);
    if settings.trials > 0 {
        // ADC 1 is the one compared against the ideal waveform
        osc.estimate_transfer_function(settings.channel, 0, settings.trials)?;
    }
    let mut report = Report::default();
    for i in 0..settings.iterations {
        osc.set_dac()?;
        std::thread::sleep(osc.delays.probe);
        match osc.acquire()? {
            None => (),
            Some(fault) => {
                warn!("Stopping calibration at iteration {i}");
                return Err(Error::Fault(fault).into());
            }
        }
        let rms = osc.optimize_amplitude(settings.alpha, settings.channel)?;
        info!("Iteration {} - amplitude error RMS {rms:.4}", i + 1);
        report.error_rms.push(rms);
    }
    // Leave the final waveform on the output
    osc.set_dac()?;
    info!("Calibration complete!");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::{Sampling, SettleDelays},
        oscillo::OscilloConfig,
        sim::SimDevice,
    };
    use approx::assert_abs_diff_eq;
    use num_complex::Complex64;
    use tempfile::TempDir;

    fn read_column(path: &Path) -> Vec<f64> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| l.parse().unwrap())
            .collect()
    }

    #[test]
    fn one_value_per_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("values");
        write_to_file([1.5, -2.0, 0.25], &path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1.5\n-2\n0.25");
        assert_eq!(read_column(&path), [1.5, -2.0, 0.25]);
    }

    #[test]
    fn save_writes_calibration_state() {
        let sampling = Sampling { n: 16, fs: 16.0 };
        let config = OscilloConfig {
            sampling,
            delays: SettleDelays::none(),
            seed: Some(0),
            ..Default::default()
        };
        let mut osc = Oscillo::new(SimDevice::new(sampling), config).unwrap();
        osc.set_transfer_function(vec![Complex64::new(0.0, 2.0); 9])
            .unwrap();
        osc.dac_mut(1).unwrap().fill(0.5);
        let report = Report {
            error_rms: vec![0.3, 0.1],
        };
        // Missing directories are created
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("run").join("1");
        save(&osc, &report, 1, &out).unwrap();

        assert_eq!(read_column(&out.join("transfer_magnitude")), vec![2.0; 9]);
        let phase = read_column(&out.join("transfer_phase"));
        assert_eq!(phase.len(), 9);
        for p in phase {
            assert_abs_diff_eq!(p, std::f64::consts::FRAC_PI_2, epsilon = 1e-12);
        }
        assert_eq!(read_column(&out.join("dac")), vec![0.5; 16]);
        assert_eq!(read_column(&out.join("error_rms")), [0.3, 0.1]);
    }
}
