//! The oscillo controller: ADC acquisition, DAC output and calibration state

use crate::{
    common::{
        check_channel, check_len, Fault, Result, Sampling, SettleDelays, CHANNELS,
        GAUSSIAN_SIGMA,
    },
    device::{
        pack_dac, MemoryMap, Registers, ADDR_OFF, ADDR_STROBE_BIT, AVG1_OFF, AVG2_OFF, AVG_BIT,
        N_AVG1_OFF,
    },
    fft::Transformer,
};
use ndarray::{Array2, ArrayView1, ArrayViewMut1};
use num_complex::Complex64;
use rand::{rngs::StdRng, SeedableRng};
use std::thread::sleep;
use tracing::{debug, warn};

/// ADC words are two's complement in an unsigned register
const WRAP: f64 = 4_294_967_296.0;
const HALF_WRAP: f64 = 2_147_483_648.0;

/// Construction parameters for [`Oscillo`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OscilloConfig {
    pub sampling: Sampling,
    /// Standard deviation of the correction window, in Hz
    pub gaussian_sigma: f64,
    pub delays: SettleDelays,
    /// Seed for the probe phases, drawn from the OS if `None`
    pub seed: Option<u64>,
}

impl Default for OscilloConfig {
    fn default() -> Self {
        Self {
            sampling: Sampling::default(),
            gaussian_sigma: GAUSSIAN_SIGMA,
            delays: SettleDelays::default(),
            seed: None,
        }
    }
}

pub struct Oscillo<R: Registers> {
    pub(crate) regs: R,
    pub(crate) sampling: Sampling,
    pub(crate) delays: SettleDelays,
    pub(crate) fft: Transformer,
    pub(crate) rng: StdRng,
    avg_on: bool,
    fault: Option<Fault>,
    pub(crate) adc: Array2<f64>,
    pub(crate) dac: Array2<f64>,
    pub(crate) spectrum: Array2<Complex64>,
    pub(crate) avg_spectrum: Array2<f64>,
    pub(crate) ideal_amplitude_waveform: Vec<f64>,
    pub(crate) amplitude_transfer_function: Vec<Complex64>,
    pub(crate) gaussian_filter: Vec<f64>,
    // Calibration
    adc_offset: [f64; CHANNELS],
    optical_power: [f64; CHANNELS],
    power: [f64; CHANNELS],
}

impl<R: Registers> Oscillo<R> {
    /// Build the controller and put the device in a known state (DAC silent, averaging off)
    pub fn new(regs: R, config: OscilloConfig) -> Result<Self> {
        let sampling = config.sampling;
        let n = sampling.n;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut osc = Self {
            regs,
            sampling,
            delays: config.delays,
            fft: Transformer::new(),
            rng,
            avg_on: false,
            fault: None,
            adc: Array2::zeros((CHANNELS, n)),
            dac: Array2::zeros((CHANNELS, n)),
            spectrum: Array2::zeros((CHANNELS, n / 2)),
            avg_spectrum: Array2::zeros((CHANNELS, n / 2)),
            ideal_amplitude_waveform: vec![0.0; n],
            amplitude_transfer_function: vec![Complex64::new(1.0, 0.0); sampling.n_freqs()],
            gaussian_filter: sampling.gaussian_filter(config.gaussian_sigma),
            adc_offset: [0.0; CHANNELS],
            optical_power: [1.0; CHANNELS],
            power: [1.0; CHANNELS],
        };
        osc.reset()?;
        Ok(osc)
    }

    /// Silence the DAC, turn averaging off and forget any latched fault
    pub fn reset(&mut self) -> Result<()> {
        self.dac.fill(0.0);
        self.set_dac()?;
        self.set_averaging(false)?;
        self.fault = None;
        Ok(())
    }

    /// Switch hardware averaging on both ADCs. The enable bits are active low.
    pub fn set_averaging(&mut self, avg_on: bool) -> Result<()> {
        debug!("Setting averaging to {avg_on}");
        self.avg_on = avg_on;
        if avg_on {
            self.regs.clear_bit(MemoryMap::Config, AVG1_OFF, AVG_BIT)?;
            self.regs.clear_bit(MemoryMap::Config, AVG2_OFF, AVG_BIT)?;
        } else {
            self.regs.set_bit(MemoryMap::Config, AVG1_OFF, AVG_BIT)?;
            self.regs.set_bit(MemoryMap::Config, AVG2_OFF, AVG_BIT)?;
        }
        Ok(())
    }

    /// Latch a capture and read both ADC channels into [`Oscillo::adc`].
    ///
    /// Returns the fault of this capture, which is also latched until
    /// [`Oscillo::clear_fault`]. On a fault the buffers are left uncalibrated.
    /// `Err` is reserved for register access failures.
    pub fn acquire(&mut self) -> Result<Option<Fault>> {
        self.regs
            .set_bit(MemoryMap::Config, ADDR_OFF, ADDR_STROBE_BIT)?;
        sleep(self.delays.capture);
        for (channel, mut row) in self.adc.outer_iter_mut().enumerate() {
            let buf = row
                .as_slice_mut()
                .expect("rows of a standard layout array are contiguous");
            self.regs.read_buffer(MemoryMap::adc(channel), 0, buf)?;
        }

        // Check reception
        if self.adc[[0, 0]].is_nan() || self.adc[[1, 0]].is_nan() {
            return Ok(Some(self.latch(Fault::Reception)));
        }

        self.adc
            .mapv_inplace(|x| (x - HALF_WRAP).rem_euclid(WRAP) - HALF_WRAP);

        // The averaging count is only valid while the strobe is asserted,
        // so it has to be read before the strobe is cleared below.
        if self.avg_on {
            let n_avg = self.regs.read(MemoryMap::Status, N_AVG1_OFF)?;
            if n_avg == 0 {
                self.regs
                    .clear_bit(MemoryMap::Config, ADDR_OFF, ADDR_STROBE_BIT)?;
                return Ok(Some(self.latch(Fault::AveragingCount)));
            }
            self.adc /= f64::from(n_avg);
        }

        self.regs
            .clear_bit(MemoryMap::Config, ADDR_OFF, ADDR_STROBE_BIT)?;

        for (channel, mut row) in self.adc.outer_iter_mut().enumerate() {
            let offset = self.adc_offset[channel];
            let gain = self.optical_power[channel] / self.power[channel];
            row.mapv_inplace(|x| (x - offset) * gain);
        }
        Ok(None)
    }

    fn latch(&mut self, fault: Fault) -> Fault {
        warn!("Acquisition failed - {fault}");
        self.fault = Some(fault);
        fault
    }

    /// Push the commanded waveforms of both channels to the DAC
    ///
    /// # Panics
    /// Never in practice: the DAC buffer is allocated in standard layout.
    pub fn set_dac(&mut self) -> Result<()> {
        let contiguous = "rows of a standard layout array are contiguous";
        let words = pack_dac(
            self.dac.row(0).to_slice().expect(contiguous),
            self.dac.row(1).to_slice().expect(contiguous),
        )?;
        self.regs.write_buffer(MemoryMap::Dac, 0, &words)?;
        Ok(())
    }

    /// Latest capture, one row per channel
    #[must_use]
    pub fn adc(&self) -> &Array2<f64> {
        &self.adc
    }

    /// Commanded waveform of a channel
    #[must_use]
    pub fn dac(&self, channel: usize) -> ArrayView1<f64> {
        self.dac.row(channel)
    }

    /// Mutable commanded waveform of a channel. Call [`Oscillo::set_dac`] to apply it.
    pub fn dac_mut(&mut self, channel: usize) -> Result<ArrayViewMut1<f64>> {
        check_channel(channel)?;
        Ok(self.dac.row_mut(channel))
    }

    #[must_use]
    pub fn avg_on(&self) -> bool {
        self.avg_on
    }

    #[must_use]
    pub fn fault(&self) -> Option<Fault> {
        self.fault
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.fault.is_some()
    }

    pub fn clear_fault(&mut self) {
        self.fault = None;
    }

    #[must_use]
    pub fn sampling(&self) -> Sampling {
        self.sampling
    }

    #[must_use]
    pub fn gaussian_filter(&self) -> &[f64] {
        &self.gaussian_filter
    }

    #[must_use]
    pub fn transfer_function(&self) -> &[Complex64] {
        &self.amplitude_transfer_function
    }

    /// Replace the transfer function, e.g. with one measured in an earlier session
    pub fn set_transfer_function(&mut self, transfer_function: Vec<Complex64>) -> Result<()> {
        check_len(self.sampling.n_freqs(), transfer_function.len())?;
        self.amplitude_transfer_function = transfer_function;
        Ok(())
    }

    #[must_use]
    pub fn ideal_waveform(&self) -> &[f64] {
        &self.ideal_amplitude_waveform
    }

    pub fn set_ideal_waveform(&mut self, waveform: Vec<f64>) -> Result<()> {
        check_len(self.sampling.n, waveform.len())?;
        self.ideal_amplitude_waveform = waveform;
        Ok(())
    }

    pub fn set_adc_offset(&mut self, offset: [f64; CHANNELS]) {
        self.adc_offset = offset;
    }

    pub fn set_optical_power(&mut self, optical_power: [f64; CHANNELS]) {
        self.optical_power = optical_power;
    }

    pub fn set_power(&mut self, power: [f64; CHANNELS]) {
        self.power = power;
    }

    #[must_use]
    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut R {
        &mut self.regs
    }
}
