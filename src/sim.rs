//! A simulated oscillo board: DAC words are looped back into the ADCs
//! through a known linear response.

use crate::{
    common::Sampling,
    device::{
        unpack_dac, DeviceError, MemoryMap, Registers, AVG1_OFF, AVG2_OFF, AVG_BIT, N_AVG1_OFF,
        N_AVG2_OFF,
    },
    fft::Transformer,
};
use num_complex::Complex64;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal, NormalError};
use std::collections::HashMap;
use tracing::debug;

/// Default low-pass corner of the simulated analog path
const DEFAULT_CUTOFF: f64 = 20e6;
/// Default ADC counts per unit of DAC full scale
const DEFAULT_ADC_SCALE: f64 = 8192.0;

/// Register traffic, recorded for inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    SetBit(MemoryMap, u32, u32),
    ClearBit(MemoryMap, u32, u32),
    Read(MemoryMap, u32),
    ReadBuffer(MemoryMap),
    WriteBuffer(MemoryMap),
}

pub struct SimDevice {
    sampling: Sampling,
    registers: HashMap<(MemoryMap, u32), u32>,
    dac_words: Vec<u32>,
    /// Complex gain of the DAC → ADC path per real-FFT bin
    response: Vec<Complex64>,
    adc_scale: f64,
    noise: Option<Normal<f64>>,
    rng: StdRng,
    averages: u32,
    injected: [Option<Vec<f64>>; 2],
    /// Captures left before ADC 1 drops one
    drop_after: Option<usize>,
    log: Vec<Access>,
    fft: Transformer,
}

impl SimDevice {
    /// A noiseless board with a first-order low-pass between DAC and ADC
    #[must_use]
    pub fn new(sampling: Sampling) -> Self {
        Self {
            sampling,
            registers: HashMap::new(),
            dac_words: vec![0; sampling.n],
            response: vec![],
            adc_scale: DEFAULT_ADC_SCALE,
            noise: None,
            rng: StdRng::seed_from_u64(0),
            averages: 1,
            injected: [None, None],
            drop_after: None,
            log: vec![],
            fft: Transformer::new(),
        }
        .with_lowpass(DEFAULT_CUTOFF, 1.0)
    }

    /// Replace the analog path by `gain / (1 + j f / cutoff)`
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn with_lowpass(mut self, cutoff: f64, gain: f64) -> Self {
        let df = self.sampling.fs / self.sampling.n as f64;
        let n_freqs = self.sampling.n_freqs();
        self.response = (0..n_freqs)
            .map(|k| Complex64::new(gain, 0.0) / Complex64::new(1.0, k as f64 * df / cutoff))
            .collect();
        // A real signal has a real Nyquist bin
        self.response[n_freqs - 1].im = 0.0;
        self
    }

    /// Add white Gaussian noise of `sigma` ADC counts to every sample
    pub fn with_noise(mut self, sigma: f64, seed: u64) -> Result<Self, NormalError> {
        self.noise = Some(Normal::new(0.0, sigma)?);
        self.rng = StdRng::seed_from_u64(seed);
        Ok(self)
    }

    /// ADC counts produced by a full scale DAC sample at DC
    #[must_use]
    pub fn with_adc_scale(mut self, adc_scale: f64) -> Self {
        self.adc_scale = adc_scale;
        self
    }

    /// The true transfer function, in ADC counts per unit of DAC full scale
    #[must_use]
    pub fn transfer_function(&self) -> Vec<Complex64> {
        self.response.iter().map(|h| h * self.adc_scale).collect()
    }

    /// Value reported by the averaging count registers
    pub fn set_averages(&mut self, averages: u32) {
        self.averages = averages;
    }

    /// Serve these raw words for an ADC channel instead of the loopback
    pub fn inject_raw(&mut self, channel: usize, raw: Vec<f64>) {
        self.injected[channel] = Some(raw);
    }

    /// Go back to serving the loopback on every channel
    pub fn clear_injected(&mut self) {
        self.injected = [None, None];
        self.drop_after = None;
    }

    /// Let `captures` more ADC 1 readouts through, then lose the next one (sample 0 reads NaN)
    pub fn drop_capture_after(&mut self, captures: usize) {
        self.drop_after = Some(captures);
    }

    /// State of a register bit
    #[must_use]
    pub fn bit(&self, map: MemoryMap, offset: u32, bit: u32) -> bool {
        self.registers
            .get(&(map, offset))
            .is_some_and(|w| w & (1 << bit) != 0)
    }

    #[must_use]
    pub fn log(&self) -> &[Access] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Last waveform written to a DAC channel, after quantization
    #[must_use]
    pub fn dac(&self, channel: usize) -> Vec<f64> {
        self.dac_words
            .iter()
            .map(|w| {
                let (a, b) = unpack_dac(*w);
                if channel == 0 {
                    a
                } else {
                    b
                }
            })
            .collect()
    }

    fn averaging(&self, channel: usize) -> bool {
        let offset = if channel == 0 { AVG1_OFF } else { AVG2_OFF };
        // Active low
        !self.bit(MemoryMap::Config, offset, AVG_BIT)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn loopback(&mut self, channel: usize, out: &mut [f64]) -> Result<(), DeviceError> {
        let to_device = |e: crate::common::Error| DeviceError::Simulation(e.to_string());
        let dac = self.dac(channel);
        let mut spectrum = self.fft.forward_vec(&dac).map_err(to_device)?;
        spectrum
            .iter_mut()
            .zip(&self.response)
            .for_each(|(x, h)| *x *= h);
        self.fft.inverse(&spectrum, out).map_err(to_device)?;
        let averages = if self.averaging(channel) {
            f64::from(self.averages)
        } else {
            1.0
        };
        for v in out.iter_mut() {
            let mut counts = *v * self.adc_scale;
            if let Some(noise) = &self.noise {
                counts += noise.sample(&mut self.rng);
            }
            // Two's complement in an unsigned word
            let word = (counts.round() * averages) as i64;
            *v = word.rem_euclid(1 << 32) as f64;
        }
        Ok(())
    }
}

impl Registers for SimDevice {
    fn set_bit(&mut self, map: MemoryMap, offset: u32, bit: u32) -> Result<(), DeviceError> {
        self.log.push(Access::SetBit(map, offset, bit));
        *self.registers.entry((map, offset)).or_default() |= 1 << bit;
        Ok(())
    }

    fn clear_bit(&mut self, map: MemoryMap, offset: u32, bit: u32) -> Result<(), DeviceError> {
        self.log.push(Access::ClearBit(map, offset, bit));
        *self.registers.entry((map, offset)).or_default() &= !(1 << bit);
        Ok(())
    }

    fn read(&mut self, map: MemoryMap, offset: u32) -> Result<u32, DeviceError> {
        self.log.push(Access::Read(map, offset));
        match (map, offset) {
            (MemoryMap::Status, N_AVG1_OFF | N_AVG2_OFF) => Ok(self.averages),
            _ => Ok(self.registers.get(&(map, offset)).copied().unwrap_or(0)),
        }
    }

    fn read_buffer(
        &mut self,
        map: MemoryMap,
        offset: u32,
        out: &mut [f64],
    ) -> Result<(), DeviceError> {
        self.log.push(Access::ReadBuffer(map));
        let channel = match map {
            MemoryMap::Adc1 => 0,
            MemoryMap::Adc2 => 1,
            _ => {
                return Err(DeviceError::OutOfBounds {
                    map,
                    offset: offset as usize,
                    len: out.len(),
                })
            }
        };
        if offset != 0 || out.len() != self.sampling.n {
            return Err(DeviceError::OutOfBounds {
                map,
                offset: offset as usize,
                len: out.len(),
            });
        }
        if let Some(raw) = &self.injected[channel] {
            for (o, r) in out.iter_mut().zip(raw) {
                *o = *r;
            }
        } else {
            self.loopback(channel, out)?;
        }
        if channel == 0 {
            match self.drop_after {
                Some(0) => {
                    debug!("Simulated ADC 1 readout lost");
                    self.drop_after = None;
                    out[0] = f64::NAN;
                }
                Some(n) => self.drop_after = Some(n - 1),
                None => (),
            }
        }
        Ok(())
    }

    fn write_buffer(
        &mut self,
        map: MemoryMap,
        offset: u32,
        data: &[u32],
    ) -> Result<(), DeviceError> {
        self.log.push(Access::WriteBuffer(map));
        if map == MemoryMap::Dac {
            if offset != 0 || data.len() != self.sampling.n {
                return Err(DeviceError::OutOfBounds {
                    map,
                    offset: offset as usize,
                    len: data.len(),
                });
            }
            debug!("Simulated DAC updated");
            self.dac_words.copy_from_slice(data);
        } else {
            for (i, w) in data.iter().enumerate() {
                self.registers.insert((map, offset + 4 * i as u32), *w);
            }
        }
        Ok(())
    }
}
