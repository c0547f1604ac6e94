//! Register-level access to the oscillo gateware

use std::io;

/// Base address of the configuration registers
pub const CONFIG_ADDR: u64 = 0x6000_0000;
/// Base address of the status registers
pub const STATUS_ADDR: u64 = 0x5000_0000;
/// Base address of the DAC waveform memory
pub const DAC_ADDR: u64 = 0x4000_0000;
/// Base address of the ADC 1 sample memory
pub const ADC1_ADDR: u64 = 0x4200_0000;
/// Base address of the ADC 2 sample memory
pub const ADC2_ADDR: u64 = 0x4400_0000;
/// Size of a register page
pub const PAGE_SIZE: usize = 4096;

/// Config offset holding the address strobe (bit 1)
pub const ADDR_OFF: u32 = 0;
/// Bit in `ADDR_OFF` that latches a capture
pub const ADDR_STROBE_BIT: u32 = 1;
/// Config offset of the ADC 1 averaging switch (bit 0, inverted)
pub const AVG1_OFF: u32 = 24;
/// Config offset of the ADC 2 averaging switch (bit 0, inverted)
pub const AVG2_OFF: u32 = 28;
/// Bit in the averaging offsets
pub const AVG_BIT: u32 = 0;
/// Status offset of the ADC 1 averaging count
pub const N_AVG1_OFF: u32 = 8;
/// Status offset of the ADC 2 averaging count
pub const N_AVG2_OFF: u32 = 12;

/// The memory regions the controller touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryMap {
    Config,
    Status,
    Dac,
    Adc1,
    Adc2,
}

impl MemoryMap {
    pub const ALL: [MemoryMap; 5] = [
        MemoryMap::Config,
        MemoryMap::Status,
        MemoryMap::Dac,
        MemoryMap::Adc1,
        MemoryMap::Adc2,
    ];

    #[must_use]
    pub fn base_address(self) -> u64 {
        match self {
            MemoryMap::Config => CONFIG_ADDR,
            MemoryMap::Status => STATUS_ADDR,
            MemoryMap::Dac => DAC_ADDR,
            MemoryMap::Adc1 => ADC1_ADDR,
            MemoryMap::Adc2 => ADC2_ADDR,
        }
    }

    /// Size of the region in bytes for a device `n` samples deep
    #[must_use]
    pub fn size(self, n: usize) -> usize {
        match self {
            MemoryMap::Config | MemoryMap::Status => PAGE_SIZE,
            MemoryMap::Dac | MemoryMap::Adc1 | MemoryMap::Adc2 => n / 1024 * PAGE_SIZE,
        }
    }

    /// ADC memory for a channel index
    #[must_use]
    pub fn adc(channel: usize) -> Self {
        if channel == 0 {
            MemoryMap::Adc1
        } else {
            MemoryMap::Adc2
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("Failed to map device memory - {0}")]
    Map(#[from] io::Error),
    #[error("Access at offset {offset:#x} of {len} words runs past the end of {map:?}")]
    OutOfBounds {
        map: MemoryMap,
        offset: usize,
        len: usize,
    },
    #[error("Simulated device failed - {0}")]
    Simulation(String),
    #[error("DAC channel {channel} sample {index} is not finite")]
    NonFiniteSample { channel: usize, index: usize },
}

/// Synchronous access to the gateware registers and sample memories.
///
/// Offsets are in bytes from the start of the map. Buffers are 32-bit words;
/// reads hand them back as `f64` so that a failed transfer can show up as NaN.
pub trait Registers {
    fn set_bit(&mut self, map: MemoryMap, offset: u32, bit: u32) -> Result<(), DeviceError>;

    fn clear_bit(&mut self, map: MemoryMap, offset: u32, bit: u32) -> Result<(), DeviceError>;

    fn read(&mut self, map: MemoryMap, offset: u32) -> Result<u32, DeviceError>;

    fn read_buffer(
        &mut self,
        map: MemoryMap,
        offset: u32,
        out: &mut [f64],
    ) -> Result<(), DeviceError>;

    fn write_buffer(&mut self, map: MemoryMap, offset: u32, data: &[u32])
        -> Result<(), DeviceError>;
}

impl<R: Registers + ?Sized> Registers for &mut R {
    fn set_bit(&mut self, map: MemoryMap, offset: u32, bit: u32) -> Result<(), DeviceError> {
        (**self).set_bit(map, offset, bit)
    }

    fn clear_bit(&mut self, map: MemoryMap, offset: u32, bit: u32) -> Result<(), DeviceError> {
        (**self).clear_bit(map, offset, bit)
    }

    fn read(&mut self, map: MemoryMap, offset: u32) -> Result<u32, DeviceError> {
        (**self).read(map, offset)
    }

    fn read_buffer(
        &mut self,
        map: MemoryMap,
        offset: u32,
        out: &mut [f64],
    ) -> Result<(), DeviceError> {
        (**self).read_buffer(map, offset, out)
    }

    fn write_buffer(
        &mut self,
        map: MemoryMap,
        offset: u32,
        data: &[u32],
    ) -> Result<(), DeviceError> {
        (**self).write_buffer(map, offset, data)
    }
}

/// Full-scale DAC code magnitude (14 bit, signed)
const DAC_HALF_SCALE: f64 = 8192.0;

/// Pack both DAC channels into gateware words.
///
/// Each sample in `[-1, 1)` becomes a 14 bit offset-binary code; channel 1
/// sits in the low half-word, channel 2 in the high half-word. Finite samples
/// outside the range are clipped, NaN and infinities are refused.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn pack_dac(ch1: &[f64], ch2: &[f64]) -> Result<Vec<u32>, DeviceError> {
    let code = |channel: usize, index: usize, v: f64| -> Result<u32, DeviceError> {
        if !v.is_finite() {
            return Err(DeviceError::NonFiniteSample { channel, index });
        }
        let c = (v * DAC_HALF_SCALE)
            .floor()
            .clamp(-DAC_HALF_SCALE, DAC_HALF_SCALE - 1.0);
        Ok((c + DAC_HALF_SCALE) as u32 & 0x3FFF)
    };
    ch1.iter()
        .zip(ch2)
        .enumerate()
        .map(|(i, (a, b))| Ok(code(0, i, *a)? | (code(1, i, *b)? << 16)))
        .collect()
}

/// Inverse of [`pack_dac`], returning the quantized samples of both channels
#[must_use]
pub fn unpack_dac(word: u32) -> (f64, f64) {
    let value = |c: u32| (f64::from(c & 0x3FFF) - DAC_HALF_SCALE) / DAC_HALF_SCALE;
    (value(word), value(word >> 16))
}
