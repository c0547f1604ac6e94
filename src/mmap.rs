//! Register access through `/dev/mem`, for running on the board itself

use crate::device::{DeviceError, MemoryMap, Registers};
use memmap2::{MmapMut, MmapOptions};
use std::{collections::HashMap, fs::OpenOptions, path::Path};
use tracing::debug;

/// Device memory mapped into this process
pub struct DevMem {
    maps: HashMap<MemoryMap, MmapMut>,
}

impl DevMem {
    /// Map every region used by the controller for a device `n` samples deep
    pub fn open(path: impl AsRef<Path>, n: usize) -> Result<Self, DeviceError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut maps = HashMap::new();
        for map in MemoryMap::ALL {
            debug!(
                "Mapping {:?} at {:#010x} ({} bytes)",
                map,
                map.base_address(),
                map.size(n)
            );
            // Safety: the physical regions belong to the gateware and are never truncated
            let region = unsafe {
                MmapOptions::new()
                    .offset(map.base_address())
                    .len(map.size(n))
                    .map_mut(&file)?
            };
            maps.insert(map, region);
        }
        Ok(Self { maps })
    }

    fn words(&mut self, map: MemoryMap, offset: u32, len: usize) -> Result<*mut u32, DeviceError> {
        let region = self
            .maps
            .get_mut(&map)
            .expect("every MemoryMap is mapped in DevMem::open");
        let offset = offset as usize;
        if offset % 4 != 0 || offset + 4 * len > region.len() {
            return Err(DeviceError::OutOfBounds { map, offset, len });
        }
        // Safety: bounds and alignment checked above, mmaps are page aligned
        Ok(unsafe { region.as_mut_ptr().add(offset).cast::<u32>() })
    }

    fn modify(
        &mut self,
        map: MemoryMap,
        offset: u32,
        f: impl FnOnce(u32) -> u32,
    ) -> Result<(), DeviceError> {
        let ptr = self.words(map, offset, 1)?;
        // Safety: `words` validated the pointer
        unsafe { ptr.write_volatile(f(ptr.read_volatile())) };
        Ok(())
    }
}

impl Registers for DevMem {
    fn set_bit(&mut self, map: MemoryMap, offset: u32, bit: u32) -> Result<(), DeviceError> {
        self.modify(map, offset, |w| w | (1 << bit))
    }

    fn clear_bit(&mut self, map: MemoryMap, offset: u32, bit: u32) -> Result<(), DeviceError> {
        self.modify(map, offset, |w| w & !(1 << bit))
    }

    fn read(&mut self, map: MemoryMap, offset: u32) -> Result<u32, DeviceError> {
        let ptr = self.words(map, offset, 1)?;
        // Safety: `words` validated the pointer
        Ok(unsafe { ptr.read_volatile() })
    }

    fn read_buffer(
        &mut self,
        map: MemoryMap,
        offset: u32,
        out: &mut [f64],
    ) -> Result<(), DeviceError> {
        let ptr = self.words(map, offset, out.len())?;
        for (i, v) in out.iter_mut().enumerate() {
            // Safety: `words` validated the whole range
            *v = f64::from(unsafe { ptr.add(i).read_volatile() });
        }
        Ok(())
    }

    fn write_buffer(
        &mut self,
        map: MemoryMap,
        offset: u32,
        data: &[u32],
    ) -> Result<(), DeviceError> {
        let ptr = self.words(map, offset, data.len())?;
        for (i, v) in data.iter().enumerate() {
            // Safety: `words` validated the whole range
            unsafe { ptr.add(i).write_volatile(*v) };
        }
        Ok(())
    }
}
