//! Fixed-slab suballocator carving the per-device pool into equal blocks.

use crate::driver::DevicePtr;

const FREE: u32 = 0;
const BODY: u32 = u32::MAX;

/// First-fit block allocator over one contiguous device allocation.
///
/// Not thread-safe on its own; callers hold the device lease.
pub struct ZoneAllocator {
    base: DevicePtr,
    unit: usize,
    units: Vec<u32>,
}

impl ZoneAllocator {
    /// Wraps a device allocation of `nb_units · unit` bytes.
    pub fn new(base: DevicePtr, nb_units: usize, unit: usize) -> Self {
        debug_assert!(unit > 0);

        Self {
            base,
            unit,
            units: vec![FREE; nb_units],
        }
    }

    /// Block size in bytes.
    pub fn unit(&self) -> usize {
        self.unit
    }

    /// Total number of blocks.
    pub fn capacity(&self) -> usize {
        self.units.len()
    }

    /// Number of currently unallocated blocks.
    pub fn free_units(&self) -> usize {
        self.units.iter().filter(|&&unit| unit == FREE).count()
    }

    /// Allocates `size` bytes rounded up to whole blocks, first-fit.
    pub fn alloc(&mut self, size: usize) -> Option<DevicePtr> {
        let need = size.div_ceil(self.unit).max(1);
        let mut run = 0;
        for i in 0..self.units.len() {
            if self.units[i] == FREE {
                run += 1;
                if run == need {
                    let start = i + 1 - need;
                    self.units[start] = need as u32;
                    for unit in &mut self.units[start + 1..=i] {
                        *unit = BODY;
                    }

                    return Some(self.base.offset((start * self.unit) as u64));
                }
            } else {
                run = 0;
            }
        }

        None
    }

    /// Releases the allocation starting at `ptr`.
    pub fn free(&mut self, ptr: DevicePtr) {
        debug_assert!(ptr.0 >= self.base.0);

        let start = ((ptr.0 - self.base.0) as usize) / self.unit;
        let len = self.units[start] as usize;

        debug_assert!(len != FREE as usize && len != BODY as usize);

        for unit in &mut self.units[start..start + len] {
            *unit = FREE;
        }
    }

    /// Finalizes the allocator, returning the base pointer for device-side
    /// freeing.
    pub fn into_base(self) -> DevicePtr {
        self.base
    }
}
