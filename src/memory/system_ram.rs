/*
    Copyright (C) 2020-2023  Rafal Michalski

    This file is part of PCMEM, a Rust library for building PC emulators.

    For the full copyright notice, see the lib.rs file.
*/
use log::debug;

use super::{
    AddressSpace, AliasHandler, BufferRef, MappingFlags, MemState, RamHandler, RegionId,
    HIGH_MEM_BASE, LOW_MEM_TOP
};

/// The default PC RAM layout.
///
/// * Low RAM: `0..640K`, internal.
/// * Mid RAM: `640K..1M`, identity mapped but hidden behind the EXTERNAL memory state
///   until a chipset shadows it.
/// * High RAM: `1M..` up to the RAM size, internal.
/// * Remapped RAM: the RAM under the `640K..1M` hole exposed at the top of memory, disabled
///   until [SystemRam::remap_top] is called.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SystemRam {
    low: RegionId,
    mid: Option<RegionId>,
    high: Option<RegionId>,
    remapped: RegionId
}

impl SystemRam {
    /// Registers and enables the RAM regions in the address space and sets the default memory state.
    pub fn install(space: &mut AddressSpace) -> Self {
        let ram_size = space.config().ram_size;
        let low_size = ram_size.min(LOW_MEM_TOP);
        let low = space.add_region(0, low_size, RamHandler, Some(BufferRef::ram(0)), MappingFlags::INTERNAL);
        space.set_mem_state(0, low_size, MemState::INTERNAL);
        space.enable_region(low);

        space.set_mem_state(LOW_MEM_TOP, HIGH_MEM_BASE - LOW_MEM_TOP, MemState::EXTERNAL);
        let mid = if ram_size > LOW_MEM_TOP {
            let size = ram_size.min(HIGH_MEM_BASE) - LOW_MEM_TOP;
            let mid = space.add_region(LOW_MEM_TOP, size, RamHandler, Some(BufferRef::ram(LOW_MEM_TOP)),
                                       MappingFlags::INTERNAL);
            space.enable_region(mid);
            Some(mid)
        }
        else {
            None
        };

        let high = if ram_size > HIGH_MEM_BASE {
            let size = ram_size - HIGH_MEM_BASE;
            let high = space.add_region(HIGH_MEM_BASE, size, RamHandler, Some(BufferRef::ram(HIGH_MEM_BASE)),
                                        MappingFlags::INTERNAL);
            space.set_mem_state(HIGH_MEM_BASE, size, MemState::INTERNAL);
            space.enable_region(high);
            Some(high)
        }
        else {
            None
        };

        let remapped = space.add_region(ram_size.max(HIGH_MEM_BASE), 0, AliasHandler::new(),
                                        Some(BufferRef::ram(LOW_MEM_TOP)), MappingFlags::INTERNAL);
        debug!("system RAM: {} KB", ram_size >> 10);
        SystemRam { low, mid, high, remapped }
    }

    #[inline]
    pub fn low(&self) -> RegionId {
        self.low
    }

    #[inline]
    pub fn mid(&self) -> Option<RegionId> {
        self.mid
    }

    #[inline]
    pub fn high(&self) -> Option<RegionId> {
        self.high
    }

    #[inline]
    pub fn remapped(&self) -> RegionId {
        self.remapped
    }
    /// Exposes up to `kb` kilobytes of the RAM starting at 640K at the top of memory
    /// (at the RAM size, but not below 1M). `0` removes the remapping.
    ///
    /// Does nothing if there is no RAM above 640K. Flushes the translation cache.
    pub fn remap_top(&self, space: &mut AddressSpace, kb: u32) {
        let ram_size = space.config().ram_size;
        if ram_size <= LOW_MEM_TOP {
            return
        }
        if kb == 0 {
            debug!("remap top: off");
            space.disable_region(self.remapped);
            space.flush();
            return
        }
        let start = ram_size.max(HIGH_MEM_BASE);
        let size = kb.min((ram_size - LOW_MEM_TOP) >> 10) << 10;
        debug!("remap top: {} KB at {:#010x}", size >> 10, start);
        space.reset_page_bookkeeping(start, size);
        space.set_mem_state(start, size, MemState::INTERNAL);
        space.set_region_addr(self.remapped, start, size);
        space.set_region_alias(self.remapped, Some(BufferRef::ram(LOW_MEM_TOP)));
        space.enable_region(self.remapped);
        space.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Accessor, MemoryConfig, UNMAPPED_BYTE};

    #[test]
    fn system_ram_works() {
        let mut space = AddressSpace::new(MemoryConfig { ram_size: 2 << 20, address_bits: 24 }).unwrap();
        let sysram = SystemRam::install(&mut space);
        space.flush();
        assert!(sysram.mid().is_some());
        assert_eq!(space.region(sysram.high().unwrap()).size(), 1 << 20);
        space.write_byte(Accessor::Cpu, 0x9FFFF, 1);
        space.write_byte(Accessor::Cpu, 0xA0000, 2);
        space.write_byte(Accessor::Bus, 0x10_0000, 3);
        assert_eq!(space.read_byte(Accessor::Bus, 0x9FFFF), 1);
        assert_eq!(space.read_byte(Accessor::Cpu, 0xA0000), UNMAPPED_BYTE);
        assert_eq!(space.read_byte(Accessor::Cpu, 0x10_0000), 3);
        assert_eq!(space.read_byte(Accessor::Cpu, 0x20_0000), UNMAPPED_BYTE);
        // shadowing exposes the mid RAM
        space.set_mem_state(0xA0000, 0x1000, MemState::INTERNAL);
        space.write_byte(Accessor::Cpu, 0xA0000, 2);
        assert_eq!(space.read_byte(Accessor::Cpu, 0xA0000), 2);
        assert_eq!(space.backing().ram().read_byte(0xA0000), 2);
        assert_eq!(space.fetch_byte(0xA0000), 2);

        sysram.remap_top(&mut space, 256);
        assert!(!space.is_flush_pending());
        assert_eq!(space.region(sysram.remapped()).base(), 0x20_0000);
        assert_eq!(space.region(sysram.remapped()).size(), 256 << 10);
        assert_eq!(space.read_byte(Accessor::Cpu, 0x20_0000), 2);
        assert_eq!(space.fetch_byte(0x20_0000), 2);
        space.write_byte(Accessor::Cpu, 0x20_0001, 4);
        assert_eq!(space.backing().ram().read_byte(0xA0001), 4);
        assert_eq!(space.read_byte(Accessor::Cpu, 0x24_0000), UNMAPPED_BYTE);
        sysram.remap_top(&mut space, 0);
        assert_eq!(space.read_byte(Accessor::Cpu, 0x20_0000), UNMAPPED_BYTE);
    }

    #[test]
    fn system_ram_small_works() {
        let mut space = AddressSpace::new(MemoryConfig { ram_size: 512 << 10, address_bits: 20 }).unwrap();
        let sysram = SystemRam::install(&mut space);
        assert_eq!(sysram.mid(), None);
        assert_eq!(sysram.high(), None);
        assert_eq!(space.region(sysram.low()).size(), 512 << 10);
        space.write_byte(Accessor::Cpu, 0x7FFFF, 0x42);
        assert_eq!(space.read_byte(Accessor::Cpu, 0x7FFFF), 0x42);
        assert_eq!(space.read_byte(Accessor::Cpu, 0x80000), UNMAPPED_BYTE);
        sysram.remap_top(&mut space, 64);
        assert!(!space.region(sysram.remapped()).is_enabled());
    }
}
