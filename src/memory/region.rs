/*
    Copyright (C) 2020-2023  Rafal Michalski

    This file is part of PCMEM, a Rust library for building PC emulators.

    For the full copyright notice, see the lib.rs file.
*/
use pcmem_core::memory::{
    Accessor, BoxMemoryHandler, BufferRef, CpuMode, MappingFlags, MemoryHandler,
    PageState, RegionGeometry, RegionId,
    PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE
};

/// A range of the address space claimed by a device.
///
/// Regions are owned by an [AddressSpace][super::AddressSpace] and referred to by [RegionId]s.
#[derive(Debug)]
pub struct MappingRegion {
    pub(super) base: u32,
    pub(super) size: u32,
    pub(super) mask: u32,
    pub(super) alias: Option<BufferRef>,
    pub(super) limit: Option<u32>,
    pub(super) flags: MappingFlags,
    pub(super) enabled: bool,
    pub(super) stamp: u64,
    pub(super) handler: BoxMemoryHandler
}

impl MappingRegion {
    pub(super) fn new(
            base: u32,
            size: u32,
            alias: Option<BufferRef>,
            flags: MappingFlags,
            handler: BoxMemoryHandler
        ) -> Self
    {
        MappingRegion {
            base, size, mask: u32::max_value(), alias, limit: None, flags,
            enabled: false,
            stamp: 0,
            handler
        }
    }

    #[inline]
    pub fn base(&self) -> u32 {
        self.base
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }
    /// Returns the exclusive end address of the region.
    #[inline]
    pub fn end(&self) -> u64 {
        u64::from(self.base) + u64::from(self.size)
    }

    #[inline]
    pub fn mask(&self) -> u32 {
        self.mask
    }

    #[inline]
    pub fn alias(&self) -> Option<BufferRef> {
        self.alias
    }

    /// Returns the number of bytes of the alias reachable through the region, if limited.
    #[inline]
    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    #[inline]
    pub fn flags(&self) -> MappingFlags {
        self.flags
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
    /// Returns the sequence number of the last enable or relocation of the region.
    ///
    /// Of overlapping regions the one with the highest stamp wins.
    #[inline]
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    pub fn handler(&self) -> &dyn MemoryHandler {
        self.handler.as_ref()
    }

    #[inline]
    pub fn geometry(&self) -> RegionGeometry {
        RegionGeometry { base: self.base, size: self.size, mask: self.mask, alias: self.alias, limit: self.limit }
    }
    /// Returns `true` if the region intersects with `start..end`.
    #[inline]
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.size != 0 && u64::from(self.base) < end && self.end() > start
    }
    /// Returns the direct buffer view of the page starting at `page_start`.
    ///
    /// A view exists only if the region has an alias, covers the whole page,
    /// its mask doesn't fold the page and the page lies within the limit.
    pub fn page_alias(&self, page_start: u64) -> Option<BufferRef> {
        let alias = self.alias?;
        if self.mask & PAGE_OFFSET_MASK != PAGE_OFFSET_MASK
            || page_start < u64::from(self.base)
            || page_start + u64::from(PAGE_SIZE) > self.end()
        {
            return None
        }
        let offset = (page_start as u32).wrapping_sub(self.base) & self.mask;
        if let Some(limit) = self.limit {
            if u64::from(offset) + u64::from(PAGE_SIZE) > u64::from(limit) {
                return None
            }
        }
        Some(alias.add(offset))
    }
}

/// The outcome of region resolution for a single page.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct PageResolution {
    /// The read target for each [Accessor].
    pub read: [Option<RegionId>;2],
    /// The write target for each [Accessor].
    pub write: [Option<RegionId>;2],
    /// The direct buffer serving CPU instruction fetches.
    pub exec: Option<BufferRef>
}

#[inline]
fn pick<T: Copy>(slot: &mut Option<(u64, T)>, stamp: u64, item: T) {
    match slot {
        Some((best, _)) if *best >= stamp => {}
        _ => *slot = Some((stamp, item))
    }
}

/// Resolves which of the `candidates` serve the page with the given index.
///
/// For each kind of access and each [Accessor] the enabled region that covers the page,
/// has a capable handler and is allowed by the page `state` in the CPU `mode`
/// wins if it has the highest stamp. Instruction fetches additionally require
/// a direct buffer view of the page (see [MappingRegion::page_alias]).
pub fn resolve_page<'a, I>(candidates: I, state: &PageState, mode: CpuMode, page: usize) -> PageResolution
    where I: IntoIterator<Item=(RegionId, &'a MappingRegion)>
{
    let start = (page as u64) << PAGE_SHIFT;
    let end = start + u64::from(PAGE_SIZE);
    let mut read: [Option<(u64, RegionId)>;2] = [None;2];
    let mut write: [Option<(u64, RegionId)>;2] = [None;2];
    let mut exec: Option<(u64, BufferRef)> = None;
    for (id, region) in candidates {
        if !region.enabled || !region.overlaps(start, end) {
            continue
        }
        let readable = region.handler.is_readable();
        let writable = region.handler.is_writable();
        for &accessor in Accessor::ALL.iter() {
            let index = accessor.index();
            if readable && state.read_allowed(mode, accessor, region.flags, false) {
                pick(&mut read[index], region.stamp, id);
            }
            if writable && state.write_allowed(mode, accessor, region.flags) {
                pick(&mut write[index], region.stamp, id);
            }
        }
        if let Some(buf) = region.page_alias(start) {
            if state.read_allowed(mode, Accessor::Cpu, region.flags, true) {
                pick(&mut exec, region.stamp, buf);
            }
        }
    }
    PageResolution {
        read: [read[0].map(|(_, id)| id), read[1].map(|(_, id)| id)],
        write: [write[0].map(|(_, id)| id), write[1].map(|(_, id)| id)],
        exec: exec.map(|(_, buf)| buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcmem_core::memory::{AliasHandler, OpenBusHandler, RamHandler, StateTable, MemState, SmramAccess};

    fn region(base: u32, size: u32, alias: Option<BufferRef>, flags: MappingFlags, stamp: u64,
              handler: BoxMemoryHandler) -> MappingRegion
    {
        let mut region = MappingRegion::new(base, size, alias, flags, handler);
        region.enabled = true;
        region.stamp = stamp;
        region
    }

    #[test]
    fn page_alias_works() {
        let mut reg = region(0xE0000, 0x4000, Some(BufferRef::ram(0x20000)), MappingFlags::empty(), 1,
                             RamHandler.into());
        assert_eq!(reg.page_alias(0xE0000), Some(BufferRef::ram(0x20000)));
        assert_eq!(reg.page_alias(0xE3000), Some(BufferRef::ram(0x23000)));
        assert_eq!(reg.page_alias(0xE4000), None);
        assert_eq!(reg.page_alias(0xDF000), None);
        reg.mask = 0x1FFF;
        assert_eq!(reg.page_alias(0xE3000), Some(BufferRef::ram(0x21000)));
        reg.mask = 0x7FF;
        assert_eq!(reg.page_alias(0xE0000), None);
        reg.mask = u32::max_value();
        reg.limit = Some(0x2800);
        assert_eq!(reg.page_alias(0xE1000), Some(BufferRef::ram(0x21000)));
        assert_eq!(reg.page_alias(0xE2000), None);
        assert_eq!(reg.page_alias(0xE3000), None);
        reg.limit = None;
        reg.size = 0x800;
        assert_eq!(reg.page_alias(0xE0000), None);
        assert!(reg.overlaps(0xE0000, 0xE1000));
        reg.size = 0;
        assert!(!reg.overlaps(0xE0000, 0xE1000));
    }

    #[test]
    fn resolve_page_works() {
        let mut states = StateTable::new(0x100);
        let ram = region(0, 0x100000, Some(BufferRef::ram(0)), MappingFlags::INTERNAL, 1, RamHandler.into());
        let rom = region(0xE0000, 0x20000, Some(BufferRef::ram(0x200000)), MappingFlags::EXTERNAL, 2,
                         AliasHandler::read_only().into());
        let vga = region(0xA0000, 0x20000, None, MappingFlags::EXTERNAL, 3, OpenBusHandler.into());
        let ids = [RegionId::new(0), RegionId::new(1), RegionId::new(2)];
        let candidates = [(ids[0], &ram), (ids[1], &rom), (ids[2], &vga)];
        let resolve = |states: &StateTable, mode, page| {
            resolve_page(candidates.iter().copied(), states.get(page), mode, page)
        };

        let res = resolve(&states, CpuMode::Normal, 0x10);
        assert_eq!(res.read, [Some(ids[0]);2]);
        assert_eq!(res.write, [Some(ids[0]);2]);
        assert_eq!(res.exec, Some(BufferRef::ram(0x10000)));
        // the ROM wins reads, the read-only handler leaves writes to RAM
        let res = resolve(&states, CpuMode::Normal, 0xF0);
        assert_eq!(res.read, [Some(ids[1]);2]);
        assert_eq!(res.write, [Some(ids[0]);2]);
        assert_eq!(res.exec, Some(BufferRef::ram(0x210000)));
        // shadowing: reads from internal RAM, writes to RAM too
        states.set_state(0xF0000, 0x10000, MemState::INTERNAL, MemState::INTERNAL);
        let res = resolve(&states, CpuMode::Normal, 0xF0);
        assert_eq!(res.read, [Some(ids[0]);2]);
        assert_eq!(res.exec, Some(BufferRef::ram(0xF0000)));
        // the VGA has no direct buffer
        states.set_state(0xA0000, 0x20000, MemState::EXTERNAL, MemState::EXTERNAL);
        let res = resolve(&states, CpuMode::Normal, 0xA0);
        assert_eq!(res.read, [Some(ids[2]);2]);
        assert_eq!(res.write, [Some(ids[2]);2]);
        assert_eq!(res.exec, None);
        states.set_state(0xA0000, 0x1000, MemState::EXTERNAL, MemState::DISABLED);
        let res = resolve(&states, CpuMode::Normal, 0xA0);
        assert_eq!(res.read, [None, Some(ids[2])]);
        assert_eq!(res.write, [None, Some(ids[2])]);
        // SMM mode has its own state slot
        let smram = region(0xA0000, 0x20000, Some(BufferRef::smram(0)), MappingFlags::SMRAM, 4,
                           AliasHandler::new().into());
        let smram_id = RegionId::new(3);
        states.set_smram(CpuMode::Smm, Some(Accessor::Cpu), 0xA0000, 0x20000, SmramAccess::READ_WRITE);
        let with_smram = [(ids[0], &ram), (ids[2], &vga), (smram_id, &smram)];
        let res = resolve_page(with_smram.iter().copied(), states.get(0xA1), CpuMode::Normal, 0xA1);
        assert_eq!(res.read, [Some(ids[2]);2]);
        let res = resolve_page(with_smram.iter().copied(), states.get(0xA1), CpuMode::Smm, 0xA1);
        assert_eq!(res.read, [Some(smram_id), Some(ids[2])]);
        assert_eq!(res.write, [Some(smram_id), Some(ids[2])]);
        assert_eq!(res.exec, Some(BufferRef::smram(0x1000)));
        // disabled regions never win
        let mut ram2 = region(0x10000, 0x1000, Some(BufferRef::ram(0x80000)), MappingFlags::INTERNAL, 9,
                              RamHandler.into());
        ram2.enabled = false;
        let res = resolve_page([(ids[0], &ram), (smram_id, &ram2)].iter().copied(),
                               states.get(0x10), CpuMode::Normal, 0x10);
        assert_eq!(res.read, [Some(ids[0]);2]);
    }
}
