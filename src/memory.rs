/*
    Copyright (C) 2020-2023  Rafal Michalski

    This file is part of PCMEM, a Rust library for building PC emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The physical address space: mapping regions, memory state and the page cache.
use log::{debug, trace, warn};

mod region;
mod system_ram;

pub use pcmem_core::memory::*;
pub use region::*;
pub use system_ram::*;

/// The physical address space of an emulated PC.
///
/// Owns the backing store, the registry of [MappingRegion]s, the per-page memory state
/// and the [PageCache] derived from them. Every mutation keeps the page cache consistent
/// with the registry immediately. Translated code derived from the page cache must be
/// discarded by calling [AddressSpace::flush] (or [AddressSpace::flush_soft]) after a batch
/// of mutations and before the CPU resumes execution.
#[derive(Debug)]
pub struct AddressSpace {
    config: MemoryConfig,
    backing: Backing,
    pages: PageCache,
    states: StateTable,
    regions: Vec<RegionSlot>,
    free_slots: Vec<u32>,
    last_stamp: u64,
    mode: CpuMode,
    a20_mask: u32,
    fetch_cache: Option<(u32, BufferRef)>,
    generation: u64,
    flush_pending: bool,
    pending_reported: bool
}

#[derive(Debug)]
struct RegionSlot {
    generation: u32,
    region: Option<MappingRegion>
}

impl RegionSlot {
    #[inline]
    fn get(&self, id: RegionId) -> Option<&MappingRegion> {
        match self.region {
            Some(ref region) if self.generation == id.generation() => Some(region),
            _ => None
        }
    }

    #[inline]
    fn get_mut(&mut self, id: RegionId) -> Option<&mut MappingRegion> {
        match self.region {
            Some(ref mut region) if self.generation == id.generation() => Some(region),
            _ => None
        }
    }
}

impl AddressSpace {
    /// Creates an empty address space with all pages unmapped.
    pub fn new(config: MemoryConfig) -> Result<Self> {
        config.validate()?;
        let page_count = config.page_count();
        debug!("address space: {} bits, RAM {} KB", config.address_bits, config.ram_size >> 10);
        Ok(AddressSpace {
            config,
            backing: Backing::new(config.ram_size),
            pages: PageCache::new(page_count),
            states: StateTable::new(page_count),
            regions: Vec::new(),
            free_slots: Vec::new(),
            last_stamp: 0,
            mode: CpuMode::Normal,
            a20_mask: config.address_mask(),
            fetch_cache: None,
            generation: 0,
            flush_pending: false,
            pending_reported: false
        })
    }

    #[inline]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    #[inline]
    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    #[inline]
    pub fn backing_mut(&mut self) -> &mut Backing {
        &mut self.backing
    }

    #[inline]
    pub fn page_cache(&self) -> &PageCache {
        &self.pages
    }
    /// Returns the page cache entry of the page containing `addr`.
    #[inline]
    pub fn page(&self, addr: u32) -> &Page {
        self.pages.get(page_index(addr & self.config.address_mask()))
    }
    /// Returns the memory state of the page containing `addr`.
    #[inline]
    pub fn page_state(&self, addr: u32) -> &PageState {
        self.states.get(page_index(addr & self.config.address_mask()))
    }

    #[inline]
    pub fn cpu_mode(&self) -> CpuMode {
        self.mode
    }
    /// Returns the number of completed translation cache flushes.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }
    /// Returns `true` if the mapping has changed since the last flush.
    #[inline]
    pub fn is_flush_pending(&self) -> bool {
        self.flush_pending
    }

    /*** Mapping region registry ***/

    /// Registers a new, initially disabled region.
    ///
    /// Slots of removed regions are reused.
    pub fn add_region<H: Into<BoxMemoryHandler>>(
            &mut self,
            base: u32,
            size: u32,
            handler: H,
            alias: Option<BufferRef>,
            flags: MappingFlags
        ) -> RegionId
    {
        let region = MappingRegion::new(base, size, alias, flags, handler.into());
        let id = match self.free_slots.pop() {
            Some(index) => {
                let slot = &mut self.regions[index as usize];
                slot.region = Some(region);
                RegionId::with_generation(index as usize, slot.generation)
            }
            None => {
                self.regions.push(RegionSlot { generation: 0, region: Some(region) });
                RegionId::new(self.regions.len() - 1)
            }
        };
        debug!("{} added: {:#010x} size: {:#x} flags: {:?}", id, base, size, flags);
        id
    }
    /// Disables and unregisters the region. Returns its handler.
    ///
    /// # Panics
    /// Panics if the region doesn't exist.
    pub fn remove_region(&mut self, id: RegionId) -> BoxMemoryHandler {
        self.disable_region(id);
        debug!("{} removed", id);
        let slot = match self.regions.get_mut(id.index()) {
            Some(slot) if slot.get(id).is_some() => slot,
            _ => invalid_region(id)
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(id.index() as u32);
        match slot.region.take() {
            Some(region) => region.handler,
            None => invalid_region(id)
        }
    }
    /// Returns a reference to the region.
    ///
    /// # Panics
    /// Panics if the region doesn't exist.
    pub fn region(&self, id: RegionId) -> &MappingRegion {
        match self.regions.get(id.index()).and_then(|slot| slot.get(id)) {
            Some(region) => region,
            None => invalid_region(id)
        }
    }
    /// Returns an iterator of all registered regions.
    pub fn regions(&self) -> impl Iterator<Item=(RegionId, &MappingRegion)> + '_ {
        self.regions.iter().enumerate()
                    .filter_map(|(index, slot)| slot.region.as_ref()
                        .map(|r| (RegionId::with_generation(index, slot.generation), r)))
    }

    /// Returns the number of region slots, both occupied and free.
    #[inline]
    pub fn region_slots(&self) -> usize {
        self.regions.len()
    }

    fn region_mut(&mut self, id: RegionId) -> &mut MappingRegion {
        match self.regions.get_mut(id.index()).and_then(|slot| slot.get_mut(id)) {
            Some(region) => region,
            None => invalid_region(id)
        }
    }

    fn next_stamp(&mut self) -> u64 {
        self.last_stamp += 1;
        self.last_stamp
    }
    /// Moves the region to the new address range without changing its enabled state.
    ///
    /// Both the old and the new range are recalculated if the region is enabled.
    pub fn set_region_addr(&mut self, id: RegionId, base: u32, size: u32) {
        let stamp = self.next_stamp();
        let region = self.region_mut(id);
        let (old_base, old_size) = (region.base, region.size);
        region.base = base;
        region.size = size;
        region.stamp = stamp;
        if region.enabled {
            self.recalc_range(old_base, old_size);
            self.recalc_range(base, size);
        }
    }
    /// Sets or clears the direct buffer of the region.
    pub fn set_region_alias(&mut self, id: RegionId, alias: Option<BufferRef>) {
        let region = self.region_mut(id);
        region.alias = alias;
        if region.enabled {
            let (base, size) = (region.base, region.size);
            self.recalc_range(base, size);
        }
    }
    /// Sets the mask applied to offsets within the region.
    pub fn set_region_mask(&mut self, id: RegionId, mask: u32) {
        let region = self.region_mut(id);
        region.mask = mask;
        if region.enabled {
            let (base, size) = (region.base, region.size);
            self.recalc_range(base, size);
        }
    }
    /// Limits the number of bytes of the alias reachable through the region.
    ///
    /// Masked offsets at or beyond the limit read as [UNMAPPED_BYTE] and ignore writes.
    pub fn set_region_limit(&mut self, id: RegionId, limit: Option<u32>) {
        let region = self.region_mut(id);
        region.limit = limit;
        if region.enabled {
            let (base, size) = (region.base, region.size);
            self.recalc_range(base, size);
        }
    }
    /// Replaces the handler of the region. Returns the previous handler.
    pub fn set_region_handler<H: Into<BoxMemoryHandler>>(&mut self, id: RegionId, handler: H) -> BoxMemoryHandler {
        let region = self.region_mut(id);
        let previous = core::mem::replace(&mut region.handler, handler.into());
        if region.enabled {
            let (base, size) = (region.base, region.size);
            self.recalc_range(base, size);
        }
        previous
    }
    /// Enables the region. It takes precedence over all regions enabled or relocated before.
    pub fn enable_region(&mut self, id: RegionId) {
        let stamp = self.next_stamp();
        let region = self.region_mut(id);
        region.enabled = true;
        region.stamp = stamp;
        let (base, size) = (region.base, region.size);
        self.recalc_range(base, size);
    }
    /// Disables the region. Disabling a disabled region does nothing.
    pub fn disable_region(&mut self, id: RegionId) {
        let region = self.region_mut(id);
        if !region.enabled {
            return
        }
        region.enabled = false;
        let (base, size) = (region.base, region.size);
        self.recalc_range(base, size);
    }

    /*** Memory state ***/

    /// Sets the access kinds of the range for both accessor classes.
    pub fn set_mem_state(&mut self, base: u32, size: u32, state: MemState) {
        self.set_mem_state_ex(base, size, state, state)
    }
    /// Sets the access kinds of the range separately for bus and CPU accesses.
    pub fn set_mem_state_ex(&mut self, base: u32, size: u32, bus: MemState, cpu: MemState) {
        self.states.set_state(base, size.into(), bus, cpu);
        self.recalc_range(base, size);
    }
    /// Directs accesses in the range to SMRAM regions (`enable`) or lets them decode normally,
    /// in one CPU `mode` for the `accessor` class or both if `None`.
    pub fn set_mem_state_smram(&mut self, mode: CpuMode, accessor: Option<Accessor>, base: u32, size: u32, enable: bool) {
        let smram = if enable { SmramAccess::READ_WRITE } else { SmramAccess::empty() };
        self.states.set_smram(mode, accessor, base, size.into(), smram);
        self.recalc_range(base, size);
    }
    /// Sets the chipset SMRAM decoding mode of the range.
    pub fn set_mem_state_smram_ex(&mut self, mode: CpuMode, accessor: Option<Accessor>, base: u32, size: u32, smram: SmramMode) {
        self.states.set_smram(mode, accessor, base, size.into(), smram.into());
        self.recalc_range(base, size);
    }

    /*** Page cache ***/

    /// Recalculates the page cache entries of all pages intersecting with the range.
    pub fn recalc_range(&mut self, base: u32, size: u32) {
        let span = page_span(base, size.into(), self.pages.len());
        if span.is_empty() {
            return
        }
        trace!("recalc: {:#010x} size: {:#x}", base, size);
        let start = (span.start as u64) << PAGE_SHIFT;
        let end = (span.end as u64) << PAGE_SHIFT;
        let mut candidates: Vec<(RegionId, &MappingRegion)> = self.regions.iter().enumerate()
            .filter_map(|(index, slot)| match slot.region {
                Some(ref region) if region.enabled && region.overlaps(start, end) => {
                    Some((RegionId::with_generation(index, slot.generation), region))
                }
                _ => None
            })
            .collect();
        candidates.sort_by_key(|(_, region)| region.stamp);
        for page in span {
            let res = resolve_page(candidates.iter().copied(), self.states.get(page), self.mode, page);
            for &accessor in Accessor::ALL.iter() {
                let index = accessor.index();
                self.pages.set_targets(page, accessor, res.read[index], res.write[index]);
            }
            self.pages.set_mem(page, res.exec);
        }
        self.flush_pending = true;
    }
    /// Clears the dirty and translated code masks of the pages in the range
    /// and takes them out of the eviction list.
    pub fn reset_page_bookkeeping(&mut self, base: u32, size: u32) {
        for page in page_span(base, size.into(), self.pages.len()) {
            self.pages.reset_bookkeeping(page);
        }
    }
    /// Invalidates all translation caches derived from the page cache including
    /// translated code bookkeeping.
    pub fn flush(&mut self) {
        trace!("flush");
        self.pages.flush_code();
        self.flush_soft();
    }
    /// Invalidates translation caches derived from the page cache preserving the translated
    /// code bookkeeping, e.g. after an A20 gate toggle.
    pub fn flush_soft(&mut self) {
        self.fetch_cache = None;
        self.generation = self.generation.wrapping_add(1);
        self.flush_pending = false;
        self.pending_reported = false;
    }
    /// Registers `len` bytes at `addr` as the origin of translated code.
    pub fn mark_code_present(&mut self, addr: u32, len: u32) {
        self.pages.mark_code_present(addr, len)
    }
    /// Marks the range `start..=end` as modified, e.g. by a DMA transfer.
    pub fn invalidate_range(&mut self, start: u32, end: u32) {
        self.pages.invalidate_range(start, end)
    }
    /// Takes the next page with stale translated code out of the eviction list.
    pub fn pop_evicted(&mut self) -> Option<usize> {
        self.pages.pop_evicted()
    }

    /*** CPU mode and the A20 gate ***/

    /// Switches the CPU mode selecting the memory state slot used for resolution.
    ///
    /// Pages whose state differs between the modes are recalculated.
    pub fn set_cpu_mode(&mut self, mode: CpuMode) {
        if mode == self.mode {
            return
        }
        debug!("CPU mode: {:?}", mode);
        self.mode = mode;
        let count = self.states.page_count();
        let mut page = 0;
        while page < count {
            if !self.states.get(page).is_mode_sensitive() {
                page += 1;
                continue
            }
            let first = page;
            while page < count && self.states.get(page).is_mode_sensitive() {
                page += 1;
            }
            let base = (first << PAGE_SHIFT) as u32;
            let size = ((page - first) << PAGE_SHIFT) as u64;
            self.recalc_range(base, size.min(u64::from(u32::max_value())) as u32);
        }
    }
    /// Opens (`true`) or closes the A20 gate. Closing the gate masks address bit 20.
    pub fn set_a20(&mut self, enabled: bool) {
        let mask = if enabled {
            self.config.address_mask()
        }
        else {
            self.config.address_mask() & !A20_BIT
        };
        if mask != self.a20_mask {
            debug!("A20: {}", if enabled { "on" } else { "off" });
            self.a20_mask = mask;
            self.flush_soft();
        }
    }

    #[inline]
    pub fn a20(&self) -> bool {
        self.a20_mask & A20_BIT != 0
    }

    /*** Access paths ***/

    #[inline]
    fn report_pending_flush(&mut self) {
        if self.flush_pending && !self.pending_reported {
            warn!("memory accessed before the translation cache flush");
            self.pending_reported = true;
        }
    }

    fn target(&mut self, id: RegionId) -> (&mut BoxMemoryHandler, AccessContext<'_>) {
        let region = match self.regions.get_mut(id.index()).and_then(|slot| slot.get_mut(id)) {
            Some(region) => region,
            None => invalid_region(id)
        };
        let geometry = region.geometry();
        (&mut region.handler, AccessContext { backing: &mut self.backing, pages: &mut self.pages, region: geometry })
    }

    #[inline]
    fn read_target(&mut self, accessor: Accessor, addr: u32) -> Option<RegionId> {
        self.report_pending_flush();
        self.pages.get(page_index(addr)).read_target(accessor)
    }

    #[inline]
    fn write_target(&mut self, accessor: Accessor, addr: u32) -> Option<RegionId> {
        self.report_pending_flush();
        self.pages.get(page_index(addr)).write_target(accessor)
    }
    /// Reads a byte. Unmapped addresses read as [UNMAPPED_BYTE].
    pub fn read_byte(&mut self, accessor: Accessor, addr: u32) -> u8 {
        let addr = addr & self.a20_mask;
        match self.read_target(accessor, addr) {
            Some(id) => {
                let (handler, mut ctx) = self.target(id);
                handler.read_byte(addr, &mut ctx)
            }
            None => UNMAPPED_BYTE
        }
    }

    pub fn read_word(&mut self, accessor: Accessor, addr: u32) -> u16 {
        let addr = addr & self.a20_mask;
        if addr & PAGE_OFFSET_MASK > PAGE_SIZE - 2 {
            return u16::from_le_bytes([self.read_byte(accessor, addr),
                                       self.read_byte(accessor, addr.wrapping_add(1))])
        }
        match self.read_target(accessor, addr) {
            Some(id) => {
                let (handler, mut ctx) = self.target(id);
                handler.read_word(addr, &mut ctx)
            }
            None => u16::max_value()
        }
    }

    pub fn read_dword(&mut self, accessor: Accessor, addr: u32) -> u32 {
        let addr = addr & self.a20_mask;
        if addr & PAGE_OFFSET_MASK > PAGE_SIZE - 4 {
            let mut bytes = [0u8;4];
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = self.read_byte(accessor, addr.wrapping_add(i as u32));
            }
            return u32::from_le_bytes(bytes)
        }
        match self.read_target(accessor, addr) {
            Some(id) => {
                let (handler, mut ctx) = self.target(id);
                handler.read_dword(addr, &mut ctx)
            }
            None => u32::max_value()
        }
    }
    /// Writes a byte. Writes to unmapped addresses are ignored.
    pub fn write_byte(&mut self, accessor: Accessor, addr: u32, val: u8) {
        let addr = addr & self.a20_mask;
        if let Some(id) = self.write_target(accessor, addr) {
            let (handler, mut ctx) = self.target(id);
            handler.write_byte(addr, val, &mut ctx)
        }
    }

    pub fn write_word(&mut self, accessor: Accessor, addr: u32, val: u16) {
        let addr = addr & self.a20_mask;
        if addr & PAGE_OFFSET_MASK > PAGE_SIZE - 2 {
            for (i, b) in val.to_le_bytes().iter().enumerate() {
                self.write_byte(accessor, addr.wrapping_add(i as u32), *b);
            }
            return
        }
        if let Some(id) = self.write_target(accessor, addr) {
            let (handler, mut ctx) = self.target(id);
            handler.write_word(addr, val, &mut ctx)
        }
    }

    pub fn write_dword(&mut self, accessor: Accessor, addr: u32, val: u32) {
        let addr = addr & self.a20_mask;
        if addr & PAGE_OFFSET_MASK > PAGE_SIZE - 4 {
            for (i, b) in val.to_le_bytes().iter().enumerate() {
                self.write_byte(accessor, addr.wrapping_add(i as u32), *b);
            }
            return
        }
        if let Some(id) = self.write_target(accessor, addr) {
            let (handler, mut ctx) = self.target(id);
            handler.write_dword(addr, val, &mut ctx)
        }
    }

    fn fetch_buffer(&mut self, addr: u32) -> Option<BufferRef> {
        let page = addr >> PAGE_SHIFT;
        match self.fetch_cache {
            Some((cached, buf)) if cached == page => Some(buf),
            _ => {
                self.report_pending_flush();
                let buf = self.pages.get(page as usize).mem?;
                self.fetch_cache = Some((page, buf));
                Some(buf)
            }
        }
    }
    /// Fetches an instruction byte on behalf of the CPU.
    ///
    /// Pages with a direct buffer are read directly, the last such page is cached until
    /// the next flush. Other pages are read through the CPU read path.
    pub fn fetch_byte(&mut self, addr: u32) -> u8 {
        let addr = addr & self.a20_mask;
        match self.fetch_buffer(addr) {
            Some(buf) => self.backing.read_byte(buf.add(addr & PAGE_OFFSET_MASK)),
            None => self.read_byte(Accessor::Cpu, addr)
        }
    }

    pub fn fetch_word(&mut self, addr: u32) -> u16 {
        let addr = addr & self.a20_mask;
        if addr & PAGE_OFFSET_MASK > PAGE_SIZE - 2 {
            return u16::from_le_bytes([self.fetch_byte(addr), self.fetch_byte(addr.wrapping_add(1))])
        }
        match self.fetch_buffer(addr) {
            Some(buf) => self.backing.read_word(buf.add(addr & PAGE_OFFSET_MASK)),
            None => self.read_word(Accessor::Cpu, addr)
        }
    }

    pub fn fetch_dword(&mut self, addr: u32) -> u32 {
        let addr = addr & self.a20_mask;
        if addr & PAGE_OFFSET_MASK > PAGE_SIZE - 4 {
            let mut bytes = [0u8;4];
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = self.fetch_byte(addr.wrapping_add(i as u32));
            }
            return u32::from_le_bytes(bytes)
        }
        match self.fetch_buffer(addr) {
            Some(buf) => self.backing.read_dword(buf.add(addr & PAGE_OFFSET_MASK)),
            None => self.read_dword(Accessor::Cpu, addr)
        }
    }
}

#[inline(always)]
fn page_index(addr: u32) -> usize {
    (addr >> PAGE_SHIFT) as usize
}

#[cold]
fn invalid_region(id: RegionId) -> ! {
    panic!("Invalid mapping region: {}", id)
}
