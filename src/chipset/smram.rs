/*
    Copyright (C) 2020-2023  Rafal Michalski

    This file is part of PCMEM, a Rust library for building PC emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! System Management RAM windows.
use bitflags::bitflags;
use log::debug;

use crate::memory::{
    Accessor, AddressSpace, AliasHandler, BufferRef, CpuMode, MappingFlags, RegionId,
    HIGH_MEM_BASE, LOW_MEM_TOP, SMRAM_SLOT_SIZE
};

bitflags! {
    /// Selects in which CPU mode and for which accessor class an SMRAM window is decoded.
    #[derive(Default, Debug, PartialEq, Eq, Hash, Clone, Copy)]
    pub struct SmramEnable: u8 {
        const NORMAL_CPU = 0b0001;
        const NORMAL_BUS = 0b0010;
        const SMM_CPU    = 0b0100;
        const SMM_BUS    = 0b1000;
        const NORMAL     = 0b0011;
        const SMM        = 0b1100;
    }
}

impl SmramEnable {
    /// Returns flags from the separate normal and SMM mode switches, applied to both accessor classes.
    pub fn from_modes(normal: bool, smm: bool) -> Self {
        let mut flags = SmramEnable::empty();
        flags.set(SmramEnable::NORMAL, normal);
        flags.set(SmramEnable::SMM, smm);
        flags
    }

    #[inline]
    pub fn for_access(self, mode: CpuMode, accessor: Accessor) -> bool {
        self.contains(match (mode, accessor) {
            (CpuMode::Normal, Accessor::Cpu) => SmramEnable::NORMAL_CPU,
            (CpuMode::Normal, Accessor::Bus) => SmramEnable::NORMAL_BUS,
            (CpuMode::Smm, Accessor::Cpu) => SmramEnable::SMM_CPU,
            (CpuMode::Smm, Accessor::Bus) => SmramEnable::SMM_BUS
        })
    }
}

/// A handle of an SMRAM window. Consumed by [SmramController::delete].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SmramId(u32);

impl SmramId {
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// A relocatable SMRAM window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SmramWindow {
    /// The address of the window as seen by the CPU and the bus.
    pub host_base: u32,
    /// The offset in the RAM the window aliases.
    pub ram_base: u32,
    /// `0` if the window is disabled.
    pub size: u32,
    /// The `host_base` at SMM entry.
    pub old_host_base: u32,
    /// The `size` at SMM entry.
    pub old_size: u32,
    pub enable: SmramEnable,
    /// The window's own region.
    pub region: RegionId
}

/// Manages SMRAM windows and the protocol of SMM entry and exit.
///
/// The controller owns the window regions, so it can't be cloned:
///
/// ```compile_fail
/// use pcmem::chipset::SmramController;
/// let smram = SmramController::new();
/// let copy = smram.clone();
/// ```
#[derive(Debug, Default)]
pub struct SmramController {
    windows: Vec<Option<SmramWindow>>,
    order: Vec<u32>,
    use_separate_backing: bool
}

/// Returns the position in the SMRAM staging buffer of a window aliasing `ram_base`
/// within the ISA hole.
fn staging_offset(ram_base: u32) -> BufferRef {
    let slot = match (ram_base >> 16) & 0xF {
        0xA => 0,
        0xB => 1,
        0xC | 0xD => 2,
        _ => 3
    };
    BufferRef::smram(slot * SMRAM_SLOT_SIZE + (ram_base & (SMRAM_SLOT_SIZE - 1)))
}

impl SmramController {
    pub fn new() -> Self {
        SmramController::default()
    }
    /// When set, windows aliasing the RAM at `0xA0000..0x100000` alias the SMRAM staging
    /// buffer instead. Affects windows enabled afterwards.
    pub fn set_use_separate_backing(&mut self, enable: bool) {
        self.use_separate_backing = enable;
    }

    #[inline]
    pub fn uses_separate_backing(&self) -> bool {
        self.use_separate_backing
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
    /// Returns the first window in the order of addition.
    pub fn first(&self) -> Option<&SmramWindow> {
        self.order.first().map(|&index| self.slot(index as usize))
    }
    /// Returns the last window in the order of addition.
    pub fn last(&self) -> Option<&SmramWindow> {
        self.order.last().map(|&index| self.slot(index as usize))
    }
    /// Returns an iterator of windows in the order of addition.
    pub fn iter(&self) -> impl Iterator<Item=&SmramWindow> + '_ {
        self.order.iter().map(move |&index| self.slot(index as usize))
    }

    fn slot(&self, index: usize) -> &SmramWindow {
        match self.windows.get(index) {
            Some(Some(window)) => window,
            _ => panic!("Invalid SMRAM mapping")
        }
    }

    fn slot_mut(&mut self, index: usize) -> &mut SmramWindow {
        match self.windows.get_mut(index) {
            Some(Some(window)) => window,
            _ => panic!("Invalid SMRAM mapping")
        }
    }
    /// Returns the window.
    ///
    /// # Panics
    /// Panics if the window doesn't exist.
    pub fn window(&self, id: &SmramId) -> &SmramWindow {
        self.slot(id.index())
    }
    /// Appends a new disabled window with its own region. Returns the window's handle.
    pub fn add(&mut self, space: &mut AddressSpace) -> SmramId {
        let region = space.add_region(0, 0, AliasHandler::new(), None, MappingFlags::SMRAM);
        let window = SmramWindow {
            host_base: 0, ram_base: 0, size: 0,
            old_host_base: 0, old_size: 0,
            enable: SmramEnable::empty(),
            region
        };
        let index = match self.windows.iter().position(Option::is_none) {
            Some(index) => {
                self.windows[index] = Some(window);
                index
            }
            None => {
                self.windows.push(Some(window));
                self.windows.len() - 1
            }
        };
        self.order.push(index as u32);
        debug!("SMRAM #{} added", index);
        SmramId(index as u32)
    }
    /// Disables the window and removes it together with its region.
    pub fn delete(&mut self, space: &mut AddressSpace, id: SmramId) {
        self.disable(space, &id);
        let index = id.index();
        let position = match self.order.iter().position(|&n| n as usize == index) {
            Some(position) => position,
            None => panic!("Invalid SMRAM mapping")
        };
        self.order.remove(position);
        if let Some(window) = self.windows[index].take() {
            space.remove_region(window.region);
        }
        debug!("SMRAM #{} deleted", index);
    }
    /// Returns `true` if the window is enabled.
    pub fn is_enabled(&self, id: &SmramId) -> bool {
        self.window(id).size != 0
    }
    /// Maps the window at `host_base` aliasing the RAM at `ram_base`, decoded in the normal
    /// and/or the SMM mode for both accessor classes.
    pub fn enable(
            &mut self,
            space: &mut AddressSpace,
            id: &SmramId,
            host_base: u32,
            ram_base: u32,
            size: u32,
            normal: bool,
            smm: bool
        )
    {
        self.enable_ex(space, id, host_base, ram_base, size, SmramEnable::from_modes(normal, smm))
    }
    /// Maps the window with separate flags for each CPU mode and accessor class.
    ///
    /// An empty `size` or no flags disable the window.
    pub fn enable_ex(
            &mut self,
            space: &mut AddressSpace,
            id: &SmramId,
            host_base: u32,
            ram_base: u32,
            size: u32,
            enable: SmramEnable
        )
    {
        if size == 0 || enable.is_empty() {
            return self.disable(space, id)
        }
        let use_separate_backing = self.use_separate_backing;
        let window = self.slot_mut(id.index());
        let (old_host_base, old_size) = (window.host_base, window.size);
        window.host_base = host_base;
        window.ram_base = ram_base;
        window.size = size;
        window.enable = enable;
        let region = window.region;
        debug!("SMRAM #{} host: {:#010x} ram: {:#010x} size: {:#x} {:?}",
               id.index(), host_base, ram_base, size, enable);

        if old_size != 0 && (old_host_base, old_size) != (host_base, size) {
            clear_overlay(space, old_host_base, old_size);
        }
        let alias = if use_separate_backing && (LOW_MEM_TOP..HIGH_MEM_BASE).contains(&ram_base) {
            staging_offset(ram_base)
        }
        else {
            BufferRef::ram(ram_base)
        };
        space.set_region_addr(region, host_base, size);
        space.set_region_alias(region, Some(alias));
        for &mode in CpuMode::ALL.iter() {
            for &accessor in Accessor::ALL.iter() {
                space.set_mem_state_smram(mode, Some(accessor), host_base, size, enable.for_access(mode, accessor));
            }
        }
        space.enable_region(region);
    }
    /// Unmaps the window. Does nothing if the window is disabled.
    pub fn disable(&mut self, space: &mut AddressSpace, id: &SmramId) {
        let window = self.slot_mut(id.index());
        if window.size == 0 {
            return
        }
        let (host_base, size, region) = (window.host_base, window.size, window.region);
        window.host_base = 0;
        window.ram_base = 0;
        window.size = 0;
        window.enable = SmramEnable::empty();
        debug!("SMRAM #{} disabled", id.index());
        clear_overlay(space, host_base, size);
        space.disable_region(region);
    }
    /// Disables all windows.
    pub fn disable_all(&mut self, space: &mut AddressSpace) {
        for n in 0..self.order.len() {
            let id = SmramId(self.order[n]);
            self.disable(space, &id);
        }
    }
    /// Applies the mapping switch of a window's current range for a single CPU mode,
    /// keeping its placement.
    pub fn state_change(&mut self, space: &mut AddressSpace, id: &SmramId, smm: bool, enable: bool) {
        let window = self.slot_mut(id.index());
        if window.size == 0 {
            return
        }
        let (mode, flags) = if smm {
            (CpuMode::Smm, SmramEnable::SMM)
        }
        else {
            (CpuMode::Normal, SmramEnable::NORMAL)
        };
        window.enable.set(flags, enable);
        let (host_base, size) = (window.host_base, window.size);
        space.set_mem_state_smram(mode, None, host_base, size, enable);
    }
    /// Remembers the current placement of all windows.
    pub fn backup_all(&mut self) {
        debug!("SMRAM backup");
        for window in self.windows.iter_mut().flatten() {
            window.old_host_base = window.host_base;
            window.old_size = window.size;
        }
    }
    /// Recalculates the ranges of all windows and flushes the translation cache.
    ///
    /// When `returning` from SMM the ranges remembered by [SmramController::backup_all] are
    /// recalculated first and forgotten.
    pub fn recalc_all(&mut self, space: &mut AddressSpace, returning: bool) {
        debug!("SMRAM recalc returning: {}", returning);
        if returning {
            for &index in self.order.iter() {
                if let Some(window) = self.windows[index as usize].as_mut() {
                    if window.old_size != 0 {
                        space.recalc_range(window.old_host_base, window.old_size);
                    }
                    window.old_host_base = 0;
                    window.old_size = 0;
                }
            }
        }
        for window in self.iter() {
            if window.size != 0 {
                space.recalc_range(window.host_base, window.size);
            }
        }
        space.flush();
    }
    /// Enters SMM: backs up the windows, switches the CPU mode and remaps.
    pub fn enter_smm(&mut self, space: &mut AddressSpace) {
        self.backup_all();
        space.set_cpu_mode(CpuMode::Smm);
        self.recalc_all(space, false);
    }
    /// Leaves SMM: switches the CPU mode and remaps both the windows' SMM entry
    /// and current ranges.
    pub fn leave_smm(&mut self, space: &mut AddressSpace) {
        space.set_cpu_mode(CpuMode::Normal);
        self.recalc_all(space, true);
    }
}

fn clear_overlay(space: &mut AddressSpace, base: u32, size: u32) {
    for &mode in CpuMode::ALL.iter() {
        space.set_mem_state_smram(mode, None, base, size, false);
    }
}
