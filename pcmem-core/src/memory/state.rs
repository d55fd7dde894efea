/*
    Copyright (C) 2020-2023  Rafal Michalski

    This file is part of PCMEM, a Rust library for building PC emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Memory state tags and the region resolution policy.
use bitflags::bitflags;

use super::{Accessor, CpuMode, page_span};

/// Determines which mapping regions may respond to accesses of a kind (read or write)
/// within a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Access {
    /// Any region except SMRAM.
    Any,
    /// Regions decoded by the memory controller (DRAM). Excludes external regions.
    Internal,
    /// External regions not asserting ROMCS.
    External,
    /// Any region not tagged internal.
    ExtAny,
    /// External regions asserting ROMCS.
    Romcs,
    /// No region responds.
    Disabled
}

impl Default for Access {
    fn default() -> Self {
        Access::Any
    }
}

/// The read and write [Access] of a page for one CPU mode and accessor class.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash)]
pub struct MemState {
    pub read: Access,
    pub write: Access
}

impl MemState {
    pub const ANY: MemState = MemState::new(Access::Any, Access::Any);
    pub const INTERNAL: MemState = MemState::new(Access::Internal, Access::Internal);
    pub const EXTERNAL: MemState = MemState::new(Access::External, Access::External);
    pub const EXTANY: MemState = MemState::new(Access::ExtAny, Access::ExtAny);
    pub const DISABLED: MemState = MemState::new(Access::Disabled, Access::Disabled);

    #[inline]
    pub const fn new(read: Access, write: Access) -> Self {
        MemState { read, write }
    }
}

bitflags! {
    /// The SMRAM overlay of a page state.
    ///
    /// The overlay takes precedence over the [Access] kind of the same state slot.
    #[derive(Default, Debug, PartialEq, Eq, Hash, Clone, Copy)]
    pub struct SmramAccess: u8 {
        /// Reads and fetches are served by SMRAM regions.
        const READ     = 0b0001;
        /// Writes are served by SMRAM regions.
        const WRITE    = 0b0010;
        /// Only instruction fetches are served by SMRAM regions.
        const CODE     = 0b0100;
        /// Neither reads nor writes are served.
        const DISABLED = 0b1000;
    }
}

impl SmramAccess {
    pub const READ_WRITE: SmramAccess = SmramAccess::from_bits_retain(
                                            SmramAccess::READ.bits()|SmramAccess::WRITE.bits());
}

/// The chipset SMRAM decoding modes, as encoded in the 2-bit fields of the SMRAM control registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SmramMode {
    /// The range decodes normally.
    Off = 0,
    /// Code and data go to SMRAM.
    On = 1,
    /// Code goes to SMRAM, data decodes normally.
    CodeOnly = 2,
    /// Neither code nor data are decoded.
    Disabled = 3
}

impl From<u8> for SmramMode {
    fn from(data: u8) -> Self {
        match data & 3 {
            0 => SmramMode::Off,
            1 => SmramMode::On,
            2 => SmramMode::CodeOnly,
            _ => SmramMode::Disabled
        }
    }
}

impl From<SmramMode> for SmramAccess {
    fn from(mode: SmramMode) -> Self {
        match mode {
            SmramMode::Off => SmramAccess::empty(),
            SmramMode::On => SmramAccess::READ_WRITE,
            SmramMode::CodeOnly => SmramAccess::CODE,
            SmramMode::Disabled => SmramAccess::DISABLED
        }
    }
}

bitflags! {
    /// A classification of a mapping region.
    #[derive(Default, Debug, PartialEq, Eq, Hash, Clone, Copy)]
    pub struct MappingFlags: u8 {
        /// Memory controller (DRAM) region.
        const INTERNAL = 0b0001;
        /// Device on the expansion bus.
        const EXTERNAL = 0b0010;
        /// Device asserting the ROM chip select.
        const ROMCS    = 0b0100;
        /// System Management RAM.
        const SMRAM    = 0b1000;
    }
}

/// Returns `true` if a region with `flags` may serve reads (or fetches if `exec` is `true`)
/// in a page with the given `access` kind and `smram` overlay.
pub fn read_allowed(flags: MappingFlags, access: Access, smram: SmramAccess, exec: bool) -> bool {
    let is_smram = flags.contains(MappingFlags::SMRAM);
    if smram.contains(SmramAccess::READ) {
        return is_smram
    }
    if exec && smram.contains(SmramAccess::CODE) {
        return is_smram
    }
    if smram.contains(SmramAccess::DISABLED) {
        return false
    }
    access_allowed(flags, access)
}

/// Returns `true` if a region with `flags` may serve writes in a page with the given
/// `access` kind and `smram` overlay.
pub fn write_allowed(flags: MappingFlags, access: Access, smram: SmramAccess) -> bool {
    if smram.contains(SmramAccess::WRITE) {
        return flags.contains(MappingFlags::SMRAM)
    }
    if smram.contains(SmramAccess::DISABLED) {
        return false
    }
    access_allowed(flags, access)
}

#[inline]
fn access_allowed(flags: MappingFlags, access: Access) -> bool {
    if flags.contains(MappingFlags::SMRAM) {
        return false
    }
    let internal = flags.contains(MappingFlags::INTERNAL);
    let romcs = flags.contains(MappingFlags::ROMCS);
    match access {
        Access::Any => true,
        Access::External => !internal && !romcs,
        Access::Romcs => !internal && romcs,
        Access::ExtAny => !internal,
        Access::Internal => !flags.contains(MappingFlags::EXTERNAL),
        Access::Disabled => false
    }
}

/// The complete state of a single page: [MemState] and [SmramAccess] for each [CpuMode] and [Accessor].
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct PageState {
    state: [[MemState;2];2],
    smram: [[SmramAccess;2];2]
}

impl PageState {
    #[inline]
    pub fn state(&self, mode: CpuMode, accessor: Accessor) -> MemState {
        self.state[mode.index()][accessor.index()]
    }

    #[inline]
    pub fn smram(&self, mode: CpuMode, accessor: Accessor) -> SmramAccess {
        self.smram[mode.index()][accessor.index()]
    }

    #[inline]
    pub fn read_allowed(&self, mode: CpuMode, accessor: Accessor, flags: MappingFlags, exec: bool) -> bool {
        read_allowed(flags, self.state(mode, accessor).read, self.smram(mode, accessor), exec)
    }

    #[inline]
    pub fn write_allowed(&self, mode: CpuMode, accessor: Accessor, flags: MappingFlags) -> bool {
        write_allowed(flags, self.state(mode, accessor).write, self.smram(mode, accessor))
    }
    /// Returns `true` if the page resolves differently depending on the [CpuMode].
    #[inline]
    pub fn is_mode_sensitive(&self) -> bool {
        self.state[0] != self.state[1] || self.smram[0] != self.smram[1]
    }
}

/// Per-page memory state tags covering the whole address space.
#[derive(Clone, Debug)]
pub struct StateTable {
    pages: Box<[PageState]>
}

impl StateTable {
    pub fn new(page_count: usize) -> Self {
        StateTable { pages: vec![PageState::default(); page_count].into_boxed_slice() }
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub fn get(&self, page: usize) -> &PageState {
        &self.pages[page]
    }
    /// Sets the access kinds of the given range for both CPU modes, leaving SMRAM overlays intact.
    pub fn set_state(&mut self, base: u32, size: u64, bus: MemState, cpu: MemState) {
        for page in page_span(base, size, self.pages.len()) {
            for slot in self.pages[page].state.iter_mut() {
                slot[Accessor::Cpu.index()] = cpu;
                slot[Accessor::Bus.index()] = bus;
            }
        }
    }
    /// Sets the SMRAM overlay of the given range for one CPU mode.
    ///
    /// If `accessor` is `None` overlays of both accessor classes are set.
    pub fn set_smram(&mut self, mode: CpuMode, accessor: Option<Accessor>, base: u32, size: u64, smram: SmramAccess) {
        for page in page_span(base, size, self.pages.len()) {
            let slot = &mut self.pages[page].smram[mode.index()];
            match accessor {
                Some(accessor) => slot[accessor.index()] = smram,
                None => *slot = [smram;2]
            }
        }
    }

    pub fn reset(&mut self) {
        for page in self.pages.iter_mut() {
            *page = PageState::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_FLAGS: [MappingFlags;5] = [
        MappingFlags::empty(),
        MappingFlags::INTERNAL,
        MappingFlags::EXTERNAL,
        MappingFlags::ROMCS,
        MappingFlags::SMRAM
    ];

    fn allowed_set(access: Access) -> Vec<MappingFlags> {
        ALL_FLAGS.iter().copied()
                 .filter(|&flags| read_allowed(flags, access, SmramAccess::empty(), false))
                 .collect()
    }

    #[test]
    fn access_policy_works() {
        assert_eq!(allowed_set(Access::Any), &ALL_FLAGS[..4]);
        assert_eq!(allowed_set(Access::Internal),
                   &[MappingFlags::empty(), MappingFlags::INTERNAL, MappingFlags::ROMCS]);
        assert_eq!(allowed_set(Access::External), &[MappingFlags::empty(), MappingFlags::EXTERNAL]);
        assert_eq!(allowed_set(Access::ExtAny),
                   &[MappingFlags::empty(), MappingFlags::EXTERNAL, MappingFlags::ROMCS]);
        assert_eq!(allowed_set(Access::Romcs), &[MappingFlags::ROMCS]);
        assert!(allowed_set(Access::Disabled).is_empty());
        for &flags in ALL_FLAGS.iter() {
            let read = read_allowed(flags, Access::Any, SmramAccess::empty(), false);
            let write = write_allowed(flags, Access::Any, SmramAccess::empty());
            assert_eq!(read, write);
        }
    }

    #[test]
    fn smram_policy_works() {
        for &access in [Access::Any, Access::Internal, Access::Disabled].iter() {
            assert!(read_allowed(MappingFlags::SMRAM, access, SmramAccess::READ, false));
            assert!(!read_allowed(MappingFlags::INTERNAL, access, SmramAccess::READ, false));
            assert!(write_allowed(MappingFlags::SMRAM, access, SmramAccess::WRITE));
            assert!(!write_allowed(MappingFlags::INTERNAL, access, SmramAccess::WRITE));
        }
        // code goes to SMRAM, data decodes normally
        let code = SmramAccess::from(SmramMode::CodeOnly);
        assert!(read_allowed(MappingFlags::SMRAM, Access::External, code, true));
        assert!(!read_allowed(MappingFlags::INTERNAL, Access::External, code, true));
        assert!(!read_allowed(MappingFlags::SMRAM, Access::External, code, false));
        assert!(read_allowed(MappingFlags::EXTERNAL, Access::External, code, false));
        assert!(write_allowed(MappingFlags::EXTERNAL, Access::External, code));
        let disabled = SmramAccess::from(SmramMode::Disabled);
        for &flags in ALL_FLAGS.iter() {
            assert!(!read_allowed(flags, Access::Any, disabled, false));
            assert!(!read_allowed(flags, Access::Any, disabled, true));
            assert!(!write_allowed(flags, Access::Any, disabled));
        }
        assert_eq!(SmramMode::from(0x05), SmramMode::On);
        assert_eq!(SmramAccess::from(SmramMode::Off), SmramAccess::empty());
    }

    #[test]
    fn state_table_works() {
        let mut table = StateTable::new(0x100);
        assert_eq!(table.page_count(), 0x100);
        table.set_state(0xA0000, 0x20000, MemState::EXTERNAL, MemState::INTERNAL);
        for page in 0..0x100 {
            let st = table.get(page);
            for &mode in CpuMode::ALL.iter() {
                if (0xA0..0xC0).contains(&page) {
                    assert_eq!(st.state(mode, Accessor::Bus), MemState::EXTERNAL);
                    assert_eq!(st.state(mode, Accessor::Cpu), MemState::INTERNAL);
                }
                else {
                    assert_eq!(st.state(mode, Accessor::Bus), MemState::ANY);
                    assert_eq!(st.state(mode, Accessor::Cpu), MemState::ANY);
                }
            }
        }
        table.set_smram(CpuMode::Smm, Some(Accessor::Cpu), 0xA0000, 0x1000, SmramAccess::READ_WRITE);
        let st = table.get(0xA0);
        assert!(st.is_mode_sensitive());
        assert!(!table.get(0xA1).is_mode_sensitive());
        assert_eq!(st.smram(CpuMode::Smm, Accessor::Cpu), SmramAccess::READ_WRITE);
        assert_eq!(st.smram(CpuMode::Smm, Accessor::Bus), SmramAccess::empty());
        assert_eq!(st.smram(CpuMode::Normal, Accessor::Cpu), SmramAccess::empty());
        assert!(st.read_allowed(CpuMode::Smm, Accessor::Cpu, MappingFlags::SMRAM, false));
        assert!(!st.read_allowed(CpuMode::Normal, Accessor::Cpu, MappingFlags::SMRAM, false));
        // overlays survive access kind updates
        table.set_state(0xA0000, 0x1000, MemState::ANY, MemState::ANY);
        assert_eq!(table.get(0xA0).smram(CpuMode::Smm, Accessor::Cpu), SmramAccess::READ_WRITE);
        table.set_smram(CpuMode::Smm, None, 0xA0000, 0x1000, SmramAccess::empty());
        assert_eq!(*table.get(0xA0), PageState::default());
        // ranges are clipped to the table
        table.set_state(0xFF000, 0x10000, MemState::DISABLED, MemState::DISABLED);
        assert_eq!(table.get(0xFF).state(CpuMode::Normal, Accessor::Cpu), MemState::DISABLED);
        table.reset();
        assert_eq!(*table.get(0xFF), PageState::default());
    }
}
