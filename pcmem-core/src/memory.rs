/*
    Copyright (C) 2020-2023  Rafal Michalski

    This file is part of PCMEM, a Rust library for building PC emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Memory API.
use core::fmt;
use std::io;

#[cfg(feature = "config")]
use serde::{Serialize, Deserialize};

mod backing;
mod handler;
mod page;
mod state;

pub use backing::*;
pub use handler::*;
pub use page::*;
pub use state::*;

/// The number of address bits selecting a byte within a page.
pub const PAGE_SHIFT: u32 = 12;
/// The granularity of the page cache and of the memory state table.
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;
pub const PAGE_OFFSET_MASK: u32 = PAGE_SIZE - 1;
/// The value read from addresses that no region responds to.
pub const UNMAPPED_BYTE: u8 = u8::max_value();
/// The end of the conventional memory and the beginning of the ISA hole.
pub const LOW_MEM_TOP: u32 = 0x000A_0000;
/// The end of the ISA hole (the first megabyte).
pub const HIGH_MEM_BASE: u32 = 0x0010_0000;
/// The size of the ISA hole.
pub const UPPER_MEM_SIZE: u32 = HIGH_MEM_BASE - LOW_MEM_TOP;
/// The address bit masked out when the A20 gate is closed.
pub const A20_BIT: u32 = 1 << 20;
/// RAM above this offset lives in the secondary RAM segment.
pub const RAM_SEGMENT_SHIFT: u32 = 30;
pub const RAM_SEGMENT_SIZE: usize = 1 << RAM_SEGMENT_SHIFT;
/// The largest amount of emulated RAM.
pub const MAX_RAM_SIZE: u32 = 0x8000_0000;

#[non_exhaustive]
#[derive(Debug)]
pub enum MemoryError {
    InvalidAddressBits,
    RamSizeExceedsAddressSpace,
    RamSizeTooLarge,
    InvalidRowCount,
    InvalidRowUnit
}

impl std::error::Error for MemoryError {}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", match self {
            MemoryError::InvalidAddressBits => "Address space width must be between 20 and 32 bits",
            MemoryError::RamSizeExceedsAddressSpace => "RAM size exceeds the address space",
            MemoryError::RamSizeTooLarge => "RAM size exceeds the 2 GB limit",
            MemoryError::InvalidRowCount => "Row count must be between 1 and 16",
            MemoryError::InvalidRowUnit => "Row unit must be between a page and 2 GB"
        })
    }
}

impl From<MemoryError> for io::Error {
    fn from(err: MemoryError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, err)
    }
}

/// A type returned by fallible configuration methods.
pub type Result<T> = core::result::Result<T, MemoryError>;

/// The class of an agent accessing memory.
///
/// Memory state and region resolution is tracked separately for each class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Accessor {
    /// Instruction fetches and data accesses made by the CPU.
    Cpu = 0,
    /// DMA and bus master accesses.
    Bus = 1
}

impl Accessor {
    pub const ALL: [Accessor;2] = [Accessor::Cpu, Accessor::Bus];

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// The CPU operating mode selecting a memory state slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CpuMode {
    Normal = 0,
    /// System Management Mode.
    Smm = 1
}

impl Default for CpuMode {
    fn default() -> Self {
        CpuMode::Normal
    }
}

impl CpuMode {
    pub const ALL: [CpuMode;2] = [CpuMode::Normal, CpuMode::Smm];

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// A handle of a mapping region registered in an address space.
///
/// Slots of removed regions are reused, the generation tells the handles of
/// the slot's successive occupants apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId {
    index: u32,
    generation: u32
}

impl RegionId {
    #[inline(always)]
    pub fn new(index: usize) -> Self {
        RegionId::with_generation(index, 0)
    }

    #[inline(always)]
    pub fn with_generation(index: usize, generation: u32) -> Self {
        RegionId { index: index as u32, generation }
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline(always)]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region #{}", self.index)?;
        if self.generation != 0 {
            write!(f, ".{}", self.generation)?;
        }
        Ok(())
    }
}

/// The address space configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "config", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config", serde(default, rename_all = "camelCase"))]
pub struct MemoryConfig {
    /// The size of the emulated RAM in bytes.
    pub ram_size: u32,
    /// The width of the physical address bus: 20 (8088), 24 (80286) or 32 (80386+).
    pub address_bits: u8,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig { ram_size: 16 << 20, address_bits: 32 }
    }
}

impl MemoryConfig {
    /// Checks the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if !(20..=32).contains(&self.address_bits) {
            return Err(MemoryError::InvalidAddressBits)
        }
        if self.ram_size > MAX_RAM_SIZE {
            return Err(MemoryError::RamSizeTooLarge)
        }
        if u64::from(self.ram_size) > self.address_space_size() {
            return Err(MemoryError::RamSizeExceedsAddressSpace)
        }
        Ok(())
    }
    /// Returns the number of bytes addressable by the CPU.
    #[inline]
    pub fn address_space_size(&self) -> u64 {
        1u64 << self.address_bits
    }
    /// Returns the mask of valid physical address bits.
    #[inline]
    pub fn address_mask(&self) -> u32 {
        (self.address_space_size() - 1) as u32
    }
    /// Returns the number of pages covering the address space.
    #[inline]
    pub fn page_count(&self) -> usize {
        (self.address_space_size() >> PAGE_SHIFT) as usize
    }
}

/// Returns the range of page indexes intersecting with the given address range,
/// clipped to `page_count` pages.
#[inline]
pub fn page_span(base: u32, size: u64, page_count: usize) -> core::ops::Range<usize> {
    if size == 0 {
        return 0..0
    }
    let start = (base >> PAGE_SHIFT) as usize;
    let end = ((u64::from(base) + size + u64::from(PAGE_OFFSET_MASK)) >> PAGE_SHIFT) as usize;
    start.min(page_count)..end.min(page_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_config_works() {
        let config = MemoryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.address_mask(), u32::max_value());
        assert_eq!(config.page_count(), 0x10_0000);
        let config = MemoryConfig { ram_size: 16 << 20, address_bits: 24 };
        assert!(config.validate().is_ok());
        assert_eq!(config.address_mask(), 0xFF_FFFF);
        assert_eq!(config.page_count(), 0x1000);
        let config = MemoryConfig { ram_size: 17 << 20, address_bits: 24 };
        assert!(matches!(config.validate(), Err(MemoryError::RamSizeExceedsAddressSpace)));
        let config = MemoryConfig { ram_size: 0, address_bits: 16 };
        assert!(matches!(config.validate(), Err(MemoryError::InvalidAddressBits)));
        let config = MemoryConfig { ram_size: u32::max_value(), address_bits: 32 };
        assert!(matches!(config.validate(), Err(MemoryError::RamSizeTooLarge)));
        let err: io::Error = MemoryError::InvalidRowCount.into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(err.to_string(), "Row count must be between 1 and 16");
    }

    #[cfg(feature = "config")]
    #[test]
    fn memory_config_serde_works() {
        let config: MemoryConfig = serde_json::from_str(r#"{"ramSize":1048576,"addressBits":20}"#).unwrap();
        assert_eq!(config, MemoryConfig { ram_size: 1 << 20, address_bits: 20 });
        let config: MemoryConfig = serde_json::from_str(r#"{"ramSize":4194304}"#).unwrap();
        assert_eq!(config, MemoryConfig { ram_size: 4 << 20, address_bits: 32 });
    }

    #[test]
    fn page_span_works() {
        assert_eq!(page_span(0, 0, 16), 0..0);
        assert_eq!(page_span(0, 1, 16), 0..1);
        assert_eq!(page_span(0x0FFF, 2, 16), 0..2);
        assert_eq!(page_span(0x1000, 0x2000, 16), 1..3);
        assert_eq!(page_span(0xE000, 0x10000, 16), 14..16);
        assert_eq!(page_span(0xFFFF_F000, 0x1000, 0x10_0000), 0xF_FFFF..0x10_0000);
    }
}
