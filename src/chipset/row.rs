/*
    Copyright (C) 2020-2023  Rafal Michalski

    This file is part of PCMEM, a Rust library for building PC emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! DRAM row (bank) remapping.
use arrayvec::ArrayVec;
use log::{debug, warn};

#[cfg(feature = "config")]
use serde::{Serialize, Deserialize};

use crate::memory::{
    AddressSpace, AliasHandler, BufferRef, MappingFlags, MemState, MemoryError, RamHandler,
    RegionId, Result, HIGH_MEM_BASE, LOW_MEM_TOP, PAGE_SHIFT
};

/// The maximum number of DRAM rows.
pub const MAX_ROWS: usize = 16;

/// The DRAM row controller configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "config", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config", serde(default, rename_all = "camelCase"))]
pub struct RowConfig {
    /// The number of rows: `1..=16`.
    pub rows: u8,
    /// The size of the row unit as a power of two.
    pub unit_shift: u8,
    /// Two packed register images with the default size of each row in units, 4 bits per row.
    ///
    /// The size of the row `n` is in the bits `(n & 7) * 4..(n & 7) * 4 + 4` of `default_rows[n >> 3]`.
    pub default_rows: [u32;2]
}

impl Default for RowConfig {
    fn default() -> Self {
        RowConfig { rows: 4, unit_shift: 22, default_rows: [0x1111, 0] }
    }
}

impl RowConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_ROWS).contains(&usize::from(self.rows)) {
            return Err(MemoryError::InvalidRowCount)
        }
        if !(PAGE_SHIFT..=31).contains(&u32::from(self.unit_shift)) {
            return Err(MemoryError::InvalidRowUnit)
        }
        Ok(())
    }
    /// Returns the default size of the row in units.
    #[inline]
    pub fn default_row_units(&self, row: usize) -> u32 {
        (self.default_rows[(row >> 3) & 1] >> ((row & 7) * 4)) & 0xF
    }
}

/// A single DRAM row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRow {
    /// The address of the row as seen by the CPU and the bus.
    pub host_base: u32,
    pub host_size: u32,
    /// The offset of the row's bytes in the RAM.
    pub ram_base: u32,
    pub ram_size: u32,
    /// Applied to offsets within the row: `ram = ((addr - host_base) & ram_mask) + ram_base`.
    pub ram_mask: u32,
    /// The end of the row in units.
    pub boundary: u32,
    /// The region mapping the row.
    pub region: RegionId
}

impl MemoryRow {
    /// Returns `true` if the row is mapped at the same addresses as its RAM.
    #[inline]
    pub fn is_identity(&self) -> bool {
        self.host_base == self.ram_base && self.host_size == self.ram_size
    }

    #[inline]
    fn host_end(&self) -> u64 {
        u64::from(self.host_base) + u64::from(self.host_size)
    }

    #[inline]
    fn overlaps(&self, other: &MemoryRow) -> bool {
        u64::from(self.host_base) < other.host_end() && u64::from(other.host_base) < self.host_end()
    }
    /// Sets the memory state over the row's host range, skipping the ISA hole.
    fn apply_state(&self, space: &mut AddressSpace, state: MemState) {
        let start = self.host_base;
        let end = self.host_end();
        if start >= HIGH_MEM_BASE {
            space.set_mem_state(start, self.host_size, state);
        }
        else {
            let low_end = end.min(u64::from(LOW_MEM_TOP));
            if low_end > u64::from(start) {
                space.set_mem_state(start, (low_end - u64::from(start)) as u32, state);
            }
            if end > u64::from(HIGH_MEM_BASE) {
                space.set_mem_state(HIGH_MEM_BASE, (end - u64::from(HIGH_MEM_BASE)) as u32, state);
            }
        }
    }
}

/// Partitions the RAM into rows with independently configurable host and RAM placement.
///
/// The controller owns the row regions, so it can't be cloned:
///
/// ```compile_fail
/// use pcmem::memory::{AddressSpace, MemoryConfig};
/// use pcmem::chipset::{RowConfig, RowController};
/// let mut space = AddressSpace::new(MemoryConfig::default()).unwrap();
/// let rows = RowController::new(&mut space, RowConfig::default()).unwrap();
/// let copy = rows.clone();
/// ```
#[derive(Debug)]
pub struct RowController {
    config: RowConfig,
    rows: ArrayVec<MemoryRow, MAX_ROWS>
}

impl RowController {
    /// Creates the row table from the default sizes, registers the row regions and maps them
    /// with [RowController::reset].
    ///
    /// Rows beyond the RAM size get no RAM and are never mapped.
    pub fn new(space: &mut AddressSpace, config: RowConfig) -> Result<Self> {
        config.validate()?;
        let ram_total = u64::from(space.config().ram_size);
        let shift = config.unit_shift;
        let mut rows = ArrayVec::new();
        let mut ram_base = 0u64;
        let mut boundary = 0u32;
        for index in 0..usize::from(config.rows) {
            let units = config.default_row_units(index);
            boundary += units;
            let base = ram_base.min(ram_total);
            let ram_size = (u64::from(units) << shift).min(ram_total - base) as u32;
            let ram_base32 = base as u32;
            let region = space.add_region(ram_base32, ram_size, RamHandler, Some(BufferRef::ram(ram_base32)),
                                          MappingFlags::INTERNAL);
            rows.push(MemoryRow {
                host_base: ram_base32,
                host_size: ram_size,
                ram_base: ram_base32,
                ram_size,
                ram_mask: ram_size.checked_next_power_of_two().unwrap_or(0).wrapping_sub(1),
                boundary,
                region
            });
            ram_base += u64::from(units) << shift;
        }
        debug!("rows: {} unit: {} KB", config.rows, (1u64 << shift) >> 10);
        let mut ctrl = RowController { config, rows };
        ctrl.reset(space);
        Ok(ctrl)
    }

    #[inline]
    pub fn config(&self) -> &RowConfig {
        &self.config
    }

    #[inline]
    pub fn rows(&self) -> &[MemoryRow] {
        &self.rows
    }
    /// Returns the end of the row in bytes.
    #[inline]
    pub fn boundary_addr(&self, row: usize) -> u64 {
        u64::from(self.rows[row].boundary) << self.config.unit_shift
    }
    /// Returns the default boundary of the row in units: the sum of the default sizes
    /// of the row and all rows before it.
    pub fn default_boundary(&self, row: usize) -> u32 {
        (0..=row).map(|n| self.config.default_row_units(n)).sum()
    }
    /// Sets the end of the row in units and remaps it.
    ///
    /// The row starts at the boundary of the previous row. Boundaries beyond the RAM are clamped.
    /// Ignores rows that don't exist.
    pub fn set_boundary(&mut self, space: &mut AddressSpace, row: u8, units: u32) {
        let index = usize::from(row);
        if index >= self.rows.len() {
            debug!("row {} doesn't exist", row);
            return
        }
        let shift = self.config.unit_shift;
        let ram_total = u64::from(space.config().ram_size);
        let mut units = units;
        if u64::from(units) << shift > ram_total {
            warn!("row {} boundary: {} exceeds RAM, clamped", row, units);
            units = (ram_total >> shift) as u32;
        }
        self.allocate(space, index, false);
        let host_base = if index == 0 { 0 } else { self.boundary_addr(index - 1) };
        let boundary_addr = u64::from(units) << shift;
        let row = &mut self.rows[index];
        row.boundary = units;
        row.host_base = host_base as u32;
        row.host_size = boundary_addr.saturating_sub(host_base) as u32;
        self.allocate(space, index, true);
    }
    /// Maps (`set`) or unmaps the row.
    ///
    /// Rows with an empty or invalid host size or without RAM are left alone, so are rows
    /// being unmapped that aren't mapped. Unmapping restores the internal state of the
    /// mapped rows sharing the host range.
    pub fn allocate(&mut self, space: &mut AddressSpace, index: usize, set: bool) {
        let row = match self.rows.get(index) {
            Some(row) => *row,
            None => return
        };
        if row.host_size == 0 || row.host_size == u32::max_value() || row.ram_size == 0 {
            return
        }
        if !set && !space.region(row.region).is_enabled() {
            return
        }
        debug!("row {}: {} host: {:#010x} size: {:#x} ram: {:#010x}", row.region,
               if set { "map" } else { "unmap" }, row.host_base, row.host_size, row.ram_base);
        space.reset_page_bookkeeping(row.host_base, row.host_size);

        if set {
            row.apply_state(space, MemState::INTERNAL);
            space.set_region_addr(row.region, row.host_base, row.host_size);
            space.set_region_alias(row.region, Some(BufferRef::ram(row.ram_base)));
            space.set_region_mask(row.region, row.ram_mask);
            // a folded offset must not reach the next row's RAM
            space.set_region_limit(row.region, Some(row.ram_size));
            if row.is_identity() {
                space.set_region_handler(row.region, RamHandler);
            }
            else {
                space.set_region_handler(row.region, AliasHandler::new());
            }
            space.enable_region(row.region);
        }
        else {
            space.disable_region(row.region);
            row.apply_state(space, MemState::EXTERNAL);
            for (n, other) in self.rows.iter().enumerate() {
                if n != index && other.overlaps(&row) && space.region(other.region).is_enabled() {
                    other.apply_state(space, MemState::INTERNAL);
                }
            }
        }
    }
    /// Unmaps all rows, from the last to the first, then restores the default boundaries.
    ///
    /// Rows already unmapped keep the memory state of their stale host ranges untouched.
    pub fn reset(&mut self, space: &mut AddressSpace) {
        for index in (0..self.rows.len()).rev() {
            self.allocate(space, index, false);
        }
        for index in 0..self.rows.len() {
            let units = self.default_boundary(index);
            self.set_boundary(space, index as u8, units);
        }
    }
    /// Unmaps all rows and unregisters their regions.
    pub fn detach(mut self, space: &mut AddressSpace) {
        for index in (0..self.rows.len()).rev() {
            self.allocate(space, index, false);
        }
        for row in self.rows.drain(..) {
            space.remove_region(row.region);
        }
    }
}
