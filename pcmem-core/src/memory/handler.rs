/*
    Copyright (C) 2020-2023  Rafal Michalski

    This file is part of PCMEM, a Rust library for building PC emulators.

    For the full copyright notice, see the lib.rs file.
*/
use core::fmt;

use super::{Backing, BufferRef, PageCache, UNMAPPED_BYTE};

/// The placement of a mapping region, as seen by its handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionGeometry {
    pub base: u32,
    pub size: u32,
    /// Applied to the offset within the region before it is added to the `alias`.
    pub mask: u32,
    pub alias: Option<BufferRef>,
    /// The number of bytes of the `alias` reachable through the region.
    ///
    /// Masked offsets at or beyond the limit have no backing.
    pub limit: Option<u32>
}

impl RegionGeometry {
    /// Translates the address `addr` to the backing buffer position.
    ///
    /// Returns `None` if the region has no backing alias or the offset exceeds the limit.
    #[inline]
    pub fn translate(&self, addr: u32) -> Option<BufferRef> {
        let offset = self.offset(addr);
        if !self.within_limit(offset) {
            return None
        }
        self.alias.map(|alias| alias.add(offset))
    }
    /// Returns `true` if `len` bytes at `addr` translate to a contiguous backing range.
    #[inline]
    pub fn is_contiguous(&self, addr: u32, len: u32) -> bool {
        let offset = self.offset(addr);
        offset.checked_add(len - 1).map_or(false, |last| last <= self.mask && self.within_limit(last))
    }
    /// Returns the masked offset of `addr` within the region.
    #[inline]
    pub fn offset(&self, addr: u32) -> u32 {
        addr.wrapping_sub(self.base) & self.mask
    }

    #[inline]
    pub fn within_limit(&self, offset: u32) -> bool {
        self.limit.map_or(true, |limit| offset < limit)
    }
}

/// The environment of a single handler call.
pub struct AccessContext<'a> {
    pub backing: &'a mut Backing,
    pub pages: &'a mut PageCache,
    pub region: RegionGeometry
}

impl AccessContext<'_> {
    /// Writes a byte to `buf` on behalf of the address `addr`.
    ///
    /// The page of `addr` is marked dirty only if the stored value actually changes.
    pub fn write_tracked_byte(&mut self, addr: u32, buf: BufferRef, val: u8) {
        if self.backing.read_byte(buf) != val {
            self.backing.write_byte(buf, val);
            self.pages.track_write(addr, 1);
        }
    }

    pub fn write_tracked_word(&mut self, addr: u32, buf: BufferRef, val: u16) {
        if self.backing.read_word(buf) != val {
            self.backing.write_word(buf, val);
            self.pages.track_write(addr, 2);
        }
    }

    pub fn write_tracked_dword(&mut self, addr: u32, buf: BufferRef, val: u32) {
        if self.backing.read_dword(buf) != val {
            self.backing.write_dword(buf, val);
            self.pages.track_write(addr, 4);
        }
    }
}

/// An interface of mapping region access handlers.
///
/// Multi-byte accesses never cross a page boundary. Values are little-endian.
pub trait MemoryHandler: fmt::Debug {
    fn read_byte(&mut self, addr: u32, ctx: &mut AccessContext<'_>) -> u8;

    fn write_byte(&mut self, addr: u32, val: u8, ctx: &mut AccessContext<'_>);

    fn read_word(&mut self, addr: u32, ctx: &mut AccessContext<'_>) -> u16 {
        u16::from_le_bytes([self.read_byte(addr, ctx), self.read_byte(addr.wrapping_add(1), ctx)])
    }

    fn read_dword(&mut self, addr: u32, ctx: &mut AccessContext<'_>) -> u32 {
        let lo = self.read_word(addr, ctx);
        let hi = self.read_word(addr.wrapping_add(2), ctx);
        u32::from(lo) | u32::from(hi) << 16
    }

    fn write_word(&mut self, addr: u32, val: u16, ctx: &mut AccessContext<'_>) {
        let [lo, hi] = val.to_le_bytes();
        self.write_byte(addr, lo, ctx);
        self.write_byte(addr.wrapping_add(1), hi, ctx);
    }

    fn write_dword(&mut self, addr: u32, val: u32, ctx: &mut AccessContext<'_>) {
        self.write_word(addr, val as u16, ctx);
        self.write_word(addr.wrapping_add(2), (val >> 16) as u16, ctx);
    }
    /// Should return `false` if the handler doesn't serve reads.
    ///
    /// Such a handler's region is never a read target.
    #[inline]
    fn is_readable(&self) -> bool {
        true
    }
    /// Should return `false` if the handler doesn't intercept writes.
    #[inline]
    fn is_writable(&self) -> bool {
        true
    }
}

/// A type of boxed dynamic [MemoryHandler]s owned by mapping regions.
pub type BoxMemoryHandler = Box<dyn MemoryHandler>;

impl<H: MemoryHandler + 'static> From<H> for BoxMemoryHandler {
    fn from(handler: H) -> Self {
        Box::new(handler)
    }
}

/// Identity-mapped access to RAM: the address is the RAM offset.
///
/// Addresses above the RAM ceiling read as `0xFF` and ignore writes.
#[derive(Clone, Copy, Default, Debug)]
pub struct RamHandler;

impl MemoryHandler for RamHandler {
    #[inline]
    fn read_byte(&mut self, addr: u32, ctx: &mut AccessContext<'_>) -> u8 {
        ctx.backing.read_byte(BufferRef::ram(addr))
    }

    #[inline]
    fn write_byte(&mut self, addr: u32, val: u8, ctx: &mut AccessContext<'_>) {
        ctx.write_tracked_byte(addr, BufferRef::ram(addr), val)
    }

    fn read_word(&mut self, addr: u32, ctx: &mut AccessContext<'_>) -> u16 {
        ctx.backing.read_word(BufferRef::ram(addr))
    }

    fn read_dword(&mut self, addr: u32, ctx: &mut AccessContext<'_>) -> u32 {
        ctx.backing.read_dword(BufferRef::ram(addr))
    }

    fn write_word(&mut self, addr: u32, val: u16, ctx: &mut AccessContext<'_>) {
        ctx.write_tracked_word(addr, BufferRef::ram(addr), val)
    }

    fn write_dword(&mut self, addr: u32, val: u32, ctx: &mut AccessContext<'_>) {
        ctx.write_tracked_dword(addr, BufferRef::ram(addr), val)
    }
}

/// Access through the region's backing alias: `alias + ((addr - base) & mask)`.
///
/// A region without an alias reads as `0xFF` and ignores writes.
#[derive(Clone, Copy, Debug)]
pub struct AliasHandler {
    writable: bool
}

impl Default for AliasHandler {
    fn default() -> Self {
        AliasHandler { writable: true }
    }
}

impl AliasHandler {
    pub fn new() -> Self {
        AliasHandler::default()
    }
    /// Creates a handler which doesn't intercept writes, e.g. for ROM.
    pub fn read_only() -> Self {
        AliasHandler { writable: false }
    }
}

impl MemoryHandler for AliasHandler {
    fn read_byte(&mut self, addr: u32, ctx: &mut AccessContext<'_>) -> u8 {
        match ctx.region.translate(addr) {
            Some(buf) => ctx.backing.read_byte(buf),
            None => UNMAPPED_BYTE
        }
    }

    fn write_byte(&mut self, addr: u32, val: u8, ctx: &mut AccessContext<'_>) {
        if let Some(buf) = ctx.region.translate(addr) {
            ctx.write_tracked_byte(addr, buf, val)
        }
    }

    fn read_word(&mut self, addr: u32, ctx: &mut AccessContext<'_>) -> u16 {
        match ctx.region.translate(addr) {
            Some(buf) if ctx.region.is_contiguous(addr, 2) => ctx.backing.read_word(buf),
            _ => u16::from_le_bytes([self.read_byte(addr, ctx), self.read_byte(addr.wrapping_add(1), ctx)])
        }
    }

    fn read_dword(&mut self, addr: u32, ctx: &mut AccessContext<'_>) -> u32 {
        match ctx.region.translate(addr) {
            Some(buf) if ctx.region.is_contiguous(addr, 4) => ctx.backing.read_dword(buf),
            _ => {
                let lo = self.read_word(addr, ctx);
                let hi = self.read_word(addr.wrapping_add(2), ctx);
                u32::from(lo) | u32::from(hi) << 16
            }
        }
    }

    fn write_word(&mut self, addr: u32, val: u16, ctx: &mut AccessContext<'_>) {
        match ctx.region.translate(addr) {
            Some(buf) if ctx.region.is_contiguous(addr, 2) => ctx.write_tracked_word(addr, buf, val),
            _ => {
                let [lo, hi] = val.to_le_bytes();
                self.write_byte(addr, lo, ctx);
                self.write_byte(addr.wrapping_add(1), hi, ctx);
            }
        }
    }

    fn write_dword(&mut self, addr: u32, val: u32, ctx: &mut AccessContext<'_>) {
        match ctx.region.translate(addr) {
            Some(buf) if ctx.region.is_contiguous(addr, 4) => ctx.write_tracked_dword(addr, buf, val),
            _ => {
                self.write_word(addr, val as u16, ctx);
                self.write_word(addr.wrapping_add(2), (val >> 16) as u16, ctx);
            }
        }
    }

    #[inline]
    fn is_writable(&self) -> bool {
        self.writable
    }
}

/// A device which responds to accesses without driving the data bus.
///
/// Reads return `0xFF`, writes are swallowed.
#[derive(Clone, Copy, Default, Debug)]
pub struct OpenBusHandler;

impl MemoryHandler for OpenBusHandler {
    #[inline]
    fn read_byte(&mut self, _addr: u32, _ctx: &mut AccessContext<'_>) -> u8 {
        UNMAPPED_BYTE
    }

    #[inline]
    fn write_byte(&mut self, _addr: u32, _val: u8, _ctx: &mut AccessContext<'_>) {}
}
