/*
    Copyright (C) 2020-2023  Rafal Michalski

    This file is part of PCMEM, a Rust library for building PC emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The backing store arena: RAM segments and the SMRAM staging buffer.

use super::{UNMAPPED_BYTE, RAM_SEGMENT_SHIFT, RAM_SEGMENT_SIZE};

/// The size of a single SMRAM staging slot.
pub const SMRAM_SLOT_SIZE: u32 = 0x1_0000;
/// The number of SMRAM staging slots.
pub const SMRAM_SLOTS: u32 = 4;
/// The size of the SMRAM staging buffer.
pub const SMRAM_STAGING_SIZE: u32 = SMRAM_SLOT_SIZE * SMRAM_SLOTS;

/// Identifies a backing buffer owned by [Backing].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Store {
    /// The emulated RAM.
    Ram,
    /// The SMRAM staging buffer, bank-switched independently of the RAM.
    Smram
}

/// A non-owning view of a position in one of the backing buffers.
///
/// Views are plain offsets, they never dangle and are re-derived on every topology change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferRef {
    pub store: Store,
    pub offset: u32
}

impl BufferRef {
    #[inline]
    pub const fn ram(offset: u32) -> Self {
        BufferRef { store: Store::Ram, offset }
    }

    #[inline]
    pub const fn smram(offset: u32) -> Self {
        BufferRef { store: Store::Smram, offset }
    }
    /// Returns the view advanced by `delta` bytes.
    #[inline]
    pub fn add(self, delta: u32) -> Self {
        BufferRef { store: self.store, offset: self.offset.wrapping_add(delta) }
    }
}

/// The emulated RAM, allocated in segments of at most 1 GB.
///
/// Offsets at or above the 1 GB boundary are served from the secondary segment.
#[derive(Clone, Debug)]
pub struct RamArena {
    segments: Vec<Box<[u8]>>,
    size: u32
}

impl RamArena {
    pub fn new(size: u32) -> Self {
        let mut segments = Vec::new();
        let mut left = size as usize;
        while left != 0 {
            let len = left.min(RAM_SEGMENT_SIZE);
            segments.push(vec![0u8; len].into_boxed_slice());
            left -= len;
        }
        RamArena { segments, size }
    }
    /// Returns the size of the RAM in bytes, which is also the RAM ceiling.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }
    /// Returns the number of allocated segments.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
    /// Returns the segment with the given `index`.
    ///
    /// # Panics
    /// Panics if the segment doesn't exist.
    pub fn segment(&self, index: usize) -> &[u8] {
        &self.segments[index]
    }

    #[inline(always)]
    fn locate(&self, offset: u32) -> Option<(usize, usize)> {
        if offset < self.size {
            Some(((offset >> RAM_SEGMENT_SHIFT) as usize, offset as usize & (RAM_SEGMENT_SIZE - 1)))
        }
        else {
            None
        }
    }
    /// Returns a slice of `len` bytes at `offset` if it lies within a single segment.
    pub fn slice(&self, offset: u32, len: usize) -> Option<&[u8]> {
        let (seg, index) = self.locate(offset)?;
        self.segments[seg].get(index..index.checked_add(len)?)
    }
    /// Returns a mutable slice of `len` bytes at `offset` if it lies within a single segment.
    pub fn slice_mut(&mut self, offset: u32, len: usize) -> Option<&mut [u8]> {
        let (seg, index) = self.locate(offset)?;
        self.segments[seg].get_mut(index..index.checked_add(len)?)
    }
    /// Reads a byte at the given offset. Returns [UNMAPPED_BYTE] at or above the RAM ceiling.
    #[inline]
    pub fn read_byte(&self, offset: u32) -> u8 {
        match self.locate(offset) {
            Some((seg, index)) => self.segments[seg][index],
            None => UNMAPPED_BYTE
        }
    }
    /// Writes a byte at the given offset. Does nothing at or above the RAM ceiling.
    #[inline]
    pub fn write_byte(&mut self, offset: u32, val: u8) {
        if let Some((seg, index)) = self.locate(offset) {
            self.segments[seg][index] = val;
        }
    }
    /// Fills the whole RAM with bytes produced by the closure.
    pub fn fill<F: FnMut() -> u8>(&mut self, mut f: F) {
        for seg in self.segments.iter_mut() {
            for p in seg.iter_mut() {
                *p = f();
            }
        }
    }
}

/// The arena owning all byte buffers the address space may alias.
#[derive(Clone, Debug)]
pub struct Backing {
    ram: RamArena,
    smram: Box<[u8]>
}

impl Backing {
    pub fn new(ram_size: u32) -> Self {
        let ram = RamArena::new(ram_size);
        let smram = vec![0u8; SMRAM_STAGING_SIZE as usize].into_boxed_slice();
        Backing { ram, smram }
    }

    #[inline]
    pub fn ram(&self) -> &RamArena {
        &self.ram
    }

    #[inline]
    pub fn ram_mut(&mut self) -> &mut RamArena {
        &mut self.ram
    }
    /// Provides a view of the SMRAM staging buffer.
    #[inline]
    pub fn smram(&self) -> &[u8] {
        &self.smram
    }

    #[inline]
    pub fn smram_mut(&mut self) -> &mut [u8] {
        &mut self.smram
    }
    /// Returns a slice of `len` bytes at `buf` if it lies within a single buffer segment.
    pub fn slice(&self, buf: BufferRef, len: usize) -> Option<&[u8]> {
        match buf.store {
            Store::Ram => self.ram.slice(buf.offset, len),
            Store::Smram => {
                let index = buf.offset as usize;
                self.smram.get(index..index.checked_add(len)?)
            }
        }
    }

    fn slice_mut(&mut self, buf: BufferRef, len: usize) -> Option<&mut [u8]> {
        match buf.store {
            Store::Ram => self.ram.slice_mut(buf.offset, len),
            Store::Smram => {
                let index = buf.offset as usize;
                self.smram.get_mut(index..index.checked_add(len)?)
            }
        }
    }
    /// Reads a byte. Returns [UNMAPPED_BYTE] if `buf` points outside of its buffer.
    #[inline]
    pub fn read_byte(&self, buf: BufferRef) -> u8 {
        match buf.store {
            Store::Ram => self.ram.read_byte(buf.offset),
            Store::Smram => self.smram.get(buf.offset as usize).copied().unwrap_or(UNMAPPED_BYTE)
        }
    }
    /// Writes a byte. Does nothing if `buf` points outside of its buffer.
    #[inline]
    pub fn write_byte(&mut self, buf: BufferRef, val: u8) {
        match buf.store {
            Store::Ram => self.ram.write_byte(buf.offset, val),
            Store::Smram => if let Some(p) = self.smram.get_mut(buf.offset as usize) {
                *p = val;
            }
        }
    }

    pub fn read_word(&self, buf: BufferRef) -> u16 {
        match self.slice(buf, 2) {
            Some(&[lo, hi]) => u16::from_le_bytes([lo, hi]),
            _ => u16::from_le_bytes([self.read_byte(buf), self.read_byte(buf.add(1))])
        }
    }

    pub fn read_dword(&self, buf: BufferRef) -> u32 {
        match self.slice(buf, 4) {
            Some(&[b0, b1, b2, b3]) => u32::from_le_bytes([b0, b1, b2, b3]),
            _ => u32::from_le_bytes([self.read_byte(buf), self.read_byte(buf.add(1)),
                                     self.read_byte(buf.add(2)), self.read_byte(buf.add(3))])
        }
    }

    pub fn write_word(&mut self, buf: BufferRef, val: u16) {
        let bytes = val.to_le_bytes();
        match self.slice_mut(buf, 2) {
            Some(slice) => slice.copy_from_slice(&bytes),
            None => for (i, b) in bytes.iter().enumerate() {
                self.write_byte(buf.add(i as u32), *b);
            }
        }
    }

    pub fn write_dword(&mut self, buf: BufferRef, val: u32) {
        let bytes = val.to_le_bytes();
        match self.slice_mut(buf, 4) {
            Some(slice) => slice.copy_from_slice(&bytes),
            None => for (i, b) in bytes.iter().enumerate() {
                self.write_byte(buf.add(i as u32), *b);
            }
        }
    }
}
