/*
    Copyright (C) 2020-2023  Rafal Michalski

    This file is part of PCMEM, a Rust library for building PC emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The page cache: per-page fast path descriptors and translated code bookkeeping.
use super::{Accessor, BufferRef, RegionId, PAGE_OFFSET_MASK, PAGE_SHIFT};

/// The `evict_prev` value of a page which is not queued in the eviction list.
pub const EVICT_NOT_IN_LIST: u32 = u32::max_value();
const EVICT_NIL: u32 = u32::max_value() - 1;
/// The number of address bits of a chunk tracked by a single bit of the page masks.
pub const PAGE_CHUNK_SHIFT: u32 = 6;

/// A descriptor of a single 4 KB page of the address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    /// A direct view of the page's bytes for CPU instruction fetches.
    ///
    /// `None` if the page has no direct buffer and fetches must go through the read handler.
    pub mem: Option<BufferRef>,
    read: [Option<RegionId>;2],
    write: [Option<RegionId>;2],
    /// 64-byte chunks written to since the last flush.
    pub dirty_mask: u64,
    /// 64-byte chunks holding translated code.
    pub code_present_mask: u64,
    evict_prev: u32,
    evict_next: u32
}

impl Default for Page {
    fn default() -> Self {
        Page {
            mem: None,
            read: [None;2],
            write: [None;2],
            dirty_mask: 0,
            code_present_mask: 0,
            evict_prev: EVICT_NOT_IN_LIST,
            evict_next: EVICT_NIL
        }
    }
}

impl Page {
    /// Returns the region serving reads for the `accessor`.
    #[inline(always)]
    pub fn read_target(&self, accessor: Accessor) -> Option<RegionId> {
        self.read[accessor.index()]
    }
    /// Returns the region intercepting writes of the `accessor`.
    #[inline(always)]
    pub fn write_target(&self, accessor: Accessor) -> Option<RegionId> {
        self.write[accessor.index()]
    }

    #[inline(always)]
    pub fn in_evict_list(&self) -> bool {
        self.evict_prev != EVICT_NOT_IN_LIST
    }
}

/// Returns the chunk mask bits covering `len` bytes at `addr`, clipped to the page of `addr`.
#[inline]
pub fn chunk_mask(addr: u32, len: u32) -> u64 {
    if len == 0 {
        return 0
    }
    let offset = addr & PAGE_OFFSET_MASK;
    let first = offset >> PAGE_CHUNK_SHIFT;
    let last = (offset + len - 1).min(PAGE_OFFSET_MASK) >> PAGE_CHUNK_SHIFT;
    let span = last - first + 1;
    let bits = if span >= 64 { u64::max_value() } else { (1u64 << span) - 1 };
    bits << first
}

/// An array of page descriptors covering the whole address space, together with
/// an intrusive eviction list of pages whose translated code became stale.
#[derive(Clone, Debug)]
pub struct PageCache {
    pages: Box<[Page]>,
    evict_head: u32,
    evict_count: usize
}

impl PageCache {
    pub fn new(page_count: usize) -> Self {
        assert!(page_count < EVICT_NIL as usize, "too many pages");
        PageCache {
            pages: vec![Page::default(); page_count].into_boxed_slice(),
            evict_head: EVICT_NIL,
            evict_count: 0
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> &Page {
        &self.pages[index]
    }
    /// Returns the descriptor of the page containing `addr` if it exists.
    #[inline]
    pub fn page_at(&self, addr: u32) -> Option<&Page> {
        self.pages.get((addr >> PAGE_SHIFT) as usize)
    }

    #[inline]
    pub fn iter(&self) -> core::slice::Iter<'_, Page> {
        self.pages.iter()
    }
    /// Installs the resolved handler targets of the page for the `accessor`.
    #[inline]
    pub fn set_targets(&mut self, index: usize, accessor: Accessor, read: Option<RegionId>, write: Option<RegionId>) {
        let page = &mut self.pages[index];
        page.read[accessor.index()] = read;
        page.write[accessor.index()] = write;
    }
    /// Sets the direct view of the page.
    #[inline]
    pub fn set_mem(&mut self, index: usize, mem: Option<BufferRef>) {
        self.pages[index].mem = mem;
    }
    /// Clears dirty and translated code masks of the page and takes it out of the eviction list.
    pub fn reset_bookkeeping(&mut self, index: usize) {
        if self.pages[index].in_evict_list() {
            self.remove_from_evict_list(index);
        }
        let page = &mut self.pages[index];
        page.dirty_mask = 0;
        page.code_present_mask = 0;
    }
    /// Marks `len` bytes written at `addr` as dirty.
    ///
    /// The page is queued for eviction if any of the written chunks hold translated code.
    pub fn track_write(&mut self, addr: u32, len: u32) {
        let index = (addr >> PAGE_SHIFT) as usize;
        if index >= self.pages.len() {
            return
        }
        let mask = chunk_mask(addr, len);
        let page = &mut self.pages[index];
        page.dirty_mask |= mask;
        if page.code_present_mask & mask != 0 && !page.in_evict_list() {
            self.add_to_evict_list(index);
        }
    }
    /// Marks the whole address range as dirty, e.g. after a DMA transfer.
    ///
    /// Pages outside of the cache are ignored.
    pub fn invalidate_range(&mut self, start: u32, end: u32) {
        if end < start {
            return
        }
        let mut addr = start & !PAGE_OFFSET_MASK;
        loop {
            let lo = addr.max(start);
            let hi = (addr | PAGE_OFFSET_MASK).min(end);
            self.track_write(lo, hi - lo + 1);
            match addr.checked_add(1 << PAGE_SHIFT) {
                Some(next) if next <= end => addr = next,
                _ => break
            }
        }
    }
    /// Registers `len` bytes at `addr` as the origin of translated code.
    pub fn mark_code_present(&mut self, addr: u32, len: u32) {
        if let Some(page) = self.pages.get_mut((addr >> PAGE_SHIFT) as usize) {
            page.code_present_mask |= chunk_mask(addr, len);
        }
    }

    #[inline]
    pub fn evict_count(&self) -> usize {
        self.evict_count
    }
    /// Queues the page at the head of the eviction list.
    ///
    /// # Panics
    /// Panics if the page is already queued.
    pub fn add_to_evict_list(&mut self, index: usize) {
        if self.pages[index].in_evict_list() {
            panic!("page {:#x} is already in the evict list", index);
        }
        let head = self.evict_head;
        if head != EVICT_NIL {
            self.pages[head as usize].evict_prev = index as u32;
        }
        let page = &mut self.pages[index];
        page.evict_next = head;
        page.evict_prev = EVICT_NIL;
        self.evict_head = index as u32;
        self.evict_count += 1;
    }
    /// Takes the page out of the eviction list.
    ///
    /// # Panics
    /// Panics if the page is not queued.
    pub fn remove_from_evict_list(&mut self, index: usize) {
        let Page { evict_prev, evict_next, .. } = self.pages[index];
        if evict_prev == EVICT_NOT_IN_LIST {
            panic!("page {:#x} is not in the evict list", index);
        }
        if evict_prev != EVICT_NIL {
            self.pages[evict_prev as usize].evict_next = evict_next;
        }
        else {
            self.evict_head = evict_next;
        }
        if evict_next != EVICT_NIL {
            self.pages[evict_next as usize].evict_prev = evict_prev;
        }
        let page = &mut self.pages[index];
        page.evict_prev = EVICT_NOT_IN_LIST;
        page.evict_next = EVICT_NIL;
        self.evict_count -= 1;
    }
    /// Takes the most recently queued page out of the eviction list and returns its index.
    ///
    /// The page's dirty and translated code masks are cleared, the code translated from it
    /// should be discarded by the caller.
    pub fn pop_evicted(&mut self) -> Option<usize> {
        if self.evict_head == EVICT_NIL {
            return None
        }
        let index = self.evict_head as usize;
        self.reset_bookkeeping(index);
        Some(index)
    }
    /// Returns an iterator of indexes of the queued pages, most recent first.
    pub fn evicted(&self) -> EvictIter<'_> {
        EvictIter { pages: &self.pages, cursor: self.evict_head }
    }
    /// Drops all translated code bookkeeping and empties the eviction list.
    pub fn flush_code(&mut self) {
        for page in self.pages.iter_mut() {
            page.dirty_mask = 0;
            page.code_present_mask = 0;
            page.evict_prev = EVICT_NOT_IN_LIST;
            page.evict_next = EVICT_NIL;
        }
        self.evict_head = EVICT_NIL;
        self.evict_count = 0;
    }
    /// Resets all page descriptors.
    pub fn reset(&mut self) {
        for page in self.pages.iter_mut() {
            *page = Page::default();
        }
        self.evict_head = EVICT_NIL;
        self.evict_count = 0;
    }
}

pub struct EvictIter<'a> {
    pages: &'a [Page],
    cursor: u32
}

impl<'a> Iterator for EvictIter<'a> {
    type Item = usize;
    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == EVICT_NIL {
            return None
        }
        let index = self.cursor as usize;
        self.cursor = self.pages[index].evict_next;
        Some(index)
    }
}
