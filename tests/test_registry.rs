//! Mapping region registry and page cache consistency.
use std::cell::RefCell;
use std::rc::Rc;
use rand::prelude::*;
use pcmem::memory::*;

#[derive(Debug, Default)]
struct Latch {
    value: u8,
    writes: Rc<RefCell<Vec<(u32, u8)>>>
}

impl MemoryHandler for Latch {
    fn read_byte(&mut self, _addr: u32, _ctx: &mut AccessContext<'_>) -> u8 {
        self.value
    }

    fn write_byte(&mut self, addr: u32, val: u8, _ctx: &mut AccessContext<'_>) {
        self.value = val;
        self.writes.borrow_mut().push((addr, val));
    }
}

fn space() -> AddressSpace {
    AddressSpace::new(MemoryConfig { ram_size: 1 << 20, address_bits: 20 }).unwrap()
}

fn snapshot(space: &AddressSpace) -> Vec<Page> {
    space.page_cache().iter().copied().collect()
}

#[test]
fn test_intercept_handlers() {
    let mut space = space();
    SystemRam::install(&mut space);
    let writes = Rc::new(RefCell::new(Vec::new()));
    let latch = Latch { value: 0x42, writes: Rc::clone(&writes) };
    let id = space.add_region(0xC8000, 0x1000, latch, None, MappingFlags::EXTERNAL);
    space.enable_region(id);
    space.flush();
    assert_eq!(space.read_byte(Accessor::Cpu, 0xC8000), 0x42);
    assert_eq!(space.read_word(Accessor::Bus, 0xC8FFE), 0x4242);
    // no direct buffer, fetches go through the handler
    assert_eq!(space.page(0xC8000).mem, None);
    assert_eq!(space.fetch_byte(0xC8010), 0x42);
    space.write_word(Accessor::Bus, 0xC8010, 0x1234);
    assert_eq!(&*writes.borrow(), &[(0xC8010, 0x34), (0xC8011, 0x12)]);
    assert_eq!(space.read_byte(Accessor::Cpu, 0xC8FFF), 0x12);
    // a dword crossing into the next page is split
    space.write_dword(Accessor::Cpu, 0xC8FFE, 0xAABB_CCDD);
    assert_eq!(writes.borrow().len(), 4);
    assert_eq!(space.read_byte(Accessor::Cpu, 0xC9000), UNMAPPED_BYTE);
    let handler = space.remove_region(id);
    assert!(format!("{:?}", handler).contains("Latch"));
    assert_eq!(space.read_byte(Accessor::Cpu, 0xC8000), UNMAPPED_BYTE);
}

#[test]
fn test_disable_enable_idempotence() {
    let mut space = space();
    let ram = space.add_region(0, 0x100000, RamHandler, Some(BufferRef::ram(0)), MappingFlags::INTERNAL);
    let ems = space.add_region(0xD0000, 0x8000, AliasHandler::new(), Some(BufferRef::ram(0x40000)),
                               MappingFlags::EXTERNAL);
    space.enable_region(ram);
    space.enable_region(ems);
    space.flush();
    let enabled = snapshot(&space);
    space.disable_region(ems);
    let disabled = snapshot(&space);
    assert_ne!(enabled, disabled);
    space.disable_region(ems);
    assert_eq!(snapshot(&space), disabled);
    space.enable_region(ems);
    assert_eq!(snapshot(&space), enabled);
    space.enable_region(ems);
    assert_eq!(snapshot(&space), enabled);
}

#[test]
fn test_last_enabled_region_wins() {
    struct Model { id: RegionId, base: u32, size: u32, alias: u32, enabled: bool, order: u64 }

    let mut rng = SmallRng::seed_from_u64(0x5EED_CAFE);
    let mut space = space();
    let mut model = Vec::new();
    for n in 0..8u32 {
        let base = rng.gen_range(0..0x80u32) << PAGE_SHIFT;
        let size = rng.gen_range(1..0x40u32) << PAGE_SHIFT;
        let alias = n << 16;
        let id = space.add_region(base, size, AliasHandler::new(), Some(BufferRef::ram(alias)),
                                  MappingFlags::INTERNAL);
        model.push(Model { id, base, size, alias, enabled: false, order: 0 });
    }
    let mut clock = 0;
    for _ in 0..300 {
        let entry = &mut model[rng.gen_range(0..8)];
        match rng.gen_range(0..3) {
            0 => {
                space.enable_region(entry.id);
                clock += 1;
                entry.enabled = true;
                entry.order = clock;
            }
            1 => {
                space.disable_region(entry.id);
                entry.enabled = false;
            }
            _ => {
                let base = rng.gen_range(0..0x80u32) << PAGE_SHIFT;
                let size = rng.gen_range(0..0x40u32) << PAGE_SHIFT;
                space.set_region_addr(entry.id, base, size);
                clock += 1;
                entry.base = base;
                entry.size = size;
                entry.order = clock;
            }
        }
        for page in 0..0xC0u32 {
            let addr = page << PAGE_SHIFT;
            let winner = model.iter()
                .filter(|m| m.enabled && m.base <= addr && addr - m.base < m.size)
                .max_by_key(|m| m.order);
            let entry = space.page(addr);
            for &accessor in Accessor::ALL.iter() {
                assert_eq!(entry.read_target(accessor), winner.map(|m| m.id));
                assert_eq!(entry.write_target(accessor), winner.map(|m| m.id));
            }
            assert_eq!(entry.mem, winner.map(|m| BufferRef::ram(m.alias + addr - m.base)));
        }
    }
}

#[test]
fn test_flush_contract() {
    let mut space = AddressSpace::new(MemoryConfig { ram_size: 2 << 20, address_bits: 24 }).unwrap();
    let sysram = SystemRam::install(&mut space);
    assert!(space.is_flush_pending());
    space.flush();
    let generation = space.generation();
    space.backing_mut().ram_mut().write_byte(0x8000, 0x11);
    space.backing_mut().ram_mut().write_byte(0x18000, 0x22);
    assert_eq!(space.fetch_byte(0x8000), 0x11);
    // a stale alias is served until the flush
    space.set_region_handler(sysram.low(), AliasHandler::new());
    space.set_region_alias(sysram.low(), Some(BufferRef::ram(0x10000)));
    assert!(space.is_flush_pending());
    assert_eq!(space.fetch_byte(0x8000), 0x11);
    assert_eq!(space.read_byte(Accessor::Cpu, 0x8000), 0x22);
    space.flush();
    assert_eq!(space.generation(), generation + 1);
    assert_eq!(space.fetch_byte(0x8000), 0x22);
    // the soft flush keeps the translated code bookkeeping
    space.mark_code_present(0x8000, 0x10);
    space.set_a20(false);
    assert_eq!(space.generation(), generation + 2);
    assert_ne!(space.page(0x8000).code_present_mask, 0);
    space.flush();
    assert_eq!(space.page(0x8000).code_present_mask, 0);
}

#[test]
fn test_dma_invalidation() {
    let mut space = space();
    SystemRam::install(&mut space);
    space.flush();
    space.mark_code_present(0x7C00, 0x200);
    space.mark_code_present(0x9000, 1);
    space.invalidate_range(0x7000, 0x8FFF);
    let mut evicted = Vec::new();
    while let Some(page) = space.pop_evicted() {
        evicted.push(page);
    }
    assert_eq!(evicted, [7]);
    assert_eq!(space.page(0x7000).code_present_mask, 0);
    assert_ne!(space.page(0x9000).code_present_mask, 0);
    assert!(!space.page(0x8000).in_evict_list());
}
