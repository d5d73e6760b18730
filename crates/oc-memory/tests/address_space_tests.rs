//! Tests for guest address space mapping and access

use oc_core::error::MemoryError;
use oc_memory::{constants::*, MemoryManager, PageFlags};

#[test]
fn test_address_space_boundaries() {
    let mem = MemoryManager::with_main_memory(0x10_0000).unwrap();

    // Test that we can access main memory
    let addr = MAIN_MEM_BASE;
    mem.write::<u32>(addr, 0xDEADBEEF).unwrap();
    assert_eq!(mem.read::<u32>(addr).unwrap(), 0xDEADBEEF);

    // Upper boundary of the mapped range
    let addr = MAIN_MEM_BASE + 0x10_0000 - 4;
    mem.write::<u32>(addr, 0xCAFEBABE).unwrap();
    assert_eq!(mem.read::<u32>(addr).unwrap(), 0xCAFEBABE);

    // One past the end straddles the boundary
    assert_eq!(
        mem.read::<u64>(addr),
        Err(MemoryError::OutOfRange { addr, size: 8 })
    );

    let alloc_addr = mem.allocate(0x1000, 0x1000, PageFlags::RW).unwrap();
    assert!(alloc_addr >= USER_MEM_BASE);
    assert!(alloc_addr < USER_MEM_BASE + USER_MEM_SIZE);

    mem.write::<u64>(alloc_addr, 0x1234567890ABCDEF).unwrap();
    assert_eq!(mem.read::<u64>(alloc_addr).unwrap(), 0x1234567890ABCDEF);
}

#[test]
fn test_unmapped_access() {
    let mem = MemoryManager::new();
    assert_eq!(
        mem.read_be32(STACK_BASE),
        Err(MemoryError::Unmapped { addr: STACK_BASE })
    );
}

#[test]
fn test_memory_region_isolation() {
    let mem = MemoryManager::with_main_memory(0x10_0000).unwrap();
    mem.map(STACK_BASE, 0x1_0000, PageFlags::RW).unwrap();

    let main_addr = MAIN_MEM_BASE + 0x1000;
    mem.write::<u32>(main_addr, 0x11111111).unwrap();

    let user_addr = mem.allocate(0x1000, 0x1000, PageFlags::RW).unwrap();
    mem.write::<u32>(user_addr, 0x22222222).unwrap();

    let stack_addr = STACK_BASE + 0x1000;
    mem.write::<u32>(stack_addr, 0x33333333).unwrap();

    assert_eq!(mem.read::<u32>(main_addr).unwrap(), 0x11111111);
    assert_eq!(mem.read::<u32>(user_addr).unwrap(), 0x22222222);
    assert_eq!(mem.read::<u32>(stack_addr).unwrap(), 0x33333333);
}

#[test]
fn test_overlapping_allocations_prevention() {
    let mem = MemoryManager::new();

    let size = 0x10000;
    let addr1 = mem.allocate(size, 0x1000, PageFlags::RW).unwrap();

    for i in 0..100 {
        mem.write::<u32>(addr1 + i * 4, i).unwrap();
    }

    let addr2 = mem.allocate(size, 0x1000, PageFlags::RW).unwrap();
    assert!(addr2 >= addr1 + size || addr1 >= addr2 + size);

    mem.write::<u32>(addr2, 0xFFFFFFFF).unwrap();

    // First allocation is unchanged
    assert_eq!(mem.read::<u32>(addr1).unwrap(), 0);
    assert_eq!(mem.read::<u32>(addr1 + 4).unwrap(), 1);
}

#[test]
fn test_unaligned_access() {
    let mem = MemoryManager::with_main_memory(0x1000).unwrap();

    let addr = MAIN_MEM_BASE + 1;

    mem.write::<u32>(addr, 0x12345678).unwrap();
    assert_eq!(mem.read::<u32>(addr).unwrap(), 0x12345678);

    mem.write::<u64>(addr, 0xDEADBEEFCAFEBABE).unwrap();
    assert_eq!(mem.read::<u64>(addr).unwrap(), 0xDEADBEEFCAFEBABE);
}

#[test]
fn test_page_aligned_allocations() {
    let mem = MemoryManager::new();

    for _ in 0..10 {
        let addr = mem.allocate(0x5555, 0x1000, PageFlags::RW).unwrap();
        assert_eq!(addr % PAGE_SIZE, 0, "Allocation not page-aligned");
    }
}

#[test]
fn test_allocation_size_rounding() {
    let mem = MemoryManager::new();

    let addr1 = mem.allocate(0x1001, 0x1000, PageFlags::RW).unwrap();
    let addr2 = mem.allocate(0x1000, 0x1000, PageFlags::RW).unwrap();

    // 0x1001 rounds up to 0x2000
    assert!(addr2 >= addr1 + 0x2000);
}

#[test]
fn test_big_endian_operations() {
    let mem = MemoryManager::with_main_memory(0x2000).unwrap();

    let addr = MAIN_MEM_BASE + 0x1000;

    mem.write_be16(addr, 0x1234).unwrap();
    assert_eq!(mem.read_be16(addr).unwrap(), 0x1234);

    mem.write_be32(addr + 2, 0x12345678).unwrap();
    assert_eq!(mem.read_be32(addr + 2).unwrap(), 0x12345678);

    mem.write_be64(addr + 8, 0xDEADBEEFCAFEBABE).unwrap();
    assert_eq!(mem.read_be64(addr + 8).unwrap(), 0xDEADBEEFCAFEBABE);
}

#[test]
fn test_line_reservations_are_per_line() {
    let mem = MemoryManager::with_main_memory(0x1000).unwrap();
    let region = mem.region(0, 0x1000).unwrap();

    region.reservation(0x100).invalidate();
    assert_eq!(region.reservation(0x17F).acquire(), 128);
    assert_eq!(region.reservation(0x180).acquire(), 0);
}
