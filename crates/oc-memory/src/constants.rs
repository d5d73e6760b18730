//! PS3 memory map constants

/// Main memory base address
pub const MAIN_MEM_BASE: u32 = 0x0000_0000;
/// Main memory size (256 MB)
pub const MAIN_MEM_SIZE: u32 = 0x1000_0000;

/// Usual load address of the main executable
pub const EXECUTABLE_BASE: u32 = 0x0001_0000;

/// User memory base address
pub const USER_MEM_BASE: u32 = 0x2000_0000;
/// User memory size (256 MB)
pub const USER_MEM_SIZE: u32 = 0x1000_0000;

/// Stack area base
pub const STACK_BASE: u32 = 0xD000_0000;
/// Stack area size
pub const STACK_SIZE: u32 = 0x1000_0000;

/// Standard page size (4 KB)
pub const PAGE_SIZE: u32 = 0x1000;

/// Reservation granularity (128 bytes = cache line)
pub const RESERVATION_GRANULARITY: u32 = 128;

/// Mask selecting the line of an address
pub const LINE_MASK: u32 = !(RESERVATION_GRANULARITY - 1);
