//! Guest memory manager
//!
//! Guest memory is big-endian. Each region stores its bytes in `AtomicU64`
//! cells holding eight guest bytes in big-endian order, so a naturally
//! aligned access up to 8 bytes is a single atomic operation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use oc_core::error::MemoryError;
use parking_lot::{Mutex, RwLock};

use crate::constants::{
    MAIN_MEM_BASE, PAGE_SIZE, RESERVATION_GRANULARITY, USER_MEM_BASE, USER_MEM_SIZE,
};
use crate::pages::PageFlags;
use crate::reservation::Reservation;

const LINE: u32 = RESERVATION_GRANULARITY;

/// A value that can be loaded from or stored to guest memory
pub trait GuestValue: Copy {
    const SIZE: u32;
    fn from_bits(bits: u64) -> Self;
    fn to_bits(self) -> u64;
}

macro_rules! impl_guest_value {
    ($($ty:ty),*) => {
        $(
            impl GuestValue for $ty {
                const SIZE: u32 = std::mem::size_of::<$ty>() as u32;
                #[inline]
                fn from_bits(bits: u64) -> Self {
                    bits as $ty
                }
                #[inline]
                fn to_bits(self) -> u64 {
                    self as u64
                }
            }
        )*
    };
}

impl_guest_value!(u8, u16, u32, u64);

/// A contiguous mapped range of guest memory
pub struct Region {
    base: u32,
    size: u32,
    flags: PageFlags,
    cells: Box<[AtomicU64]>,
    lines: Box<[Reservation]>,
}

impl Region {
    fn new(base: u32, size: u32, flags: PageFlags) -> Self {
        let size = size.div_ceil(LINE) * LINE;
        let cells = (0..size / 8).map(|_| AtomicU64::new(0)).collect();
        let lines = (0..size / LINE).map(|_| Reservation::new()).collect();
        Self {
            base,
            size,
            flags,
            cells,
            lines,
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    /// Check whether `len` bytes at `addr` lie inside the region
    #[inline]
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        addr >= self.base && (addr - self.base) as u64 + len as u64 <= self.size as u64
    }

    #[inline]
    fn offset(&self, addr: u32) -> usize {
        (addr - self.base) as usize
    }

    #[inline]
    fn load_byte(&self, off: usize) -> u8 {
        let cell = self.cells[off / 8].load(Ordering::Acquire);
        (cell >> (56 - 8 * (off % 8))) as u8
    }

    #[inline]
    fn store_byte(&self, off: usize, value: u8) {
        self.merge_cell(off / 8, 56 - 8 * (off % 8) as u32, 0xFF, value as u64);
    }

    /// Replace the bits selected by `mask << shift` in one cell
    #[inline]
    fn merge_cell(&self, index: usize, shift: u32, mask: u64, value: u64) {
        let mask = mask << shift;
        let bits = (value << shift) & mask;
        let cell = &self.cells[index];
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let new = (current & !mask) | bits;
            match cell.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Load a big-endian value of `size` bytes (1, 2, 4 or 8)
    #[inline]
    pub fn load(&self, addr: u32, size: u32) -> u64 {
        let off = self.offset(addr);
        let size = size as usize;
        if off % size == 0 {
            let cell = self.cells[off / 8].load(Ordering::Acquire);
            if size == 8 {
                return cell;
            }
            let shift = 64 - 8 * (off % 8 + size);
            return (cell >> shift) & ((1u64 << (size * 8)) - 1);
        }
        (0..size).fold(0u64, |acc, i| (acc << 8) | self.load_byte(off + i) as u64)
    }

    /// Store a big-endian value of `size` bytes (1, 2, 4 or 8)
    #[inline]
    pub fn store(&self, addr: u32, size: u32, value: u64) {
        let off = self.offset(addr);
        let size = size as usize;
        if off % size == 0 {
            if size == 8 {
                self.cells[off / 8].store(value, Ordering::Release);
            } else {
                let shift = (64 - 8 * (off % 8 + size)) as u32;
                self.merge_cell(off / 8, shift, (1u64 << (size * 8)) - 1, value);
            }
            return;
        }
        for i in 0..size {
            let byte = (value >> (8 * (size - 1 - i))) as u8;
            self.store_byte(off + i, byte);
        }
    }

    pub fn read_bytes(&self, addr: u32, out: &mut [u8]) {
        let off = self.offset(addr);
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.load_byte(off + i);
        }
    }

    pub fn write_bytes(&self, addr: u32, data: &[u8]) {
        let off = self.offset(addr);
        for (i, byte) in data.iter().enumerate() {
            self.store_byte(off + i, *byte);
        }
    }

    /// Copy the 128-byte line containing `addr`
    pub fn read_line(&self, addr: u32, out: &mut [u8; 128]) {
        let first = self.offset(addr & !(LINE - 1)) / 8;
        for (i, chunk) in out.chunks_exact_mut(8).enumerate() {
            let cell = self.cells[first + i].load(Ordering::Acquire);
            chunk.copy_from_slice(&cell.to_be_bytes());
        }
    }

    /// Zero the 128-byte line containing `addr`
    pub fn clear_line(&self, addr: u32) {
        let first = self.offset(addr & !(LINE - 1)) / 8;
        for cell in &self.cells[first..first + (LINE / 8) as usize] {
            cell.store(0, Ordering::Release);
        }
    }

    /// Reservation epoch of the line containing `addr`
    #[inline]
    pub fn reservation(&self, addr: u32) -> &Reservation {
        &self.lines[self.offset(addr) / LINE as usize]
    }
}

/// Guest memory manager
pub struct MemoryManager {
    /// Mapped regions sorted by base address
    regions: RwLock<Vec<Arc<Region>>>,
    /// Next free address in user memory
    next_user: Mutex<u32>,
}

impl MemoryManager {
    /// Create a memory manager with nothing mapped
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            regions: RwLock::new(Vec::new()),
            next_user: Mutex::new(USER_MEM_BASE),
        })
    }

    /// Create a memory manager with `size` bytes of main memory mapped RWX
    pub fn with_main_memory(size: u32) -> Result<Arc<Self>, MemoryError> {
        let memory = Self::new();
        memory.map(MAIN_MEM_BASE, size, PageFlags::RWX)?;
        Ok(memory)
    }

    /// Map a new zeroed region
    pub fn map(&self, base: u32, size: u32, flags: PageFlags) -> Result<(), MemoryError> {
        if base % LINE != 0 {
            return Err(MemoryError::Misaligned { addr: base });
        }
        if size == 0 || base as u64 + size as u64 > 1 << 32 {
            return Err(MemoryError::OutOfRange { addr: base, size });
        }

        let mut regions = self.regions.write();
        let end = base as u64 + size as u64;
        let overlaps = regions.iter().any(|r| {
            let r_end = r.base as u64 + r.size as u64;
            (base as u64) < r_end && end > r.base as u64
        });
        if overlaps {
            return Err(MemoryError::Overlap { addr: base, size });
        }

        let pos = regions.partition_point(|r| r.base < base);
        regions.insert(pos, Arc::new(Region::new(base, size, flags)));
        tracing::debug!("Mapped 0x{:08x}..0x{:08x} ({:?})", base, end, flags);
        Ok(())
    }

    /// Unmap the region starting at `base`
    pub fn unmap(&self, base: u32) -> Result<(), MemoryError> {
        let mut regions = self.regions.write();
        let pos = regions
            .iter()
            .position(|r| r.base == base)
            .ok_or(MemoryError::Unmapped { addr: base })?;
        regions.remove(pos);
        Ok(())
    }

    /// Allocate and map memory in the user area
    pub fn allocate(&self, size: u32, align: u32, flags: PageFlags) -> Result<u32, MemoryError> {
        let align = align.max(PAGE_SIZE);
        let size = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;

        let mut next = self.next_user.lock();
        let addr = next.div_ceil(align) * align;
        if addr as u64 + size as u64 > USER_MEM_BASE as u64 + USER_MEM_SIZE as u64 {
            return Err(MemoryError::OutOfMemory { size });
        }
        self.map(addr, size, flags)?;
        *next = addr + size;
        Ok(addr)
    }

    /// Find the region holding `len` bytes at `addr`
    pub fn region(&self, addr: u32, len: u32) -> Result<Arc<Region>, MemoryError> {
        let regions = self.regions.read();
        Self::find(&regions, addr, len).cloned()
    }

    fn find<'a>(regions: &'a [Arc<Region>], addr: u32, len: u32) -> Result<&'a Arc<Region>, MemoryError> {
        let pos = regions.partition_point(|r| r.base <= addr);
        if pos == 0 {
            return Err(MemoryError::Unmapped { addr });
        }
        let region = &regions[pos - 1];
        if !region.contains(addr, 1) {
            return Err(MemoryError::Unmapped { addr });
        }
        if !region.contains(addr, len) {
            return Err(MemoryError::OutOfRange { addr, size: len });
        }
        Ok(region)
    }

    #[inline]
    fn with_region<R>(
        &self,
        addr: u32,
        len: u32,
        write: bool,
        f: impl FnOnce(&Region) -> R,
    ) -> Result<R, MemoryError> {
        let regions = self.regions.read();
        let region = Self::find(&regions, addr, len)?;
        if write && !region.flags.contains(PageFlags::WRITE) {
            return Err(MemoryError::ReadOnly { addr });
        }
        Ok(f(region))
    }

    /// Check whether `addr` lies in an executable region
    pub fn is_executable(&self, addr: u32) -> bool {
        self.with_region(addr, 4, false, |r| r.flags.contains(PageFlags::EXECUTE))
            .unwrap_or(false)
    }

    /// Read a big-endian value
    #[inline]
    pub fn read<T: GuestValue>(&self, addr: u32) -> Result<T, MemoryError> {
        self.with_region(addr, T::SIZE, false, |r| T::from_bits(r.load(addr, T::SIZE)))
    }

    /// Write a big-endian value
    #[inline]
    pub fn write<T: GuestValue>(&self, addr: u32, value: T) -> Result<(), MemoryError> {
        self.with_region(addr, T::SIZE, true, |r| r.store(addr, T::SIZE, value.to_bits()))
    }

    #[inline]
    pub fn read_be16(&self, addr: u32) -> Result<u16, MemoryError> {
        self.read(addr)
    }

    #[inline]
    pub fn read_be32(&self, addr: u32) -> Result<u32, MemoryError> {
        self.read(addr)
    }

    #[inline]
    pub fn read_be64(&self, addr: u32) -> Result<u64, MemoryError> {
        self.read(addr)
    }

    #[inline]
    pub fn write_be16(&self, addr: u32, value: u16) -> Result<(), MemoryError> {
        self.write(addr, value)
    }

    #[inline]
    pub fn write_be32(&self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write(addr, value)
    }

    #[inline]
    pub fn write_be64(&self, addr: u32, value: u64) -> Result<(), MemoryError> {
        self.write(addr, value)
    }

    pub fn read_bytes(&self, addr: u32, out: &mut [u8]) -> Result<(), MemoryError> {
        self.with_region(addr, out.len() as u32, false, |r| r.read_bytes(addr, out))
    }

    pub fn write_bytes(&self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        self.with_region(addr, data.len() as u32, true, |r| r.write_bytes(addr, data))
    }

    /// Copy a loaded image into memory regardless of region protection
    pub fn load_image(&self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        self.with_region(addr, data.len() as u32, false, |r| r.write_bytes(addr, data))
    }
}
