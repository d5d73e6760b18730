//! Executable-address table
//!
//! One 64-bit cell per 4-byte guest instruction address says how to run the
//! code there: an interpreter opcode token, the fallback (trap) thunk, or a
//! native function id. Cells are updated with single atomic stores, so a
//! reader never sees a half-written entry and never takes a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use oc_core::error::{MemoryError, PpuError};
use oc_memory::MemoryManager;
use parking_lot::{Mutex, RwLock};

use crate::decoder::{PpuDecoder, PpuOpcode};
use crate::interpreter::PpuInterpreter;
use crate::thread::PpuThread;

const KIND_SHIFT: u32 = 62;
const KIND_EMPTY: u64 = 0;
const KIND_INTERP: u64 = 1;
const KIND_FALLBACK: u64 = 2;
const KIND_NATIVE: u64 = 3;
const AUX_SHIFT: u32 = 32;
const AUX_MASK: u64 = 0xFFFF;
const PAYLOAD_MASK: u64 = 0xFFFF_FFFF;

/// Native functions a table can hold by default
pub const DEFAULT_NATIVE_CAPACITY: usize = 1 << 16;

/// Decoded table cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecEntry {
    /// Nothing registered
    Empty,
    /// Decoded opcode for the interpreter
    Interp(PpuOpcode),
    /// Unknown instruction; route to the trap path
    Fallback,
    /// Translated function `id`, with relocation-base bits
    Native { id: u32, reloc: u16 },
}

impl ExecEntry {
    pub fn pack(self) -> u64 {
        match self {
            ExecEntry::Empty => KIND_EMPTY << KIND_SHIFT,
            ExecEntry::Interp(op) => (KIND_INTERP << KIND_SHIFT) | op.token() as u64,
            ExecEntry::Fallback => KIND_FALLBACK << KIND_SHIFT,
            ExecEntry::Native { id, reloc } => {
                (KIND_NATIVE << KIND_SHIFT) | ((reloc as u64 & AUX_MASK) << AUX_SHIFT) | id as u64
            }
        }
    }

    pub fn unpack(raw: u64) -> Self {
        let payload = raw & PAYLOAD_MASK;
        match raw >> KIND_SHIFT {
            KIND_INTERP => PpuOpcode::from_token(payload as u16)
                .map(ExecEntry::Interp)
                .unwrap_or(ExecEntry::Fallback),
            KIND_FALLBACK => ExecEntry::Fallback,
            KIND_NATIVE => ExecEntry::Native {
                id: payload as u32,
                reloc: ((raw >> AUX_SHIFT) & AUX_MASK) as u16,
            },
            _ => ExecEntry::Empty,
        }
    }
}

/// How a native function gave control back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeExit {
    /// Control left the function or a check was requested; `cia` is current
    Branch,
    /// The instruction at `cia` must be interpreted
    Fallback,
}

/// Executable body of a translated function
pub trait NativeCode: Send + Sync {
    fn run(&self, thread: &mut PpuThread, interp: &PpuInterpreter) -> Result<NativeExit, PpuError>;
}

/// A translated guest function
pub struct NativeFunction {
    pub addr: u32,
    pub size: u32,
    pub code: Box<dyn NativeCode>,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction")
            .field("addr", &format_args!("0x{:08x}", self.addr))
            .field("size", &self.size)
            .finish()
    }
}

/// Id allocator state; only touched when functions are added or retired
#[derive(Debug, Default)]
struct ArenaIds {
    next: u32,
    free: Vec<u32>,
}

/// Fixed-capacity storage for native functions
///
/// Ids are reserved before any of them is published, and return to the free
/// list once the functions are retired. A reader that raced a retirement may
/// resolve a reused id to another function, so callers check the entry
/// address of what they get back.
pub struct NativeArena {
    slots: Box<[RwLock<Option<Arc<NativeFunction>>>]>,
    ids: Mutex<ArenaIds>,
}

impl NativeArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| RwLock::new(None)).collect(),
            ids: Mutex::new(ArenaIds::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Reserve `count` ids at once, or none when they do not all fit
    pub fn reserve(&self, count: usize) -> Option<Vec<u32>> {
        let mut ids = self.ids.lock();
        let fresh = count.saturating_sub(ids.free.len());
        if ids.next as usize + fresh > self.slots.len() {
            return None;
        }
        let reused = ids.free.len() - (count - fresh);
        let mut reserved = ids.free.split_off(reused);
        reserved.extend(ids.next..ids.next + fresh as u32);
        ids.next += fresh as u32;
        Some(reserved)
    }

    /// Fill a reserved slot
    pub fn fill(&self, id: u32, function: NativeFunction) {
        if let Some(slot) = self.slots.get(id as usize) {
            *slot.write() = Some(Arc::new(function));
        }
    }

    /// Store a function, returning its id, or `None` when full
    pub fn insert(&self, function: NativeFunction) -> Option<u32> {
        let id = self.reserve(1)?.pop()?;
        self.fill(id, function);
        Some(id)
    }

    /// Empty the slots and make their ids available again
    pub fn release(&self, released: &[u32]) {
        let mut ids = self.ids.lock();
        for &id in released {
            if let Some(slot) = self.slots.get(id as usize) {
                if slot.write().take().is_some() {
                    ids.free.push(id);
                }
            }
        }
    }

    #[inline]
    pub fn get(&self, id: u32) -> Option<Arc<NativeFunction>> {
        self.slots.get(id as usize)?.read().clone()
    }

    /// Ids currently in use
    pub fn len(&self) -> usize {
        let ids = self.ids.lock();
        ids.next as usize - ids.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Executable-address table for one guest address range
pub struct ExecTable {
    base: u32,
    cells: Box<[AtomicU64]>,
    arena: NativeArena,
}

impl ExecTable {
    /// Create a table covering `size` bytes at `base`
    pub fn new(base: u32, size: u32) -> Self {
        Self::with_native_capacity(base, size, DEFAULT_NATIVE_CAPACITY)
    }

    pub fn with_native_capacity(base: u32, size: u32, capacity: usize) -> Self {
        let count = (size / 4) as usize;
        Self {
            base,
            cells: (0..count).map(|_| AtomicU64::new(ExecEntry::Empty.pack())).collect(),
            arena: NativeArena::new(capacity),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Covered size in bytes
    pub fn size(&self) -> u32 {
        (self.cells.len() * 4) as u32
    }

    #[inline]
    fn cell(&self, addr: u32) -> Option<&AtomicU64> {
        if addr % 4 != 0 || addr < self.base {
            return None;
        }
        self.cells.get(((addr - self.base) >> 2) as usize)
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.cell(addr).is_some()
    }

    /// Current entry; `Empty` outside the table
    #[inline]
    pub fn get(&self, addr: u32) -> ExecEntry {
        self.cell(addr)
            .map(|cell| ExecEntry::unpack(cell.load(Ordering::Acquire)))
            .unwrap_or(ExecEntry::Empty)
    }

    /// Pre-decode every word of a loaded segment into interpreter tokens
    pub fn register_segment(&self, memory: &MemoryManager, addr: u32, size: u32) -> Result<usize, MemoryError> {
        let mut registered = 0;
        for offset in (0..size & !3).step_by(4) {
            let pc = addr + offset;
            let Some(cell) = self.cell(pc) else { continue };
            let entry = match PpuDecoder::decode(memory.read_be32(pc)?) {
                PpuOpcode::Unknown => ExecEntry::Fallback,
                op => ExecEntry::Interp(op),
            };
            cell.store(entry.pack(), Ordering::Release);
            registered += 1;
        }
        tracing::debug!(target: "ppu", "registered {} instructions at 0x{:08x}", registered, addr);
        Ok(registered)
    }

    /// Return a segment's entries to empty
    pub fn reset_segment(&self, addr: u32, size: u32) {
        for offset in (0..size & !3).step_by(4) {
            if let Some(cell) = self.cell(addr + offset) {
                cell.store(ExecEntry::Empty.pack(), Ordering::Release);
            }
        }
    }

    /// Cache a decoded opcode if the entry is still `expected`
    pub fn install_interp(&self, addr: u32, expected: ExecEntry, op: PpuOpcode) -> bool {
        self.replace(addr, expected, ExecEntry::Interp(op))
    }

    /// Swap in the fallback thunk if the entry is still `expected`
    ///
    /// Several threads may race to install the same thunk; losing is harmless.
    pub fn install_fallback(&self, addr: u32, expected: ExecEntry) -> bool {
        self.replace(addr, expected, ExecEntry::Fallback)
    }

    fn replace(&self, addr: u32, expected: ExecEntry, new: ExecEntry) -> bool {
        self.cell(addr).is_some_and(|cell| {
            cell.compare_exchange(expected.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    /// Store a function in the arena without publishing it
    pub fn add_native(&self, function: NativeFunction) -> Option<u32> {
        self.arena.insert(function)
    }

    /// Reserve arena ids for `count` functions, all or nothing
    pub fn reserve_native(&self, count: usize) -> Option<Vec<u32>> {
        self.arena.reserve(count)
    }

    /// Store a function under an id from [`Self::reserve_native`]
    pub fn fill_native(&self, id: u32, function: NativeFunction) {
        self.arena.fill(id, function);
    }

    /// Return ids to the arena; their table entries must already be gone
    pub fn release_native(&self, ids: &[u32]) {
        self.arena.release(ids);
    }

    /// Empty `addr` if it still points at native function `id`
    pub fn unpublish_native(&self, addr: u32, id: u32) -> bool {
        let Some(cell) = self.cell(addr) else {
            return false;
        };
        let current = cell.load(Ordering::Acquire);
        match ExecEntry::unpack(current) {
            ExecEntry::Native { id: published, .. } if published == id => cell
                .compare_exchange(current, ExecEntry::Empty.pack(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            _ => false,
        }
    }

    /// Point `addr` at native function `id`
    pub fn publish_native(&self, addr: u32, id: u32, reloc: u16) -> bool {
        match self.cell(addr) {
            Some(cell) => {
                cell.store(ExecEntry::Native { id, reloc }.pack(), Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn native(&self, id: u32) -> Option<Arc<NativeFunction>> {
        self.arena.get(id)
    }

    pub fn native_count(&self) -> usize {
        self.arena.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl NativeCode for Nop {
        fn run(&self, _: &mut PpuThread, _: &PpuInterpreter) -> Result<NativeExit, PpuError> {
            Ok(NativeExit::Branch)
        }
    }

    #[test]
    fn test_entry_packing() {
        for entry in [
            ExecEntry::Empty,
            ExecEntry::Fallback,
            ExecEntry::Interp(PpuOpcode::Stwcx),
            ExecEntry::Native { id: 0xDEAD_BEEF, reloc: 0x1234 },
        ] {
            assert_eq!(ExecEntry::unpack(entry.pack()), entry);
        }
    }

    #[test]
    fn test_out_of_range_is_empty() {
        let table = ExecTable::new(0x1_0000, 0x100);
        assert_eq!(table.get(0x2_0000), ExecEntry::Empty);
        assert_eq!(table.get(0x1_0002), ExecEntry::Empty);
        assert!(!table.publish_native(0x2_0000, 0, 0));
    }

    #[test]
    fn test_register_and_reset_segment() {
        let memory = MemoryManager::with_main_memory(0x1000).unwrap();
        memory.write_be32(0x100, 0x38600064).unwrap(); // addi r3, 0, 100
        let table = ExecTable::new(0, 0x1000);

        assert_eq!(table.register_segment(&memory, 0x100, 8).unwrap(), 2);
        assert_eq!(table.get(0x100), ExecEntry::Interp(PpuOpcode::Addi));
        assert_eq!(table.get(0x104), ExecEntry::Fallback);

        table.reset_segment(0x100, 8);
        assert_eq!(table.get(0x100), ExecEntry::Empty);
    }

    #[test]
    fn test_fallback_cas() {
        let table = ExecTable::new(0, 0x100);
        assert!(table.install_fallback(0x10, ExecEntry::Empty));
        assert!(!table.install_fallback(0x10, ExecEntry::Empty));
        assert_eq!(table.get(0x10), ExecEntry::Fallback);
    }

    #[test]
    fn test_native_publish() {
        let table = ExecTable::with_native_capacity(0, 0x100, 2);
        let id = table
            .add_native(NativeFunction { addr: 0x20, size: 4, code: Box::new(Nop) })
            .unwrap();
        assert!(table.publish_native(0x20, id, 3));
        assert_eq!(table.get(0x20), ExecEntry::Native { id, reloc: 3 });
        assert_eq!(table.native(id).unwrap().addr, 0x20);

        table.add_native(NativeFunction { addr: 0x24, size: 4, code: Box::new(Nop) });
        assert!(table
            .add_native(NativeFunction { addr: 0x28, size: 4, code: Box::new(Nop) })
            .is_none());
    }

    #[test]
    fn test_released_ids_are_reused() {
        let table = ExecTable::with_native_capacity(0, 0x100, 3);
        let first = table.reserve_native(2).unwrap();
        for (&id, addr) in first.iter().zip([0x20, 0x24]) {
            table.fill_native(id, NativeFunction { addr, size: 4, code: Box::new(Nop) });
            table.publish_native(addr, id, 0);
        }
        assert_eq!(table.native_count(), 2);

        // Not enough room for three: nothing is handed out
        assert!(table.reserve_native(2).is_none());
        assert_eq!(table.native_count(), 2);

        assert!(table.unpublish_native(0x20, first[0]));
        assert!(!table.unpublish_native(0x24, first[0]));
        table.release_native(&first[..1]);
        assert!(table.native(first[0]).is_none());
        assert_eq!(table.get(0x20), ExecEntry::Empty);

        let again = table.reserve_native(2).unwrap();
        assert!(again.contains(&first[0]));
        assert_eq!(table.native_count(), 3);
    }
}
