//! Symbolic link table and kernel interface
//!
//! Translated code never calls kernel or reservation routines directly. It
//! names them, and the names are resolved against a fixed [`LinkTable`] when
//! the code is loaded.

use std::fmt;
use std::time::Instant;

use oc_core::error::KernelError;
use oc_core::kernel_trace;

use crate::thread::PpuThread;

/// Time base frequency of the guest, in Hz
pub const TIME_BASE_FREQUENCY: u64 = 79_800_000;

/// Host entry points callable from translated code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkEntry {
    Trap,
    Illegal,
    Lwarx,
    Ldarx,
    Stwcx,
    Stdcx,
    GetTb,
    Syscall,
    Dcbz,
}

const SYMBOLS: [(&str, LinkEntry); 9] = [
    ("__trap", LinkEntry::Trap),
    ("__illegal", LinkEntry::Illegal),
    ("__lwarx", LinkEntry::Lwarx),
    ("__ldarx", LinkEntry::Ldarx),
    ("__stwcx", LinkEntry::Stwcx),
    ("__stdcx", LinkEntry::Stdcx),
    ("__get_tb", LinkEntry::GetTb),
    ("__syscall", LinkEntry::Syscall),
    ("__dcbz", LinkEntry::Dcbz),
];

impl LinkEntry {
    pub fn symbol(self) -> &'static str {
        SYMBOLS
            .iter()
            .find(|(_, entry)| *entry == self)
            .map(|(name, _)| *name)
            .unwrap_or("__illegal")
    }
}

/// Name-to-entry mapping used when linking translated code
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkTable;

impl LinkTable {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, name: &str) -> Option<LinkEntry> {
        SYMBOLS.iter().find(|(symbol, _)| *symbol == name).map(|(_, entry)| *entry)
    }

    pub fn symbols(&self) -> impl Iterator<Item = (&'static str, LinkEntry)> {
        SYMBOLS.iter().copied()
    }
}

/// Why the trap path was entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// The decoder did not recognise the word
    Unknown { opcode: u32 },
    /// A recognised instruction in an invalid form
    Illegal { opcode: u32 },
    /// A trap instruction whose condition held
    Trap,
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrapKind::Unknown { opcode } => write!(f, "unknown instruction 0x{:08x}", opcode),
            TrapKind::Illegal { opcode } => write!(f, "illegal instruction 0x{:08x}", opcode),
            TrapKind::Trap => write!(f, "trap"),
        }
    }
}

/// Kernel decision for a trap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapAction {
    /// Skip the instruction and continue
    Stub,
    /// End the guest thread
    Terminate,
    /// The kernel redirected `cia` itself
    Handled,
}

/// Kernel services the execution core calls out to
pub trait KernelServices: Send + Sync {
    /// Dispatch syscall `num`; the result goes to r3
    fn syscall(&self, thread: &mut PpuThread, num: u64) -> Result<u64, KernelError>;

    fn trap(&self, thread: &mut PpuThread, addr: u32, kind: TrapKind) -> TrapAction;

    fn time_base(&self) -> u64;
}

/// Kernel with no services, used by tests and the bare runner
#[derive(Debug)]
pub struct NullKernel {
    start: Instant,
}

impl NullKernel {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for NullKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelServices for NullKernel {
    fn syscall(&self, thread: &mut PpuThread, num: u64) -> Result<u64, KernelError> {
        kernel_trace!("thread {} syscall {}", thread.id, num);
        Err(KernelError::UnknownSyscall(num))
    }

    fn trap(&self, _thread: &mut PpuThread, _addr: u32, kind: TrapKind) -> TrapAction {
        match kind {
            TrapKind::Unknown { .. } => TrapAction::Stub,
            TrapKind::Illegal { .. } | TrapKind::Trap => TrapAction::Terminate,
        }
    }

    fn time_base(&self) -> u64 {
        let nanos = self.start.elapsed().as_nanos() as u64;
        nanos / 1000 * (TIME_BASE_FREQUENCY / 1_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_all_symbols() {
        let links = LinkTable::new();
        for (name, entry) in links.symbols() {
            assert_eq!(links.resolve(name), Some(entry));
            assert_eq!(entry.symbol(), name);
        }
        assert_eq!(links.symbols().count(), 9);
        assert_eq!(links.resolve("__missing"), None);
    }

    #[test]
    fn test_null_kernel_policy() {
        let kernel = NullKernel::new();
        let memory = oc_memory::MemoryManager::new();
        let mut thread = PpuThread::new(0, memory);
        assert_eq!(
            kernel.trap(&mut thread, 0, TrapKind::Unknown { opcode: 0 }),
            TrapAction::Stub
        );
        assert_eq!(kernel.trap(&mut thread, 0, TrapKind::Trap), TrapAction::Terminate);
        assert_eq!(
            kernel.syscall(&mut thread, 988),
            Err(KernelError::UnknownSyscall(988))
        );
    }
}
