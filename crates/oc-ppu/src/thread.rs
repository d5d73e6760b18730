//! PPU thread state

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use oc_memory::MemoryManager;
use parking_lot::{Condvar, Mutex};

use crate::gateway::GatewayFrame;
use crate::reservation::Granularity;

/// Offset of the initial stack pointer below the top of the stack
pub const STACK_START_OFFSET: u32 = 0x70;

/// Link register value marking the return of a host-initiated call
pub const RETURN_SENTINEL: u64 = 0xFFFF_FFF0;

/// PPU register set
#[derive(Debug, Clone)]
pub struct PpuRegisters {
    /// General Purpose Registers (64-bit)
    pub gpr: [u64; 32],
    /// Floating Point Registers (64-bit)
    pub fpr: [f64; 32],
    /// Vector Registers (128-bit, stored as 4 x u32)
    pub vr: [[u32; 4]; 32],
    /// Condition Register
    pub cr: u32,
    /// Link Register
    pub lr: u64,
    /// Count Register
    pub ctr: u64,
    /// Fixed-Point Exception Register
    pub xer: u64,
    /// FP Status and Control Register
    pub fpscr: u64,
    /// Vector Status and Control Register
    pub vscr: u32,
    /// Program Counter / Current Instruction Address
    pub cia: u64,
}

impl Default for PpuRegisters {
    fn default() -> Self {
        Self {
            gpr: [0; 32],
            fpr: [0.0; 32],
            vr: [[0; 4]; 32],
            cr: 0,
            lr: 0,
            ctr: 0,
            xer: 0,
            fpscr: 0,
            vscr: 0,
            cia: 0,
        }
    }
}

/// PPU thread lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpuThreadState {
    /// Thread is stopped
    Stopped,
    /// Thread is running
    Running,
    /// Thread is waiting (blocked)
    Waiting,
    /// Thread is suspended
    Suspended,
}

bitflags! {
    /// State-change requests observed at suspension points
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ThreadState: u32 {
        /// Leave the execution loop for good
        const STOP      = 1 << 0;
        /// Park until resumed
        const SUSPEND   = 1 << 1;
        /// Execute a single instruction, then pause
        const DBG_STEP  = 1 << 2;
        /// Parked by the debugger
        const DBG_PAUSE = 1 << 3;
        /// Unwind to the gateway call site
        const RET       = 1 << 4;
        /// Sleep until the next command arrives
        const SLEEP     = 1 << 5;
        /// A command is waiting in the inbox
        const CMD       = 1 << 6;

        /// Requests that park the thread in place
        const PARKED = Self::SUSPEND.bits() | Self::DBG_PAUSE.bits();
        /// Requests that must interrupt guest execution
        const INTERRUPT = Self::STOP.bits() | Self::PARKED.bits() | Self::DBG_STEP.bits() | Self::RET.bits();
    }
}

/// Shared state word of a guest thread
///
/// This is the cancellation token other host threads use to request a stop,
/// suspension or single step. The owning thread checks it at batch starts and
/// after every call into native code.
#[derive(Debug, Default)]
pub struct ThreadSignals {
    state: AtomicU32,
    lock: Mutex<()>,
    cond: Condvar,
}

impl ThreadSignals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline]
    pub fn load(&self) -> ThreadState {
        ThreadState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    /// A request that interrupts execution is pending
    #[inline]
    pub fn pending(&self) -> bool {
        self.state.load(Ordering::Acquire) & ThreadState::INTERRUPT.bits() != 0
    }

    pub fn set(&self, flags: ThreadState) {
        self.state.fetch_or(flags.bits(), Ordering::AcqRel);
        self.notify();
    }

    pub fn clear(&self, flags: ThreadState) {
        self.state.fetch_and(!flags.bits(), Ordering::AcqRel);
        self.notify();
    }

    /// Clear `flags`, returning whether any of them were set
    pub fn take(&self, flags: ThreadState) -> bool {
        let old = self.state.fetch_and(!flags.bits(), Ordering::AcqRel);
        self.notify();
        old & flags.bits() != 0
    }

    pub fn request_stop(&self) {
        self.set(ThreadState::STOP);
    }

    pub fn is_stopped(&self) -> bool {
        self.load().contains(ThreadState::STOP)
    }

    /// Block while the thread is parked, unless a stop is requested
    pub fn wait_while_parked(&self) {
        let mut guard = self.lock.lock();
        loop {
            let state = self.load();
            if state.contains(ThreadState::STOP) || !state.intersects(ThreadState::PARKED) {
                return;
            }
            self.cond.wait(&mut guard);
        }
    }

    fn notify(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

/// Record of the last failed conditional store
#[derive(Debug, Clone, Copy)]
pub struct FailedReservation {
    /// Line address
    pub line: u32,
    /// Epoch observed when the store failed
    pub rtime: u64,
    pub at: Instant,
}

/// Reservation state of a thread
#[derive(Debug, Clone)]
pub struct ReservationSlot {
    /// Reserved address, 0 when no reservation is held
    pub raddr: u32,
    /// Epoch recorded by the load-reserve
    pub rtime: u64,
    /// Shadow copy of the reserved line
    pub rdata: [u8; 128],
    pub mode: Granularity,
    pub last_fail: Option<FailedReservation>,
}

impl Default for ReservationSlot {
    fn default() -> Self {
        Self {
            raddr: 0,
            rtime: 0,
            rdata: [0; 128],
            mode: Granularity::Line,
            last_fail: None,
        }
    }
}

/// PPU thread
pub struct PpuThread {
    /// Thread ID
    pub id: u32,
    /// Thread name
    pub name: String,
    /// Register state
    pub regs: PpuRegisters,
    /// Thread state
    pub state: PpuThreadState,
    /// State-change requests from other host threads
    pub signals: Arc<ThreadSignals>,
    /// Reservation slot for lwarx/stwcx.
    pub reservation: ReservationSlot,
    /// Memory manager reference
    memory: Arc<MemoryManager>,
    /// Stack address
    pub stack_addr: u32,
    /// Stack size
    pub stack_size: u32,
    /// Priority
    pub priority: u32,
    /// Unknown instructions skipped so far
    pub stubbed_instructions: u32,
    /// Active gateway frames, innermost last
    pub gateway: Vec<GatewayFrame>,
}

impl PpuThread {
    /// Create a new PPU thread
    pub fn new(id: u32, memory: Arc<MemoryManager>) -> Self {
        Self {
            id,
            name: format!("PPU Thread {}", id),
            regs: PpuRegisters::default(),
            state: PpuThreadState::Stopped,
            signals: ThreadSignals::new(),
            reservation: ReservationSlot::default(),
            memory,
            stack_addr: 0,
            stack_size: 0,
            priority: 0,
            stubbed_instructions: 0,
            gateway: Vec::new(),
        }
    }

    /// Attach a stack and point r1 at it
    pub fn with_stack(mut self, addr: u32, size: u32) -> Self {
        self.stack_addr = addr;
        self.stack_size = size;
        self.reset_stack();
        self
    }

    /// Get the current instruction address
    pub fn pc(&self) -> u64 {
        self.regs.cia
    }

    /// Set the program counter
    pub fn set_pc(&mut self, addr: u64) {
        self.regs.cia = addr;
    }

    /// Advance the program counter by 4 bytes
    pub fn advance_pc(&mut self) {
        self.regs.cia += 4;
    }

    /// Read a GPR
    #[inline]
    pub fn gpr(&self, index: usize) -> u64 {
        self.regs.gpr[index]
    }

    /// Write a GPR
    #[inline]
    pub fn set_gpr(&mut self, index: usize, value: u64) {
        self.regs.gpr[index] = value;
    }

    /// Read an FPR
    #[inline]
    pub fn fpr(&self, index: usize) -> f64 {
        self.regs.fpr[index]
    }

    /// Write an FPR
    #[inline]
    pub fn set_fpr(&mut self, index: usize, value: f64) {
        self.regs.fpr[index] = value;
    }

    /// Get a reference to the memory manager
    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Start the thread
    pub fn start(&mut self) {
        self.state = PpuThreadState::Running;
        self.signals.clear(ThreadState::STOP);
    }

    /// Stop the thread
    pub fn stop(&mut self) {
        self.state = PpuThreadState::Stopped;
        self.signals.request_stop();
    }

    /// Check if thread is running
    pub fn is_running(&self) -> bool {
        self.state == PpuThreadState::Running && !self.signals.is_stopped()
    }

    /// Reset registers and reservation, keeping the stack
    pub fn initialize(&mut self) {
        self.regs = PpuRegisters::default();
        self.reservation = ReservationSlot::default();
        self.stubbed_instructions = 0;
        self.reset_stack();
    }

    /// Point r1 at the top of the stack
    pub fn reset_stack(&mut self) {
        if self.stack_size != 0 {
            let top = self.stack_addr as u64 + self.stack_size as u64;
            self.regs.gpr[1] = top - STACK_START_OFFSET as u64;
        }
    }

    /// Get CR field value (0-7)
    pub fn get_cr_field(&self, field: usize) -> u32 {
        (self.regs.cr >> (28 - field * 4)) & 0xF
    }

    /// Set CR field value (0-7)
    pub fn set_cr_field(&mut self, field: usize, value: u32) {
        let shift = 28 - field * 4;
        self.regs.cr = (self.regs.cr & !(0xF << shift)) | ((value & 0xF) << shift);
    }

    /// Get XER CA (Carry) bit
    pub fn get_xer_ca(&self) -> bool {
        (self.regs.xer & 0x20000000) != 0
    }

    /// Set XER CA (Carry) bit
    pub fn set_xer_ca(&mut self, value: bool) {
        if value {
            self.regs.xer |= 0x20000000;
        } else {
            self.regs.xer &= !0x20000000;
        }
    }

    /// Get XER OV (Overflow) bit
    pub fn get_xer_ov(&self) -> bool {
        (self.regs.xer & 0x40000000) != 0
    }

    /// Set XER OV (Overflow) bit
    pub fn set_xer_ov(&mut self, value: bool) {
        if value {
            self.regs.xer |= 0x40000000;
        } else {
            self.regs.xer &= !0x40000000;
        }
    }

    /// Get XER SO (Summary Overflow) bit
    pub fn get_xer_so(&self) -> bool {
        (self.regs.xer & 0x80000000) != 0
    }

    /// Set XER SO (Summary Overflow) bit
    pub fn set_xer_so(&mut self, value: bool) {
        if value {
            self.regs.xer |= 0x80000000;
        } else {
            self.regs.xer &= !0x80000000;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_memory() -> Arc<MemoryManager> {
        MemoryManager::new()
    }

    #[test]
    fn test_ppu_thread_creation() {
        let mem = create_test_memory();
        let thread = PpuThread::new(0, mem);

        assert_eq!(thread.id, 0);
        assert_eq!(thread.state, PpuThreadState::Stopped);
        assert_eq!(thread.pc(), 0);
        assert_eq!(thread.reservation.raddr, 0);
    }

    #[test]
    fn test_pc_operations() {
        let mem = create_test_memory();
        let mut thread = PpuThread::new(0, mem);

        thread.set_pc(0x10000);
        assert_eq!(thread.pc(), 0x10000);

        thread.advance_pc();
        assert_eq!(thread.pc(), 0x10004);
    }

    #[test]
    fn test_cr_fields() {
        let mem = create_test_memory();
        let mut thread = PpuThread::new(0, mem);

        thread.set_cr_field(0, 0b1010);
        assert_eq!(thread.get_cr_field(0), 0b1010);

        thread.set_cr_field(7, 0b0101);
        assert_eq!(thread.get_cr_field(7), 0b0101);
    }

    #[test]
    fn test_stack_reset() {
        let mem = create_test_memory();
        let mut thread = PpuThread::new(1, mem).with_stack(0xD000_0000, 0x1_0000);
        assert_eq!(thread.gpr(1), 0xD000_FF90);

        thread.set_gpr(1, 0);
        thread.set_gpr(3, 7);
        thread.initialize();
        assert_eq!(thread.gpr(1), 0xD000_FF90);
        assert_eq!(thread.gpr(3), 0);
    }

    #[test]
    fn test_signals_take() {
        let signals = ThreadSignals::new();
        assert!(!signals.pending());

        signals.set(ThreadState::RET | ThreadState::SUSPEND);
        assert!(signals.take(ThreadState::RET));
        assert!(!signals.take(ThreadState::RET));
        assert_eq!(signals.load(), ThreadState::SUSPEND);
    }

    #[test]
    fn test_wait_while_parked_wakes_on_resume() {
        let signals = ThreadSignals::new();
        signals.set(ThreadState::SUSPEND);

        let waiter = {
            let signals = signals.clone();
            std::thread::spawn(move || signals.wait_while_parked())
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        signals.clear(ThreadState::SUSPEND);
        waiter.join().unwrap();
    }
}
