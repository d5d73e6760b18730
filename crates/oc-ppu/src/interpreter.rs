//! PPU interpreter implementation

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use oc_core::config::{CpuConfig, ReservationGranularity};
use oc_core::error::PpuError;
use oc_memory::MemoryManager;

use crate::decoder::{PpuDecoder, PpuOpcode};
use crate::exec_table::{ExecEntry, ExecTable};
use crate::link::{KernelServices, LinkEntry, TrapAction, TrapKind};
use crate::reservation::{Granularity, ReservationUnit};
use crate::thread::{PpuThread, RETURN_SENTINEL};

/// r3 value for a syscall the kernel could not service
pub const CELL_ENOSYS: u64 = 0x8001_0003;

/// Instructions loaded together by [`PpuInterpreter::run_batch`]
pub const BATCH: usize = 4;

/// Settings-dependent instruction variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecHints {
    /// fmadd rounds once
    pub fused_fma: bool,
    /// dcbz takes the line lock and advances the epoch
    pub accurate_dcbz: bool,
    pub granularity: ReservationGranularity,
}

impl ExecHints {
    pub fn from_config(config: &CpuConfig) -> Self {
        Self {
            fused_fma: config.accurate_fma,
            accurate_dcbz: config.accurate_cache_line_stores,
            granularity: config.reservation_granularity,
        }
    }

    /// Variant used by the single-step precise path
    pub fn precise(self) -> Self {
        Self {
            fused_fma: true,
            ..self
        }
    }
}

impl Default for ExecHints {
    fn default() -> Self {
        Self::from_config(&CpuConfig::default())
    }
}

/// PPU interpreter for instruction execution
pub struct PpuInterpreter {
    memory: Arc<MemoryManager>,
    table: Arc<ExecTable>,
    reservations: Arc<ReservationUnit>,
    kernel: Arc<dyn KernelServices>,
    hints: ExecHints,
    stub_limit: u32,
}

impl PpuInterpreter {
    /// Create a new PPU interpreter
    pub fn new(
        memory: Arc<MemoryManager>,
        table: Arc<ExecTable>,
        reservations: Arc<ReservationUnit>,
        kernel: Arc<dyn KernelServices>,
        config: &CpuConfig,
    ) -> Self {
        Self {
            memory,
            table,
            reservations,
            kernel,
            hints: ExecHints::from_config(config),
            stub_limit: config.stub_unknown_limit,
        }
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn table(&self) -> &Arc<ExecTable> {
        &self.table
    }

    pub fn reservations(&self) -> &ReservationUnit {
        &self.reservations
    }

    /// Another thread wants everyone parked at a checkpoint
    #[inline]
    pub fn suspend_pending(&self) -> bool {
        self.reservations.suspend().is_pending()
    }

    pub fn hints(&self) -> ExecHints {
        self.hints
    }

    /// Execute the instruction at `cia`
    ///
    /// Returns whether the caller should advance `cia` by 4; `false` means
    /// the instruction already redirected it.
    pub fn step(&self, thread: &mut PpuThread, precise: bool) -> Result<bool, PpuError> {
        let pc = thread.pc() as u32;
        let hints = if precise { self.hints.precise() } else { self.hints };
        let word = self.memory.read_be32(pc)?;

        let entry = self.table.get(pc);
        let op = match entry {
            ExecEntry::Interp(op) => op,
            ExecEntry::Fallback => return self.call_link(LinkEntry::Trap, thread, word, &hints),
            ExecEntry::Empty | ExecEntry::Native { .. } => {
                let op = PpuDecoder::decode(word);
                if entry == ExecEntry::Empty && self.table.contains(pc) {
                    if op == PpuOpcode::Unknown {
                        self.table.install_fallback(pc, entry);
                        return self.step(thread, precise);
                    }
                    self.table.install_interp(pc, entry, op);
                }
                op
            }
        };

        self.execute(thread, op, word, &hints)
    }

    /// Execute one instruction and advance past it
    pub fn single(&self, thread: &mut PpuThread, precise: bool) -> Result<(), PpuError> {
        if self.step(thread, precise)? {
            thread.advance_pc();
        }
        Ok(())
    }

    /// Execute up to [`BATCH`] cached instructions, returning how many ran
    ///
    /// The words and their tokens are loaded before anything executes. The
    /// batch ends at the first control transfer, and a state-change request
    /// seen mid-batch leaves the rest to the next loop entry.
    pub fn run_batch(&self, thread: &mut PpuThread) -> Result<usize, PpuError> {
        let base = thread.pc() as u32;
        let mut batch = [(PpuOpcode::Unknown, 0u32); BATCH];
        let mut len = 0;
        for (i, slot) in batch.iter_mut().enumerate() {
            let addr = base.wrapping_add(4 * i as u32);
            let ExecEntry::Interp(op) = self.table.get(addr) else { break };
            let Ok(word) = self.memory.read_be32(addr) else { break };
            *slot = (op, word);
            len += 1;
        }

        if len == 0 {
            self.single(thread, false)?;
            return Ok(1);
        }

        for (i, &(op, word)) in batch[..len].iter().enumerate() {
            if i > 0 && thread.signals.pending() {
                return Ok(i);
            }
            let next = thread.pc().wrapping_add(4);
            if self.execute(thread, op, word, &self.hints)? {
                thread.advance_pc();
            }
            if thread.pc() != next {
                return Ok(i + 1);
            }
        }
        Ok(len)
    }

    /// Interpret until `budget` instructions ran, a request is pending,
    /// the call sentinel is reached, or a native entry is found
    pub fn run_slice(&self, thread: &mut PpuThread, budget: usize, precise: bool) -> Result<usize, PpuError> {
        let mut executed = 0;
        while executed < budget {
            if thread.signals.pending() || thread.pc() == RETURN_SENTINEL {
                break;
            }
            if executed > 0 && matches!(self.table.get(thread.pc() as u32), ExecEntry::Native { .. }) {
                break;
            }
            if precise {
                self.single(thread, true)?;
                executed += 1;
            } else {
                executed += self.run_batch(thread)?;
            }
        }
        Ok(executed)
    }

    /// Execute a decoded instruction
    pub fn execute(
        &self,
        thread: &mut PpuThread,
        op: PpuOpcode,
        word: u32,
        hints: &ExecHints,
    ) -> Result<bool, PpuError> {
        use PpuOpcode::*;

        match op {
            Tdi | Twi | Mulli | Subfic | Cmpli | Cmpi | Addic | AddicRc | Addi | Addis | Ori
            | Oris | Xori | Xoris | AndiRc => self.execute_d_form(thread, op, word, hints),
            Lwz | Lwzu | Lbz | Stw | Stwu | Stb | Lhz | Sth | Lfd | Stfd | Ld | Std => {
                self.execute_load_store(thread, op, word, hints)
            }
            B => self.execute_i_form(thread, word),
            Bc => self.execute_b_form(thread, word),
            Bclr | Bcctr => self.execute_xl_form(thread, op, word),
            Isync => Ok(true),
            Sc => self.call_link(LinkEntry::Syscall, thread, word, hints),
            Rlwimi | Rlwinm | Rlwnm => self.execute_m_form(thread, op, word),
            Tw | Td | Lwarx | Ldarx | Stwcx | Stdcx | And | Or | Xor | Nor | Cmp | Cmpl | Lwzx
            | Stwx | Ldx | Stdx | Mfspr | Mtspr | Mftb | Sync | Eieio | Dcbz => {
                self.execute_x_form(thread, op, word, hints)
            }
            Add | Subf | Neg | Mullw | Mulld | Divw | Divwu => self.execute_xo_form(thread, op, word),
            Fadd | Fsub | Fmul | Fmadd | Fadds | Fmr => self.execute_a_form(thread, op, word, hints),
            Unknown => self.call_link(LinkEntry::Trap, thread, word, hints),
        }
    }

    /// Run a link-table entry on behalf of the instruction `word`
    pub fn call_link(
        &self,
        entry: LinkEntry,
        thread: &mut PpuThread,
        word: u32,
        hints: &ExecHints,
    ) -> Result<bool, PpuError> {
        let (rt, ra, rb, _, _) = PpuDecoder::x_form(word);
        match entry {
            LinkEntry::Trap => {
                let kind = match PpuDecoder::decode(word) {
                    PpuOpcode::Unknown => TrapKind::Unknown { opcode: word },
                    _ => TrapKind::Trap,
                };
                self.raise(thread, kind)
            }
            LinkEntry::Illegal => self.raise(thread, TrapKind::Illegal { opcode: word }),
            LinkEntry::Lwarx | LinkEntry::Ldarx => {
                let size = if entry == LinkEntry::Lwarx { 4 } else { 8 };
                let ea = Self::ea_x(thread, ra, rb);
                let mode = Granularity::resolve(hints.granularity, &self.memory, thread.pc() as u32, size);
                let value = self.reservations.load_reserve(thread, ea, size, mode)?;
                thread.set_gpr(rt as usize, value);
                Ok(true)
            }
            LinkEntry::Stwcx | LinkEntry::Stdcx => {
                let (size, value) = if entry == LinkEntry::Stwcx {
                    (4, thread.gpr(rt as usize) & 0xFFFF_FFFF)
                } else {
                    (8, thread.gpr(rt as usize))
                };
                let ea = Self::ea_x(thread, ra, rb);
                let stored = self.reservations.store_conditional(thread, ea, size, value)?;
                let c = (if stored { 0b0010 } else { 0 }) | thread.get_xer_so() as u32;
                thread.set_cr_field(0, c);
                Ok(true)
            }
            LinkEntry::GetTb => {
                let spr = ((rb as u16) << 5) | ra as u16;
                let tb = self.kernel.time_base();
                let value = if spr == 269 { tb >> 32 } else { tb };
                thread.set_gpr(rt as usize, value);
                Ok(true)
            }
            LinkEntry::Syscall => {
                let num = thread.gpr(11);
                tracing::trace!(target: "kernel", "System call {} at 0x{:08x}", num, thread.pc());
                // The kernel may block; suspension must not wait on it
                let _idle = self.reservations.suspend().idle();
                let result = match self.kernel.syscall(thread, num) {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::warn!(target: "kernel", "syscall {} failed: {}", num, err);
                        CELL_ENOSYS
                    }
                };
                thread.set_gpr(3, result);
                Ok(true)
            }
            LinkEntry::Dcbz => {
                let ea = Self::ea_x(thread, ra, rb);
                self.reservations.clear_line(&self.memory, ea, hints.accurate_dcbz)?;
                Ok(true)
            }
        }
    }

    /// Hand a trap to the kernel and apply its decision
    fn raise(&self, thread: &mut PpuThread, kind: TrapKind) -> Result<bool, PpuError> {
        let pc = thread.pc() as u32;
        match self.kernel.trap(thread, pc, kind) {
            TrapAction::Handled => Ok(false),
            TrapAction::Stub => {
                thread.stubbed_instructions += 1;
                if thread.stubbed_instructions > self.stub_limit {
                    return Err(PpuError::ThreadTerminated {
                        id: thread.id,
                        reason: format!("{} at 0x{:08x} after {} stubs", kind, pc, self.stub_limit),
                    });
                }
                tracing::warn!(target: "ppu", "Stubbing {} at 0x{:08x}", kind, pc);
                Ok(true)
            }
            TrapAction::Terminate => Err(PpuError::ThreadTerminated {
                id: thread.id,
                reason: format!("{} at 0x{:08x}", kind, pc),
            }),
        }
    }

    #[inline]
    fn ea_d(thread: &PpuThread, ra: u8, d: i64) -> u32 {
        let base = if ra == 0 { 0 } else { thread.gpr(ra as usize) };
        base.wrapping_add(d as u64) as u32
    }

    #[inline]
    fn ea_x(thread: &PpuThread, ra: u8, rb: u8) -> u32 {
        let base = if ra == 0 { 0 } else { thread.gpr(ra as usize) };
        base.wrapping_add(thread.gpr(rb as usize)) as u32
    }

    fn trap_condition(to: u8, a: i64, b: i64) -> bool {
        (to & 0x10 != 0 && a < b)
            || (to & 0x08 != 0 && a > b)
            || (to & 0x04 != 0 && a == b)
            || (to & 0x02 != 0 && (a as u64) < (b as u64))
            || (to & 0x01 != 0 && (a as u64) > (b as u64))
    }

    fn compare(thread: &mut PpuThread, bf: u8, less: bool, greater: bool) {
        let c = if less { 0b1000 } else if greater { 0b0100 } else { 0b0010 };
        let c = c | if thread.get_xer_so() { 1 } else { 0 };
        thread.set_cr_field(bf as usize, c);
    }

    /// Execute D-form arithmetic, logical, compare and trap instructions
    fn execute_d_form(
        &self,
        thread: &mut PpuThread,
        op: PpuOpcode,
        word: u32,
        hints: &ExecHints,
    ) -> Result<bool, PpuError> {
        let (rt, ra, d) = PpuDecoder::d_form(word);
        let d = d as i64;
        let uimm = word as u64 & 0xFFFF;
        let a = thread.gpr(ra as usize);

        match op {
            PpuOpcode::Tdi | PpuOpcode::Twi => {
                let lhs = if op == PpuOpcode::Tdi { a as i64 } else { a as i32 as i64 };
                if Self::trap_condition(rt, lhs, d) {
                    return self.call_link(LinkEntry::Trap, thread, word, hints);
                }
            }
            // mulli - Multiply Low Immediate
            PpuOpcode::Mulli => thread.set_gpr(rt as usize, (a as i64).wrapping_mul(d) as u64),
            // subfic - Subtract From Immediate Carrying
            PpuOpcode::Subfic => {
                let imm = d as u64;
                thread.set_gpr(rt as usize, imm.wrapping_sub(a));
                thread.set_xer_ca(imm >= a);
            }
            // cmpli - Compare Logical Immediate (unsigned)
            PpuOpcode::Cmpli => {
                let l = (rt & 1) != 0;
                let a = if l { a } else { a as u32 as u64 };
                Self::compare(thread, (rt >> 2) & 7, a < uimm, a > uimm);
            }
            // cmpi - Compare Immediate (signed)
            PpuOpcode::Cmpi => {
                let l = (rt & 1) != 0;
                let a = if l { a as i64 } else { a as i32 as i64 };
                Self::compare(thread, (rt >> 2) & 7, a < d, a > d);
            }
            // addic / addic. - Add Immediate Carrying
            PpuOpcode::Addic | PpuOpcode::AddicRc => {
                let result = a.wrapping_add(d as u64);
                thread.set_gpr(rt as usize, result);
                thread.set_xer_ca(result < a);
                if op == PpuOpcode::AddicRc {
                    self.update_cr0(thread, result);
                }
            }
            // addi - Add Immediate
            PpuOpcode::Addi => {
                let base = if ra == 0 { 0 } else { a };
                thread.set_gpr(rt as usize, base.wrapping_add(d as u64));
            }
            // addis - Add Immediate Shifted
            PpuOpcode::Addis => {
                let base = if ra == 0 { 0 } else { a };
                thread.set_gpr(rt as usize, base.wrapping_add((d << 16) as u64));
            }
            // ori / oris / xori / xoris: rt holds rS, ra is the target
            PpuOpcode::Ori => thread.set_gpr(ra as usize, thread.gpr(rt as usize) | uimm),
            PpuOpcode::Oris => thread.set_gpr(ra as usize, thread.gpr(rt as usize) | (uimm << 16)),
            PpuOpcode::Xori => thread.set_gpr(ra as usize, thread.gpr(rt as usize) ^ uimm),
            PpuOpcode::Xoris => thread.set_gpr(ra as usize, thread.gpr(rt as usize) ^ (uimm << 16)),
            // andi. - AND Immediate
            PpuOpcode::AndiRc => {
                let value = thread.gpr(rt as usize) & uimm;
                thread.set_gpr(ra as usize, value);
                self.update_cr0(thread, value);
            }
            _ => unreachable!("{:?} is not a D-form ALU instruction", op),
        }
        Ok(true)
    }

    /// Execute D-form and DS-form loads and stores
    fn execute_load_store(
        &self,
        thread: &mut PpuThread,
        op: PpuOpcode,
        word: u32,
        hints: &ExecHints,
    ) -> Result<bool, PpuError> {
        let (rt, ra, d) = match op {
            PpuOpcode::Ld | PpuOpcode::Std => PpuDecoder::ds_form(word),
            _ => PpuDecoder::d_form(word),
        };
        let ea = Self::ea_d(thread, ra, d as i64);
        let rt = rt as usize;

        match op {
            PpuOpcode::Lwz => thread.set_gpr(rt, self.memory.read_be32(ea)? as u64),
            PpuOpcode::Lwzu => {
                if ra == 0 || ra as usize == rt {
                    return self.call_link(LinkEntry::Illegal, thread, word, hints);
                }
                let value = self.memory.read_be32(ea)?;
                thread.set_gpr(rt, value as u64);
                thread.set_gpr(ra as usize, ea as u64);
            }
            PpuOpcode::Lbz => thread.set_gpr(rt, self.memory.read::<u8>(ea)? as u64),
            PpuOpcode::Lhz => thread.set_gpr(rt, self.memory.read_be16(ea)? as u64),
            PpuOpcode::Ld => thread.set_gpr(rt, self.memory.read_be64(ea)?),
            PpuOpcode::Lfd => thread.set_fpr(rt, f64::from_bits(self.memory.read_be64(ea)?)),
            PpuOpcode::Stw => self.memory.write_be32(ea, thread.gpr(rt) as u32)?,
            PpuOpcode::Stwu => {
                if ra == 0 {
                    return self.call_link(LinkEntry::Illegal, thread, word, hints);
                }
                self.memory.write_be32(ea, thread.gpr(rt) as u32)?;
                thread.set_gpr(ra as usize, ea as u64);
            }
            PpuOpcode::Stb => self.memory.write(ea, thread.gpr(rt) as u8)?,
            PpuOpcode::Sth => self.memory.write_be16(ea, thread.gpr(rt) as u16)?,
            PpuOpcode::Std => self.memory.write_be64(ea, thread.gpr(rt))?,
            PpuOpcode::Stfd => self.memory.write_be64(ea, thread.fpr(rt).to_bits())?,
            _ => unreachable!("{:?} is not a load or store", op),
        }
        Ok(true)
    }

    /// Execute I-form instructions (branches)
    fn execute_i_form(&self, thread: &mut PpuThread, word: u32) -> Result<bool, PpuError> {
        let (li, aa, lk) = PpuDecoder::i_form(word);

        let target = if aa {
            li as i64 as u64
        } else {
            (thread.pc() as i64 + li as i64) as u64
        };

        if lk {
            thread.regs.lr = thread.pc() + 4;
        }
        thread.set_pc(target);
        Ok(false)
    }

    fn branch_condition(thread: &mut PpuThread, bo: u8, bi: u8, decrement: bool) -> bool {
        let ctr_ok = if !decrement || (bo & 0x04) != 0 {
            true
        } else {
            thread.regs.ctr = thread.regs.ctr.wrapping_sub(1);
            ((thread.regs.ctr != 0) as u8) ^ ((bo >> 1) & 1) != 0
        };

        let cond_ok = if (bo & 0x10) != 0 {
            true
        } else {
            let cr_bit = (thread.regs.cr >> (31 - bi)) & 1;
            (cr_bit as u8) == ((bo >> 3) & 1)
        };

        ctr_ok && cond_ok
    }

    /// Execute B-form instructions (conditional branches)
    fn execute_b_form(&self, thread: &mut PpuThread, word: u32) -> Result<bool, PpuError> {
        let (bo, bi, bd, aa, lk) = PpuDecoder::b_form(word);

        if !Self::branch_condition(thread, bo, bi, true) {
            return Ok(true);
        }

        let target = if aa {
            bd as i64 as u64
        } else {
            (thread.pc() as i64 + bd as i64) as u64
        };
        if lk {
            thread.regs.lr = thread.pc() + 4;
        }
        thread.set_pc(target);
        Ok(false)
    }

    /// Execute XL-form instructions (branch to LR/CTR)
    fn execute_xl_form(&self, thread: &mut PpuThread, op: PpuOpcode, word: u32) -> Result<bool, PpuError> {
        let bo = ((word >> 21) & 0x1F) as u8;
        let bi = ((word >> 16) & 0x1F) as u8;
        let lk = (word & 1) != 0;

        // bcctr never decrements CTR
        let to_lr = op == PpuOpcode::Bclr;
        if !Self::branch_condition(thread, bo, bi, to_lr) {
            return Ok(true);
        }

        let target = if to_lr { thread.regs.lr } else { thread.regs.ctr } & !3;
        if lk {
            thread.regs.lr = thread.pc() + 4;
        }
        thread.set_pc(target);
        Ok(false)
    }

    /// Execute X-form instructions
    fn execute_x_form(
        &self,
        thread: &mut PpuThread,
        op: PpuOpcode,
        word: u32,
        hints: &ExecHints,
    ) -> Result<bool, PpuError> {
        let (rt, ra, rb, _, rc) = PpuDecoder::x_form(word);
        let s = thread.gpr(rt as usize);
        let b = thread.gpr(rb as usize);

        match op {
            PpuOpcode::Tw | PpuOpcode::Td => {
                let a = thread.gpr(ra as usize);
                let (lhs, rhs) = if op == PpuOpcode::Td {
                    (a as i64, b as i64)
                } else {
                    (a as i32 as i64, b as i32 as i64)
                };
                if Self::trap_condition(rt, lhs, rhs) {
                    return self.call_link(LinkEntry::Trap, thread, word, hints);
                }
            }
            PpuOpcode::Lwarx => return self.call_link(LinkEntry::Lwarx, thread, word, hints),
            PpuOpcode::Ldarx => return self.call_link(LinkEntry::Ldarx, thread, word, hints),
            PpuOpcode::Stwcx => return self.call_link(LinkEntry::Stwcx, thread, word, hints),
            PpuOpcode::Stdcx => return self.call_link(LinkEntry::Stdcx, thread, word, hints),
            PpuOpcode::Mftb => return self.call_link(LinkEntry::GetTb, thread, word, hints),
            PpuOpcode::Dcbz => return self.call_link(LinkEntry::Dcbz, thread, word, hints),
            PpuOpcode::And | PpuOpcode::Or | PpuOpcode::Xor | PpuOpcode::Nor => {
                let value = match op {
                    PpuOpcode::And => s & b,
                    PpuOpcode::Or => s | b,
                    PpuOpcode::Xor => s ^ b,
                    _ => !(s | b),
                };
                thread.set_gpr(ra as usize, value);
                if rc {
                    self.update_cr0(thread, value);
                }
            }
            // cmp - Compare (signed)
            PpuOpcode::Cmp => {
                let l = (rt & 1) != 0;
                let a = thread.gpr(ra as usize);
                let (a, b) = if l { (a as i64, b as i64) } else { (a as i32 as i64, b as i32 as i64) };
                Self::compare(thread, (rt >> 2) & 7, a < b, a > b);
            }
            // cmpl - Compare Logical (unsigned)
            PpuOpcode::Cmpl => {
                let l = (rt & 1) != 0;
                let a = thread.gpr(ra as usize);
                let (a, b) = if l { (a, b) } else { (a as u32 as u64, b as u32 as u64) };
                Self::compare(thread, (rt >> 2) & 7, a < b, a > b);
            }
            PpuOpcode::Lwzx => {
                let value = self.memory.read_be32(Self::ea_x(thread, ra, rb))?;
                thread.set_gpr(rt as usize, value as u64);
            }
            PpuOpcode::Ldx => {
                let value = self.memory.read_be64(Self::ea_x(thread, ra, rb))?;
                thread.set_gpr(rt as usize, value);
            }
            PpuOpcode::Stwx => self.memory.write_be32(Self::ea_x(thread, ra, rb), s as u32)?,
            PpuOpcode::Stdx => self.memory.write_be64(Self::ea_x(thread, ra, rb), s)?,
            // mfspr - Move From Special Purpose Register
            PpuOpcode::Mfspr => {
                let spr = ((rb as u16) << 5) | (ra as u16);
                let value = match spr {
                    1 => thread.regs.xer,
                    8 => thread.regs.lr,
                    9 => thread.regs.ctr,
                    _ => {
                        tracing::warn!(target: "ppu", "Unimplemented mfspr SPR {} at 0x{:08x}", spr, thread.pc());
                        0
                    }
                };
                thread.set_gpr(rt as usize, value);
            }
            // mtspr - Move To Special Purpose Register
            PpuOpcode::Mtspr => {
                let spr = ((rb as u16) << 5) | (ra as u16);
                match spr {
                    1 => thread.regs.xer = s,
                    8 => thread.regs.lr = s,
                    9 => thread.regs.ctr = s,
                    _ => {
                        tracing::warn!(target: "ppu", "Unimplemented mtspr SPR {} at 0x{:08x}", spr, thread.pc());
                    }
                }
            }
            PpuOpcode::Sync | PpuOpcode::Eieio => fence(Ordering::SeqCst),
            _ => unreachable!("{:?} is not an X-form instruction", op),
        }
        Ok(true)
    }

    /// Execute XO-form instructions (integer arithmetic)
    fn execute_xo_form(&self, thread: &mut PpuThread, op: PpuOpcode, word: u32) -> Result<bool, PpuError> {
        let (rt, ra, rb, oe, _, rc) = PpuDecoder::xo_form(word);
        let a = thread.gpr(ra as usize);
        let b = thread.gpr(rb as usize);

        let (result, overflow) = match op {
            PpuOpcode::Add => {
                let (_, overflow) = (a as i64).overflowing_add(b as i64);
                (a.wrapping_add(b), overflow)
            }
            // subf - Subtract From
            PpuOpcode::Subf => {
                let (_, overflow) = (b as i64).overflowing_sub(a as i64);
                (b.wrapping_sub(a), overflow)
            }
            PpuOpcode::Neg => ((a as i64).wrapping_neg() as u64, a == 1 << 63),
            // mullw - Multiply Low Word
            PpuOpcode::Mullw => {
                let product = a as i32 as i64 * b as i32 as i64;
                (product as u64, product != product as i32 as i64)
            }
            PpuOpcode::Mulld => {
                let (product, overflow) = (a as i64).overflowing_mul(b as i64);
                (product as u64, overflow)
            }
            // divw - Divide Word
            PpuOpcode::Divw => {
                let (a, b) = (a as i32, b as i32);
                if b == 0 || (a == i32::MIN && b == -1) {
                    (0, true)
                } else {
                    ((a / b) as i64 as u64, false)
                }
            }
            PpuOpcode::Divwu => {
                let (a, b) = (a as u32, b as u32);
                match a.checked_div(b) {
                    Some(q) => (q as u64, false),
                    None => (0, true),
                }
            }
            _ => unreachable!("{:?} is not an XO-form instruction", op),
        };

        thread.set_gpr(rt as usize, result);
        if oe {
            thread.set_xer_ov(overflow);
            if overflow {
                thread.set_xer_so(true);
            }
        }
        if rc {
            self.update_cr0(thread, result);
        }
        Ok(true)
    }

    /// Execute M-form instructions (rotate)
    fn execute_m_form(&self, thread: &mut PpuThread, op: PpuOpcode, word: u32) -> Result<bool, PpuError> {
        let (rs, ra, rb_sh, mb, me, rc) = PpuDecoder::m_form(word);
        let value = thread.gpr(rs as usize) as u32;
        let mask = Self::generate_mask_32(mb, me);

        let result = match op {
            // rlwinm - Rotate Left Word Immediate then AND with Mask
            PpuOpcode::Rlwinm => (value.rotate_left(rb_sh as u32) & mask) as u64,
            // rlwimi - Rotate Left Word Immediate then Mask Insert
            PpuOpcode::Rlwimi => {
                let rotated = value.rotate_left(rb_sh as u32);
                ((rotated & mask) | (thread.gpr(ra as usize) as u32 & !mask)) as u64
            }
            // rlwnm - Rotate Left Word then AND with Mask
            PpuOpcode::Rlwnm => {
                let sh = (thread.gpr(rb_sh as usize) & 0x1F) as u32;
                (value.rotate_left(sh) & mask) as u64
            }
            _ => unreachable!("{:?} is not an M-form instruction", op),
        };

        thread.set_gpr(ra as usize, result);
        if rc {
            self.update_cr0(thread, result);
        }
        Ok(true)
    }

    /// Execute A-form floating-point instructions
    fn execute_a_form(
        &self,
        thread: &mut PpuThread,
        op: PpuOpcode,
        word: u32,
        hints: &ExecHints,
    ) -> Result<bool, PpuError> {
        let (frt, fra, frb, frc, _) = PpuDecoder::a_form(word);
        let a = thread.fpr(fra as usize);
        let b = thread.fpr(frb as usize);
        let c = thread.fpr(frc as usize);

        let result = match op {
            PpuOpcode::Fadd => a + b,
            PpuOpcode::Fsub => a - b,
            PpuOpcode::Fmul => a * c,
            PpuOpcode::Fmadd if hints.fused_fma => a.mul_add(c, b),
            PpuOpcode::Fmadd => a * c + b,
            PpuOpcode::Fadds => (a + b) as f32 as f64,
            PpuOpcode::Fmr => b,
            _ => unreachable!("{:?} is not a floating-point instruction", op),
        };

        thread.set_fpr(frt as usize, result);
        Ok(true)
    }

    /// Update CR0 based on result (for Rc=1 instructions)
    fn update_cr0(&self, thread: &mut PpuThread, value: u64) {
        let value = value as i64;
        Self::compare(thread, 0, value < 0, value > 0);
    }

    /// Generate 32-bit mask for rotate instructions
    fn generate_mask_32(mb: u8, me: u8) -> u32 {
        let mb = mb as u32;
        let me = me as u32;
        if mb <= me {
            (u32::MAX >> mb) & (u32::MAX << (31 - me))
        } else {
            (u32::MAX >> mb) | (u32::MAX << (31 - me))
        }
    }
}
