//! Load-reserve / store-conditional emulation
//!
//! A load-reserve records the line epoch and a shadow copy of the line. A
//! store-conditional commits only if the epoch is unchanged and the watched
//! bytes still match the shadow. Commits escalate through three strategies:
//!
//! 1. [`TransactionalPath`]: a short transaction through an [`HtmBackend`],
//!    retried with backoff on abort.
//! 2. [`LockPath`]: take the lock bit of the line epoch, recheck, write.
//! 3. [`SuspendPath`]: stop every other guest thread, then commit.
//!
//! Every store-conditional clears the reservation, whatever its outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use oc_core::config::{CpuConfig, ReservationGranularity};
use oc_core::error::{MemoryError, PpuError};
use oc_core::res_trace;
use oc_memory::constants::{LINE_MASK, RESERVATION_GRANULARITY};
use oc_memory::{MemoryManager, PageFlags, Region, Reservation};
use serde::{Deserialize, Serialize};

use crate::decoder::{PpuDecoder, PpuOpcode};
use crate::suspend::GlobalSuspend;
use crate::thread::{FailedReservation, PpuThread};

const LINE: usize = RESERVATION_GRANULARITY as usize;

/// Spin iterations the lightweight lock waits for a busy line
const LOCK_SPIN_LIMIT: u32 = 1 << 12;

/// Size of the region a reservation watches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    /// The aligned 8-byte word holding the reserved address
    Word,
    /// The whole 128-byte line
    #[default]
    Line,
}

impl Granularity {
    /// Instructions searched for the matching store-conditional
    pub const LOOKAHEAD: usize = 16;

    /// Pick a granularity from the instructions following a load-reserve
    ///
    /// Word mode is only chosen when a store-conditional of the same width
    /// appears before any branch; everything else watches the full line.
    pub fn scan(words: &[u32], width: u32) -> Self {
        for &word in words.iter().take(Self::LOOKAHEAD) {
            match PpuDecoder::decode(word) {
                PpuOpcode::Stwcx => return if width == 4 { Self::Word } else { Self::Line },
                PpuOpcode::Stdcx => return if width == 8 { Self::Word } else { Self::Line },
                op if op.is_branch() => return Self::Line,
                _ => {}
            }
        }
        Self::Line
    }

    /// Apply the configured policy to the load-reserve at `addr`
    pub fn resolve(
        policy: ReservationGranularity,
        memory: &MemoryManager,
        addr: u32,
        width: u32,
    ) -> Self {
        match policy {
            ReservationGranularity::Word => Self::Word,
            ReservationGranularity::Line => Self::Line,
            ReservationGranularity::Auto => {
                let words: Vec<u32> = (1..=Self::LOOKAHEAD as u32)
                    .map_while(|i| memory.read_be32(addr.wrapping_add(i * 4)).ok())
                    .collect();
                Self::scan(&words, width)
            }
        }
    }
}

/// Commit strategies, lightest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStrategy {
    Transactional,
    LightweightLock,
    GlobalSuspend,
}

/// Outcome of one commit attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    /// Value written, epoch advanced
    Success,
    /// Reservation was lost
    Failure,
    /// The strategy could not decide; try the next one
    Abort,
}

/// A pending conditional store
pub struct CommitRequest<'a> {
    pub region: &'a Region,
    pub addr: u32,
    pub size: u32,
    pub value: u64,
    pub rtime: u64,
    pub rdata: &'a [u8; 128],
    pub mode: Granularity,
}

impl CommitRequest<'_> {
    #[inline]
    fn line(&self) -> &Reservation {
        self.region.reservation(self.addr)
    }

    /// Compare the watched bytes against the shadow copy
    fn verify_bytes(&self) -> bool {
        let mut live = [0u8; 128];
        self.region.read_line(self.addr, &mut live);
        match self.mode {
            Granularity::Line => live == *self.rdata,
            Granularity::Word => {
                let off = (self.addr as usize & (LINE - 1)) & !7;
                live[off..off + 8] == self.rdata[off..off + 8]
            }
        }
    }

    /// Verify and write while the caller holds the line exclusively
    fn commit_locked(&self, epoch: u64) -> bool {
        if epoch != self.rtime || !self.verify_bytes() {
            return false;
        }
        self.region.store(self.addr, self.size, self.value);
        true
    }
}

/// One store-conditional strategy
pub trait CommitPath: Send + Sync {
    fn strategy(&self) -> CommitStrategy;
    fn try_commit(&self, request: &CommitRequest<'_>) -> CommitResult;
}

/// Hardware transactional memory interface
///
/// `run` executes `body` atomically with respect to every other writer of
/// the line, passing it the epoch seen at transaction start. The body
/// returns whether it wrote. `None` means the transaction aborted.
pub trait HtmBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, line: &Reservation, body: &mut dyn FnMut(u64) -> bool) -> Option<bool>;
}

/// Transaction built from a non-blocking try-lock of the line
///
/// Any contention on the line aborts instead of waiting.
#[derive(Debug, Default)]
pub struct SoftwareHtm;

impl HtmBackend for SoftwareHtm {
    fn name(&self) -> &'static str {
        "software"
    }

    fn run(&self, line: &Reservation, body: &mut dyn FnMut(u64) -> bool) -> Option<bool> {
        let epoch = line.raw();
        if epoch & Reservation::LOCK_BIT != 0 || !line.try_lock(epoch) {
            return None;
        }
        let wrote = body(epoch);
        if wrote {
            line.unlock_and_increment();
        } else {
            line.unlock();
        }
        Some(wrote)
    }
}

/// Transactional strategy with bounded retries
pub struct TransactionalPath {
    htm: Arc<dyn HtmBackend>,
    retries: u32,
}

impl TransactionalPath {
    pub fn new(htm: Arc<dyn HtmBackend>, retries: u32) -> Self {
        Self { htm, retries }
    }
}

impl CommitPath for TransactionalPath {
    fn strategy(&self) -> CommitStrategy {
        CommitStrategy::Transactional
    }

    fn try_commit(&self, request: &CommitRequest<'_>) -> CommitResult {
        let line = request.line();
        for attempt in 0..=self.retries {
            // A changed epoch cannot succeed; skip the transaction.
            if line.acquire() != request.rtime {
                return CommitResult::Failure;
            }
            match self.htm.run(line, &mut |epoch| request.commit_locked(epoch)) {
                Some(true) => return CommitResult::Success,
                Some(false) => return CommitResult::Failure,
                None => {
                    for _ in 0..(1u32 << attempt.min(10)) {
                        std::hint::spin_loop();
                    }
                }
            }
        }
        res_trace!(
            "{} transaction aborted {} times at 0x{:08x}",
            self.htm.name(),
            self.retries + 1,
            request.addr
        );
        CommitResult::Abort
    }
}

/// Lock-bit strategy; aborts only if the line stays busy
#[derive(Debug, Default)]
pub struct LockPath;

impl CommitPath for LockPath {
    fn strategy(&self) -> CommitStrategy {
        CommitStrategy::LightweightLock
    }

    fn try_commit(&self, request: &CommitRequest<'_>) -> CommitResult {
        let line = request.line();
        for _ in 0..LOCK_SPIN_LIMIT {
            let raw = line.raw();
            if raw & Reservation::LOCK_BIT != 0 {
                std::hint::spin_loop();
                continue;
            }
            if raw != request.rtime {
                return CommitResult::Failure;
            }
            if !line.try_lock(raw) {
                continue;
            }
            return if request.commit_locked(raw) {
                line.unlock_and_increment();
                CommitResult::Success
            } else {
                line.unlock();
                CommitResult::Failure
            };
        }
        CommitResult::Abort
    }
}

/// Suspend-all strategy; always decides
pub struct SuspendPath {
    suspend: Arc<GlobalSuspend>,
}

impl SuspendPath {
    pub fn new(suspend: Arc<GlobalSuspend>) -> Self {
        Self { suspend }
    }
}

impl CommitPath for SuspendPath {
    fn strategy(&self) -> CommitStrategy {
        CommitStrategy::GlobalSuspend
    }

    fn try_commit(&self, request: &CommitRequest<'_>) -> CommitResult {
        let _suspended = self.suspend.suspend_others();
        let line = request.line();
        if !line.lock_if(request.rtime) {
            return CommitResult::Failure;
        }
        if request.commit_locked(request.rtime) {
            line.unlock_and_increment();
            CommitResult::Success
        } else {
            line.unlock();
            CommitResult::Failure
        }
    }
}

/// Commit counters per strategy
#[derive(Debug, Default)]
struct Counters {
    transactional: AtomicU64,
    lightweight: AtomicU64,
    global: AtomicU64,
    failures: AtomicU64,
}

/// Snapshot of the commit counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub transactional: u64,
    pub lightweight: u64,
    pub global: u64,
    pub failures: u64,
}

/// Reservation protocol shared by all guest threads
pub struct ReservationUnit {
    paths: Vec<Box<dyn CommitPath>>,
    suspend: Arc<GlobalSuspend>,
    fail_window: Duration,
    counters: Counters,
}

impl ReservationUnit {
    /// Build the standard strategy ladder with the software transaction
    pub fn new(config: &CpuConfig, suspend: Arc<GlobalSuspend>) -> Self {
        Self::with_htm(config, suspend, Arc::new(SoftwareHtm))
    }

    /// Build the standard strategy ladder around a specific transaction backend
    pub fn with_htm(config: &CpuConfig, suspend: Arc<GlobalSuspend>, htm: Arc<dyn HtmBackend>) -> Self {
        let paths: Vec<Box<dyn CommitPath>> = vec![
            Box::new(TransactionalPath::new(htm, config.htm_retries)),
            Box::new(LockPath),
            Box::new(SuspendPath::new(suspend.clone())),
        ];
        Self::with_paths(paths, suspend, Duration::from_micros(config.reservation_fail_window_us))
    }

    /// Build from an explicit strategy list, tried in order
    pub fn with_paths(paths: Vec<Box<dyn CommitPath>>, suspend: Arc<GlobalSuspend>, fail_window: Duration) -> Self {
        Self {
            paths,
            suspend,
            fail_window,
            counters: Counters::default(),
        }
    }

    /// Suspension controller the guest threads answer to
    pub fn suspend(&self) -> &GlobalSuspend {
        &self.suspend
    }

    pub fn stats(&self) -> CommitStats {
        CommitStats {
            transactional: self.counters.transactional.load(Ordering::Relaxed),
            lightweight: self.counters.lightweight.load(Ordering::Relaxed),
            global: self.counters.global.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    fn check(addr: u32, size: u32) -> Result<(), PpuError> {
        if !matches!(size, 4 | 8) || addr % size != 0 {
            return Err(PpuError::UnalignedReservation { addr, size });
        }
        Ok(())
    }

    fn region(memory: &MemoryManager, addr: u32, size: u32) -> Result<Arc<Region>, PpuError> {
        memory.region(addr, size).map_err(|err| match err {
            MemoryError::Unmapped { .. } | MemoryError::OutOfRange { .. } => {
                PpuError::ReservationOutOfRange { addr }
            }
            other => other.into(),
        })
    }

    /// Copy a consistent snapshot of the line, returning its epoch
    fn snapshot(region: &Region, addr: u32, out: &mut [u8; 128]) -> u64 {
        let line = region.reservation(addr);
        loop {
            let epoch = line.acquire_unlocked();
            region.read_line(addr, out);
            if line.raw() == epoch {
                return epoch;
            }
        }
    }

    /// Load-reserve of `size` bytes; returns the loaded value
    pub fn load_reserve(
        &self,
        thread: &mut PpuThread,
        addr: u32,
        size: u32,
        mode: Granularity,
    ) -> Result<u64, PpuError> {
        Self::check(addr, size)?;
        let region = Self::region(thread.memory(), addr, size)?;
        let line_addr = addr & LINE_MASK;
        let slot = &mut thread.reservation;

        let reuse = slot.last_fail.filter(|fail| {
            fail.line == line_addr
                && fail.at.elapsed() < self.fail_window
                && region.reservation(addr).raw() == fail.rtime
        });
        slot.rtime = match reuse {
            Some(fail) => {
                res_trace!("reusing failed snapshot of line 0x{:08x}", line_addr);
                fail.rtime
            }
            None => {
                slot.last_fail = None;
                Self::snapshot(&region, addr, &mut slot.rdata)
            }
        };
        slot.raddr = addr;
        slot.mode = mode;

        let off = (addr - line_addr) as usize;
        let value = slot.rdata[off..off + size as usize]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64);
        Ok(value)
    }

    /// Store-conditional of `size` bytes; returns whether it committed
    pub fn store_conditional(
        &self,
        thread: &mut PpuThread,
        addr: u32,
        size: u32,
        value: u64,
    ) -> Result<bool, PpuError> {
        let raddr = std::mem::take(&mut thread.reservation.raddr);
        Self::check(addr, size)?;
        if raddr == 0 {
            return Ok(false);
        }

        let slot = &thread.reservation;
        let same_line = raddr & LINE_MASK == addr & LINE_MASK;
        if raddr != addr && !(slot.mode == Granularity::Line && same_line) {
            res_trace!("store-conditional 0x{:08x} outside reservation 0x{:08x}", addr, raddr);
            return Ok(false);
        }

        let region = Self::region(thread.memory(), addr, size)?;
        if !region.flags().contains(PageFlags::WRITE) {
            return Err(MemoryError::ReadOnly { addr }.into());
        }
        let request = CommitRequest {
            region: &region,
            addr,
            size,
            value,
            rtime: slot.rtime,
            rdata: &slot.rdata,
            mode: slot.mode,
        };

        let mut result = CommitResult::Abort;
        for path in &self.paths {
            result = path.try_commit(&request);
            if result != CommitResult::Abort {
                if result == CommitResult::Success {
                    self.count_success(path.strategy());
                }
                break;
            }
            tracing::debug!(
                target: "reservation",
                "{:?} aborted at 0x{:08x}, escalating",
                path.strategy(),
                addr
            );
        }

        if result == CommitResult::Success {
            thread.reservation.last_fail = None;
            return Ok(true);
        }

        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        let slot = &mut thread.reservation;
        let epoch = Self::snapshot(&region, addr, &mut slot.rdata);
        slot.last_fail = Some(FailedReservation {
            line: addr & LINE_MASK,
            rtime: epoch,
            at: Instant::now(),
        });
        Ok(false)
    }

    fn count_success(&self, strategy: CommitStrategy) {
        let counter = match strategy {
            CommitStrategy::Transactional => &self.counters.transactional,
            CommitStrategy::LightweightLock => &self.counters.lightweight,
            CommitStrategy::GlobalSuspend => &self.counters.global,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// dcbz: zero the line holding `addr`
    ///
    /// The accurate form zeroes under the line lock and advances the epoch,
    /// so reservations on the line are lost.
    pub fn clear_line(&self, memory: &MemoryManager, addr: u32, accurate: bool) -> Result<(), PpuError> {
        let line_addr = addr & LINE_MASK;
        if !accurate {
            memory.write_bytes(line_addr, &[0u8; LINE])?;
            return Ok(());
        }

        let region = memory.region(line_addr, RESERVATION_GRANULARITY)?;
        if !region.flags().contains(PageFlags::WRITE) {
            return Err(MemoryError::ReadOnly { addr: line_addr }.into());
        }
        let line = region.reservation(line_addr);
        line.lock();
        region.clear_line(line_addr);
        line.unlock_and_increment();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (ReservationUnit, PpuThread) {
        let memory = MemoryManager::with_main_memory(0x1000).unwrap();
        let unit = ReservationUnit::new(&CpuConfig::default(), Arc::new(GlobalSuspend::new()));
        (unit, PpuThread::new(0, memory))
    }

    #[test]
    fn test_scan_finds_matching_store() {
        // lwz, add, stwcx.
        let words = [0x80830000, 0x7C642A14, 0x7C80192D];
        assert_eq!(Granularity::scan(&words, 4), Granularity::Word);
        assert_eq!(Granularity::scan(&words, 8), Granularity::Line);
    }

    #[test]
    fn test_scan_stops_at_branch() {
        // bne, stwcx.
        let words = [0x40820008, 0x7C80192D];
        assert_eq!(Granularity::scan(&words, 4), Granularity::Line);
        assert_eq!(Granularity::scan(&[], 4), Granularity::Line);
    }

    #[test]
    fn test_pair_succeeds_once() {
        let (unit, mut thread) = setup();
        thread.memory().write_be32(0x100, 5).unwrap();

        let value = unit.load_reserve(&mut thread, 0x100, 4, Granularity::Word).unwrap();
        assert_eq!(value, 5);
        assert!(unit.store_conditional(&mut thread, 0x100, 4, 6).unwrap());
        assert_eq!(thread.reservation.raddr, 0);
        assert_eq!(thread.memory().read_be32(0x100).unwrap(), 6);

        // Reservation is gone
        assert!(!unit.store_conditional(&mut thread, 0x100, 4, 7).unwrap());
        assert_eq!(thread.memory().read_be32(0x100).unwrap(), 6);
    }

    #[test]
    fn test_misaligned_is_error() {
        let (unit, mut thread) = setup();
        assert_eq!(
            unit.load_reserve(&mut thread, 0x102, 4, Granularity::Line),
            Err(PpuError::UnalignedReservation { addr: 0x102, size: 4 })
        );
        assert_eq!(
            unit.store_conditional(&mut thread, 0x104, 8, 0),
            Err(PpuError::UnalignedReservation { addr: 0x104, size: 8 })
        );
    }

    #[test]
    fn test_unmapped_is_out_of_range() {
        let (unit, mut thread) = setup();
        assert_eq!(
            unit.load_reserve(&mut thread, 0x8000_0000, 8, Granularity::Line),
            Err(PpuError::ReservationOutOfRange { addr: 0x8000_0000 })
        );
    }

    #[test]
    fn test_line_mode_honours_same_line() {
        let (unit, mut thread) = setup();
        unit.load_reserve(&mut thread, 0x100, 4, Granularity::Line).unwrap();
        assert!(unit.store_conditional(&mut thread, 0x140, 4, 9).unwrap());
        assert_eq!(thread.memory().read_be32(0x140).unwrap(), 9);

        unit.load_reserve(&mut thread, 0x100, 4, Granularity::Word).unwrap();
        assert!(!unit.store_conditional(&mut thread, 0x140, 4, 10).unwrap());
        assert_eq!(thread.memory().read_be32(0x140).unwrap(), 9);
    }

    #[test]
    fn test_plain_store_breaks_reservation() {
        let (unit, mut thread) = setup();
        unit.load_reserve(&mut thread, 0x200, 8, Granularity::Word).unwrap();
        thread.memory().write_be64(0x200, 1).unwrap();
        assert!(!unit.store_conditional(&mut thread, 0x200, 8, 2).unwrap());
        assert_eq!(thread.memory().read_be64(0x200).unwrap(), 1);

        let fail = thread.reservation.last_fail.unwrap();
        assert_eq!(fail.line, 0x200);
    }

    #[test]
    fn test_word_mode_ignores_rest_of_line() {
        let (unit, mut thread) = setup();
        unit.load_reserve(&mut thread, 0x200, 4, Granularity::Word).unwrap();
        thread.memory().write_be32(0x240, 0xFFFF).unwrap();
        assert!(unit.store_conditional(&mut thread, 0x200, 4, 3).unwrap());

        unit.load_reserve(&mut thread, 0x200, 4, Granularity::Line).unwrap();
        thread.memory().write_be32(0x240, 0).unwrap();
        assert!(!unit.store_conditional(&mut thread, 0x200, 4, 4).unwrap());
    }

    #[test]
    fn test_accurate_dcbz_invalidates() {
        let (unit, mut thread) = setup();
        unit.load_reserve(&mut thread, 0x300, 4, Granularity::Word).unwrap();
        let memory = thread.memory().clone();
        unit.clear_line(&memory, 0x37C, true).unwrap();
        assert!(!unit.store_conditional(&mut thread, 0x300, 4, 1).unwrap());
    }

    #[test]
    fn test_fast_dcbz_keeps_epoch() {
        let (unit, thread) = setup();
        let memory = thread.memory().clone();
        memory.write_be64(0x380, u64::MAX).unwrap();
        let before = memory.region(0x380, 8).unwrap().reservation(0x380).acquire();
        unit.clear_line(&memory, 0x3FF, false).unwrap();
        assert_eq!(memory.read_be64(0x380).unwrap(), 0);
        let after = memory.region(0x380, 8).unwrap().reservation(0x380).acquire();
        assert_eq!(before, after);
    }
}
