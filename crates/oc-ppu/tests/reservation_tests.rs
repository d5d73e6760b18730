//! Concurrency tests for the load-reserve / store-conditional protocol

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use oc_core::config::CpuConfig;
use oc_core::error::{MemoryError, PpuError};
use oc_memory::{MemoryManager, PageFlags, Reservation};
use oc_ppu::reservation::{CommitPath, HtmBackend, LockPath, SuspendPath};
use oc_ppu::{GlobalSuspend, Granularity, PpuThread, ReservationUnit};

const COUNTER: u32 = 0x1000;
const WORKERS: u32 = 4;
const INCREMENTS: u64 = 500;

/// Transaction backend that never commits
struct AlwaysAbort;

impl HtmBackend for AlwaysAbort {
    fn name(&self) -> &'static str {
        "always-abort"
    }

    fn run(&self, _line: &Reservation, _body: &mut dyn FnMut(u64) -> bool) -> Option<bool> {
        None
    }
}

fn create_memory() -> Arc<MemoryManager> {
    MemoryManager::with_main_memory(0x1_0000).unwrap()
}

/// Increment the counter `INCREMENTS` times from each of `WORKERS` threads
fn hammer(unit: Arc<ReservationUnit>, memory: Arc<MemoryManager>, suspend: Arc<GlobalSuspend>, mode: Granularity) {
    let handles: Vec<_> = (0..WORKERS)
        .map(|id| {
            let unit = unit.clone();
            let memory = memory.clone();
            let suspend = suspend.clone();
            thread::spawn(move || {
                let _active = suspend.enter();
                let mut ppu = PpuThread::new(id, memory);
                for _ in 0..INCREMENTS {
                    loop {
                        suspend.checkpoint();
                        let value = unit.load_reserve(&mut ppu, COUNTER, 8, mode).unwrap();
                        if unit.store_conditional(&mut ppu, COUNTER, 8, value + 1).unwrap() {
                            break;
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_concurrent_increments_commit_once_per_epoch() {
    let config = CpuConfig::default();
    let memory = create_memory();
    let suspend = Arc::new(GlobalSuspend::new());
    let unit = Arc::new(ReservationUnit::new(&config, suspend.clone()));

    hammer(unit.clone(), memory.clone(), suspend, Granularity::Word);

    let total = WORKERS as u64 * INCREMENTS;
    assert_eq!(memory.read_be64(COUNTER).unwrap(), total);
    let stats = unit.stats();
    assert_eq!(stats.transactional + stats.lightweight + stats.global, total);

    // Every commit advanced the line epoch exactly once.
    let region = memory.region(COUNTER, 8).unwrap();
    assert_eq!(region.reservation(COUNTER).raw(), total * Reservation::STEP);
}

#[test]
fn test_aborting_transactions_fall_back_to_lock() {
    let config = CpuConfig::default();
    let memory = create_memory();
    let suspend = Arc::new(GlobalSuspend::new());
    let unit = Arc::new(ReservationUnit::with_htm(&config, suspend.clone(), Arc::new(AlwaysAbort)));

    hammer(unit.clone(), memory.clone(), suspend, Granularity::Line);

    let total = WORKERS as u64 * INCREMENTS;
    assert_eq!(memory.read_be64(COUNTER).unwrap(), total);
    let stats = unit.stats();
    assert_eq!(stats.transactional, 0);
    assert_eq!(stats.lightweight + stats.global, total);
}

#[test]
fn test_suspend_only_ladder() {
    let memory = create_memory();
    let suspend = Arc::new(GlobalSuspend::new());
    let paths: Vec<Box<dyn CommitPath>> = vec![Box::new(SuspendPath::new(suspend.clone()))];
    let unit = Arc::new(ReservationUnit::with_paths(paths, suspend.clone(), Duration::from_micros(100)));

    hammer(unit.clone(), memory.clone(), suspend.clone(), Granularity::Word);

    assert_eq!(memory.read_be64(COUNTER).unwrap(), WORKERS as u64 * INCREMENTS);
    assert_eq!(unit.stats().global, WORKERS as u64 * INCREMENTS);
    assert_eq!(suspend.active(), 0);
}

#[test]
fn test_second_reserver_fails_after_first_commits() {
    let config = CpuConfig::default();
    let memory = create_memory();
    let unit = ReservationUnit::new(&config, Arc::new(GlobalSuspend::new()));
    memory.write_be32(0x2000, 10).unwrap();

    let mut a = PpuThread::new(1, memory.clone());
    let mut b = PpuThread::new(2, memory.clone());
    assert_eq!(unit.load_reserve(&mut a, 0x2000, 4, Granularity::Word).unwrap(), 10);
    assert_eq!(unit.load_reserve(&mut b, 0x2000, 4, Granularity::Word).unwrap(), 10);

    assert!(unit.store_conditional(&mut a, 0x2000, 4, 11).unwrap());
    assert!(!unit.store_conditional(&mut b, 0x2000, 4, 12).unwrap());
    assert_eq!(memory.read_be32(0x2000).unwrap(), 11);
    assert_eq!(b.reservation.raddr, 0);

    // B retries from the refreshed snapshot and wins.
    assert_eq!(unit.load_reserve(&mut b, 0x2000, 4, Granularity::Word).unwrap(), 11);
    assert!(unit.store_conditional(&mut b, 0x2000, 4, 12).unwrap());
    assert_eq!(memory.read_be32(0x2000).unwrap(), 12);
}

#[test]
fn test_store_outside_line_does_not_write() {
    let config = CpuConfig::default();
    let memory = create_memory();
    let unit = ReservationUnit::new(&config, Arc::new(GlobalSuspend::new()));

    let mut ppu = PpuThread::new(1, memory.clone());
    unit.load_reserve(&mut ppu, 0x3000, 4, Granularity::Line).unwrap();
    assert!(!unit.store_conditional(&mut ppu, 0x3080, 4, 0xFFFF).unwrap());
    assert_eq!(memory.read_be32(0x3080).unwrap(), 0);

    // Same line in line mode is honoured.
    unit.load_reserve(&mut ppu, 0x3000, 4, Granularity::Line).unwrap();
    assert!(unit.store_conditional(&mut ppu, 0x3040, 4, 0xFFFF).unwrap());
    assert_eq!(memory.read_be32(0x3040).unwrap(), 0xFFFF);

    // Word mode only honours the reserved address.
    unit.load_reserve(&mut ppu, 0x3000, 4, Granularity::Word).unwrap();
    assert!(!unit.store_conditional(&mut ppu, 0x3004, 4, 1).unwrap());
    assert_eq!(memory.read_be32(0x3004).unwrap(), 0);
}

#[test]
fn test_epoch_change_fails_word_reservation() {
    let config = CpuConfig::default();
    let memory = create_memory();
    let unit = ReservationUnit::new(&config, Arc::new(GlobalSuspend::new()));
    let mut a = PpuThread::new(1, memory.clone());
    let mut b = PpuThread::new(2, memory.clone());

    unit.load_reserve(&mut a, 0x4000, 8, Granularity::Word).unwrap();
    unit.load_reserve(&mut b, 0x4040, 8, Granularity::Word).unwrap();
    assert!(unit.store_conditional(&mut b, 0x4040, 8, 7).unwrap());

    // The epoch moved, so even word mode loses the reservation.
    assert!(!unit.store_conditional(&mut a, 0x4000, 8, 1).unwrap());
    assert_eq!(memory.read_be64(0x4000).unwrap(), 0);
}

#[test]
fn test_busy_line_aborts_every_strategy() {
    let memory = create_memory();
    let paths: Vec<Box<dyn CommitPath>> = vec![Box::new(LockPath)];
    let unit = ReservationUnit::with_paths(paths, Arc::new(GlobalSuspend::new()), Duration::from_micros(100));
    let mut ppu = PpuThread::new(1, memory.clone());

    unit.load_reserve(&mut ppu, 0x5000, 4, Granularity::Word).unwrap();
    let region = memory.region(0x5000, 4).unwrap();
    let line = region.reservation(0x5000);
    line.lock();

    let stored = thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            line.unlock();
        });
        unit.store_conditional(&mut ppu, 0x5000, 4, 9).unwrap()
    });

    assert!(!stored);
    assert_eq!(memory.read_be32(0x5000).unwrap(), 0);
    assert_eq!(unit.stats().failures, 1);
}

#[test]
fn test_store_conditional_to_read_only_region_faults() {
    let memory = MemoryManager::new();
    memory.map(0x1_0000, 0x1000, PageFlags::RX).unwrap();
    memory.load_image(0x1_0100, &5u32.to_be_bytes()).unwrap();
    let unit = ReservationUnit::new(&CpuConfig::default(), Arc::new(GlobalSuspend::new()));
    let mut ppu = PpuThread::new(1, memory.clone());

    assert_eq!(unit.load_reserve(&mut ppu, 0x1_0100, 4, Granularity::Word).unwrap(), 5);
    let err = unit.store_conditional(&mut ppu, 0x1_0100, 4, 6).unwrap_err();
    assert!(matches!(err, PpuError::Memory(MemoryError::ReadOnly { addr: 0x1_0100 })));
    assert_eq!(memory.read_be32(0x1_0100).unwrap(), 5);
    assert_eq!(ppu.reservation.raddr, 0);
    assert_eq!(unit.stats(), Default::default());
}
