//! Publication tests for the executable-address table

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use oc_core::error::PpuError;
use oc_ppu::{ExecEntry, ExecTable, NativeCode, NativeExit, NativeFunction, PpuInterpreter, PpuOpcode, PpuThread};

const BASE: u32 = 0x1_0000;
const SPAN: u32 = 0x400;
const ROUNDS: u32 = 64;

struct Marker;

impl NativeCode for Marker {
    fn run(&self, _: &mut PpuThread, _: &PpuInterpreter) -> Result<NativeExit, PpuError> {
        Ok(NativeExit::Branch)
    }
}

#[test]
fn test_readers_never_see_torn_entries() {
    let table = Arc::new(ExecTable::with_native_capacity(BASE, SPAN, (SPAN / 4 * ROUNDS) as usize));
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let table = table.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut natives = 0u64;
                while !done.load(Ordering::Acquire) {
                    for addr in (BASE..BASE + SPAN).step_by(4) {
                        match table.get(addr) {
                            ExecEntry::Empty | ExecEntry::Interp(PpuOpcode::Addi) => {}
                            ExecEntry::Native { id, reloc } => {
                                assert_eq!(reloc, (id & 0xFFFF) as u16, "torn entry at 0x{:x}", addr);
                                let function = table.native(id).expect("published id must be resident");
                                assert_eq!(function.addr, addr);
                                natives += 1;
                            }
                            other => panic!("unexpected entry {:?} at 0x{:x}", other, addr),
                        }
                    }
                }
                natives
            })
        })
        .collect();

    for _ in 0..ROUNDS {
        for addr in (BASE..BASE + SPAN).step_by(4) {
            table.install_interp(addr, ExecEntry::Empty, PpuOpcode::Addi);
            let id = table
                .add_native(NativeFunction { addr, size: 4, code: Box::new(Marker) })
                .unwrap();
            assert!(table.publish_native(addr, id, (id & 0xFFFF) as u16));
        }
        table.reset_segment(BASE, SPAN);
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(table.native_count(), (SPAN / 4 * ROUNDS) as usize);
}

#[test]
fn test_racing_fallback_installs_agree() {
    let table = Arc::new(ExecTable::new(BASE, SPAN));
    let winners: usize = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = &table;
                scope.spawn(move || {
                    (BASE..BASE + SPAN)
                        .step_by(4)
                        .filter(|&addr| table.install_fallback(addr, ExecEntry::Empty))
                        .count()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    assert_eq!(winners, (SPAN / 4) as usize);
    assert!((BASE..BASE + SPAN).step_by(4).all(|addr| table.get(addr) == ExecEntry::Fallback));
}
