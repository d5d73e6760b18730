//! Thread command inbox
//!
//! Other host threads never touch a running guest thread's registers. They
//! send [`ThreadCommand`]s, and the owning thread applies them in order
//! between execution slices.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use oc_core::error::PpuError;
use oc_core::ppu_debug;

use crate::gateway::{ActiveBridge, ExitReason, Gateway, HostBridge};
use crate::thread::{PpuThread, ThreadSignals, ThreadState};

/// How often a sleeping thread re-checks for a stop request
const SLEEP_POLL: Duration = Duration::from_millis(10);

/// A single register assignment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegisterWrite {
    Gpr(u8, u64),
    Fpr(u8, f64),
    Lr(u64),
    Ctr(u64),
    Cr(u32),
    Cia(u64),
}

impl RegisterWrite {
    fn apply(self, thread: &mut PpuThread) -> Result<(), PpuError> {
        match self {
            RegisterWrite::Gpr(index, value) if index < 32 => thread.set_gpr(index as usize, value),
            RegisterWrite::Fpr(index, value) if index < 32 => thread.set_fpr(index as usize, value),
            RegisterWrite::Gpr(index, _) | RegisterWrite::Fpr(index, _) => {
                return Err(PpuError::InvalidCommand(format!("register index {} out of range", index)))
            }
            RegisterWrite::Lr(value) => thread.regs.lr = value,
            RegisterWrite::Ctr(value) => thread.regs.ctr = value,
            RegisterWrite::Cr(value) => thread.regs.cr = value,
            RegisterWrite::Cia(value) => thread.set_pc(value),
        }
        Ok(())
    }
}

/// Request to a guest thread
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadCommand {
    SetRegisters(Vec<RegisterWrite>),
    /// Call the guest function at `entry`
    NativeCall { entry: u32 },
    /// Call through a function descriptor (entry address, then TOC)
    DescriptorCall { descriptor: u32 },
    /// Interpret `count` instructions at `cia`
    Step { count: u32 },
    /// Reset registers and reservation
    Initialize,
    /// Block until the next command
    Sleep,
    /// Point r1 back at the top of the stack
    ResetStack,
}

/// Sending half of a thread's inbox
#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<ThreadCommand>,
    /// Thread to interrupt when a command is queued
    target: Option<Arc<ThreadSignals>>,
}

impl CommandSender {
    /// Queue a command, blocking while the inbox is full
    pub fn send(&self, command: ThreadCommand) -> Result<(), PpuError> {
        self.tx
            .send(command)
            .map_err(|_| PpuError::InvalidCommand("thread inbox closed".to_string()))?;
        self.notify();
        Ok(())
    }

    /// Queue a command unless the inbox is full
    pub fn try_send(&self, command: ThreadCommand) -> Result<bool, PpuError> {
        match self.tx.try_send(command) {
            Ok(()) => {
                self.notify();
                Ok(true)
            }
            Err(channel::TrySendError::Full(_)) => Ok(false),
            Err(channel::TrySendError::Disconnected(_)) => {
                Err(PpuError::InvalidCommand("thread inbox closed".to_string()))
            }
        }
    }

    fn notify(&self) {
        if let Some(signals) = &self.target {
            signals.set(ThreadState::CMD);
        }
    }
}

/// Receiving half, owned by the guest thread
pub struct CommandReceiver {
    rx: Receiver<ThreadCommand>,
}

impl CommandReceiver {
    pub fn try_recv(&self) -> Option<ThreadCommand> {
        match self.rx.try_recv() {
            Ok(command) => Some(command),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Wait for a command, giving up when the thread is stopped or the
    /// senders are gone
    pub fn recv_until_stopped(&self, signals: &ThreadSignals) -> Option<ThreadCommand> {
        loop {
            match self.rx.recv_timeout(SLEEP_POLL) {
                Ok(command) => return Some(command),
                Err(RecvTimeoutError::Timeout) if !signals.is_stopped() => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Bounded command inbox
pub struct CommandInbox;

impl CommandInbox {
    /// Inbox whose senders do not interrupt the thread
    #[allow(clippy::new_ret_no_self)]
    pub fn new(capacity: usize) -> (CommandSender, CommandReceiver) {
        Self::open(capacity, None)
    }

    /// Inbox whose senders pull `thread` out of guest code to drain it
    pub fn for_thread(thread: &PpuThread, capacity: usize) -> (CommandSender, CommandReceiver) {
        Self::open(capacity, Some(thread.signals.clone()))
    }

    fn open(capacity: usize, target: Option<Arc<ThreadSignals>>) -> (CommandSender, CommandReceiver) {
        let (tx, rx) = channel::bounded(capacity.max(1));
        (CommandSender { tx, target }, CommandReceiver { rx })
    }
}

/// Drives one guest thread: commands between gateway runs
pub struct PpuRunner<B: HostBridge = ActiveBridge> {
    gateway: Arc<Gateway<B>>,
    inbox: CommandReceiver,
}

impl<B: HostBridge> PpuRunner<B> {
    pub fn new(gateway: Arc<Gateway<B>>, inbox: CommandReceiver) -> Self {
        Self { gateway, inbox }
    }

    /// Apply one command; returns an exit reason if the thread must end
    pub fn apply(&self, thread: &mut PpuThread, command: ThreadCommand) -> Result<Option<ExitReason>, PpuError> {
        ppu_debug!("thread {} command {:?}", thread.id, command);
        match command {
            ThreadCommand::SetRegisters(writes) => {
                for write in writes {
                    write.apply(thread)?;
                }
            }
            ThreadCommand::NativeCall { entry } => return self.finish_call(thread, entry),
            ThreadCommand::DescriptorCall { descriptor } => {
                let memory = thread.memory().clone();
                let entry = memory.read_be32(descriptor)?;
                let toc = memory.read_be32(descriptor.wrapping_add(4))?;
                thread.set_gpr(2, toc as u64);
                return self.finish_call(thread, entry);
            }
            ThreadCommand::Step { count } => {
                let interp = self.gateway.interpreter();
                for _ in 0..count {
                    interp.single(thread, true)?;
                }
            }
            ThreadCommand::Initialize => thread.initialize(),
            ThreadCommand::Sleep => {
                thread.signals.set(ThreadState::SLEEP);
                let next = {
                    let _idle = self.gateway.suspend().idle();
                    self.inbox.recv_until_stopped(&thread.signals)
                };
                thread.signals.clear(ThreadState::SLEEP);
                return match next {
                    Some(command) => self.apply(thread, command),
                    None => Ok(Some(ExitReason::Stopped)),
                };
            }
            ThreadCommand::ResetStack => thread.reset_stack(),
        }
        Ok(None)
    }

    fn finish_call(&self, thread: &mut PpuThread, entry: u32) -> Result<Option<ExitReason>, PpuError> {
        match self.gateway.call(thread, entry)? {
            ExitReason::Returned | ExitReason::Escaped => Ok(None),
            reason => Ok(Some(reason)),
        }
    }

    /// Apply every queued command in order
    pub fn drain(&self, thread: &mut PpuThread) -> Result<Option<ExitReason>, PpuError> {
        thread.signals.clear(ThreadState::CMD);
        while let Some(command) = self.inbox.try_recv() {
            if let Some(reason) = self.apply(thread, command)? {
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }

    /// Run the thread, draining commands between slices of execution
    pub fn run(&self, thread: &mut PpuThread) -> Result<ExitReason, PpuError> {
        thread.start();
        loop {
            if let Some(reason) = self.drain(thread)? {
                return Ok(reason);
            }
            if thread.signals.is_stopped() {
                return Ok(ExitReason::Stopped);
            }
            match self.gateway.resume(thread)? {
                ExitReason::Escaped | ExitReason::Interrupted => continue,
                reason => return Ok(reason),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec_table::ExecTable;
    use crate::interpreter::PpuInterpreter;
    use crate::link::NullKernel;
    use crate::reservation::ReservationUnit;
    use crate::suspend::GlobalSuspend;
    use crate::thread::RETURN_SENTINEL;
    use oc_core::config::CpuConfig;
    use oc_memory::MemoryManager;

    fn create_runner(capacity: usize) -> (PpuRunner, CommandSender, PpuThread) {
        let config = CpuConfig::default();
        let memory = MemoryManager::with_main_memory(0x1_0000).unwrap();
        let table = Arc::new(ExecTable::new(0, 0x1_0000));
        let suspend = Arc::new(GlobalSuspend::new());
        let reservations = Arc::new(ReservationUnit::new(&config, suspend.clone()));
        let interp = Arc::new(PpuInterpreter::new(
            memory.clone(),
            table,
            reservations,
            Arc::new(NullKernel::new()),
            &config,
        ));
        let gateway = Arc::new(Gateway::new(interp, suspend, &config));
        let thread = PpuThread::new(1, memory).with_stack(0x8000, 0x1000);
        let (tx, rx) = CommandInbox::for_thread(&thread, capacity);
        (PpuRunner::new(gateway, rx), tx, thread)
    }

    #[test]
    fn test_commands_apply_in_order() {
        let (runner, tx, mut thread) = create_runner(8);
        tx.send(ThreadCommand::SetRegisters(vec![RegisterWrite::Gpr(3, 1)])).unwrap();
        tx.send(ThreadCommand::SetRegisters(vec![
            RegisterWrite::Gpr(3, 2),
            RegisterWrite::Lr(0x40),
            RegisterWrite::Cr(0x2000_0000),
        ]))
        .unwrap();

        assert_eq!(runner.drain(&mut thread).unwrap(), None);
        assert_eq!(thread.gpr(3), 2);
        assert_eq!(thread.regs.lr, 0x40);
        assert_eq!(thread.get_cr_field(0), 0b0010);
    }

    #[test]
    fn test_bad_register_index() {
        let (runner, tx, mut thread) = create_runner(1);
        tx.send(ThreadCommand::SetRegisters(vec![RegisterWrite::Gpr(40, 1)])).unwrap();
        assert!(matches!(runner.drain(&mut thread), Err(PpuError::InvalidCommand(_))));
    }

    #[test]
    fn test_reset_stack_and_initialize() {
        let (runner, tx, mut thread) = create_runner(4);
        thread.set_gpr(1, 0);
        thread.set_gpr(5, 5);
        tx.send(ThreadCommand::ResetStack).unwrap();
        runner.drain(&mut thread).unwrap();
        assert_eq!(thread.gpr(1), 0x8000 + 0x1000 - 0x70);
        assert_eq!(thread.gpr(5), 5);

        tx.send(ThreadCommand::Initialize).unwrap();
        runner.drain(&mut thread).unwrap();
        assert_eq!(thread.gpr(5), 0);
        assert_eq!(thread.gpr(1), 0x8000 + 0x1000 - 0x70);
    }

    #[test]
    fn test_descriptor_call_loads_toc() {
        let (runner, tx, mut thread) = create_runner(4);
        let memory = thread.memory().clone();
        memory.write_be32(0x100, 0x38600003).unwrap(); // li r3, 3
        memory.write_be32(0x104, 0x4E800020).unwrap(); // blr
        memory.write_be32(0x200, 0x100).unwrap();
        memory.write_be32(0x204, 0x7000).unwrap();

        tx.send(ThreadCommand::DescriptorCall { descriptor: 0x200 }).unwrap();
        assert_eq!(runner.drain(&mut thread).unwrap(), None);
        assert_eq!(thread.gpr(2), 0x7000);
        assert_eq!(thread.gpr(3), 3);
        assert_ne!(thread.pc(), RETURN_SENTINEL);
    }

    #[test]
    fn test_sleep_waits_for_next_command() {
        let (runner, tx, mut thread) = create_runner(4);
        tx.send(ThreadCommand::Sleep).unwrap();

        let sender = tx.clone();
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sender.send(ThreadCommand::SetRegisters(vec![RegisterWrite::Gpr(4, 9)])).unwrap();
        });

        assert_eq!(runner.drain(&mut thread).unwrap(), None);
        assert_eq!(thread.gpr(4), 9);
        assert!(!thread.signals.load().contains(ThreadState::SLEEP));
        producer.join().unwrap();
    }

    #[test]
    fn test_full_inbox_rejects_try_send() {
        let (_runner, tx, _thread) = create_runner(1);
        assert!(tx.try_send(ThreadCommand::Initialize).unwrap());
        assert!(!tx.try_send(ThreadCommand::Initialize).unwrap());
    }

    #[test]
    fn test_run_returns_at_sentinel() {
        let (runner, tx, mut thread) = create_runner(4);
        let memory = thread.memory().clone();
        memory.write_be32(0x300, 0x4E800020).unwrap(); // blr
        tx.send(ThreadCommand::SetRegisters(vec![
            RegisterWrite::Cia(0x300),
            RegisterWrite::Lr(RETURN_SENTINEL),
        ]))
        .unwrap();
        assert_eq!(runner.run(&mut thread).unwrap(), ExitReason::Returned);
    }

    #[test]
    fn test_command_interrupts_running_loop() {
        let (runner, tx, mut thread) = create_runner(4);
        let memory = thread.memory().clone();
        memory.write_be32(0x400, 0x48000000).unwrap(); // b .
        memory.write_be32(0x500, 0x4E800020).unwrap(); // blr
        thread.set_pc(0x400);

        let sender = tx.clone();
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sender
                .send(ThreadCommand::SetRegisters(vec![
                    RegisterWrite::Cia(0x500),
                    RegisterWrite::Lr(RETURN_SENTINEL),
                ]))
                .unwrap();
        });

        assert_eq!(runner.run(&mut thread).unwrap(), ExitReason::Returned);
        assert!(!thread.signals.load().contains(ThreadState::CMD));
        producer.join().unwrap();
    }
}
