//! Native execution gateway
//!
//! [`Gateway::enter_native`] is the single place a host thread starts running
//! guest code. It dispatches translated functions through a [`HostBridge`] and
//! everything else through the interpreter, and it re-checks the thread's
//! signals after every call into translated code. [`Gateway::escape`] unwinds
//! back to the innermost `enter_native` without touching the guest stack.

use std::sync::atomic::{compiler_fence, AtomicU64, Ordering};
use std::sync::Arc;

use oc_core::config::{CpuConfig, PpuDecoderType};
use oc_core::error::PpuError;

use crate::exec_table::{ExecEntry, ExecTable, NativeExit, NativeFunction};
use crate::interpreter::PpuInterpreter;
use crate::suspend::GlobalSuspend;
use crate::thread::{PpuThread, PpuThreadState, ThreadState, RETURN_SENTINEL};

/// Interpreter instructions run between signal checks
pub const DEFAULT_SLICE: usize = 256;

/// Saved unwind point of one `enter_native` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayFrame {
    pub id: u64,
    /// Frames below this one on the thread
    pub depth: usize,
}

/// Why `enter_native` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A stop was requested
    Stopped,
    /// [`Gateway::escape`] unwound this frame
    Escaped,
    /// The thread reached the call sentinel
    Returned,
    /// The trap path ended the thread
    Terminated,
    /// A command is waiting for the runner
    Interrupted,
}

/// Boundary between host code and translated code
pub trait HostBridge: Send + Sync {
    /// Called once when a gateway frame is pushed
    fn enter(&self, frame: &GatewayFrame);

    fn call(
        &self,
        function: &NativeFunction,
        thread: &mut PpuThread,
        interp: &PpuInterpreter,
    ) -> Result<NativeExit, PpuError>;

    /// Called once when a gateway frame is popped
    fn leave(&self, frame: &GatewayFrame);
}

/// Bridge for translated code that follows the host calling convention
///
/// Translated code is an ordinary Rust call, so the host ABI keeps the
/// callee-saved and vector registers intact across it; guest registers live
/// in [`PpuThread`] and never occupy host registers between calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortableBridge;

impl HostBridge for PortableBridge {
    fn enter(&self, _frame: &GatewayFrame) {
        compiler_fence(Ordering::SeqCst);
    }

    #[inline]
    fn call(
        &self,
        function: &NativeFunction,
        thread: &mut PpuThread,
        interp: &PpuInterpreter,
    ) -> Result<NativeExit, PpuError> {
        function.code.run(thread, interp)
    }

    fn leave(&self, _frame: &GatewayFrame) {
        compiler_fence(Ordering::SeqCst);
    }
}

/// Bridge used on this host
pub type ActiveBridge = PortableBridge;

/// Native execution gateway
pub struct Gateway<B: HostBridge = ActiveBridge> {
    interp: Arc<PpuInterpreter>,
    table: Arc<ExecTable>,
    suspend: Arc<GlobalSuspend>,
    bridge: B,
    slice: usize,
    precise: bool,
    use_native: bool,
    next_frame: AtomicU64,
}

impl Gateway<ActiveBridge> {
    pub fn new(interp: Arc<PpuInterpreter>, suspend: Arc<GlobalSuspend>, config: &CpuConfig) -> Self {
        Self::with_bridge(interp, suspend, config, ActiveBridge::default())
    }
}

impl<B: HostBridge> Gateway<B> {
    pub fn with_bridge(
        interp: Arc<PpuInterpreter>,
        suspend: Arc<GlobalSuspend>,
        config: &CpuConfig,
        bridge: B,
    ) -> Self {
        Self {
            table: interp.table().clone(),
            interp,
            suspend,
            bridge,
            slice: DEFAULT_SLICE,
            precise: config.ppu_decoder == PpuDecoderType::InterpreterPrecise,
            use_native: config.ppu_decoder == PpuDecoderType::Recompiler,
            next_frame: AtomicU64::new(1),
        }
    }

    pub fn interpreter(&self) -> &Arc<PpuInterpreter> {
        &self.interp
    }

    pub fn suspend(&self) -> &Arc<GlobalSuspend> {
        &self.suspend
    }

    /// Run the thread from `cia` until it stops, escapes, returns or dies
    pub fn enter_native(&self, thread: &mut PpuThread) -> Result<ExitReason, PpuError> {
        self.enter(thread, false)
    }

    /// Like [`Self::enter_native`], but an outermost frame also returns
    /// [`ExitReason::Interrupted`] once a command is queued for the thread
    pub fn resume(&self, thread: &mut PpuThread) -> Result<ExitReason, PpuError> {
        self.enter(thread, true)
    }

    fn enter(&self, thread: &mut PpuThread, interruptible: bool) -> Result<ExitReason, PpuError> {
        let _active = self.suspend.enter();
        let frame = GatewayFrame {
            id: self.next_frame.fetch_add(1, Ordering::Relaxed),
            depth: thread.gateway.len(),
        };
        thread.gateway.push(frame);
        thread.state = PpuThreadState::Running;
        self.bridge.enter(&frame);

        let result = self.run(thread, interruptible && frame.depth == 0);

        self.bridge.leave(&frame);
        thread.gateway.pop();
        if thread.gateway.is_empty() {
            thread.state = PpuThreadState::Stopped;
        }

        match result {
            Err(PpuError::ThreadTerminated { id, reason }) => {
                tracing::warn!(target: "ppu", "Thread {} terminated: {}", id, reason);
                thread.state = PpuThreadState::Stopped;
                Ok(ExitReason::Terminated)
            }
            other => other,
        }
    }

    fn run(&self, thread: &mut PpuThread, interruptible: bool) -> Result<ExitReason, PpuError> {
        let mut interpret_next = false;
        loop {
            let state = thread.signals.load();
            if state.contains(ThreadState::STOP) {
                return Ok(ExitReason::Stopped);
            }
            if interruptible && state.contains(ThreadState::CMD) {
                return Ok(ExitReason::Interrupted);
            }
            if state.contains(ThreadState::RET) {
                thread.signals.clear(ThreadState::RET);
                return Ok(ExitReason::Escaped);
            }
            if state.intersects(ThreadState::PARKED) {
                thread.state = PpuThreadState::Suspended;
                let _idle = self.suspend.idle();
                thread.signals.wait_while_parked();
                thread.state = PpuThreadState::Running;
                continue;
            }
            self.suspend.checkpoint();

            if thread.pc() == RETURN_SENTINEL {
                return Ok(ExitReason::Returned);
            }

            if state.contains(ThreadState::DBG_STEP) {
                self.interp.single(thread, true)?;
                thread.signals.clear(ThreadState::DBG_STEP);
                thread.signals.set(ThreadState::DBG_PAUSE);
                continue;
            }

            if self.use_native && !interpret_next {
                let pc = thread.pc() as u32;
                if let ExecEntry::Native { id, .. } = self.table.get(pc) {
                    // A retired id may already belong to another function
                    if let Some(function) = self.table.native(id).filter(|f| f.addr == pc) {
                        tracing::trace!(target: "ppu", "native call 0x{:08x}", function.addr);
                        if self.bridge.call(&function, thread, &self.interp)? == NativeExit::Fallback {
                            interpret_next = true;
                        }
                        continue;
                    }
                }
            }

            interpret_next = false;
            self.interp.run_slice(thread, self.slice, self.precise)?;
        }
    }

    /// Unwind to the innermost `enter_native` call site
    pub fn escape(&self, thread: &mut PpuThread) -> Result<(), PpuError> {
        if thread.gateway.is_empty() {
            return Err(PpuError::NoGatewayFrame);
        }
        thread.signals.set(ThreadState::RET);
        Ok(())
    }

    /// Run the guest function at `entry` to completion
    ///
    /// LR is pointed at the call sentinel; `cia` and LR are restored when the
    /// function returns normally.
    pub fn call(&self, thread: &mut PpuThread, entry: u32) -> Result<ExitReason, PpuError> {
        let saved_pc = thread.pc();
        let saved_lr = thread.regs.lr;
        thread.regs.lr = RETURN_SENTINEL;
        thread.set_pc(entry as u64);

        let reason = self.enter_native(thread)?;
        if reason == ExitReason::Returned {
            thread.set_pc(saved_pc);
            thread.regs.lr = saved_lr;
        }
        Ok(reason)
    }
}
