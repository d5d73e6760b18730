//! PPU (PowerPC Processing Unit) execution core
//!
//! Guest threads run either through the interpreter or through translated
//! native functions published in the [`ExecTable`]. The [`Gateway`] moves a
//! thread between the two, and the [`reservation`] module emulates the
//! lwarx/stwcx. protocol on top of per-line epochs in guest memory.

pub mod commands;
pub mod decoder;
pub mod exec_table;
pub mod gateway;
pub mod interpreter;
pub mod link;
pub mod module;
pub mod reservation;
pub mod suspend;
pub mod thread;

pub use commands::{CommandInbox, CommandReceiver, CommandSender, PpuRunner, RegisterWrite, ThreadCommand};
pub use decoder::{PpuDecoder, PpuOpcode};
pub use exec_table::{ExecEntry, ExecTable, NativeCode, NativeExit, NativeFunction};
pub use gateway::{ExitReason, Gateway};
pub use interpreter::{ExecHints, PpuInterpreter};
pub use link::{KernelServices, LinkEntry, LinkTable, NullKernel, TrapAction, TrapKind};
pub use module::{BlockInfo, FunctionInfo, GuestModule, Relocation, RelocationKind, Segment};
pub use reservation::{Granularity, ReservationUnit};
pub use suspend::GlobalSuspend;
pub use thread::PpuThread;
