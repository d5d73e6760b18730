//! PPU module compiler
//!
//! Guest modules are split into chunks of functions, each chunk is hashed and
//! looked up in an on-disk object cache, missing chunks are compiled by a pool
//! of workers, and the resulting native functions are published into the
//! executable-address table.

pub mod backend;
pub mod cache;
pub mod hash;
pub mod pipeline;
pub mod settings;

pub use backend::{CodegenBackend, LinkContext, ObjectCode, ThreadedBackend, UnitSource};
pub use cache::{CachedModule, ModuleRegistry, ObjectCache};
pub use hash::CompilationUnit;
pub use pipeline::{CancelToken, CompileStats, CompilerSlots, Recompiler};
pub use settings::CodegenSettings;
