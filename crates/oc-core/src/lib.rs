//! Core types shared by the oxidized-ppu crates
//!
//! Configuration, the error taxonomy and logging setup live here so that the
//! memory, interpreter and recompiler crates agree on them.

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{EmulatorError, Result};
