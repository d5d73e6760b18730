//! Guest memory for the PPU execution core
//!
//! Memory is a set of mapped regions backed by atomic 64-bit cells, so guest
//! threads running on different host threads can share it without locks. Each
//! 128-byte line carries a [`Reservation`] epoch used by lwarx/stwcx.

pub mod constants;
pub mod manager;
pub mod pages;
pub mod reservation;

pub use manager::{GuestValue, MemoryManager, Region};
pub use pages::PageFlags;
pub use reservation::Reservation;
