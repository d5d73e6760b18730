//! Per-line reservation epochs
//!
//! Every 128-byte line of guest memory has an epoch counter. A successful
//! conditional store (or an accurate cache-line clear) advances the epoch, so
//! a thread holding a stale epoch knows its reservation was lost.

use std::sync::atomic::{AtomicU64, Ordering};

/// Reservation epoch for one cache line
///
/// The epoch advances by the line size; bit 0 is the exclusive marker taken
/// by a committing writer.
#[repr(C, align(64))]
pub struct Reservation {
    /// Epoch with lock bit in LSB
    timestamp: AtomicU64,
}

impl Reservation {
    /// Lock bit position in timestamp
    pub const LOCK_BIT: u64 = 1;
    /// Epoch increment per commit
    pub const STEP: u64 = 128;

    /// Create a new reservation
    pub const fn new() -> Self {
        Self {
            timestamp: AtomicU64::new(0),
        }
    }

    /// Current epoch, excluding the lock bit
    #[inline]
    pub fn acquire(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire) & !Self::LOCK_BIT
    }

    /// Raw timestamp including the lock bit
    #[inline]
    pub fn raw(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Spin until no writer holds the line and return the epoch
    #[inline]
    pub fn acquire_unlocked(&self) -> u64 {
        loop {
            let raw = self.raw();
            if raw & Self::LOCK_BIT == 0 {
                return raw;
            }
            std::hint::spin_loop();
        }
    }

    /// Try to lock the reservation if timestamp matches
    #[inline]
    pub fn try_lock(&self, expected_time: u64) -> bool {
        self.timestamp
            .compare_exchange(
                expected_time,
                expected_time | Self::LOCK_BIT,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Lock the reservation, waiting out other writers
    ///
    /// Returns false without locking once the unlocked epoch differs from
    /// `expected_time`.
    pub fn lock_if(&self, expected_time: u64) -> bool {
        loop {
            let raw = self.raw();
            if raw & Self::LOCK_BIT != 0 {
                std::hint::spin_loop();
                continue;
            }
            if raw != expected_time {
                return false;
            }
            if self.try_lock(expected_time) {
                return true;
            }
        }
    }

    /// Lock the reservation whatever its epoch, returning the epoch
    pub fn lock(&self) -> u64 {
        loop {
            let time = self.acquire_unlocked();
            if self.try_lock(time) {
                return time;
            }
        }
    }

    /// Unlock and increment the timestamp
    #[inline]
    pub fn unlock_and_increment(&self) {
        let current = self.timestamp.load(Ordering::Relaxed);
        let new_time = (current & !Self::LOCK_BIT) + Self::STEP;
        self.timestamp.store(new_time, Ordering::Release);
    }

    /// Unlock without advancing the epoch (nothing was written)
    #[inline]
    pub fn unlock(&self) {
        self.timestamp.fetch_and(!Self::LOCK_BIT, Ordering::Release);
    }

    /// Check if the reservation is locked
    #[inline]
    pub fn is_locked(&self) -> bool {
        (self.timestamp.load(Ordering::Acquire) & Self::LOCK_BIT) != 0
    }

    /// Invalidate the reservation (increment timestamp without locking)
    #[inline]
    pub fn invalidate(&self) {
        self.timestamp.fetch_add(Self::STEP, Ordering::Release);
    }
}

impl Default for Reservation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_basic() {
        let res = Reservation::new();

        assert_eq!(res.acquire(), 0);
        assert!(!res.is_locked());
    }

    #[test]
    fn test_reservation_lock_unlock() {
        let res = Reservation::new();

        let time = res.acquire();
        assert!(res.try_lock(time));
        assert!(res.is_locked());

        res.unlock_and_increment();
        assert!(!res.is_locked());
        assert_eq!(res.acquire(), 128);
    }

    #[test]
    fn test_reservation_lock_conflict() {
        let res = Reservation::new();

        let time = res.acquire();
        assert!(res.try_lock(time));

        // Second lock attempt should fail
        assert!(!res.try_lock(time));

        res.unlock_and_increment();
    }

    #[test]
    fn test_lock_if_rejects_stale_epoch() {
        let res = Reservation::new();
        res.invalidate();

        assert!(!res.lock_if(0));
        assert!(!res.is_locked());
        assert!(res.lock_if(128));
        res.unlock();
        assert_eq!(res.acquire(), 128);
    }

    #[test]
    fn test_lock_waits_for_writer() {
        use std::sync::Arc;

        let res = Arc::new(Reservation::new());
        assert!(res.try_lock(0));

        let waiter = {
            let res = res.clone();
            std::thread::spawn(move || res.lock())
        };

        std::thread::sleep(std::time::Duration::from_millis(10));
        res.unlock_and_increment();

        assert_eq!(waiter.join().unwrap(), 128);
        assert!(res.is_locked());
    }

    #[test]
    fn test_reservation_invalidate() {
        let res = Reservation::new();

        res.invalidate();
        assert_eq!(res.acquire(), 128);

        res.invalidate();
        assert_eq!(res.acquire(), 256);
    }
}
