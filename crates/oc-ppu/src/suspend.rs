//! Suspend-all coordination between guest threads
//!
//! Guest threads register while they execute and park at checkpoints when
//! another thread asks for exclusive access. The heaviest store-conditional
//! strategy uses this to commit with every other guest thread stopped.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

thread_local! {
    /// Controller this host thread is registered with, and the nesting depth
    static ENTERED: Cell<(usize, u32)> = const { Cell::new((0, 0)) };
}

#[derive(Debug, Default)]
struct SuspendState {
    /// A requester currently owns the suspension
    owned: bool,
    /// Registered threads that are not parked
    active: usize,
}

/// Suspend-all controller shared by every guest thread of a process
#[derive(Debug, Default)]
pub struct GlobalSuspend {
    state: Mutex<SuspendState>,
    cond: Condvar,
    pending: AtomicBool,
}

impl GlobalSuspend {
    pub fn new() -> Self {
        Self::default()
    }

    fn id(&self) -> usize {
        self as *const Self as usize
    }

    fn is_entered(&self) -> bool {
        ENTERED.with(|e| e.get().0 == self.id() && e.get().1 > 0)
    }

    /// Register the calling host thread as an executing guest thread
    pub fn enter(&self) -> ActiveGuard<'_> {
        let (owner, depth) = ENTERED.with(|e| e.get());
        if owner == self.id() && depth > 0 {
            ENTERED.with(|e| e.set((owner, depth + 1)));
            return ActiveGuard { suspend: self };
        }

        let mut state = self.state.lock();
        while state.owned {
            self.cond.wait(&mut state);
        }
        state.active += 1;
        ENTERED.with(|e| e.set((self.id(), 1)));
        ActiveGuard { suspend: self }
    }

    /// Number of registered threads that are not parked
    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    /// Suspension requested or in progress
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Park the caller while another thread holds the suspension
    #[inline]
    pub fn checkpoint(&self) {
        if !self.is_pending() || !self.is_entered() {
            return;
        }
        let mut state = self.state.lock();
        if !state.owned {
            return;
        }
        state.active -= 1;
        self.cond.notify_all();
        while state.owned {
            self.cond.wait(&mut state);
        }
        state.active += 1;
    }

    /// Stop every other registered thread at its next checkpoint
    ///
    /// The caller leaves the active set while it waits, so two threads
    /// requesting at once serialize instead of waiting on each other.
    pub fn suspend_others(&self) -> SuspendGuard<'_> {
        let registered = self.is_entered();
        let mut state = self.state.lock();
        if registered {
            state.active -= 1;
            self.cond.notify_all();
        }
        while state.owned {
            self.cond.wait(&mut state);
        }
        state.owned = true;
        self.pending.store(true, Ordering::Release);
        while state.active > 0 {
            self.cond.wait(&mut state);
        }
        tracing::trace!(target: "reservation", "all guest threads suspended");
        SuspendGuard {
            suspend: self,
            registered,
        }
    }

    /// Leave the active set for the guard's lifetime, for blocking waits
    pub fn idle(&self) -> IdleGuard<'_> {
        let registered = self.is_entered();
        if registered {
            let mut state = self.state.lock();
            state.active -= 1;
            self.cond.notify_all();
        }
        IdleGuard {
            suspend: self,
            registered,
        }
    }

    fn rejoin(&self) {
        let mut state = self.state.lock();
        while state.owned {
            self.cond.wait(&mut state);
        }
        state.active += 1;
    }
}

/// Registration of an executing guest thread
pub struct ActiveGuard<'a> {
    suspend: &'a GlobalSuspend,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let (owner, depth) = ENTERED.with(|e| e.get());
        if depth > 1 {
            ENTERED.with(|e| e.set((owner, depth - 1)));
            return;
        }
        ENTERED.with(|e| e.set((0, 0)));
        let mut state = self.suspend.state.lock();
        state.active -= 1;
        self.suspend.cond.notify_all();
    }
}

/// Exclusive suspension; other threads resume when it drops
pub struct SuspendGuard<'a> {
    suspend: &'a GlobalSuspend,
    registered: bool,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.suspend.state.lock();
        state.owned = false;
        self.suspend.pending.store(false, Ordering::Release);
        if self.registered {
            state.active += 1;
        }
        self.suspend.cond.notify_all();
    }
}

/// Temporary absence from the active set
pub struct IdleGuard<'a> {
    suspend: &'a GlobalSuspend,
    registered: bool,
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        if self.registered {
            self.suspend.rejoin();
        }
    }
}
