//! Reentrant critical section.
//!
//! A mutex plus the owning thread id and a nesting depth. Threads that
//! find the section owned by another thread wait on a condition variable
//! until ownership is released.

use std::thread::ThreadId;

use parking_lot::Condvar;

use super::Mutex;

#[derive(Debug, Default)]
struct CsState {
    owner: Option<ThreadId>,
    depth: u32,
}

#[derive(Debug)]
pub struct CritSec {
    state: Mutex<CsState>,
    cond: Condvar,
}

impl CritSec {
    pub fn new() -> Self {
        CritSec {
            state: Mutex::new(CsState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn with_name(name: &str) -> Self {
        CritSec {
            state: Mutex::with_name(name, CsState::default()),
            cond: Condvar::new(),
        }
    }

    /// Enter the section, blocking while another thread owns it.
    /// Reentry from the owning thread only bumps the nesting depth.
    pub fn enter(&self) -> CritSecGuard<'_> {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            state.depth += 1;
        } else {
            while state.owner.is_some() {
                state.wait_on(&self.cond);
            }
            state.owner = Some(me);
            state.depth = 1;
        }
        CritSecGuard { section: self }
    }

    fn leave(&self) {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        debug_assert_eq!(state.owner, Some(me), "leaving a section we do not own");
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.cond.notify_one();
        }
    }
}

impl Default for CritSec {
    fn default() -> Self {
        CritSec::new()
    }
}

/// Releases one nesting level on drop.
#[derive(Debug)]
pub struct CritSecGuard<'a> {
    section: &'a CritSec,
}

impl<'a> Drop for CritSecGuard<'a> {
    fn drop(&mut self) {
        self.section.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn reentry_from_owner_does_not_deadlock() {
        let cs = CritSec::new();
        let outer = cs.enter();
        let inner = cs.enter();
        drop(inner);
        drop(outer);
    }

    #[test]
    fn excludes_other_threads_until_fully_released() {
        let cs = Arc::new(CritSec::new());
        let outer = cs.enter();
        let inner = cs.enter();

        let cs2 = Arc::clone(&cs);
        let entered = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let entered2 = Arc::clone(&entered);
        let t = std::thread::spawn(move || {
            let _g = cs2.enter();
            entered2.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(20));
        assert!(!entered.load(std::sync::atomic::Ordering::SeqCst));
        drop(inner);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!entered.load(std::sync::atomic::Ordering::SeqCst));
        drop(outer);
        t.join().unwrap();
        assert!(entered.load(std::sync::atomic::Ordering::SeqCst));
    }
}
