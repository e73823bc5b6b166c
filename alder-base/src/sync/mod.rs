//! Instrumented thread primitives.
//!
//! Every named primitive registers itself in a process-wide table guarded
//! by the reentrant master lock, and carries counters for contended
//! acquisitions, waiting time and hold time. The table can be walked for
//! diagnostics without touching the primitives themselves.

mod critsec;
mod mutex;
mod rwlock;
mod semaphore;

pub use critsec::{CritSec, CritSecGuard};
pub use mutex::{Condvar, Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::Semaphore;

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::time::Time;

/// Upper bound on primitive names, matching the thread-name limit.
pub const NAME_SIZE: usize = 64;

/// Process-wide toggle for logging long waits and holds.
static LOCK_TRACE: AtomicBool = AtomicBool::new(false);

/// Enable or disable wait/hold tracing for all locks.
pub fn set_lock_trace(enabled: bool) {
    LOCK_TRACE.store(enabled, Ordering::Relaxed);
}

pub(crate) fn lock_trace_enabled() -> bool {
    LOCK_TRACE.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockKind {
    Mutex,
    RwLock,
}

/// Shared statistics block, one per registered primitive.
#[derive(Debug)]
pub(crate) struct LockStats {
    pub id: u64,
    pub kind: LockKind,
    pub name: parking_lot::Mutex<String>,
    pub nlock: AtomicU64,
    pub nbusy: AtomicU64,
    pub nrlock: AtomicU64,
    pub nwlock: AtomicU64,
    pub total_waiting_us: AtomicI64,
    pub max_waiting_us: AtomicI64,
    pub total_lock_us: AtomicI64,
}

impl LockStats {
    fn new(id: u64, kind: LockKind, name: String) -> Self {
        LockStats {
            id,
            kind,
            name: parking_lot::Mutex::new(name),
            nlock: AtomicU64::new(0),
            nbusy: AtomicU64::new(0),
            nrlock: AtomicU64::new(0),
            nwlock: AtomicU64::new(0),
            total_waiting_us: AtomicI64::new(0),
            max_waiting_us: AtomicI64::new(0),
            total_lock_us: AtomicI64::new(0),
        }
    }

    pub(crate) fn record_wait(&self, waited: Time) {
        let us = waited.sec * 1_000_000 + i64::from(waited.usec);
        if us < 0 {
            tracing::warn!(name = %self.name.lock(), "negative lock wait duration");
            return;
        }
        self.total_waiting_us.fetch_add(us, Ordering::Relaxed);
        self.max_waiting_us.fetch_max(us, Ordering::Relaxed);
        if lock_trace_enabled() && us > 100_000 {
            tracing::info!(name = %self.name.lock(), wait_us = us, "slow lock acquisition");
        }
    }

    pub(crate) fn record_hold(&self, held: Time) {
        let us = held.sec * 1_000_000 + i64::from(held.usec);
        self.total_lock_us.fetch_add(us.max(0), Ordering::Relaxed);
        if lock_trace_enabled() && us > 100_000 {
            tracing::info!(name = %self.name.lock(), hold_us = us, "long lock hold");
        }
    }

    pub(crate) fn set_name(&self, prefix: &str, suffix: Option<&str>) {
        let mut name = match suffix {
            Some(s) => format!("{prefix}:{s}"),
            None => prefix.to_string(),
        };
        name.truncate(NAME_SIZE);
        let _master = master_lock();
        *self.name.lock() = name;
    }

    fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            name: self.name.lock().clone(),
            id: self.id,
            nlock: self.nlock.load(Ordering::Relaxed),
            nbusy: self.nbusy.load(Ordering::Relaxed),
            nrlock: self.nrlock.load(Ordering::Relaxed),
            nwlock: self.nwlock.load(Ordering::Relaxed),
            total_wait: us_to_time(self.total_waiting_us.load(Ordering::Relaxed)),
            max_wait: us_to_time(self.max_waiting_us.load(Ordering::Relaxed)),
            total_hold: us_to_time(self.total_lock_us.load(Ordering::Relaxed)),
        }
    }
}

fn us_to_time(us: i64) -> Time {
    Time::new(us / 1_000_000, (us % 1_000_000) as i32)
}

/// Point-in-time view of one registered lock.
#[derive(Debug, Clone)]
pub struct LockSnapshot {
    pub name: String,
    pub id: u64,
    pub nlock: u64,
    pub nbusy: u64,
    pub nrlock: u64,
    pub nwlock: u64,
    pub total_wait: Time,
    pub max_wait: Time,
    pub total_hold: Time,
}

/// Process-wide table of registered primitives. Opaque to callers; held
/// behind the reentrant master lock.
pub struct Registry {
    entries: Vec<Weak<LockStats>>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

static REGISTRY: Lazy<ReentrantMutex<RefCell<Registry>>> =
    Lazy::new(|| ReentrantMutex::new(RefCell::new(Registry { entries: Vec::new() })));

/// Acquire the process master lock.
///
/// The master lock is reentrant so that lazy initialization performed while
/// holding it may take it again.
pub fn master_lock() -> ReentrantMutexGuard<'static, RefCell<Registry>> {
    REGISTRY.lock()
}

pub(crate) fn register(kind: LockKind, name: Option<&str>) -> Arc<LockStats> {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let default_name = match kind {
        LockKind::Mutex => format!("mu{id}"),
        LockKind::RwLock => format!("rw{id}"),
    };
    let mut name = name.map(str::to_string).unwrap_or(default_name);
    name.truncate(NAME_SIZE);
    let stats = Arc::new(LockStats::new(id, kind, name));
    let master = master_lock();
    master.borrow_mut().entries.push(Arc::downgrade(&stats));
    stats
}

/// Walk all registered mutexes under the master lock.
///
/// The callback runs with the master lock held and must not create or
/// destroy primitives.
pub fn for_each_mutex(mut f: impl FnMut(&LockSnapshot)) {
    for_each(LockKind::Mutex, &mut f);
}

/// Walk all registered reader/writer locks under the master lock.
pub fn for_each_rwlock(mut f: impl FnMut(&LockSnapshot)) {
    for_each(LockKind::RwLock, &mut f);
}

fn for_each(kind: LockKind, f: &mut dyn FnMut(&LockSnapshot)) {
    let master = master_lock();
    let mut registry = master.borrow_mut();
    // Drop entries whose primitive is gone while walking.
    registry.entries.retain(|weak| {
        if let Some(stats) = weak.upgrade() {
            if stats.kind == kind {
                f(&stats.snapshot());
            }
            true
        } else {
            false
        }
    });
}
