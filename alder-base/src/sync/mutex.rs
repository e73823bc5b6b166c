//! Instrumented mutex with contention accounting.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::WaitTimeoutResult;

use super::{register, LockKind, LockStats};
use crate::time::Time;

/// Condition variable usable with [`MutexGuard::wait_on`].
pub type Condvar = parking_lot::Condvar;

/// Mutual exclusion lock that records contention, wait time and hold time.
///
/// Locking first attempts a cheap try-acquire; only a contended
/// acquisition blocks and is charged to `nbusy` and the waiting-time
/// counters.
#[derive(Debug)]
pub struct Mutex<T: ?Sized> {
    stats: Arc<LockStats>,
    inner: parking_lot::Mutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex {
            stats: register(LockKind::Mutex, None),
            inner: parking_lot::Mutex::new(value),
        }
    }

    pub fn with_name(name: &str, value: T) -> Self {
        Mutex {
            stats: register(LockKind::Mutex, Some(name)),
            inner: parking_lot::Mutex::new(value),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Rename to `prefix`.
    pub fn set_name(&self, prefix: &str) {
        self.stats.set_name(prefix, None);
    }

    /// Rename to `prefix:suffix`.
    pub fn set_name2(&self, prefix: &str, suffix: &str) {
        self.stats.set_name(prefix, Some(suffix));
    }

    pub fn name(&self) -> String {
        self.stats.name.lock().clone()
    }

    pub fn id(&self) -> u64 {
        self.stats.id
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        use std::sync::atomic::Ordering;

        let start = Time::now();
        let guard = match self.inner.try_lock() {
            Some(guard) => guard,
            None => {
                let guard = self.inner.lock();
                self.stats.nbusy.fetch_add(1, Ordering::Relaxed);
                let (waited, _) = Time::diff(Time::now(), start);
                self.stats.record_wait(waited);
                guard
            }
        };
        self.stats.nlock.fetch_add(1, Ordering::Relaxed);
        MutexGuard {
            inner: Some(guard),
            stats: &self.stats,
            acquired: start,
        }
    }

    /// Non-blocking acquisition; `None` reports contention.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        use std::sync::atomic::Ordering;

        let start = Time::now();
        let guard = self.inner.try_lock()?;
        self.stats.nlock.fetch_add(1, Ordering::Relaxed);
        Some(MutexGuard {
            inner: Some(guard),
            stats: &self.stats,
            acquired: start,
        })
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

/// RAII guard; dropping accumulates hold time.
#[derive(Debug)]
pub struct MutexGuard<'a, T: ?Sized> {
    inner: Option<parking_lot::MutexGuard<'a, T>>,
    stats: &'a Arc<LockStats>,
    acquired: Time,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    /// Block on `cond`, releasing the mutex while waiting.
    pub fn wait_on(&mut self, cond: &Condvar) {
        // The wait itself is uninstrumented; hold time keeps running from
        // the original acquisition like any other long hold.
        cond.wait(self.inner.as_mut().unwrap_or_else(|| unreachable!()));
    }

    /// Block on `cond` with a timeout.
    pub fn wait_on_for(&mut self, cond: &Condvar, timeout: Duration) -> WaitTimeoutResult {
        cond.wait_for(self.inner.as_mut().unwrap_or_else(|| unreachable!()), timeout)
    }
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.inner.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        drop(self.inner.take());
        let (held, _) = Time::diff(Time::now(), self.acquired);
        self.stats.record_hold(held);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc as StdArc;

    #[test]
    fn uncontended_locks_never_count_busy() {
        let m = Mutex::new(0u64);
        for _ in 0..100 {
            *m.lock() += 1;
        }
        assert_eq!(*m.lock(), 100);
        assert_eq!(m.stats.nbusy.load(Ordering::Relaxed), 0);
        assert_eq!(m.stats.nlock.load(Ordering::Relaxed), 101);
    }

    #[test]
    fn contended_lock_counts_busy_and_wait() {
        let m = StdArc::new(Mutex::new(()));
        let g = m.lock();
        let m2 = StdArc::clone(&m);
        let t = std::thread::spawn(move || {
            let _g = m2.lock();
        });
        std::thread::sleep(Duration::from_millis(50));
        drop(g);
        t.join().unwrap();
        assert_eq!(m.stats.nbusy.load(Ordering::Relaxed), 1);
        assert!(m.stats.total_waiting_us.load(Ordering::Relaxed) > 0);
        assert!(
            m.stats.max_waiting_us.load(Ordering::Relaxed)
                <= m.stats.total_waiting_us.load(Ordering::Relaxed)
        );
    }

    #[test]
    fn try_lock_reports_contention() {
        let m = Mutex::new(());
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn set_name2_joins_with_colon() {
        let m = Mutex::new(());
        m.set_name2("pool", "jobs");
        assert_eq!(m.name(), "pool:jobs");
    }

    #[test]
    fn condvar_wait_round_trip() {
        let m = StdArc::new(Mutex::new(false));
        let cv = StdArc::new(Condvar::new());
        let (m2, cv2) = (StdArc::clone(&m), StdArc::clone(&cv));
        let t = std::thread::spawn(move || {
            let mut g = m2.lock();
            while !*g {
                g.wait_on(&cv2);
            }
        });
        std::thread::sleep(Duration::from_millis(20));
        *m.lock() = true;
        cv.notify_all();
        t.join().unwrap();
    }
}
