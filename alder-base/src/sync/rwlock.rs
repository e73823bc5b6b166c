//! Instrumented reader/writer lock.
//!
//! Built on the writer-preferring parking_lot primitive. Read and write
//! acquisitions are counted separately; hold time is tracked for write
//! locks only, since writes are exclusive.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{register, LockKind, LockStats};
use crate::time::Time;

#[derive(Debug)]
pub struct RwLock<T: ?Sized> {
    stats: Arc<LockStats>,
    inner: parking_lot::RwLock<T>,
}

impl<T> RwLock<T> {
    pub fn new(value: T) -> Self {
        RwLock {
            stats: register(LockKind::RwLock, None),
            inner: parking_lot::RwLock::new(value),
        }
    }

    pub fn with_name(name: &str, value: T) -> Self {
        RwLock {
            stats: register(LockKind::RwLock, Some(name)),
            inner: parking_lot::RwLock::new(value),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    pub fn set_name(&self, prefix: &str) {
        self.stats.set_name(prefix, None);
    }

    pub fn set_name2(&self, prefix: &str, suffix: &str) {
        self.stats.set_name(prefix, Some(suffix));
    }

    pub fn name(&self) -> String {
        self.stats.name.lock().clone()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let start = Time::now();
        let guard = match self.inner.try_read() {
            Some(guard) => guard,
            None => {
                let guard = self.inner.read();
                self.stats.nbusy.fetch_add(1, Ordering::Relaxed);
                let (waited, _) = Time::diff(Time::now(), start);
                self.stats.record_wait(waited);
                guard
            }
        };
        self.stats.nlock.fetch_add(1, Ordering::Relaxed);
        self.stats.nrlock.fetch_add(1, Ordering::Relaxed);
        RwLockReadGuard { inner: guard }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let start = Time::now();
        let guard = match self.inner.try_write() {
            Some(guard) => guard,
            None => {
                let guard = self.inner.write();
                self.stats.nbusy.fetch_add(1, Ordering::Relaxed);
                let (waited, _) = Time::diff(Time::now(), start);
                self.stats.record_wait(waited);
                guard
            }
        };
        self.stats.nlock.fetch_add(1, Ordering::Relaxed);
        self.stats.nwlock.fetch_add(1, Ordering::Relaxed);
        RwLockWriteGuard {
            inner: Some(guard),
            stats: &self.stats,
            acquired: start,
        }
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let guard = self.inner.try_read()?;
        self.stats.nlock.fetch_add(1, Ordering::Relaxed);
        self.stats.nrlock.fetch_add(1, Ordering::Relaxed);
        Some(RwLockReadGuard { inner: guard })
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        let start = Time::now();
        let guard = self.inner.try_write()?;
        self.stats.nlock.fetch_add(1, Ordering::Relaxed);
        self.stats.nwlock.fetch_add(1, Ordering::Relaxed);
        Some(RwLockWriteGuard {
            inner: Some(guard),
            stats: &self.stats,
            acquired: start,
        })
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        RwLock::new(T::default())
    }
}

#[derive(Debug)]
pub struct RwLockReadGuard<'a, T: ?Sized> {
    inner: parking_lot::RwLockReadGuard<'a, T>,
}

impl<'a, T: ?Sized> Deref for RwLockReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

#[derive(Debug)]
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    inner: Option<parking_lot::RwLockWriteGuard<'a, T>>,
    stats: &'a Arc<LockStats>,
    acquired: Time,
}

impl<'a, T: ?Sized> Deref for RwLockWriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.inner.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<'a, T: ?Sized> DerefMut for RwLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<'a, T: ?Sized> Drop for RwLockWriteGuard<'a, T> {
    fn drop(&mut self) {
        drop(self.inner.take());
        let (held, _) = Time::diff(Time::now(), self.acquired);
        self.stats.record_hold(held);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share_writers_exclude() {
        let l = RwLock::new(5u32);
        let r1 = l.read();
        let r2 = l.read();
        assert_eq!(*r1 + *r2, 10);
        assert!(l.try_write().is_none());
        drop((r1, r2));
        *l.write() = 7;
        assert_eq!(*l.read(), 7);
    }

    #[test]
    fn counters_split_read_and_write() {
        let l = RwLock::with_name("rw-test", 0u8);
        drop(l.read());
        drop(l.read());
        drop(l.write());
        assert_eq!(l.stats.nrlock.load(Ordering::Relaxed), 2);
        assert_eq!(l.stats.nwlock.load(Ordering::Relaxed), 1);
        assert_eq!(l.stats.nlock.load(Ordering::Relaxed), 3);
    }
}
