//! Counting semaphore built from a mutex and a condition variable.

use parking_lot::Condvar;

use super::Mutex;

#[derive(Debug)]
pub struct Semaphore {
    count: Mutex<i32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: i32) -> Self {
        Semaphore {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn with_name(name: &str, initial: i32) -> Self {
        Semaphore {
            count: Mutex::with_name(name, initial),
            cond: Condvar::new(),
        }
    }

    /// Block until the count is positive, then take one unit.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            count.wait_on(&self.cond);
        }
        *count -= 1;
    }

    /// Add `n` units; a single unit signals one waiter, more broadcast.
    pub fn post(&self, n: i32) {
        let mut count = self.count.lock();
        *count += n;
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }
}
