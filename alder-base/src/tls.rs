//! Per-thread storage slots with ordered cleanup.
//!
//! Slot ids are assigned process-wide and monotonically; allocation past
//! [`MAX_TLS`] aborts. Thread cleanup runs the registered cleanup
//! callbacks in LIFO slot order and re-sweeps up to five passes, so a
//! destructor that repopulates a slot still gets its value released.

use std::any::Any;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

/// Fixed number of per-thread slots.
pub const MAX_TLS: usize = 100;

/// Passes over the slot table during thread cleanup.
const CLEANUP_PASSES: usize = 5;

type Value = Box<dyn Any + Send>;
type Cleanup = Arc<dyn Fn(Value) + Send + Sync>;

static NEXT_KEY: AtomicUsize = AtomicUsize::new(0);

static CLEANUPS: Lazy<parking_lot::Mutex<Vec<Option<Cleanup>>>> =
    Lazy::new(|| parking_lot::Mutex::new(vec![None; MAX_TLS]));

thread_local! {
    static SLOTS: RefCell<Vec<Option<Value>>> = RefCell::new({
        let mut v = Vec::with_capacity(MAX_TLS);
        v.resize_with(MAX_TLS, || None);
        v
    });
}

/// A typed handle to one per-thread slot.
#[derive(Debug, Clone, Copy)]
pub struct Tls<T: Send + 'static> {
    key: usize,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: Send + 'static> Tls<T> {
    /// Allocate a slot with no cleanup callback.
    pub fn alloc() -> Self {
        Self::alloc_slot(None)
    }

    /// Allocate a slot whose values are handed to `cleanup` at thread exit.
    pub fn alloc_with_cleanup(cleanup: impl Fn(Box<T>) + Send + Sync + 'static) -> Self {
        let erased: Cleanup = Arc::new(move |value: Value| match value.downcast::<T>() {
            Ok(v) => cleanup(v),
            Err(_) => tracing::error!("tls cleanup saw a value of the wrong type"),
        });
        Self::alloc_slot(Some(erased))
    }

    fn alloc_slot(cleanup: Option<Cleanup>) -> Self {
        let key = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
        if key >= MAX_TLS {
            crate::fatal("tls alloc", format!("slot limit {MAX_TLS} exceeded"));
        }
        CLEANUPS.lock()[key] = cleanup;
        Tls {
            key,
            _marker: PhantomData,
        }
    }

    /// Store a value for the calling thread, dropping any previous one.
    pub fn set(&self, value: T) {
        SLOTS.with(|slots| {
            slots.borrow_mut()[self.key] = Some(Box::new(value));
        });
    }

    /// Run `f` with the calling thread's value, if any.
    pub fn with<R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            let value = slots[self.key].as_mut().and_then(|v| v.downcast_mut::<T>());
            f(value)
        })
    }

    /// Remove and return the calling thread's value.
    pub fn take(&self) -> Option<Box<T>> {
        SLOTS.with(|slots| {
            slots.borrow_mut()[self.key]
                .take()
                .and_then(|v| v.downcast::<T>().ok())
        })
    }
}

/// Run slot cleanups for the calling thread.
///
/// Worker threads call this on their way out. Slots are swept from the
/// highest key down; a cleanup that stores into another slot triggers
/// another pass, up to [`CLEANUP_PASSES`] total.
pub fn cleanup_thread() {
    for _ in 0..CLEANUP_PASSES {
        let mut again = false;
        for key in (0..MAX_TLS).rev() {
            let value = SLOTS.with(|slots| slots.borrow_mut()[key].take());
            if let Some(value) = value {
                again = true;
                let cleanup = CLEANUPS.lock()[key].clone();
                if let Some(cleanup) = cleanup {
                    cleanup(value);
                }
            }
        }
        if !again {
            break;
        }
    }
}
