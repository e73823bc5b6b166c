//! Foundation layer for the alder server runtime.
//!
//! Provides the microsecond-resolution [`Time`] type used by every timed
//! wait in the tree, instrumented lock primitives that register themselves
//! in a process-wide table, per-thread storage slots with ordered cleanup,
//! and a pool of reusable temp-file descriptors.

pub mod fdpool;
pub mod sync;
pub mod time;
pub mod tls;

pub use sync::{CritSec, LockSnapshot, Mutex, MutexGuard, RwLock, Semaphore};
pub use time::Time;

/// Abort the process after logging a failed OS operation.
///
/// Higher layers depend on the base primitives never failing silently; the
/// few OS calls that can still fail here are treated as unrecoverable.
pub fn fatal(what: &str, err: impl std::fmt::Display) -> ! {
    tracing::error!(operation = what, error = %err, "fatal OS error");
    eprintln!("alder fatal: {what}: {err}");
    std::process::abort();
}
