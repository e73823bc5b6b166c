//! In-memory file cache.
//!
//! Entries are keyed by path and validated by the `(mtime, size, dev,
//! ino)` tuple; a mismatch replaces the entry before use. One thread
//! reads a missing file while others wait on the cache condition. The
//! cache is size-bounded with least-recently-used eviction; entries
//! being streamed stay alive through their `Arc`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Condvar;
use tracing::debug;

use alder_base::Mutex;

use crate::FileInfo;

/// One cached file body plus the identity it was read under.
#[derive(Debug)]
pub struct FileEntry {
    pub info: FileInfo,
    pub bytes: Vec<u8>,
}

enum Slot {
    /// A thread is reading the file.
    Loading,
    Ready { entry: Arc<FileEntry>, last_used: u64 },
}

struct CacheState {
    slots: HashMap<PathBuf, Slot>,
    total_bytes: usize,
    use_counter: u64,
}

/// Point-in-time counters for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
}

pub struct FileCache {
    state: Mutex<CacheState>,
    cond: Condvar,
    max_size: usize,
}

impl FileCache {
    pub fn new(max_size: usize) -> Self {
        FileCache {
            state: Mutex::with_name("fastpath:cache", CacheState {
                slots: HashMap::new(),
                total_bytes: 0,
                use_counter: 0,
            }),
            cond: Condvar::new(),
            max_size,
        }
    }

    /// Fetch a valid entry, loading the file with `read` on miss.
    ///
    /// `read` runs outside the cache lock in exactly one thread per
    /// path; concurrent callers wait for the published entry.
    pub fn get(
        &self,
        path: &Path,
        info: FileInfo,
        read: impl FnOnce() -> std::io::Result<Vec<u8>>,
    ) -> std::io::Result<Arc<FileEntry>> {
        enum Action {
            Wait,
            Hit,
            Replace(usize),
            Load,
        }

        let mut state = self.state.lock();
        loop {
            let action = match state.slots.get(path) {
                Some(Slot::Loading) => Action::Wait,
                Some(Slot::Ready { entry, .. }) => {
                    if entry.info.same_identity(&info) {
                        Action::Hit
                    } else {
                        Action::Replace(entry.bytes.len())
                    }
                }
                None => Action::Load,
            };
            match action {
                Action::Wait => state.wait_on(&self.cond),
                Action::Hit => {
                    state.use_counter += 1;
                    let counter = state.use_counter;
                    let Some(Slot::Ready { entry, last_used }) = state.slots.get_mut(path) else {
                        unreachable!()
                    };
                    *last_used = counter;
                    return Ok(Arc::clone(entry));
                }
                Action::Replace(stale_len) => {
                    state.total_bytes -= stale_len;
                    state.slots.insert(path.to_path_buf(), Slot::Loading);
                    break;
                }
                Action::Load => {
                    state.slots.insert(path.to_path_buf(), Slot::Loading);
                    break;
                }
            }
        }
        drop(state);

        let loaded = read();
        let mut state = self.state.lock();
        let result = match loaded {
            Ok(bytes) => {
                let entry = Arc::new(FileEntry { info, bytes });
                state.total_bytes += entry.bytes.len();
                state.use_counter += 1;
                let counter = state.use_counter;
                state.slots.insert(
                    path.to_path_buf(),
                    Slot::Ready {
                        entry: Arc::clone(&entry),
                        last_used: counter,
                    },
                );
                evict(&mut state, self.max_size, path);
                Ok(entry)
            }
            Err(e) => {
                state.slots.remove(path);
                Err(e)
            }
        };
        self.cond.notify_all();
        result
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.slots.len(),
            total_bytes: state.total_bytes,
        }
    }

    /// Drop a cached entry, if present.
    pub fn flush(&self, path: &Path) {
        let mut state = self.state.lock();
        if let Some(Slot::Ready { entry, .. }) = state.slots.remove(path) {
            state.total_bytes -= entry.bytes.len();
        }
        self.cond.notify_all();
    }
}

fn evict(state: &mut CacheState, max_size: usize, keep: &Path) {
    while state.total_bytes > max_size && state.slots.len() > 1 {
        let victim = state
            .slots
            .iter()
            .filter_map(|(path, slot)| match slot {
                Slot::Ready { last_used, .. } if path.as_path() != keep => {
                    Some((path.clone(), *last_used))
                }
                _ => None,
            })
            .min_by_key(|(_, last_used)| *last_used)
            .map(|(path, _)| path);
        let Some(victim) = victim else {
            break;
        };
        if let Some(Slot::Ready { entry, .. }) = state.slots.remove(&victim) {
            state.total_bytes -= entry.bytes.len();
            debug!(path = %victim.display(), "evicted fastpath cache entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn info(size: u64, mtime: i64) -> FileInfo {
        FileInfo {
            mtime_sec: mtime,
            ctime_sec: mtime,
            size,
            dev: 1,
            ino: 42,
            is_file: true,
            is_dir: false,
        }
    }

    #[test]
    fn loads_once_and_reuses() {
        let cache = FileCache::new(1 << 20);
        let reads = AtomicUsize::new(0);
        let path = Path::new("/x/y");
        for _ in 0..3 {
            let entry = cache
                .get(path, info(3, 100), || {
                    reads.fetch_add(1, Ordering::SeqCst);
                    Ok(b"abc".to_vec())
                })
                .unwrap();
            assert_eq!(entry.bytes, b"abc");
        }
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn identity_mismatch_replaces_the_entry() {
        let cache = FileCache::new(1 << 20);
        let path = Path::new("/x/y");
        cache.get(path, info(3, 100), || Ok(b"old".to_vec())).unwrap();
        let entry = cache
            .get(path, info(3, 200), || Ok(b"new".to_vec()))
            .unwrap();
        assert_eq!(entry.bytes, b"new");
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.stats().total_bytes, 3);
    }

    #[test]
    fn eviction_honors_the_size_bound() {
        let cache = FileCache::new(10);
        cache
            .get(Path::new("/a"), info(6, 1), || Ok(vec![0u8; 6]))
            .unwrap();
        cache
            .get(Path::new("/b"), info(6, 1), || Ok(vec![0u8; 6]))
            .unwrap();
        let stats = cache.stats();
        assert!(stats.total_bytes <= 10, "stats {stats:?}");
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn failed_loads_leave_no_entry() {
        let cache = FileCache::new(1 << 20);
        let path = Path::new("/gone");
        let err = cache.get(path, info(1, 1), || {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))
        });
        assert!(err.is_err());
        assert_eq!(cache.stats().entries, 0);
    }
}
