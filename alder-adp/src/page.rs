//! Shared template pages and the server-wide page cache.
//!
//! Pages are keyed by normalized absolute path. A page is valid while the
//! file's `(mtime, size, dev, ino)` tuple and the parse flags match; a
//! stale or missing entry is re-read and re-parsed by exactly one thread
//! while others wait on the page condition.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Condvar;
use tracing::debug;

use alder_base::{Mutex, Time};

use crate::code::AdpCode;
use crate::{AdpError, AdpResult};

/// Attempts to re-read a file that keeps changing under us.
const READ_RETRIES: u32 = 10;

/// Filesystem identity of a parsed page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
    pub size: u64,
    pub dev: u64,
    pub ino: u64,
}

impl FileStat {
    pub fn of(md: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            FileStat {
                mtime_sec: md.mtime(),
                mtime_nsec: md.mtime_nsec() as u32,
                size: md.len(),
                dev: md.dev(),
                ino: md.ino(),
            }
        }
        #[cfg(not(unix))]
        {
            let mtime = md
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .unwrap_or_default();
            FileStat {
                mtime_sec: mtime.as_secs() as i64,
                mtime_nsec: mtime.subsec_nanos(),
                size: md.len(),
                dev: 0,
                ino: 0,
            }
        }
    }
}

/// A rendered-output cache entry attached to a page.
#[derive(Debug)]
pub struct AdpCache {
    pub expires: Time,
    pub code: AdpCode,
}

/// Mutable page state guarded by the page-cache lock.
#[derive(Debug, Default)]
pub struct PageDyn {
    /// A thread is rebuilding the result cache.
    pub locked: bool,
    pub cache: Option<Arc<AdpCache>>,
    pub cache_gen: u64,
    pub evals: u64,
}

/// A parsed template plus its filesystem identity.
#[derive(Debug)]
pub struct Page {
    pub path: PathBuf,
    pub stat: FileStat,
    /// Parse-relevant flag subset; part of the page identity.
    pub parse_key: u8,
    pub code: AdpCode,
    pub dynamic: parking_lot::Mutex<PageDyn>,
    /// Signals result-cache rebuild completion.
    pub cache_cond: Condvar,
}

impl Page {
    pub fn new(path: PathBuf, stat: FileStat, parse_key: u8, code: AdpCode) -> Arc<Self> {
        Arc::new(Page {
            path,
            stat,
            parse_key,
            code,
            dynamic: parking_lot::Mutex::new(PageDyn::default()),
            cache_cond: Condvar::new(),
        })
    }
}

/// Server-wide cache of shared pages.
///
/// A `None` slot marks a read/parse in progress; concurrent readers wait
/// on the condition until the parser publishes or fails.
pub struct PageCache {
    map: Mutex<HashMap<PathBuf, Option<Arc<Page>>>>,
    cond: Condvar,
}

impl PageCache {
    pub fn new() -> Self {
        PageCache {
            map: Mutex::with_name("adp:pages", HashMap::new()),
            cond: Condvar::new(),
        }
    }

    /// Fetch a valid page, parsing it if absent or stale.
    ///
    /// `parse` runs outside the cache lock in exactly one thread per
    /// page; other callers wait for the published result.
    pub fn get(
        &self,
        path: &Path,
        stat: FileStat,
        parse_key: u8,
        parse: impl FnOnce() -> AdpResult<Arc<Page>>,
    ) -> AdpResult<Arc<Page>> {
        let mut map = self.map.lock();
        loop {
            match map.get(path) {
                Some(None) => {
                    // Another thread is reading/parsing this page.
                    map.wait_on(&self.cond);
                }
                Some(Some(page)) => {
                    if page.stat == stat && page.parse_key == parse_key {
                        return Ok(Arc::clone(page));
                    }
                    debug!(path = %path.display(), "shared page stale; re-parsing");
                    map.insert(path.to_path_buf(), None);
                    break;
                }
                None => {
                    map.insert(path.to_path_buf(), None);
                    break;
                }
            }
        }
        drop(map);

        let parsed = parse();
        let mut map = self.map.lock();
        let result = match parsed {
            Ok(page) => {
                map.insert(path.to_path_buf(), Some(Arc::clone(&page)));
                Ok(page)
            }
            Err(e) => {
                map.remove(path);
                Err(e)
            }
        };
        self.cond.notify_all();
        result
    }

    /// Drop a cached page, if present.
    pub fn flush(&self, path: &Path) {
        self.map.lock().remove(path);
        self.cond.notify_all();
    }
}

impl Default for PageCache {
    fn default() -> Self {
        PageCache::new()
    }
}

/// Read a whole file, retrying while it changes size underneath us.
pub fn read_file(path: &Path) -> AdpResult<(String, FileStat)> {
    let file_err = |op: &'static str, e: std::io::Error| AdpError::File {
        op,
        path: path.display().to_string(),
        detail: e.to_string(),
    };

    let mut f = File::open(path).map_err(|e| file_err("open", e))?;
    for _ in 0..READ_RETRIES {
        let md = f.metadata().map_err(|e| file_err("stat", e))?;
        let size = md.len() as usize;
        let mut buf = Vec::with_capacity(size + 1);
        f.read_to_end(&mut buf).map_err(|e| file_err("read", e))?;
        if buf.len() == size {
            let text = String::from_utf8_lossy(&buf).into_owned();
            return Ok((text, FileStat::of(&md)));
        }
        // The file is growing or shrinking; rewind and try again.
        f.seek(SeekFrom::Start(0)).map_err(|e| file_err("seek", e))?;
        std::thread::yield_now();
    }
    Err(AdpError::InconsistentFile(path.display().to_string()))
}
