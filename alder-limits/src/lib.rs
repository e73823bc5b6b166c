//! Per-request admission limits.
//!
//! Named [`Limits`] records carry caps for concurrent execution, waiting
//! requests, upload size and timeout, plus live and cumulative counters.
//! They are installed into a per-server URL space by `(method, url
//! pattern)` and resolved per request with longest-prefix matching, an
//! optional filename wildcard on the last segment, and an inheritance
//! flag.

mod urlspace;

pub use urlspace::UrlSpace;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use globset::Glob;
use thiserror::Error;
use tracing::debug;

pub type LimitsResult<T> = Result<T, LimitsError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimitsError {
    #[error("no such limits: {0}")]
    NoSuchLimits(String),

    #[error("invalid pattern {0:?}")]
    BadPattern(String),
}

/// Tunable values of one limits record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitsValues {
    /// Concurrent running requests.
    pub max_run: u64,
    /// Requests allowed to queue behind the running set.
    pub max_wait: u64,
    /// Upload cap in bytes.
    pub max_upload: u64,
    /// Per-request timeout in seconds.
    pub timeout: u64,
}

impl Default for LimitsValues {
    fn default() -> Self {
        // Matches the process-wide defaults installed for servers that
        // configure nothing.
        LimitsValues {
            max_run: 100,
            max_wait: 100,
            max_upload: 10 * 1024 * 1024,
            timeout: 60,
        }
    }
}

/// A named limits record. All counters are atomics so the driver can
/// account admissions without extra locking.
#[derive(Debug)]
pub struct Limits {
    pub name: String,
    max_run: AtomicU64,
    max_wait: AtomicU64,
    max_upload: AtomicU64,
    timeout: AtomicU64,
    nrunning: AtomicU64,
    nwaiting: AtomicU64,
    ndropped: AtomicU64,
    noverflow: AtomicU64,
    ntimeout: AtomicU64,
}

/// Live and cumulative counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitsCounters {
    pub nrunning: u64,
    pub nwaiting: u64,
    pub ndropped: u64,
    pub noverflow: u64,
    pub ntimeout: u64,
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted to run; pair with [`Limits::end_run`].
    Run,
    /// Queued behind the running set; pair with [`Limits::end_wait`].
    Wait,
    /// Rejected, the waiting set is full.
    Dropped,
}

impl Limits {
    pub fn new(name: &str, values: LimitsValues) -> Arc<Self> {
        Arc::new(Limits {
            name: name.to_string(),
            max_run: AtomicU64::new(values.max_run),
            max_wait: AtomicU64::new(values.max_wait),
            max_upload: AtomicU64::new(values.max_upload),
            timeout: AtomicU64::new(values.timeout),
            nrunning: AtomicU64::new(0),
            nwaiting: AtomicU64::new(0),
            ndropped: AtomicU64::new(0),
            noverflow: AtomicU64::new(0),
            ntimeout: AtomicU64::new(0),
        })
    }

    pub fn values(&self) -> LimitsValues {
        LimitsValues {
            max_run: self.max_run.load(Ordering::Relaxed),
            max_wait: self.max_wait.load(Ordering::Relaxed),
            max_upload: self.max_upload.load(Ordering::Relaxed),
            timeout: self.timeout.load(Ordering::Relaxed),
        }
    }

    pub fn set_values(&self, values: LimitsValues) {
        self.max_run.store(values.max_run, Ordering::Relaxed);
        self.max_wait.store(values.max_wait, Ordering::Relaxed);
        self.max_upload.store(values.max_upload, Ordering::Relaxed);
        self.timeout.store(values.timeout, Ordering::Relaxed);
    }

    pub fn counters(&self) -> LimitsCounters {
        LimitsCounters {
            nrunning: self.nrunning.load(Ordering::Relaxed),
            nwaiting: self.nwaiting.load(Ordering::Relaxed),
            ndropped: self.ndropped.load(Ordering::Relaxed),
            noverflow: self.noverflow.load(Ordering::Relaxed),
            ntimeout: self.ntimeout.load(Ordering::Relaxed),
        }
    }

    /// Admission decision for one incoming request.
    pub fn admit(&self) -> Admission {
        loop {
            let running = self.nrunning.load(Ordering::Acquire);
            if running < self.max_run.load(Ordering::Relaxed) {
                if self
                    .nrunning
                    .compare_exchange(running, running + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                return Admission::Run;
            }
            let waiting = self.nwaiting.load(Ordering::Acquire);
            if waiting < self.max_wait.load(Ordering::Relaxed) {
                if self
                    .nwaiting
                    .compare_exchange(waiting, waiting + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                return Admission::Wait;
            }
            self.ndropped.fetch_add(1, Ordering::Relaxed);
            return Admission::Dropped;
        }
    }

    /// A waiting request was promoted to running.
    pub fn promote(&self) {
        self.nwaiting.fetch_sub(1, Ordering::AcqRel);
        self.nrunning.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_run(&self) {
        self.nrunning.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn end_wait(&self) {
        self.nwaiting.fetch_sub(1, Ordering::AcqRel);
    }

    /// Upload size check; oversize bumps the overflow counter.
    pub fn check_upload(&self, content_length: u64) -> bool {
        if content_length > self.max_upload.load(Ordering::Relaxed) {
            self.noverflow.fetch_add(1, Ordering::Relaxed);
            false
        } else {
            true
        }
    }

    pub fn note_timeout(&self) {
        self.ntimeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout.load(Ordering::Relaxed)
    }
}

/// Registry of named limits plus per-server URL spaces.
#[derive(Default)]
pub struct LimitsRegistry {
    named: DashMap<String, Arc<Limits>>,
    spaces: DashMap<String, alder_base::RwLock<UrlSpace>>,
    default: alder_base::Mutex<Option<Arc<Limits>>>,
}

impl LimitsRegistry {
    pub fn new() -> Self {
        LimitsRegistry {
            named: DashMap::new(),
            spaces: DashMap::new(),
            default: alder_base::Mutex::with_name("limits:default", None),
        }
    }

    /// Fetch or create a named limits record.
    pub fn get_or_create(&self, name: &str) -> Arc<Limits> {
        self.named
            .entry(name.to_string())
            .or_insert_with(|| Limits::new(name, LimitsValues::default()))
            .clone()
    }

    pub fn get(&self, name: &str) -> LimitsResult<Arc<Limits>> {
        self.named
            .get(name)
            .map(|entry| entry.clone())
            .ok_or_else(|| LimitsError::NoSuchLimits(name.to_string()))
    }

    /// Names of registered limits, optionally filtered by a glob.
    pub fn list(&self, pattern: Option<&str>) -> LimitsResult<Vec<String>> {
        let matcher = match pattern {
            Some(p) => Some(
                Glob::new(p)
                    .map_err(|_| LimitsError::BadPattern(p.to_string()))?
                    .compile_matcher(),
            ),
            None => None,
        };
        let mut names: Vec<String> = self
            .named
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|name| matcher.as_ref().map(|m| m.is_match(name)).unwrap_or(true))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Update values of a named record, creating it if needed.
    pub fn set(&self, name: &str, values: LimitsValues) -> Arc<Limits> {
        let limits = self.get_or_create(name);
        limits.set_values(values);
        limits
    }

    /// Install a named record into a server's URL space.
    pub fn register(
        &self,
        server: &str,
        name: &str,
        method: &str,
        url: &str,
        noinherit: bool,
    ) -> LimitsResult<Arc<Limits>> {
        let limits = self.get_or_create(name);
        let space = self
            .spaces
            .entry(server.to_string())
            .or_insert_with(|| alder_base::RwLock::with_name("limits:urlspace", UrlSpace::new()));
        space
            .write()
            .insert(method, url, noinherit, Arc::clone(&limits))
            .map_err(|_| LimitsError::BadPattern(url.to_string()))?;
        debug!(server, name, method, url, noinherit, "registered limits");
        Ok(limits)
    }

    /// Resolve the limits for a request, falling back to the process
    /// default.
    pub fn find(&self, server: &str, method: &str, url: &str) -> Arc<Limits> {
        if let Some(space) = self.spaces.get(server) {
            if let Some(limits) = space.read().find(method, url) {
                return limits;
            }
        }
        let mut default = self.default.lock();
        default
            .get_or_insert_with(|| Limits::new("default", LimitsValues::default()))
            .clone()
    }
}
