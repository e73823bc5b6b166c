//! Static file fast path.
//!
//! Resolves request URLs to files, answers conditional GETs, negotiates
//! precompressed gzip variants with on-demand refresh, resolves
//! directory indexes with a query-preserving redirect, and delivers
//! bodies from an in-memory cache, an mmap, or an open descriptor.

mod cache;
mod conn;

pub use cache::{CacheStats, FileCache, FileEntry};
pub use conn::Conn;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, warn};

pub type FastPathResult<T> = Result<T, FastPathError>;

#[derive(Error, Debug)]
pub enum FastPathError {
    #[error("connection i/o failed: {0}")]
    Conn(#[from] std::io::Error),
}

/// Filesystem identity used to validate cached content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub mtime_sec: i64,
    pub ctime_sec: i64,
    pub size: u64,
    pub dev: u64,
    pub ino: u64,
    pub is_file: bool,
    pub is_dir: bool,
}

impl FileInfo {
    pub fn of(md: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            FileInfo {
                mtime_sec: md.mtime(),
                ctime_sec: md.ctime(),
                size: md.len(),
                dev: md.dev(),
                ino: md.ino(),
                is_file: md.is_file(),
                is_dir: md.is_dir(),
            }
        }
        #[cfg(not(unix))]
        {
            let secs = |t: std::io::Result<SystemTime>| {
                t.ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0)
            };
            FileInfo {
                mtime_sec: secs(md.modified()),
                ctime_sec: secs(md.created()),
                size: md.len(),
                dev: 0,
                ino: 0,
                is_file: md.is_file(),
                is_dir: md.is_dir(),
            }
        }
    }

    pub fn stat(path: &Path) -> Option<Self> {
        std::fs::metadata(path).ok().map(|md| FileInfo::of(&md))
    }

    /// The validation tuple: mtime, size, dev and ino.
    pub fn same_identity(&self, other: &FileInfo) -> bool {
        self.mtime_sec == other.mtime_sec
            && self.size == other.size
            && self.dev == other.dev
            && self.ino == other.ino
    }

    fn mtime_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.mtime_sec.max(0) as u64)
    }
}

/// Fast-path tuning, from the `fastpath` configuration section.
#[derive(Debug, Clone)]
pub struct FastPathConfig {
    /// Deliver uncached files through mmap.
    pub mmap: bool,
    /// Serve precompressed `.gz` companions to accepting clients.
    pub gzip_static: bool,
    /// Regenerate stale `.gz` companions on demand.
    pub gzip_refresh: bool,
    /// Command prefix invoked as `cmd... source gzfile` to refresh.
    pub gzip_refresh_cmd: Vec<String>,
    /// Enable the in-memory file cache.
    pub cache: bool,
    /// Total cache bound in bytes.
    pub cachemaxsize: usize,
    /// Largest cacheable file in bytes.
    pub cachemaxentry: usize,
    /// Directory index candidates, in order.
    pub directoryfile: Vec<String>,
    /// Template rendered for directories without an index.
    pub directoryadp: Option<PathBuf>,
    /// Script proc invoked for directories without an index.
    pub directoryproc: Option<String>,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        FastPathConfig {
            mmap: false,
            gzip_static: false,
            gzip_refresh: false,
            gzip_refresh_cmd: Vec::new(),
            cache: true,
            cachemaxsize: 10 * 1024 * 1024,
            cachemaxentry: 8192,
            directoryfile: ["index.adp", "index.tcl", "index.html", "index.htm"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            directoryadp: None,
            directoryproc: Some("_dirlist".to_string()),
        }
    }
}

/// How a dispatch ended. Directory listings are delegated back to the
/// caller, which owns the template engine and script bindings.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// A response was written to the connection.
    Done,
    /// Render the configured directory-listing template for `dir`.
    DirectoryAdp { adp: PathBuf, dir: PathBuf },
    /// Invoke the configured directory-listing proc for `dir`.
    DirectoryProc { proc: String, dir: PathBuf },
}

type UrlToFile = Box<dyn Fn(&str) -> Option<PathBuf> + Send + Sync>;

pub struct FastPath {
    config: FastPathConfig,
    cache: FileCache,
    url_to_file: UrlToFile,
}

impl FastPath {
    pub fn new(config: FastPathConfig, url_to_file: UrlToFile) -> Self {
        let cache = FileCache::new(config.cachemaxsize);
        FastPath {
            config,
            cache,
            url_to_file,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Handle a request for a file URL.
    pub fn dispatch(&self, conn: &mut dyn Conn) -> FastPathResult<Dispatch> {
        if !matches!(conn.method(), "GET" | "HEAD" | "POST") {
            conn.return_not_found()?;
            return Ok(Dispatch::Done);
        }

        let url = conn.url().to_string();
        let Some(path) = (self.url_to_file)(&url) else {
            conn.return_not_found()?;
            return Ok(Dispatch::Done);
        };
        let Some(info) = FileInfo::stat(&path) else {
            conn.return_not_found()?;
            return Ok(Dispatch::Done);
        };

        if info.is_file {
            self.fast_return(conn, 200, None, &path, info)?;
            return Ok(Dispatch::Done);
        }
        if !info.is_dir {
            conn.return_not_found()?;
            return Ok(Dispatch::Done);
        }

        // Directory: look for an index file.
        for candidate in &self.config.directoryfile {
            let index = path.join(candidate);
            let Some(index_info) = FileInfo::stat(&index) else {
                continue;
            };
            if !index_info.is_file {
                continue;
            }
            if !url.ends_with('/') {
                // Redirect so relative links resolve, keeping the query.
                let mut location = format!("{url}/");
                if let Some(query) = conn.query() {
                    location.push('?');
                    location.push_str(query);
                }
                conn.return_redirect(&location)?;
            } else {
                self.fast_return(conn, 200, None, &index, index_info)?;
            }
            return Ok(Dispatch::Done);
        }

        if let Some(adp) = &self.config.directoryadp {
            return Ok(Dispatch::DirectoryAdp {
                adp: adp.clone(),
                dir: path,
            });
        }
        if let Some(proc) = &self.config.directoryproc {
            return Ok(Dispatch::DirectoryProc {
                proc: proc.clone(),
                dir: path,
            });
        }
        conn.return_not_found()?;
        Ok(Dispatch::Done)
    }

    /// Deliver one regular file, honoring conditional and gzip headers.
    pub fn fast_return(
        &self,
        conn: &mut dyn Conn,
        status: u16,
        mime: Option<&str>,
        path: &Path,
        info: FileInfo,
    ) -> FastPathResult<()> {
        let mut path = path.to_path_buf();
        let mut info = info;
        let mime = match mime {
            Some(m) => m.to_string(),
            None => mime_guess::from_path(&path)
                .first_or_octet_stream()
                .to_string(),
        };

        conn.set_response_header("Last-Modified", &httpdate::fmt_http_date(info.mtime_system()));

        if let Some(since) = header_date(conn, "if-modified-since") {
            if info.mtime_sec <= since {
                conn.return_not_modified()?;
                return Ok(());
            }
        }
        if let Some(since) = header_date(conn, "if-unmodified-since") {
            if info.mtime_sec > since {
                conn.return_status(412)?;
                return Ok(());
            }
        }

        if self.config.gzip_static && conn.accepts_gzip() {
            let gz_path = PathBuf::from(format!("{}.gz", path.display()));
            if let Some(mut gz_info) = FileInfo::stat(&gz_path) {
                conn.set_response_header("Vary", "Accept-Encoding");
                if gz_info.mtime_sec < info.mtime_sec && self.config.gzip_refresh {
                    if self.refresh_gzip(&path, &gz_path) {
                        if let Some(fresh) = FileInfo::stat(&gz_path) {
                            gz_info = fresh;
                        }
                    }
                }
                if gz_info.mtime_sec >= info.mtime_sec {
                    conn.set_response_header("Content-Encoding", "gzip");
                    path = gz_path;
                    info = gz_info;
                } else {
                    warn!(gz = %gz_path.display(),
                        "gzip file is older than the uncompressed file");
                }
            }
        }

        if conn.method() == "HEAD" {
            conn.return_no_body(status, &mime, info.size)?;
            return Ok(());
        }

        // Large entries, a disabled cache, or a file changed within one
        // second of the connection's accept go straight from disk.
        let accept_sec = conn.accept_time().sec;
        let bypass = !self.config.cache
            || info.size as usize > self.config.cachemaxentry
            || info.ctime_sec >= accept_sec - 1;
        if bypass {
            return self.send_direct(conn, status, &mime, &path, info);
        }

        let entry = self.cache.get(&path, info, || {
            debug!(path = %path.display(), "fastpath cache miss; reading file");
            let mut file = File::open(&path)?;
            let mut bytes = Vec::with_capacity(info.size as usize);
            file.read_to_end(&mut bytes)?;
            Ok(bytes)
        });
        match entry {
            Ok(entry) => {
                conn.return_data(status, &mime, &entry.bytes)?;
                Ok(())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "fastpath read failed");
                conn.return_not_found()?;
                Ok(())
            }
        }
    }

    fn send_direct(
        &self,
        conn: &mut dyn Conn,
        status: u16,
        mime: &str,
        path: &Path,
        info: FileInfo,
    ) -> FastPathResult<()> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "fastpath open failed");
                conn.return_not_found()?;
                return Ok(());
            }
        };
        if self.config.mmap && info.size > 0 {
            // SAFETY: the mapping is read-only and lives only for the
            // duration of the send.
            match unsafe { memmap2::Mmap::map(&file) } {
                Ok(map) => {
                    conn.return_data(status, mime, &map)?;
                    return Ok(());
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e,
                        "mmap failed; falling back to descriptor send");
                }
            }
        }
        conn.return_open_file(status, mime, file, info.size)?;
        Ok(())
    }

    /// Run the configured helper to regenerate a stale `.gz` companion.
    #[cfg(not(unix))]
    fn refresh_gzip(&self, _source: &Path, _gz: &Path) -> bool {
        false
    }

    /// Run the configured helper to regenerate a stale `.gz` companion.
    #[cfg(unix)]
    fn refresh_gzip(&self, source: &Path, gz: &Path) -> bool {
        let Some(cmd) = self.config.gzip_refresh_cmd.first().cloned() else {
            return false;
        };
        let mut argv = self.config.gzip_refresh_cmd.clone();
        argv.push(source.display().to_string());
        argv.push(gz.display().to_string());
        match alder_exec::spawn(Path::new(&cmd), &argv, &alder_exec::SpawnOptions::default()) {
            Ok(pid) => match alder_exec::wait_for(pid) {
                Ok(alder_exec::WaitOutcome::Exited(0)) => true,
                other => {
                    warn!(?other, "gzip refresh helper failed");
                    false
                }
            },
            Err(e) => {
                warn!(error = %e, "could not spawn gzip refresh helper");
                false
            }
        }
    }
}

fn header_date(conn: &dyn Conn, name: &str) -> Option<i64> {
    let raw = conn.request_header(name)?;
    let parsed = httpdate::parse_http_date(raw.trim()).ok()?;
    parsed
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs() as i64)
}
