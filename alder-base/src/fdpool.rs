//! Pool of reusable temp-file descriptors.
//!
//! Temp files are opened exclusively, unlinked immediately, and recycled
//! through a process-wide LIFO. Returning a descriptor rewinds and
//! truncates it so the next user sees an empty file.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;

use once_cell::sync::Lazy;

use crate::time::Time;

/// Attempts to open a fresh temp file before giving up on `EEXIST`.
const OPEN_RETRIES: u32 = 10;

static POOL: Lazy<parking_lot::Mutex<Vec<File>>> = Lazy::new(|| parking_lot::Mutex::new(Vec::new()));

/// A pooled temp file. Dropping it returns the descriptor to the pool.
#[derive(Debug)]
pub struct TempFd {
    file: Option<File>,
}

impl TempFd {
    pub fn as_file(&self) -> &File {
        self.file.as_ref().unwrap_or_else(|| unreachable!())
    }

    pub fn as_file_mut(&mut self) -> &mut File {
        self.file.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl AsRawFd for TempFd {
    fn as_raw_fd(&self) -> RawFd {
        self.as_file().as_raw_fd()
    }
}

impl Drop for TempFd {
    fn drop(&mut self) {
        if let Some(mut file) = self.file.take() {
            let reset = file.seek(SeekFrom::Start(0)).and_then(|_| file.set_len(0));
            match reset {
                Ok(()) => POOL.lock().push(file),
                Err(e) => {
                    // Close instead of recycling a descriptor in an
                    // unknown state.
                    tracing::warn!(error = %e, "dropping temp fd after failed reset");
                }
            }
        }
    }
}

/// Pop a pooled descriptor, or open a fresh unlinked temp file.
pub fn get_temp() -> io::Result<TempFd> {
    if let Some(file) = POOL.lock().pop() {
        return Ok(TempFd { file: Some(file) });
    }

    let mut last_err = io::Error::new(io::ErrorKind::Other, "no attempt made");
    for _ in 0..OPEN_RETRIES {
        let path = temp_name();
        let opened = open_exclusive(&path);
        match opened {
            Ok(file) => {
                // Unlink right away; the descriptor keeps the file alive.
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to unlink temp file");
                }
                close_on_exec(file.as_raw_fd())?;
                return Ok(TempFd { file: Some(file) });
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                last_err = e;
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

fn temp_name() -> PathBuf {
    let now = Time::now();
    std::env::temp_dir().join(format!("alder-tmp.{}.{}", now.sec, now.usec))
}

#[cfg(unix)]
fn open_exclusive(path: &PathBuf) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_exclusive(path: &PathBuf) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
}

/// Mark a descriptor close-on-exec.
pub fn close_on_exec(fd: RawFd) -> io::Result<()> {
    set_cloexec(fd, true)
}

/// Clear the close-on-exec attribute, for descriptors handed to children.
pub fn no_close_on_exec(fd: RawFd) -> io::Result<()> {
    set_cloexec(fd, false)
}

#[cfg(unix)]
fn set_cloexec(fd: RawFd, enable: bool) -> io::Result<()> {
    // SAFETY: plain fcntl on a caller-supplied descriptor.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if enable {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_cloexec(_fd: RawFd, _enable: bool) -> io::Result<()> {
    Ok(())
}
