//! Child process helpers.
//!
//! [`spawn`] forks and execs with redirected stdio. A close-on-exec pipe
//! carries `(step, errno)` back from the child when anything before the
//! exec fails, so the parent can tell a chdir problem from a missing
//! binary. [`wait_for`] wraps waitpid, decoding exits, signals and core
//! dumps.

use std::path::{Path, PathBuf};

use thiserror::Error;

pub type ExecResult<T> = Result<T, ExecError>;

/// Which step of child setup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStep {
    Chdir = 1,
    Dup = 2,
    Exec = 3,
}

impl ChildStep {
    fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(ChildStep::Chdir),
            2 => Some(ChildStep::Dup),
            3 => Some(ChildStep::Exec),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("pipe failed: {0}")]
    Pipe(String),

    #[error("fork failed: {0}")]
    Fork(String),

    #[error("exec {exec}: {step:?} failed in child: errno {errno}")]
    Child {
        exec: PathBuf,
        step: ChildStep,
        errno: i32,
    },

    #[error("exec {exec}: unintelligible status from child")]
    BadChildStatus { exec: PathBuf },

    #[error("argument contains a NUL byte")]
    NulByte,

    #[error("waitpid({0}) failed: {1}")]
    Wait(i32, String),

    #[error("process execution is unsupported on this platform")]
    Unsupported,
}

/// How a waited-on child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(i32),
    Signaled { signal: i32, core_dumped: bool },
}

/// What to run and with which environment.
#[derive(Debug, Default, Clone)]
pub struct SpawnOptions {
    /// Working directory for the child.
    pub dir: Option<PathBuf>,
    /// Descriptor placed on the child's stdin; default inherits.
    pub stdin: Option<std::os::fd::RawFd>,
    /// Descriptor placed on the child's stdout; default inherits.
    pub stdout: Option<std::os::fd::RawFd>,
    /// Environment; `None` inherits the parent's.
    pub env: Option<Vec<(String, String)>>,
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::ffi::CString;
    use std::os::fd::AsRawFd;

    use nix::sys::signal::{signal, SigHandler, Signal};
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{chdir, close, dup, dup2, execve, fork, pipe, ForkResult, Pid};
    use tracing::{error, warn};

    fn cstring(s: &str) -> ExecResult<CString> {
        CString::new(s).map_err(|_| ExecError::NulByte)
    }

    /// Spawn `exec` with `argv`, returning the child's pid.
    ///
    /// `argv` should include the program name as its first element; an
    /// empty list gets the exec path as argv[0].
    pub fn spawn(exec: &Path, argv: &[String], options: &SpawnOptions) -> ExecResult<Pid> {
        let exec_c = cstring(&exec.display().to_string())?;
        let mut argv_c = Vec::with_capacity(argv.len().max(1));
        if argv.is_empty() {
            argv_c.push(exec_c.clone());
        } else {
            for arg in argv {
                argv_c.push(cstring(arg)?);
            }
        }
        let env_pairs: Vec<(String, String)> = match &options.env {
            Some(pairs) => pairs.clone(),
            None => std::env::vars().collect(),
        };
        let mut env_c = Vec::with_capacity(env_pairs.len());
        for (k, v) in &env_pairs {
            env_c.push(cstring(&format!("{k}={v}"))?);
        }

        let (err_read, err_write) = pipe().map_err(|e| ExecError::Pipe(e.to_string()))?;
        crate::set_cloexec(err_write.as_raw_fd());

        // SAFETY: the child runs only async-signal-safe calls before
        // execve or _exit.
        let fork_result = unsafe { fork() };
        match fork_result {
            Err(e) => Err(ExecError::Fork(e.to_string())),
            Ok(ForkResult::Child) => {
                drop(err_read);
                let mut step: i32 = 0;
                let mut errnum: i32 = 0;

                let fdin = options.stdin;
                let fdout = options.stdout;
                let setup = (|| -> Result<(), (i32, nix::errno::Errno)> {
                    if let Some(dir) = &options.dir {
                        chdir(dir.as_path()).map_err(|e| (ChildStep::Chdir as i32, e))?;
                    }
                    // Swap descriptors that would collide with the dup2
                    // targets before redirecting.
                    let mut fdin = fdin;
                    let mut fdout = fdout;
                    if fdin == Some(1) {
                        fdin = Some(dup(1).map_err(|e| (ChildStep::Dup as i32, e))?);
                    }
                    if fdout == Some(0) {
                        fdout = Some(dup(0).map_err(|e| (ChildStep::Dup as i32, e))?);
                    }
                    if let Some(fd) = fdin {
                        if fd != 0 {
                            dup2(fd, 0).map_err(|e| (ChildStep::Dup as i32, e))?;
                            if fd > 2 {
                                let _ = close(fd);
                            }
                        }
                    }
                    if let Some(fd) = fdout {
                        if fd != 1 {
                            dup2(fd, 1).map_err(|e| (ChildStep::Dup as i32, e))?;
                            if fd > 2 {
                                let _ = close(fd);
                            }
                        }
                    }
                    restore_default_signals();
                    for fd in 0..=2 {
                        crate::clear_cloexec(fd);
                    }
                    let err = execve(&exec_c, &argv_c, &env_c)
                        .map_err(|e| (ChildStep::Exec as i32, e));
                    // Reached only when execve failed.
                    err.map(|_| ())
                })();

                if let Err((failed_step, errno)) = setup {
                    step = failed_step;
                    errnum = errno as i32;
                }
                let mut payload = [0u8; 8];
                payload[..4].copy_from_slice(&step.to_ne_bytes());
                payload[4..].copy_from_slice(&errnum.to_ne_bytes());
                let _ = nix::unistd::write(&err_write, &payload);
                unsafe { libc::_exit(1) }
            }
            Ok(ForkResult::Parent { child }) => {
                drop(err_write);
                let mut payload = [0u8; 8];
                let nread = loop {
                    match nix::unistd::read(err_read.as_raw_fd(), &mut payload) {
                        Ok(n) => break n,
                        Err(nix::errno::Errno::EINTR) => continue,
                        Err(e) => {
                            error!(exec = %exec.display(), error = %e,
                                "error reading status from child");
                            break 0;
                        }
                    }
                };
                drop(err_read);

                if nread == 0 {
                    return Ok(child);
                }
                // The child reported a failure; reap it and decode.
                let _ = waitpid(child, None);
                if nread != 8 {
                    return Err(ExecError::BadChildStatus {
                        exec: exec.to_path_buf(),
                    });
                }
                let step = i32::from_ne_bytes(payload[..4].try_into().unwrap_or([0; 4]));
                let errno = i32::from_ne_bytes(payload[4..].try_into().unwrap_or([0; 4]));
                match ChildStep::from_code(step) {
                    Some(step) => {
                        error!(exec = %exec.display(), ?step, errno, "child setup failed");
                        Err(ExecError::Child {
                            exec: exec.to_path_buf(),
                            step,
                            errno,
                        })
                    }
                    None => Err(ExecError::BadChildStatus {
                        exec: exec.to_path_buf(),
                    }),
                }
            }
        }
    }

    /// Wait for a child, looping over EINTR, and decode its status.
    pub fn wait_for(pid: Pid) -> ExecResult<WaitOutcome> {
        loop {
            match waitpid(pid, None) {
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(ExecError::Wait(pid.as_raw(), e.to_string())),
                Ok(WaitStatus::Signaled(_, sig, core_dumped)) => {
                    error!(pid = pid.as_raw(), signal = %sig, core_dumped,
                        "process killed by signal");
                    return Ok(WaitOutcome::Signaled {
                        signal: sig as i32,
                        core_dumped,
                    });
                }
                Ok(WaitStatus::Exited(_, code)) => {
                    if code != 0 {
                        warn!(pid = pid.as_raw(), code, "process exited with nonzero code");
                    }
                    return Ok(WaitOutcome::Exited(code));
                }
                Ok(_) => continue,
            }
        }
    }

    fn restore_default_signals() {
        for sig in [
            Signal::SIGHUP,
            Signal::SIGINT,
            Signal::SIGTERM,
            Signal::SIGPIPE,
            Signal::SIGUSR1,
            Signal::SIGUSR2,
            Signal::SIGCHLD,
        ] {
            // SAFETY: resetting dispositions to their defaults.
            let _ = unsafe { signal(sig, SigHandler::SigDfl) };
        }
    }
}

#[cfg(unix)]
pub use unix::{spawn, wait_for};
#[cfg(unix)]
pub use nix::unistd::Pid;

#[cfg(unix)]
fn set_cloexec(fd: std::os::fd::RawFd) {
    // SAFETY: plain fcntl on a descriptor we just created.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
}

#[cfg(unix)]
fn clear_cloexec(fd: std::os::fd::RawFd) {
    // SAFETY: as above.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
        }
    }
}
