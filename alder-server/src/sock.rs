//! Socket scripting interfaces.
//!
//! The connection driver owns the event loop; script-level socket
//! features reach it through these interfaces. This crate defines the
//! contract only; the driver provides the implementation.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{OwnedFd, RawFd};

/// Conditions a registered callback can fire on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockEvent {
    Readable,
    Writable,
    Exception,
    /// The driver is shutting the callback down.
    Exit,
}

/// Callback invoked by the driver; returning false unregisters it.
pub type SockProc = Box<dyn FnMut(RawFd, SockEvent) -> bool + Send>;

/// Completion callback for an asynchronous name lookup.
pub type DnsCallback = Box<dyn FnOnce(io::Result<Vec<IpAddr>>) + Send>;

/// Callback receiving accepted connections from a listening socket.
pub type AcceptProc = Box<dyn FnMut(OwnedFd, SocketAddr) + Send>;

/// Event-loop services the driver exposes to script bindings.
pub trait SockCallbackDriver: Send + Sync {
    /// Create a connected socket pair.
    fn socketpair(&self) -> io::Result<(OwnedFd, OwnedFd)>;

    /// Resolve a host name off-thread, invoking `done` with the result.
    fn lookup_async(&self, host: &str, done: DnsCallback);

    /// Watch a descriptor for the given conditions.
    fn register(&self, fd: RawFd, events: &[SockEvent], proc: SockProc) -> io::Result<()>;

    /// Stop watching a descriptor; the callback sees [`SockEvent::Exit`].
    fn unregister(&self, fd: RawFd) -> io::Result<()>;

    /// Listen on an address and hand accepted sockets to `accept`.
    fn listen(&self, addr: SocketAddr, accept: AcceptProc) -> io::Result<()>;
}
