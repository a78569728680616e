//! Event-loop contract.
//!
//! Workers, the signal table and the async-threads bridge never drive an
//! event loop themselves. They consume one through this trait:
//!
//! - register a readable-fd callback (`add_reader` / `del`)
//! - queue a next-tick callback (`defer`)
//! - push bytes through the loop's buffered write path (`write`)
//! - add a custom exit condition (`set_exit_condition`)
//!
//! # Implementors
//!
//! - `prefork_runtime::reactor::Reactor` (default): single-threaded poll(2)
//!   loop, one per thread, stored in a thread-local.

use std::os::unix::io::RawFd;

use crate::error::Result;

/// Readable-fd callback. Receives the ready descriptor.
pub type FdHandler = Box<dyn FnMut(RawFd)>;

/// Next-tick callback
pub type Deferred = Box<dyn FnOnce()>;

/// Exit predicate. Receives the number of user-registered fds and returns
/// `true` when the loop may exit as far as this condition is concerned.
pub type ExitCondition = Box<dyn Fn(usize) -> bool>;

/// Keys for the exit-condition table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitKey {
    /// No armed signal handler remains (or signal waiting is disabled)
    SignalListener,
    /// No async task is outstanding
    AsyncThreads,
    /// Application-defined condition
    User(u32),
}

/// Single-threaded reactor consumed by prefork components.
///
/// **Contract:**
/// - Every method is called from the thread that owns the loop.
/// - Callbacks run outside any OS signal context.
/// - `internal` readers do not keep the loop alive on their own.
pub trait EventLoop {
    /// Register `handler` for readability on `fd`
    fn add_reader(&self, fd: RawFd, internal: bool, handler: FdHandler) -> Result<()>;

    /// Remove every registration for `fd`. Unknown fds are ignored.
    fn del(&self, fd: RawFd);

    /// Run `cb` at the start of the next loop iteration
    fn defer(&self, cb: Deferred);

    /// Write through the loop's buffer. Bytes that cannot be written now are
    /// flushed when `fd` becomes writable. Returns the number of bytes accepted.
    fn write(&self, fd: RawFd, data: &[u8]) -> Result<usize>;

    fn set_exit_condition(&self, key: ExitKey, cond: ExitCondition);

    fn isset_exit_condition(&self, key: ExitKey) -> bool;

    fn remove_exit_condition(&self, key: ExitKey);
}
