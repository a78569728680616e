//! Error types shared by every prefork crate

use core::fmt;

/// Result type for prefork operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by workers, queues, signals and the async pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Worker already has a live child process
    AlreadyStarted,

    /// Worker was created without a pipe, or the pipe was closed
    NoPipe,

    /// Worker has no message queue attached
    NoQueue,

    /// Caller passed an argument outside the accepted domain
    InvalidParams(&'static str),

    /// Signal slot is owned by a handler this crate did not install
    AlreadySystemOwned(i32),

    /// Nothing registered to clear or look up
    NotFound,

    /// OS call failed with errno
    Syscall(i32),

    /// Async task was canceled before it ran
    Canceled,

    /// Async task timed out
    Timeout,

    /// fork() failed with errno
    ForkFailed(i32),

    /// Operation is not allowed in the current process/thread state
    WrongOperation(&'static str),

    /// Name resolution failed (getaddrinfo EAI_* code)
    Resolve(i32),
}

impl Error {
    /// errno carried by this error, if any
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Error::Syscall(e) | Error::ForkFailed(e) => Some(*e),
            _ => None,
        }
    }

    /// Build a `Syscall` error from the current thread's errno
    #[inline]
    pub fn last_os() -> Self {
        Error::Syscall(errno())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AlreadyStarted => write!(f, "process has already been started"),
            Error::NoPipe => write!(f, "no pipe"),
            Error::NoQueue => write!(f, "no msgqueue"),
            Error::InvalidParams(what) => write!(f, "invalid params: {}", what),
            Error::AlreadySystemOwned(signo) => {
                write!(f, "signal [{}] processor has been registered by the system", signo)
            }
            Error::NotFound => write!(f, "not found"),
            Error::Syscall(e) => write!(f, "syscall failed: errno {} ({})", e, nix::errno::Errno::from_raw(*e).desc()),
            Error::Canceled => write!(f, "operation canceled"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::ForkFailed(e) => write!(f, "fork() failed: errno {}", e),
            Error::WrongOperation(what) => write!(f, "wrong operation: {}", what),
            Error::Resolve(code) => write!(f, "name resolution failed: code {}", code),
        }
    }
}

impl std::error::Error for Error {}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Syscall(e as i32)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Syscall(e.raw_os_error().unwrap_or(nix::errno::Errno::EIO as i32))
    }
}

/// Current thread's errno
#[inline]
pub fn errno() -> i32 {
    nix::errno::Errno::last() as i32
}
