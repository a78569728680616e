//! `CompletionPipe` — default `Notifier` implementation.
//!
//! Pool threads write the 8-byte task id of each finished event to the
//! write end. The reactor watches the read end and drains every token that
//! is available. Unlike an eventfd counter, tokens do not coalesce: one
//! notify is one token.

use prefork_core::constants::TOKEN_SIZE;
use prefork_core::error::{errno, Error, Result};
use prefork_core::notifier::Notifier;

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Tokens read per `read()` call while draining
const DRAIN_BATCH: usize = 64;

pub struct CompletionPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl CompletionPipe {
    /// Create the pipe. The read end is non-blocking; the write end blocks
    /// so a token is never lost when the pipe buffer fills up.
    pub fn create() -> Result<Self> {
        let mut fds = [-1 as libc::c_int; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(Error::last_os());
        }
        // Safety: pipe2 just returned two fresh descriptors we now own.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let flags = unsafe { libc::fcntl(read.as_raw_fd(), libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(read.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(Error::last_os());
        }
        Ok(Self { read, write })
    }

    /// Descriptor to register with the reactor
    #[inline]
    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Read every pending token into `out`. Returns the number appended.
    pub fn drain(&self, out: &mut Vec<u64>) -> Result<usize> {
        let mut buf = [0u8; TOKEN_SIZE * DRAIN_BATCH];
        let before = out.len();
        loop {
            let n = unsafe {
                libc::read(self.read.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n < 0 {
                match errno() {
                    libc::EINTR => continue,
                    libc::EAGAIN => break,
                    e => return Err(Error::Syscall(e)),
                }
            }
            if n == 0 {
                break;
            }
            // Writes are TOKEN_SIZE bytes and atomic, so reads stay aligned.
            for chunk in buf[..n as usize].chunks_exact(TOKEN_SIZE) {
                let mut raw = [0u8; TOKEN_SIZE];
                raw.copy_from_slice(chunk);
                out.push(u64::from_ne_bytes(raw));
            }
            if (n as usize) < buf.len() {
                break;
            }
        }
        Ok(out.len() - before)
    }
}

impl Notifier for CompletionPipe {
    fn notify(&self, token: u64) -> Result<()> {
        let raw = token.to_ne_bytes();
        loop {
            let ret = unsafe {
                libc::write(self.write.as_raw_fd(), raw.as_ptr() as *const libc::c_void, TOKEN_SIZE)
            };
            if ret < 0 {
                let e = errno();
                if e == libc::EINTR {
                    continue;
                }
                return Err(Error::Syscall(e));
            }
            return Ok(());
        }
    }
}
