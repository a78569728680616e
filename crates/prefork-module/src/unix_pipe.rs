//! `UnixPipe` — duplex channel between a parent and one worker process.
//!
//! Backed by `socketpair(AF_UNIX)`. The master end stays in the parent, the
//! worker end is used by the child after fork. Each end is a `PipeSocket`
//! with its own blocking mode and timeout.
//!
//! Timeouts: a negative timeout means "wait forever". A positive timeout is
//! enforced in user space with poll(2) before each blocking read/write, and
//! can additionally be pushed into the kernel with `set_kernel_timeout()`
//! (SO_RCVTIMEO / SO_SNDTIMEO).

use prefork_core::error::{errno, Error, Result};

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use std::cell::Cell;
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

/// Kind of channel requested for a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeType {
    None,
    Stream,
    Datagram,
}

/// Which end of the pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Master,
    Worker,
}

/// One end of a `UnixPipe`
#[derive(Debug)]
pub struct PipeSocket {
    fd: OwnedFd,
    pipe_type: PipeType,
    timeout: Cell<f64>,
    nonblock: Cell<bool>,
}

impl PipeSocket {
    fn new(fd: OwnedFd, pipe_type: PipeType) -> Self {
        Self {
            fd,
            pipe_type,
            timeout: Cell::new(-1.0),
            nonblock: Cell::new(false),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    #[inline]
    pub fn pipe_type(&self) -> PipeType {
        self.pipe_type
    }

    #[inline]
    pub fn timeout(&self) -> f64 {
        self.timeout.get()
    }

    #[inline]
    pub fn is_nonblock(&self) -> bool {
        self.nonblock.get()
    }

    /// User-space timeout for `read_sync` / `send_sync`, in seconds
    pub fn set_timeout(&self, seconds: f64) {
        self.timeout.set(seconds);
    }

    /// Push the timeout into the kernel (SO_RCVTIMEO + SO_SNDTIMEO).
    /// Non-positive values clear it.
    pub fn set_kernel_timeout(&self, seconds: f64) -> Result<()> {
        let tv = if seconds > 0.0 {
            let sec = seconds.trunc();
            libc::timeval {
                tv_sec: sec as libc::time_t,
                tv_usec: ((seconds - sec) * 1_000_000.0) as libc::suseconds_t,
            }
        } else {
            libc::timeval { tv_sec: 0, tv_usec: 0 }
        };
        for opt in [libc::SO_RCVTIMEO, libc::SO_SNDTIMEO] {
            let ret = unsafe {
                libc::setsockopt(
                    self.fd(),
                    libc::SOL_SOCKET,
                    opt,
                    &tv as *const libc::timeval as *const libc::c_void,
                    std::mem::size_of::<libc::timeval>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(Error::last_os());
            }
        }
        Ok(())
    }

    pub fn set_block(&self) -> Result<()> {
        self.set_fl_nonblock(false)
    }

    pub fn set_nonblock(&self) -> Result<()> {
        self.set_fl_nonblock(true)
    }

    fn set_fl_nonblock(&self, on: bool) -> Result<()> {
        let fd = self.fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(Error::last_os());
        }
        let flags = if on { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
            return Err(Error::last_os());
        }
        self.nonblock.set(on);
        Ok(())
    }

    /// Blocking read. Waits for readability first when the fd is
    /// non-blocking or a user-space timeout is set.
    pub fn read_sync(&self, buf: &mut [u8]) -> Result<usize> {
        if self.nonblock.get() || self.timeout.get() > 0.0 {
            wait_event(self.fd(), libc::POLLIN, self.timeout.get())?;
        }
        let n = unsafe { libc::read(self.fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            let e = errno();
            // SO_RCVTIMEO expiry surfaces as EAGAIN on a blocking fd
            if e == libc::EAGAIN && !self.nonblock.get() {
                return Err(Error::Timeout);
            }
            return Err(Error::Syscall(e));
        }
        Ok(n as usize)
    }

    /// Single non-blocking read. `Syscall(EAGAIN)` when nothing is ready.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = unsafe {
            libc::recv(self.fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), libc::MSG_DONTWAIT)
        };
        if n < 0 {
            return Err(Error::last_os());
        }
        Ok(n as usize)
    }

    /// Blocking send. Stream sockets write the whole buffer; datagram
    /// sockets send exactly one message.
    pub fn send_sync(&self, data: &[u8]) -> Result<usize> {
        let mut written = 0usize;
        while written < data.len() {
            if self.nonblock.get() || self.timeout.get() > 0.0 {
                wait_event(self.fd(), libc::POLLOUT, self.timeout.get())?;
            }
            let rest = &data[written..];
            let n = unsafe {
                libc::send(self.fd(), rest.as_ptr() as *const libc::c_void, rest.len(), libc::MSG_NOSIGNAL)
            };
            if n < 0 {
                let e = errno();
                if e == libc::EAGAIN {
                    if self.nonblock.get() {
                        continue;
                    }
                    return Err(Error::Timeout);
                }
                return Err(Error::Syscall(e));
            }
            written += n as usize;
            if self.pipe_type == PipeType::Datagram {
                break;
            }
        }
        Ok(written)
    }

    /// Single non-blocking send
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        let n = unsafe {
            libc::send(
                self.fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            return Err(Error::last_os());
        }
        Ok(n as usize)
    }

    /// Half- or full-close of the connection without releasing the fd
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        if unsafe { libc::shutdown(self.fd(), how) } < 0 {
            return Err(Error::last_os());
        }
        Ok(())
    }
}

/// poll(2) a single fd. `timeout < 0` waits forever.
fn wait_event(fd: RawFd, events: libc::c_short, timeout: f64) -> Result<()> {
    let ms = if timeout < 0.0 { -1 } else { (timeout * 1000.0).ceil() as libc::c_int };
    let mut pfd = libc::pollfd { fd, events, revents: 0 };
    loop {
        let n = unsafe { libc::poll(&mut pfd, 1, ms) };
        if n < 0 {
            let e = errno();
            if e == libc::EINTR {
                continue;
            }
            return Err(Error::Syscall(e));
        }
        if n == 0 {
            return Err(Error::Timeout);
        }
        return Ok(());
    }
}

/// Connected socket pair shared by a parent and one worker
#[derive(Debug)]
pub struct UnixPipe {
    pipe_type: PipeType,
    master: Option<PipeSocket>,
    worker: Option<PipeSocket>,
}

impl UnixPipe {
    /// Create a connected pair. `PipeType::None` is rejected.
    pub fn new(pipe_type: PipeType) -> Result<Self> {
        let sock_type = match pipe_type {
            PipeType::Stream => SockType::Stream,
            PipeType::Datagram => SockType::Datagram,
            PipeType::None => return Err(Error::InvalidParams("pipe type is none")),
        };
        let (master, worker) = socketpair(AddressFamily::Unix, sock_type, None, SockFlag::SOCK_CLOEXEC)?;
        Ok(Self {
            pipe_type,
            master: Some(PipeSocket::new(master, pipe_type)),
            worker: Some(PipeSocket::new(worker, pipe_type)),
        })
    }

    #[inline]
    pub fn pipe_type(&self) -> PipeType {
        self.pipe_type
    }

    /// The requested end, unless it has been closed
    pub fn socket(&self, end: PipeEnd) -> Option<&PipeSocket> {
        match end {
            PipeEnd::Master => self.master.as_ref(),
            PipeEnd::Worker => self.worker.as_ref(),
        }
    }

    /// Close one end, or both when `end` is `None`. Closing twice is a no-op.
    pub fn close(&mut self, end: Option<PipeEnd>) {
        match end {
            Some(PipeEnd::Master) => drop(self.master.take()),
            Some(PipeEnd::Worker) => drop(self.worker.take()),
            None => {
                self.master.take();
                self.worker.take();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.master.is_none() && self.worker.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_pair_roundtrip() {
        let pipe = UnixPipe::new(PipeType::Stream).unwrap();
        let master = pipe.socket(PipeEnd::Master).unwrap();
        let worker = pipe.socket(PipeEnd::Worker).unwrap();

        assert_eq!(master.send_sync(b"hello").unwrap(), 5);
        let mut buf = [0u8; 16];
        let n = worker.read_sync(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        worker.send_sync(b"back").unwrap();
        let n = master.read_sync(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"back");
    }

    #[test]
    fn test_datagram_preserves_boundaries() {
        let pipe = UnixPipe::new(PipeType::Datagram).unwrap();
        let master = pipe.socket(PipeEnd::Master).unwrap();
        let worker = pipe.socket(PipeEnd::Worker).unwrap();

        master.send_sync(b"one").unwrap();
        master.send_sync(b"two").unwrap();
        let mut buf = [0u8; 16];
        let n = worker.read_sync(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one");
        let n = worker.read_sync(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"two");
    }

    #[test]
    fn test_nonblocking_read_empty() {
        let pipe = UnixPipe::new(PipeType::Stream).unwrap();
        let worker = pipe.socket(PipeEnd::Worker).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(worker.read(&mut buf), Err(Error::Syscall(libc::EAGAIN)));
    }

    #[test]
    fn test_read_timeout() {
        let pipe = UnixPipe::new(PipeType::Stream).unwrap();
        let worker = pipe.socket(PipeEnd::Worker).unwrap();
        worker.set_timeout(0.05);
        let mut buf = [0u8; 8];
        assert_eq!(worker.read_sync(&mut buf), Err(Error::Timeout));
    }

    #[test]
    fn test_kernel_timeout_and_blocking_mode() {
        let pipe = UnixPipe::new(PipeType::Stream).unwrap();
        let master = pipe.socket(PipeEnd::Master).unwrap();
        master.set_kernel_timeout(0.5).unwrap();
        master.set_nonblock().unwrap();
        assert!(master.is_nonblock());
        master.set_block().unwrap();
        assert!(!master.is_nonblock());
    }

    #[test]
    fn test_shutdown_write_gives_eof() {
        let pipe = UnixPipe::new(PipeType::Stream).unwrap();
        let master = pipe.socket(PipeEnd::Master).unwrap();
        let worker = pipe.socket(PipeEnd::Worker).unwrap();
        master.shutdown(Shutdown::Write).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(worker.read_sync(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_close_ends() {
        let mut pipe = UnixPipe::new(PipeType::Stream).unwrap();
        pipe.close(Some(PipeEnd::Worker));
        assert!(pipe.socket(PipeEnd::Worker).is_none());
        assert!(pipe.socket(PipeEnd::Master).is_some());
        pipe.close(None);
        pipe.close(None);
        assert!(pipe.is_closed());
    }

    #[test]
    fn test_none_type_rejected() {
        assert!(matches!(UnixPipe::new(PipeType::None), Err(Error::InvalidParams(_))));
    }
}
