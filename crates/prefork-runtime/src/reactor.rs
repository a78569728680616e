//! # Reactor — single-threaded poll(2) event loop
//!
//! One reactor per thread, stored in a thread-local. The loop:
//! 1. Runs deferred callbacks
//! 2. Polls every registered reader (and fds with pending buffered writes)
//! 3. Invokes ready read handlers, flushes writable buffers
//! 4. Dispatches pending signals through the signal table
//! 5. Checks the exit conditions
//!
//! Readers flagged `internal` (signal wake pipe, async completion pipe) do
//! not count towards keeping the loop alive. The loop exits when no user
//! reader, deferred callback or buffered write is left and every registered
//! exit condition agrees.

use prefork_core::error::{errno, Error, Result};
use prefork_core::event_loop::{Deferred, EventLoop, ExitCondition, ExitKey, FdHandler};
use prefork_core::{kdebug, kwarn};

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::signal;

struct Registration {
    handler: Rc<RefCell<FdHandler>>,
    internal: bool,
}

/// Bytes waiting for POLLOUT on one fd. Datagram sockets keep one entry per
/// message so boundaries survive buffering.
struct WriteQueue {
    datagram: bool,
    chunks: VecDeque<Vec<u8>>,
}

impl WriteQueue {
    fn new(fd: RawFd) -> Self {
        Self { datagram: is_datagram(fd), chunks: VecDeque::new() }
    }

    fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn push(&mut self, data: &[u8]) {
        match self.chunks.back_mut() {
            Some(last) if !self.datagram => last.extend_from_slice(data),
            _ => self.chunks.push_back(data.to_vec()),
        }
    }
}

pub struct Reactor {
    readers: RefCell<HashMap<RawFd, Registration>>,
    write_buffers: RefCell<HashMap<RawFd, WriteQueue>>,
    deferred: RefCell<VecDeque<Deferred>>,
    exit_conditions: RefCell<HashMap<ExitKey, ExitCondition>>,
    running: Cell<bool>,
    stopped: Cell<bool>,
    poll_timeout: Duration,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Reactor>>> = const { RefCell::new(None) };
}

/// Create this thread's reactor, or return the existing one
pub fn init() -> Result<Rc<Reactor>> {
    if let Some(r) = current() {
        return Ok(r);
    }
    let config = RuntimeConfig::from_env();
    let reactor = Rc::new(Reactor::new(&config));
    CURRENT.with(|c| *c.borrow_mut() = Some(Rc::clone(&reactor)));
    if let Err(e) = signal::attach(&reactor) {
        CURRENT.with(|c| c.borrow_mut().take());
        return Err(e);
    }
    kdebug!("reactor initialized");
    Ok(reactor)
}

/// This thread's reactor, if any
pub fn current() -> Option<Rc<Reactor>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Whether an event loop exists on this thread
pub fn is_available() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

/// Drop this thread's reactor and every handler registered on it
pub fn free() {
    let reactor = CURRENT.with(|c| c.borrow_mut().take());
    if let Some(r) = reactor {
        r.stop();
        drop(r);
        kdebug!("reactor freed");
    }
}

/// Run this thread's reactor until it has nothing left to wait for
pub fn run() -> Result<()> {
    current().ok_or(Error::WrongOperation("no reactor on this thread"))?.run()
}

/// Alias of `run()`
pub fn wait() -> Result<()> {
    run()
}

/// Single loop iteration on this thread's reactor
pub fn run_once(timeout: Option<Duration>) -> Result<usize> {
    current().ok_or(Error::WrongOperation("no reactor on this thread"))?.run_once(timeout)
}

impl Reactor {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            readers: RefCell::new(HashMap::new()),
            write_buffers: RefCell::new(HashMap::new()),
            deferred: RefCell::new(VecDeque::new()),
            exit_conditions: RefCell::new(HashMap::new()),
            running: Cell::new(false),
            stopped: Cell::new(false),
            poll_timeout: config.poll_timeout,
        }
    }

    /// Registered readers that keep the loop alive
    pub fn user_fd_count(&self) -> usize {
        self.readers.borrow().values().filter(|r| !r.internal).count()
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Ask `run()` to return after the current iteration
    pub fn stop(&self) {
        self.stopped.set(true);
    }

    /// True when nothing keeps the loop alive
    pub fn should_exit(&self) -> bool {
        if self.stopped.get() {
            return true;
        }
        let user = self.user_fd_count();
        if user > 0 || !self.deferred.borrow().is_empty() {
            return false;
        }
        if self.write_buffers.borrow().values().any(|b| !b.is_empty()) {
            return false;
        }
        self.exit_conditions.borrow().values().all(|cond| cond(user))
    }

    /// Loop until `should_exit()`
    pub fn run(&self) -> Result<()> {
        if self.running.replace(true) {
            return Err(Error::WrongOperation("reactor is already running"));
        }
        self.stopped.set(false);
        let result = loop {
            if self.should_exit() {
                break Ok(());
            }
            if let Err(e) = self.run_once(Some(self.poll_timeout)) {
                break Err(e);
            }
        };
        self.running.set(false);
        result
    }

    /// One iteration. `None` waits without a timeout. Returns the number of
    /// ready descriptors handled.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<usize> {
        self.run_deferred();

        let mut fds = self.build_pollfds();
        let timeout_ms = if !self.deferred.borrow().is_empty() {
            0
        } else {
            timeout.map_or(-1, |d| d.as_millis().min(i32::MAX as u128) as libc::c_int)
        };

        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let e = errno();
            if e == libc::EINTR {
                signal::dispatch_pending();
                return Ok(0);
            }
            return Err(Error::Syscall(e));
        }

        let mut handled = 0;
        for pfd in fds.iter().filter(|p| p.revents != 0) {
            handled += 1;
            if pfd.revents & libc::POLLNVAL != 0 {
                kwarn!("reactor: fd {} is not open, removing it", pfd.fd);
                self.del(pfd.fd);
                continue;
            }
            if pfd.revents & libc::POLLOUT != 0 {
                self.flush(pfd.fd);
            }
            if pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                self.dispatch_read(pfd.fd);
            }
        }

        signal::dispatch_pending();
        Ok(handled)
    }

    fn run_deferred(&self) {
        let batch: Vec<Deferred> = self.deferred.borrow_mut().drain(..).collect();
        for cb in batch {
            cb();
        }
    }

    fn build_pollfds(&self) -> Vec<libc::pollfd> {
        let readers = self.readers.borrow();
        let buffers = self.write_buffers.borrow();
        let mut fds: Vec<libc::pollfd> = readers
            .keys()
            .map(|&fd| libc::pollfd { fd, events: libc::POLLIN, revents: 0 })
            .collect();
        for (&fd, _) in buffers.iter().filter(|(_, b)| !b.is_empty()) {
            match fds.iter_mut().find(|p| p.fd == fd) {
                Some(p) => p.events |= libc::POLLOUT,
                None => fds.push(libc::pollfd { fd, events: libc::POLLOUT, revents: 0 }),
            }
        }
        fds
    }

    fn dispatch_read(&self, fd: RawFd) {
        // Clone the handler out so it may re-register or delete itself.
        let handler = self.readers.borrow().get(&fd).map(|r| Rc::clone(&r.handler));
        if let Some(h) = handler {
            match h.try_borrow_mut() {
                Ok(mut handler) => (*handler)(fd),
                Err(_) => kwarn!("reactor: re-entrant dispatch on fd {} skipped", fd),
            }
        }
    }

    fn flush(&self, fd: RawFd) {
        let mut buffers = self.write_buffers.borrow_mut();
        let Some(queue) = buffers.get_mut(&fd) else {
            return;
        };
        while let Some(chunk) = queue.chunks.front_mut() {
            match raw_write(fd, chunk) {
                Ok(n) if n < chunk.len() && !queue.datagram => {
                    chunk.drain(..n);
                }
                Ok(_) => {
                    queue.chunks.pop_front();
                }
                Err(libc::EAGAIN) => return,
                Err(e) => {
                    kwarn!("reactor: buffered write to fd {} failed: errno {}, dropping {} bytes", fd, e, chunk.len());
                    queue.chunks.pop_front();
                }
            }
        }
        buffers.remove(&fd);
    }
}

impl EventLoop for Reactor {
    fn add_reader(&self, fd: RawFd, internal: bool, handler: FdHandler) -> Result<()> {
        if fd < 0 {
            return Err(Error::InvalidParams("invalid fd"));
        }
        let reg = Registration { handler: Rc::new(RefCell::new(handler)), internal };
        self.readers.borrow_mut().insert(fd, reg);
        Ok(())
    }

    fn del(&self, fd: RawFd) {
        self.readers.borrow_mut().remove(&fd);
        self.write_buffers.borrow_mut().remove(&fd);
    }

    fn defer(&self, cb: Deferred) {
        self.deferred.borrow_mut().push_back(cb);
    }

    fn write(&self, fd: RawFd, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Err(Error::InvalidParams("the data to write is empty"));
        }
        let mut buffers = self.write_buffers.borrow_mut();
        if let Some(queue) = buffers.get_mut(&fd).filter(|q| !q.is_empty()) {
            queue.push(data);
            return Ok(data.len());
        }
        let written = match raw_write(fd, data) {
            Ok(n) => n,
            Err(libc::EAGAIN) => 0,
            Err(e) => return Err(Error::Syscall(e)),
        };
        if written < data.len() {
            let queue = buffers.entry(fd).or_insert_with(|| WriteQueue::new(fd));
            // A datagram is either sent whole or not at all.
            let rest = if queue.datagram { data } else { &data[written..] };
            queue.push(rest);
        }
        Ok(data.len())
    }

    fn set_exit_condition(&self, key: ExitKey, cond: ExitCondition) {
        self.exit_conditions.borrow_mut().insert(key, cond);
    }

    fn isset_exit_condition(&self, key: ExitKey) -> bool {
        self.exit_conditions.borrow().contains_key(&key)
    }

    fn remove_exit_condition(&self, key: ExitKey) {
        self.exit_conditions.borrow_mut().remove(&key);
    }
}

/// SOCK_DGRAM / SOCK_SEQPACKET sockets. Anything else, including
/// non-sockets, is treated as a byte stream.
fn is_datagram(fd: RawFd) -> bool {
    let mut ty: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_TYPE, &mut ty as *mut libc::c_int as *mut libc::c_void, &mut len)
    };
    ret == 0 && (ty == libc::SOCK_DGRAM || ty == libc::SOCK_SEQPACKET)
}

/// send(MSG_NOSIGNAL) for sockets, write(2) otherwise. `Err` carries errno.
fn raw_write(fd: RawFd, data: &[u8]) -> std::result::Result<usize, i32> {
    loop {
        let n = unsafe {
            libc::send(fd, data.as_ptr() as *const libc::c_void, data.len(), libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL)
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        match errno() {
            libc::EINTR => continue,
            libc::ENOTSOCK => break,
            e => return Err(e),
        }
    }
    loop {
        let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        match errno() {
            libc::EINTR => continue,
            libc::EWOULDBLOCK => return Err(libc::EAGAIN),
            e => return Err(e),
        }
    }
}
