//! Worker process handle
//!
//! A `Worker` describes one child process: its entry callback, the socket
//! pair used to talk to it, an optional SysV message queue and the knobs
//! applied in the child before the entry runs. The same object is used on
//! both sides of the fork; `pipe_current` says which end this process uses.
//!
//! `Worker` is deliberately `!Send`: it lives on the reactor thread.

mod supervisor;

use prefork_core::constants::EXIT_CODE_MAX;
use prefork_core::error::{Error, Result};
use prefork_core::event_loop::EventLoop;
use prefork_core::{kdebug, kwarn};
use prefork_module::{ftok_key, MessageQueue, PipeEnd, PipeSocket, PipeType, QueueStat, UnixPipe};

use std::cell::RefCell;
use std::convert::Infallible;
use std::ffi::CString;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::rc::Rc;

use crate::config::RuntimeConfig;
use crate::process::{self, PriorityWhich};
use crate::{async_threads, reactor, signal};

/// Error type entry callbacks may return
pub type EntryResult = std::result::Result<(), Box<dyn std::error::Error>>;

/// Entry callback, run once in the child
pub type EntryFn = dyn Fn(&mut Worker) -> EntryResult;

/// How `pop()` selects messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Any worker takes the oldest message
    Balanced,
    /// Each worker only takes messages addressed to its id
    Targeted,
}

/// Target of `Worker::close`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeClose {
    /// Destroy the whole channel
    Both,
    Master,
    Worker,
    /// shutdown(SHUT_RD) on the current end
    Read,
    /// shutdown(SHUT_WR) on the current end
    Write,
}

/// Options for `Worker::create`
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub pipe_type: PipeType,
    /// Redirect the child's stdin, stdout and stderr to the pipe (forces `Stream`)
    pub redirect_stdio: bool,
    /// Run a reactor in the child around the entry callback
    pub enable_coroutine: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self { pipe_type: PipeType::Datagram, redirect_stdio: false, enable_coroutine: false }
    }
}

impl WorkerOptions {
    pub fn pipe_type(mut self, t: PipeType) -> Self {
        self.pipe_type = t;
        self
    }

    pub fn redirect_stdio(mut self, enable: bool) -> Self {
        self.redirect_stdio = enable;
        self
    }

    pub fn enable_coroutine(mut self, enable: bool) -> Self {
        self.enable_coroutine = enable;
        self
    }
}

/// Settings adjustable after creation
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerSettings {
    pub enable_coroutine: bool,
}

/// Duplicated pipe descriptor handed to foreign code
#[derive(Debug)]
pub struct ExportedChannel {
    fd: OwnedFd,
    pipe_type: PipeType,
}

impl ExportedChannel {
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn pipe_type(&self) -> PipeType {
        self.pipe_type
    }
}

pub struct Worker {
    id: u32,
    pid: i32,
    pipe: Option<Rc<RefCell<UnixPipe>>>,
    pipe_current: Option<PipeEnd>,
    pipe_type: PipeType,
    queue: Option<MessageQueue>,
    msgqueue_mode: QueueMode,
    shared: bool,
    redirect_stdin: bool,
    redirect_stdout: bool,
    redirect_stderr: bool,
    blocking: bool,
    enable_coroutine: bool,
    read_buffer_size: usize,
    entry: Option<Rc<EntryFn>>,
    exported: Option<Rc<ExportedChannel>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("pipe_type", &self.pipe_type)
            .field("pipe_current", &self.pipe_current)
            .field("shared", &self.shared)
            .field("blocking", &self.blocking)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Build a worker around `entry`. Nothing is forked until `start()`.
    pub fn create<F>(entry: F, options: WorkerOptions) -> Result<Worker>
    where
        F: Fn(&mut Worker) -> EntryResult + 'static,
    {
        if async_threads::is_active() {
            return Err(Error::WrongOperation("unable to create process with async-io threads"));
        }
        let pipe_type = if options.redirect_stdio { PipeType::Stream } else { options.pipe_type };
        let pipe = match pipe_type {
            PipeType::None => None,
            t => Some(Rc::new(RefCell::new(UnixPipe::new(t)?))),
        };

        let worker = Worker {
            id: process::alloc_worker_id(),
            pid: 0,
            pipe_current: pipe.as_ref().map(|_| PipeEnd::Master),
            pipe,
            pipe_type,
            queue: None,
            msgqueue_mode: QueueMode::Balanced,
            shared: false,
            redirect_stdin: options.redirect_stdio,
            redirect_stdout: options.redirect_stdio,
            redirect_stderr: options.redirect_stdio,
            blocking: true,
            enable_coroutine: options.enable_coroutine,
            read_buffer_size: RuntimeConfig::from_env().read_buffer_size,
            entry: Some(Rc::new(entry)),
            exported: None,
        };
        kdebug!("worker {} created, pipe {:?}", worker.id, pipe_type);
        Ok(worker)
    }

    /// Alias of a pool slot using `end` of its pipe. The alias never owns
    /// or closes the pipe.
    pub fn shared(slot: &Worker, end: PipeEnd) -> Worker {
        Worker {
            id: slot.id,
            pid: slot.pid,
            pipe: slot.pipe.clone(),
            pipe_current: slot.pipe.as_ref().map(|_| end),
            pipe_type: slot.pipe_type,
            queue: None,
            msgqueue_mode: slot.msgqueue_mode,
            shared: true,
            redirect_stdin: false,
            redirect_stdout: false,
            redirect_stderr: false,
            blocking: slot.blocking,
            enable_coroutine: slot.enable_coroutine,
            read_buffer_size: slot.read_buffer_size,
            entry: None,
            exported: None,
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn pid(&self) -> i32 {
        self.pid
    }

    #[inline]
    pub fn pipe_type(&self) -> PipeType {
        self.pipe_type
    }

    #[inline]
    pub fn pipe_current(&self) -> Option<PipeEnd> {
        self.pipe_current
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    #[inline]
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    #[inline]
    pub fn enable_coroutine(&self) -> bool {
        self.enable_coroutine
    }

    #[inline]
    pub fn msgqueue_mode(&self) -> QueueMode {
        self.msgqueue_mode
    }

    /// Descriptor of the end this process uses
    pub fn pipe_fd(&self) -> Option<RawFd> {
        self.with_socket(|s| Ok(s.fd())).ok()
    }

    /// Override stderr redirection, which otherwise follows `redirect_stdio`
    pub fn redirect_stderr(&mut self, enable: bool) {
        self.redirect_stderr = enable;
    }

    fn with_socket<T>(&self, f: impl FnOnce(&PipeSocket) -> Result<T>) -> Result<T> {
        let pipe = self.pipe.as_ref().ok_or(Error::NoPipe)?;
        let end = self.pipe_current.ok_or(Error::NoPipe)?;
        let pipe = pipe.borrow();
        let socket = pipe.socket(end).ok_or(Error::NoPipe)?;
        f(socket)
    }

    /// Read up to `max_len` bytes (0 = configured default) from the pipe
    pub fn read(&self, max_len: usize) -> Result<Vec<u8>> {
        let len = if max_len == 0 { self.read_buffer_size } else { max_len };
        let mut buf = vec![0u8; len];
        let n = self.with_socket(|s| if self.blocking { s.read_sync(&mut buf) } else { s.read(&mut buf) })?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write `data` to the pipe. Non-blocking workers with a reactor on this
    /// thread go through the reactor's buffered write.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Err(Error::InvalidParams("the data to send is empty"));
        }
        self.with_socket(|s| {
            if !self.blocking {
                if let Some(r) = reactor::current() {
                    return r.write(s.fd(), data);
                }
            }
            s.send_sync(data)
        })
    }

    /// Dup the current pipe end once; later calls share the same handle
    pub fn export_channel(&mut self) -> Result<Rc<ExportedChannel>> {
        self.pipe_fd().ok_or(Error::NoPipe)?;
        if let Some(ch) = &self.exported {
            return Ok(Rc::clone(ch));
        }
        let fd = self.with_socket(|s| {
            // Safety: the socket is alive for the duration of this borrow.
            let borrowed = unsafe { BorrowedFd::borrow_raw(s.fd()) };
            Ok(borrowed.try_clone_to_owned()?)
        })?;
        let ch = Rc::new(ExportedChannel { fd, pipe_type: self.pipe_type });
        self.exported = Some(Rc::clone(&ch));
        Ok(ch)
    }

    pub fn close(&mut self, which: PipeClose) -> Result<()> {
        let pipe = self.pipe.as_ref().ok_or(Error::NoPipe)?;
        if self.shared {
            return Err(Error::InvalidParams("shared worker cannot close the pipe"));
        }
        match which {
            PipeClose::Read => self.with_socket(|s| s.shutdown(Shutdown::Read)),
            PipeClose::Write => self.with_socket(|s| s.shutdown(Shutdown::Write)),
            PipeClose::Master => {
                pipe.borrow_mut().close(Some(PipeEnd::Master));
                Ok(())
            }
            PipeClose::Worker => {
                pipe.borrow_mut().close(Some(PipeEnd::Worker));
                Ok(())
            }
            PipeClose::Both => {
                pipe.borrow_mut().close(None);
                self.pipe = None;
                self.pipe_current = None;
                Ok(())
            }
        }
    }

    fn priority_target(&self, which: PriorityWhich, who: Option<u32>) -> Result<u32> {
        match (which, who) {
            (_, Some(who)) => Ok(who),
            (PriorityWhich::Process, None) => Ok(self.pid.max(0) as u32),
            _ => Err(Error::InvalidParams("who is required for group and user priority")),
        }
    }

    pub fn set_priority(&self, which: PriorityWhich, value: i32, who: Option<u32>) -> Result<()> {
        process::set_priority(which, self.priority_target(which, who)?, value)
    }

    pub fn get_priority(&self, which: PriorityWhich, who: Option<u32>) -> Result<i32> {
        process::get_priority(which, self.priority_target(which, who)?)
    }

    /// Pin the calling process to `cpus`
    pub fn set_affinity(&self, cpus: &[usize]) -> Result<()> {
        process::set_affinity(cpus)
    }

    pub fn get_affinity(&self) -> Result<Vec<usize>> {
        process::get_affinity()
    }

    /// Pipe I/O timeout in seconds; negative waits forever
    pub fn set_timeout(&self, seconds: f64) -> Result<()> {
        self.with_socket(|s| {
            s.set_timeout(seconds);
            s.set_kernel_timeout(seconds)
        })
    }

    pub fn set_blocking(&mut self, blocking: bool) -> Result<()> {
        self.with_socket(|s| if blocking { s.set_block() } else { s.set_nonblock() })?;
        self.blocking = blocking;
        Ok(())
    }

    pub fn set(&mut self, settings: WorkerSettings) {
        self.enable_coroutine = settings.enable_coroutine;
    }

    /// Attach a SysV message queue. Without `key` the key is derived from
    /// the current executable.
    pub fn use_queue(&mut self, key: Option<i32>, mode: QueueMode, blocking: bool, capacity: Option<usize>) -> Result<()> {
        let key = match key {
            Some(k) => k,
            None => {
                let exe = std::env::current_exe()?;
                ftok_key(&exe, 1)?
            }
        };
        let queue = MessageQueue::open(key, blocking)?;
        if let Some(bytes) = capacity {
            queue.set_capacity(bytes)?;
        }
        self.queue = Some(queue);
        self.msgqueue_mode = mode;
        Ok(())
    }

    pub fn stat_queue(&self) -> Result<QueueStat> {
        self.queue.as_ref().ok_or(Error::NoQueue)?.stat()
    }

    /// Remove the queue from the system
    pub fn free_queue(&mut self) -> Result<()> {
        let queue = self.queue.take().ok_or(Error::NoQueue)?;
        queue.destroy()
    }

    /// Enqueue `data` addressed to this worker
    pub fn push(&self, data: &[u8]) -> Result<()> {
        let queue = self.queue.as_ref().ok_or(Error::NoQueue)?;
        queue.push(self.id as i64 + 1, data)
    }

    /// Dequeue one message; balanced mode takes any, targeted mode only
    /// messages addressed to this worker.
    pub fn pop(&self, max_len: usize) -> Result<Vec<u8>> {
        let queue = self.queue.as_ref().ok_or(Error::NoQueue)?;
        let mtype = match self.msgqueue_mode {
            QueueMode::Balanced => 0,
            QueueMode::Targeted => self.id as i64 + 1,
        };
        queue.pop(mtype, max_len)
    }

    /// Exit the worker process. Only valid inside the worker itself.
    /// Codes outside [0, 255] become 1.
    pub fn exit(&self, code: i32) -> Result<Infallible> {
        if self.pid == 0 || self.pid != std::process::id() as i32 {
            return Err(Error::WrongOperation("exit() is only allowed in the worker process"));
        }
        let code = if (0..=EXIT_CODE_MAX).contains(&code) {
            code
        } else {
            kwarn!("exit status must be in [0, {}], got {}", EXIT_CODE_MAX, code);
            1
        };
        reactor::free();
        std::process::exit(code)
    }

    /// Replace the process image. Returns only on failure.
    pub fn exec(&self, path: &str, args: &[&str]) -> Result<Infallible> {
        let c_path = CString::new(path).map_err(|_| Error::InvalidParams("path contains a NUL byte"))?;
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(c_path.clone());
        for arg in args {
            argv.push(CString::new(*arg).map_err(|_| Error::InvalidParams("argument contains a NUL byte"))?);
        }
        signal::clean();
        match nix::unistd::execv(&c_path, &argv) {
            Ok(never) => match never {},
            Err(err) => {
                kwarn!("execv({}) failed: {}", path, err);
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut Worker) -> EntryResult {
        Ok(())
    }

    #[test]
    fn test_create_allocates_distinct_ids() {
        let a = Worker::create(noop, WorkerOptions::default()).unwrap();
        let b = Worker::create(noop, WorkerOptions::default()).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.pid(), 0);
        assert_eq!(a.pipe_current(), Some(PipeEnd::Master));
        assert_eq!(a.pipe_type(), PipeType::Datagram);
    }

    #[test]
    fn test_redirect_forces_stream() {
        let opts = WorkerOptions::default().pipe_type(PipeType::Datagram).redirect_stdio(true);
        let w = Worker::create(noop, opts).unwrap();
        assert_eq!(w.pipe_type(), PipeType::Stream);
    }

    #[test]
    fn test_no_pipe_errors() {
        let w = Worker::create(noop, WorkerOptions::default().pipe_type(PipeType::None)).unwrap();
        assert_eq!(w.read(0), Err(Error::NoPipe));
        assert_eq!(w.write(b"x"), Err(Error::NoPipe));
        assert!(w.pipe_fd().is_none());
    }

    #[test]
    fn test_write_empty_rejected() {
        let w = Worker::create(noop, WorkerOptions::default()).unwrap();
        assert!(matches!(w.write(b""), Err(Error::InvalidParams(_))));
    }

    #[test]
    fn test_shared_alias_talks_to_slot() {
        let master = Worker::create(noop, WorkerOptions::default().pipe_type(PipeType::Stream)).unwrap();
        let mut child_side = Worker::shared(&master, PipeEnd::Worker);
        assert!(child_side.is_shared());

        master.write(b"over the pipe").unwrap();
        assert_eq!(child_side.read(64).unwrap(), b"over the pipe");
        child_side.write(b"back").unwrap();
        assert_eq!(master.read(64).unwrap(), b"back");

        assert!(matches!(child_side.close(PipeClose::Both), Err(Error::InvalidParams(_))));
    }

    #[test]
    fn test_export_channel_is_cached() {
        let mut w = Worker::create(noop, WorkerOptions::default()).unwrap();
        let a = w.export_channel().unwrap();
        let b = w.export_channel().unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_ne!(Some(a.fd()), w.pipe_fd());
        assert_eq!(Rc::strong_count(&a), 3);
    }

    #[test]
    fn test_export_channel_after_close() {
        let mut w = Worker::create(noop, WorkerOptions::default()).unwrap();
        let ch = w.export_channel().unwrap();
        w.close(PipeClose::Both).unwrap();
        assert_eq!(w.export_channel().unwrap_err(), Error::NoPipe);
        // Handles already given out stay usable.
        assert!(ch.fd() >= 0);
    }

    #[test]
    fn test_seeded_ids_continue_from_pool_size() {
        process::seed_worker_ids(40);
        let a = Worker::create(noop, WorkerOptions::default().pipe_type(PipeType::None)).unwrap();
        let b = Worker::create(noop, WorkerOptions::default().pipe_type(PipeType::None)).unwrap();
        assert!(a.id() >= 40);
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_close_both_drops_pipe() {
        let mut w = Worker::create(noop, WorkerOptions::default()).unwrap();
        w.close(PipeClose::Both).unwrap();
        assert_eq!(w.read(0), Err(Error::NoPipe));
        assert_eq!(w.close(PipeClose::Both), Err(Error::NoPipe));
    }

    #[test]
    fn test_close_write_half() {
        let mut w = Worker::create(noop, WorkerOptions::default().pipe_type(PipeType::Stream)).unwrap();
        let peer = Worker::shared(&w, PipeEnd::Worker);
        w.close(PipeClose::Write).unwrap();
        assert_eq!(peer.read(16).unwrap(), b"");
    }

    #[test]
    fn test_nonblocking_read_empty() {
        let mut w = Worker::create(noop, WorkerOptions::default()).unwrap();
        w.set_blocking(false).unwrap();
        assert_eq!(w.read(16), Err(Error::Syscall(libc::EAGAIN)));
    }

    #[test]
    fn test_group_priority_needs_who() {
        let w = Worker::create(noop, WorkerOptions::default().pipe_type(PipeType::None)).unwrap();
        assert!(matches!(w.get_priority(PriorityWhich::Group, None), Err(Error::InvalidParams(_))));
        assert!(w.get_priority(PriorityWhich::Process, None).is_ok());
    }

    #[test]
    fn test_queue_roundtrip_and_modes() {
        let mut w = Worker::create(noop, WorkerOptions::default().pipe_type(PipeType::None)).unwrap();
        assert_eq!(w.push(b"x"), Err(Error::NoQueue));

        w.use_queue(Some(libc::IPC_PRIVATE), QueueMode::Targeted, false, None).unwrap();
        w.push(b"job-1").unwrap();
        assert_eq!(w.stat_queue().unwrap().count, 1);
        assert_eq!(w.pop(0).unwrap(), b"job-1");
        assert_eq!(w.pop(0), Err(Error::Syscall(libc::ENOMSG)));
        w.free_queue().unwrap();
        assert_eq!(w.stat_queue(), Err(Error::NoQueue));
    }

    #[test]
    fn test_exit_outside_worker_refused() {
        let w = Worker::create(noop, WorkerOptions::default()).unwrap();
        assert!(matches!(w.exit(0), Err(Error::WrongOperation(_))));
    }
}
