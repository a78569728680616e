//! Forking a worker and bringing up the child side

use prefork_core::error::{Error, Result};
use prefork_core::{kdebug, kinfo, kwarn};
use prefork_module::PipeEnd;

use nix::unistd::{dup2, fork, ForkResult};

use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use super::{EntryFn, Worker};
use crate::{process, reactor, signal};

impl Worker {
    /// Fork the worker. Returns the child pid in the parent; the child runs
    /// the entry callback and exits without returning.
    pub fn start(&mut self) -> Result<i32> {
        if self.pid > 0 && signal::kill(self.pid, 0).is_ok() {
            return Err(Error::AlreadyStarted);
        }
        let entry = self
            .entry
            .clone()
            .ok_or(Error::WrongOperation("worker has no entry callback"))?;

        // Buffered output would otherwise be emitted by both processes.
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();

        match unsafe { fork() } {
            Err(e) => {
                kwarn!("fork() failed: {}", e);
                Err(Error::ForkFailed(e as i32))
            }
            Ok(ForkResult::Parent { child }) => {
                self.pid = child.as_raw();
                kdebug!("worker {} started as pid {}", self.id, self.pid);
                Ok(self.pid)
            }
            Ok(ForkResult::Child) => self.run_child(entry),
        }
    }

    fn run_child(&mut self, entry: Rc<EntryFn>) -> ! {
        let pid = std::process::id() as i32;
        self.pid = pid;
        if self.pipe.is_some() {
            self.pipe_current = Some(PipeEnd::Worker);
        }
        self.apply_redirects();

        signal::clean();
        process::set_worker_id(self.id);
        process::set_worker_pid(pid);

        // A reactor inherited from the parent thread belongs to the parent.
        reactor::free();
        if self.enable_coroutine {
            if let Err(e) = reactor::init() {
                kwarn!("worker {}: reactor init failed: {}", self.id, e);
            }
        }

        match panic::catch_unwind(AssertUnwindSafe(|| entry(self))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => kwarn!("worker {}: entry returned an error: {}", self.id, e),
            Err(_) => kwarn!("worker {}: entry panicked", self.id),
        }

        if self.enable_coroutine && reactor::is_available() {
            if let Err(e) = reactor::run() {
                kwarn!("worker {}: reactor stopped with error: {}", self.id, e);
            }
        }

        self.entry = None;
        drop(entry);
        reactor::free();
        kinfo!("worker {} exiting", self.id);
        let _ = std::io::stdout().flush();
        std::process::exit(0)
    }

    fn apply_redirects(&self) {
        let Some(fd) = self.pipe_fd() else {
            return;
        };
        let targets = [
            (self.redirect_stdin, libc::STDIN_FILENO),
            (self.redirect_stdout, libc::STDOUT_FILENO),
            (self.redirect_stderr, libc::STDERR_FILENO),
        ];
        for (enabled, target) in targets {
            if enabled {
                if let Err(e) = dup2(fd, target) {
                    kwarn!("worker {}: dup2({}, {}) failed: {}", self.id, fd, target, e);
                }
            }
        }
    }
}
