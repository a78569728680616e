//! Process-level utilities: worker identity, child reaping, daemonizing,
//! CPU affinity and scheduling priority.

use prefork_core::error::{Error, Result};
use prefork_core::{kdebug, kwarn};

use nix::errno::Errno;
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, Pid};

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

static NEXT_WORKER_ID: AtomicU32 = AtomicU32::new(1);
static WORKER_ID: AtomicU32 = AtomicU32::new(0);
static WORKER_PID: AtomicI32 = AtomicI32::new(0);

/// Restart worker id allocation at `base`. A pool that already runs N
/// workers seeds with N so new slots never collide with existing ones.
pub fn seed_worker_ids(base: u32) {
    NEXT_WORKER_ID.store(base, Ordering::SeqCst);
}

pub(crate) fn alloc_worker_id() -> u32 {
    NEXT_WORKER_ID.fetch_add(1, Ordering::SeqCst)
}

/// Id of the worker this process runs, 0 in the parent
pub fn worker_id() -> u32 {
    WORKER_ID.load(Ordering::SeqCst)
}

pub fn set_worker_id(id: u32) {
    WORKER_ID.store(id, Ordering::SeqCst);
}

/// Pid recorded by the running worker, 0 in the parent
pub fn worker_pid() -> i32 {
    WORKER_PID.load(Ordering::SeqCst)
}

pub fn set_worker_pid(pid: i32) {
    WORKER_PID.store(pid, Ordering::SeqCst);
}

/// How a reaped child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub pid: i32,
    /// Exit code, 0 when killed by a signal
    pub code: i32,
    /// Terminating signal, if any
    pub signal: Option<i32>,
}

/// Reap one child. Non-blocking mode returns `Ok(None)` when no child has
/// exited yet.
pub fn wait_process(blocking: bool) -> Result<Option<ExitStatus>> {
    let flags = if blocking { None } else { Some(WaitPidFlag::WNOHANG) };
    loop {
        match waitpid(Pid::from_raw(-1), flags) {
            Ok(WaitStatus::Exited(pid, code)) => {
                kdebug!("child {} exited with code {}", pid, code);
                return Ok(Some(ExitStatus { pid: pid.as_raw(), code, signal: None }));
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                kdebug!("child {} killed by {:?}", pid, sig);
                return Ok(Some(ExitStatus { pid: pid.as_raw(), code: 0, signal: Some(sig as i32) }));
            }
            Ok(WaitStatus::StillAlive) => return Ok(None),
            Ok(_) => continue,
            Err(Errno::EINTR) if blocking => continue,
            Err(e) => {
                if e != Errno::ECHILD {
                    kwarn!("waitpid() failed: {}", e);
                }
                return Err(e.into());
            }
        }
    }
}

/// Detach from the controlling terminal. Each `Some(fd)` in `stdio` is
/// installed as stdin/stdout/stderr afterwards.
pub fn daemon(nochdir: bool, noclose: bool, stdio: [Option<RawFd>; 3]) -> Result<()> {
    if unsafe { libc::daemon(nochdir as libc::c_int, noclose as libc::c_int) } < 0 {
        let e = Error::last_os();
        kwarn!("daemon() failed: {}", e);
        return Err(e);
    }
    for (target, fd) in stdio.iter().enumerate() {
        if let Some(fd) = *fd {
            dup2(fd, target as RawFd).map_err(|e| {
                kwarn!("dup2({}, {}) failed: {}", fd, target, e);
                Error::from(e)
            })?;
        }
    }
    Ok(())
}

/// Online CPU count
pub fn cpu_num() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 {
        n as usize
    } else {
        1
    }
}

/// Pin the calling thread to `cpus`
pub fn set_affinity(cpus: &[usize]) -> Result<()> {
    let total = cpu_num();
    if cpus.is_empty() {
        return Err(Error::InvalidParams("cpu set is empty"));
    }
    if cpus.len() > total {
        return Err(Error::InvalidParams("more cpus than available"));
    }
    let mut set = CpuSet::new();
    for &cpu in cpus {
        if cpu >= total {
            return Err(Error::InvalidParams("cpu id out of range"));
        }
        set.set(cpu)?;
    }
    sched_setaffinity(Pid::from_raw(0), &set).map_err(|e| {
        kwarn!("sched_setaffinity({:?}) failed: {}", cpus, e);
        Error::from(e)
    })
}

/// CPUs the calling thread may run on, ascending
pub fn get_affinity() -> Result<Vec<usize>> {
    let set = sched_getaffinity(Pid::from_raw(0))?;
    Ok((0..CpuSet::count()).filter(|&cpu| set.is_set(cpu).unwrap_or(false)).collect())
}

/// Target class for `set_priority` / `get_priority`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityWhich {
    Process,
    Group,
    User,
}

impl PriorityWhich {
    fn raw(self) -> libc::c_int {
        match self {
            PriorityWhich::Process => libc::PRIO_PROCESS as libc::c_int,
            PriorityWhich::Group => libc::PRIO_PGRP as libc::c_int,
            PriorityWhich::User => libc::PRIO_USER as libc::c_int,
        }
    }
}

/// setpriority(2); `who == 0` means the caller
pub fn set_priority(which: PriorityWhich, who: u32, value: i32) -> Result<()> {
    if unsafe { libc::setpriority(which.raw() as _, who as libc::id_t, value) } < 0 {
        let e = Error::last_os();
        kwarn!("setpriority({:?}, {}, {}) failed: {}", which, who, value, e);
        return Err(e);
    }
    Ok(())
}

/// getpriority(2); `who == 0` means the caller
pub fn get_priority(which: PriorityWhich, who: u32) -> Result<i32> {
    // -1 is a valid priority, so errno decides.
    Errno::clear();
    let value = unsafe { libc::getpriority(which.raw() as _, who as libc::id_t) };
    if value == -1 && Errno::last_raw() != 0 {
        return Err(Error::last_os());
    }
    Ok(value)
}
