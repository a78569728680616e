//! Unix signal table and two-phase dispatch

use prefork_core::constants::SIGNO_MAX;
use prefork_core::error::{errno, Error, Result};
use prefork_core::event_loop::{EventLoop, ExitKey};
use prefork_core::{kdebug, kwarn};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::reactor::{self, Reactor};

pub use libc::{
    SIGABRT, SIGALRM, SIGBUS, SIGCHLD, SIGCONT, SIGFPE, SIGHUP, SIGILL, SIGINT, SIGIO, SIGKILL, SIGPIPE, SIGPROF,
    SIGQUIT, SIGSEGV, SIGSTOP, SIGTERM, SIGTRAP, SIGTSTP, SIGTTIN, SIGTTOU, SIGURG, SIGUSR1, SIGUSR2, SIGVTALRM,
    SIGWINCH, SIGXCPU, SIGXFSZ,
};

cfg_if::cfg_if! {
    if #[cfg(all(any(target_os = "linux", target_os = "android"), not(any(target_arch = "mips", target_arch = "mips64", target_arch = "sparc64"))))] {
        pub use libc::{SIGPWR, SIGSTKFLT, SIGSYS};
    } else {
        pub use libc::SIGSYS;
    }
}
pub use prefork_core::constants::SIGNO_MAX as SIGNAL_MAX;

/// User handler, called with the signal number on the reactor thread
pub type SignalHandler = Box<dyn FnMut(i32) -> Result<()> + Send>;

/// What `signal()` should do with a slot
pub enum SignalAction {
    /// Dispatch to this handler through the reactor
    Handler(SignalHandler),
    /// Install SIG_IGN
    Ignore,
    /// Remove the handler and restore SIG_DFL
    Clear,
}

/// Timer selected by `alarm()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItimerKind {
    Real,
    Virtual,
    Prof,
}

struct Slot {
    /// `None` while the handler is running
    handler: Option<SignalHandler>,
}

#[derive(Default)]
struct SignalTable {
    slots: HashMap<i32, Slot>,
    wake_read: Option<i32>,
}

static PENDING: [AtomicBool; SIGNO_MAX as usize] = [const { AtomicBool::new(false) }; SIGNO_MAX as usize];
static ANY_PENDING: AtomicBool = AtomicBool::new(false);
static WAKE_WRITE: AtomicI32 = AtomicI32::new(-1);
static ARMED: AtomicUsize = AtomicUsize::new(0);
static WAIT_SIGNAL: OnceLock<AtomicBool> = OnceLock::new();

fn table() -> MutexGuard<'static, SignalTable> {
    static TABLE: OnceLock<Mutex<SignalTable>> = OnceLock::new();
    TABLE
        .get_or_init(|| Mutex::new(SignalTable::default()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        unsafe fn errno_location() -> *mut libc::c_int {
            libc::__errno_location()
        }
    } else {
        unsafe fn errno_location() -> *mut libc::c_int {
            libc::__error()
        }
    }
}

/// Signal context: only atomics and write(2).
extern "C" fn raw_handler(signo: libc::c_int) {
    if signo <= 0 || signo >= SIGNO_MAX {
        return;
    }
    let saved = unsafe { *errno_location() };
    PENDING[signo as usize].store(true, Ordering::SeqCst);
    ANY_PENDING.store(true, Ordering::SeqCst);
    let fd = WAKE_WRITE.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = 1u8;
        unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    }
    unsafe { *errno_location() = saved };
}

fn raw_handler_addr() -> libc::sighandler_t {
    raw_handler as extern "C" fn(libc::c_int) as libc::sighandler_t
}

/// `0 <= signo < SIGNO_MAX`. Signal 0 passes and is refused by the OS.
fn check_signo(signo: i32) -> Result<()> {
    if !(0..SIGNO_MAX).contains(&signo) {
        return Err(Error::InvalidParams("invalid signal number"));
    }
    Ok(())
}

fn current_disposition(signo: i32) -> Result<libc::sighandler_t> {
    let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
    if unsafe { libc::sigaction(signo, std::ptr::null(), &mut old) } < 0 {
        return Err(Error::last_os());
    }
    Ok(old.sa_sigaction)
}

fn set_disposition(signo: i32, disposition: libc::sighandler_t) -> Result<()> {
    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    sa.sa_sigaction = disposition;
    sa.sa_flags = libc::SA_RESTART;
    unsafe { libc::sigemptyset(&mut sa.sa_mask) };
    if unsafe { libc::sigaction(signo, &sa, std::ptr::null_mut()) } < 0 {
        let e = errno();
        kwarn!("sigaction({}) failed: errno {}", signo, e);
        return Err(Error::Syscall(e));
    }
    Ok(())
}

/// Create the self-pipe raw handlers write to
fn ensure_wake_pipe(t: &mut SignalTable) -> Result<i32> {
    if let Some(fd) = t.wake_read {
        return Ok(fd);
    }
    let mut fds = [-1 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
        return Err(Error::last_os());
    }
    t.wake_read = Some(fds[0]);
    WAKE_WRITE.store(fds[1], Ordering::SeqCst);
    Ok(fds[0])
}

fn close_wake_pipe(t: &mut SignalTable) {
    let write = WAKE_WRITE.swap(-1, Ordering::SeqCst);
    if write >= 0 {
        unsafe { libc::close(write) };
    }
    if let Some(read) = t.wake_read.take() {
        if let Some(r) = reactor::current() {
            r.del(read);
        }
        unsafe { libc::close(read) };
    }
}

fn drain_wake_pipe(fd: i32) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 && errno() != libc::EINTR {
            break;
        }
    }
}

fn install_exit_condition(r: &Reactor) {
    if !r.isset_exit_condition(ExitKey::SignalListener) {
        r.set_exit_condition(
            ExitKey::SignalListener,
            Box::new(|_| armed_count() == 0 || !wait_signal()),
        );
    }
}

/// Hook the signal wake pipe into a freshly created reactor
pub fn attach(r: &Reactor) -> Result<()> {
    let fd = ensure_wake_pipe(&mut table())?;
    r.add_reader(fd, true, Box::new(drain_wake_pipe))?;
    if armed_count() > 0 {
        install_exit_condition(r);
    }
    Ok(())
}

/// Install, ignore or clear the handler for `signo`.
///
/// Fails with `AlreadySystemOwned` when the current OS disposition is a
/// handler that was not installed through this table.
pub fn signal(signo: i32, action: SignalAction) -> Result<()> {
    check_signo(signo)?;

    let mut t = table();
    let current = current_disposition(signo)?;
    if current != libc::SIG_DFL && current != libc::SIG_IGN && current != raw_handler_addr() {
        kwarn!("signal [{}] processor has been registered by the system", signo);
        return Err(Error::AlreadySystemOwned(signo));
    }

    match action {
        SignalAction::Handler(handler) => {
            ensure_wake_pipe(&mut t)?;
            set_disposition(signo, raw_handler_addr())?;
            let replaced = t.slots.insert(signo, Slot { handler: Some(handler) }).is_some();
            if !replaced {
                ARMED.fetch_add(1, Ordering::SeqCst);
            }
            drop(t);

            if let Some(r) = reactor::current() {
                install_exit_condition(&r);
            }
            kdebug!("signal [{}] handler installed, armed {}", signo, armed_count());
        }
        SignalAction::Ignore => {
            set_disposition(signo, libc::SIG_IGN)?;
            if t.slots.remove(&signo).is_some() {
                ARMED.fetch_sub(1, Ordering::SeqCst);
            }
            PENDING[signo as usize].store(false, Ordering::SeqCst);
        }
        SignalAction::Clear => {
            if !t.slots.contains_key(&signo) {
                return Err(Error::NotFound);
            }
            set_disposition(signo, libc::SIG_DFL)?;
            t.slots.remove(&signo);
            ARMED.fetch_sub(1, Ordering::SeqCst);
            PENDING[signo as usize].store(false, Ordering::SeqCst);
        }
    }
    Ok(())
}

/// Run the handler of every pending signal. Called by the reactor after
/// each poll; handler errors are logged, never propagated.
pub fn dispatch_pending() {
    if !ANY_PENDING.swap(false, Ordering::SeqCst) {
        return;
    }
    for signo in 1..SIGNO_MAX {
        if !PENDING[signo as usize].swap(false, Ordering::SeqCst) {
            continue;
        }
        // Take the handler out so it may call back into the table.
        let handler = table().slots.get_mut(&signo).and_then(|s| s.handler.take());
        let Some(mut handler) = handler else {
            continue;
        };
        if let Err(e) = handler(signo) {
            kwarn!("signal [{}] handler failed: {}", signo, e);
        }
        if let Some(slot) = table().slots.get_mut(&signo) {
            if slot.handler.is_none() {
                slot.handler = Some(handler);
            }
        }
    }
}

/// Drop every handler, restore default dispositions and reset the armed
/// count. Used in a freshly forked child and before `exec`.
pub fn clean() {
    let mut t = table();
    for (&signo, _) in t.slots.iter() {
        let _ = set_disposition(signo, libc::SIG_DFL);
    }
    t.slots.clear();
    ARMED.store(0, Ordering::SeqCst);
    for flag in PENDING.iter() {
        flag.store(false, Ordering::SeqCst);
    }
    ANY_PENDING.store(false, Ordering::SeqCst);
    close_wake_pipe(&mut t);
    drop(t);

    if let Some(r) = reactor::current() {
        r.remove_exit_condition(ExitKey::SignalListener);
    }
}

pub fn isset_handler(signo: i32) -> bool {
    check_signo(signo).is_ok() && table().slots.contains_key(&signo)
}

/// Number of signals with a user handler installed
pub fn armed_count() -> usize {
    ARMED.load(Ordering::SeqCst)
}

/// Whether armed handlers keep the reactor alive (default from
/// `PREFORK_WAIT_SIGNAL`)
pub fn wait_signal() -> bool {
    wait_signal_flag().load(Ordering::SeqCst)
}

pub fn set_wait_signal(enable: bool) {
    wait_signal_flag().store(enable, Ordering::SeqCst);
}

fn wait_signal_flag() -> &'static AtomicBool {
    WAIT_SIGNAL.get_or_init(|| AtomicBool::new(crate::config::RuntimeConfig::from_env().wait_signal))
}

/// Arm an interval timer firing every `usec` microseconds. `0` disarms.
pub fn alarm(usec: i64, kind: ItimerKind) -> Result<()> {
    if usec < 0 {
        return Err(Error::InvalidParams("usec must be >= 0"));
    }
    let which = match kind {
        ItimerKind::Real => libc::ITIMER_REAL,
        ItimerKind::Virtual => libc::ITIMER_VIRTUAL,
        ItimerKind::Prof => libc::ITIMER_PROF,
    };
    let tv = libc::timeval {
        tv_sec: (usec / 1_000_000) as libc::time_t,
        tv_usec: (usec % 1_000_000) as libc::suseconds_t,
    };
    let timer = libc::itimerval { it_interval: tv, it_value: tv };
    if unsafe { libc::setitimer(which, &timer, std::ptr::null_mut()) } < 0 {
        let e = errno();
        kwarn!("setitimer({}) failed: errno {}", which, e);
        return Err(Error::Syscall(e));
    }
    Ok(())
}

/// Send `signo` to `pid`. `signo == 0` only probes for existence.
pub fn kill(pid: i32, signo: i32) -> Result<()> {
    if signo < 0 || signo >= SIGNO_MAX {
        return Err(Error::InvalidParams("invalid signal number"));
    }
    if unsafe { libc::kill(pid, signo) } < 0 {
        let e = errno();
        if !(signo == 0 && e == libc::ESRCH) {
            kwarn!("kill({}, {}) failed: errno {}", pid, signo, e);
        }
        return Err(Error::Syscall(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// Signal state is process-wide; serialize tests that touch it.
    fn serial() -> MutexGuard<'static, ()> {
        static LOCK: Mutex<()> = Mutex::new(());
        LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn counting_handler(hits: &Arc<AtomicUsize>) -> SignalAction {
        let hits = Arc::clone(hits);
        SignalAction::Handler(Box::new(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(matches!(signal(-1, SignalAction::Ignore), Err(Error::InvalidParams(_))));
        assert_eq!(signal(0, SignalAction::Ignore), Err(Error::Syscall(libc::EINVAL)));
        assert!(!isset_handler(0));
        assert!(matches!(signal(SIGNO_MAX, SignalAction::Ignore), Err(Error::InvalidParams(_))));
        assert!(!isset_handler(-1));
    }

    #[test]
    fn test_ignore_handler_clear_is_net_zero() {
        let _g = serial();
        let before = armed_count();
        let hits = Arc::new(AtomicUsize::new(0));

        signal(SIGWINCH, SignalAction::Ignore).unwrap();
        assert_eq!(armed_count(), before);
        signal(SIGWINCH, counting_handler(&hits)).unwrap();
        assert_eq!(armed_count(), before + 1);
        assert!(isset_handler(SIGWINCH));
        signal(SIGWINCH, SignalAction::Clear).unwrap();
        assert_eq!(armed_count(), before);
        assert!(!isset_handler(SIGWINCH));
    }

    #[test]
    fn test_replace_does_not_double_count() {
        let _g = serial();
        let before = armed_count();
        let hits = Arc::new(AtomicUsize::new(0));
        signal(SIGURG, counting_handler(&hits)).unwrap();
        signal(SIGURG, counting_handler(&hits)).unwrap();
        assert_eq!(armed_count(), before + 1);
        signal(SIGURG, SignalAction::Clear).unwrap();
        assert_eq!(armed_count(), before);
    }

    #[test]
    fn test_clear_without_handler() {
        let _g = serial();
        assert_eq!(signal(SIGIO, SignalAction::Clear), Err(Error::NotFound));
    }

    #[test]
    fn test_raised_signal_dispatches_once() {
        let _g = serial();
        let hits = Arc::new(AtomicUsize::new(0));
        signal(SIGUSR2, counting_handler(&hits)).unwrap();

        assert_eq!(unsafe { libc::raise(SIGUSR2) }, 0);
        dispatch_pending();
        dispatch_pending();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        signal(SIGUSR2, SignalAction::Clear).unwrap();
    }

    #[test]
    fn test_handler_error_is_swallowed() {
        let _g = serial();
        signal(SIGHUP, SignalAction::Handler(Box::new(|_| Err(Error::Timeout)))).unwrap();
        assert_eq!(unsafe { libc::raise(SIGHUP) }, 0);
        dispatch_pending();
        assert!(isset_handler(SIGHUP));
        signal(SIGHUP, SignalAction::Clear).unwrap();
    }

    #[test]
    fn test_exported_signals_fit_the_table() {
        let all = [
            SIGHUP, SIGINT, SIGQUIT, SIGILL, SIGTRAP, SIGABRT, SIGBUS, SIGFPE, SIGKILL, SIGUSR1, SIGSEGV, SIGUSR2,
            SIGPIPE, SIGALRM, SIGTERM, SIGCHLD, SIGCONT, SIGSTOP, SIGTSTP, SIGTTIN, SIGTTOU, SIGURG, SIGXCPU, SIGXFSZ,
            SIGVTALRM, SIGPROF, SIGWINCH, SIGIO, SIGSYS,
        ];
        assert!(all.iter().all(|&s| s > 0 && s < SIGNAL_MAX));
        let mut sorted = all.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), all.len());
    }

    #[test]
    fn test_kill_probe() {
        assert!(kill(std::process::id() as i32, 0).is_ok());
        assert!(matches!(kill(i32::MAX, 0), Err(Error::Syscall(libc::ESRCH))));
        assert!(kill(1, SIGNO_MAX).is_err());
    }

    #[test]
    fn test_alarm_disarm() {
        alarm(0, ItimerKind::Real).unwrap();
        assert!(alarm(-1, ItimerKind::Real).is_err());
    }

    #[test]
    fn test_wait_signal_toggle() {
        let _g = serial();
        let prev = wait_signal();
        set_wait_signal(false);
        assert!(!wait_signal());
        set_wait_signal(prev);
    }
}
