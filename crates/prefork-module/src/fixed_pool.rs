//! `FixedPool` — background thread pool for blocking async work.
//!
//! Spawns N OS threads at creation. Workers sleep on a condvar until an
//! event is queued, run its handler (which may block), push the finished
//! event onto a lock-free done queue and notify the reactor with the task
//! id. The reactor thread pops finished events with `pop_completed()`.
//!
//! The number of events between `dispatch()` and `pop_completed()` is
//! capped at `max_pending`; dispatch beyond the cap is refused.

use prefork_core::error::{Error, Result};
use prefork_core::event::{AsyncEvent, Handler};
use prefork_core::notifier::Notifier;
use prefork_core::{kdebug, kerror};

use crossbeam_queue::SegQueue;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

/// Pool sizing
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Worker thread count (at least 1)
    pub threads: usize,
    /// Maximum events in flight
    pub max_pending: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self { threads: cpus.clamp(2, 8), max_pending: 1024 }
    }
}

/// A queued unit of work
struct Job {
    event: AsyncEvent,
    handler: Handler,
}

/// Shared state between the reactor thread and the workers
struct PoolInner {
    /// Pending jobs: reactor → workers
    queue: Mutex<VecDeque<Job>>,
    cond: Condvar,
    /// Finished events: workers → reactor
    done: SegQueue<AsyncEvent>,
    notifier: Arc<dyn Notifier>,
    /// Dispatched but not yet popped
    outstanding: AtomicUsize,
    /// Workers currently running a handler
    active: AtomicUsize,
    shutdown: AtomicBool,
    max_pending: usize,
}

impl PoolInner {
    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Job>> {
        // Handlers never run under the lock, so poisoning only happens on a
        // bug in the pool itself; the queue is still consistent.
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct FixedPool {
    inner: Arc<PoolInner>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl FixedPool {
    /// Start `config.threads` workers reporting completions to `notifier`
    pub fn new(config: PoolConfig, notifier: Arc<dyn Notifier>) -> Result<Self> {
        if config.max_pending == 0 {
            return Err(Error::InvalidParams("max_pending must be positive"));
        }
        let n = config.threads.max(1);
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            done: SegQueue::new(),
            notifier,
            outstanding: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            max_pending: config.max_pending,
        });

        let mut pool = FixedPool { inner, handles: Vec::with_capacity(n) };
        for worker_id in 0..n {
            let inner = Arc::clone(&pool.inner);
            let handle = thread::Builder::new()
                .name(format!("prefork-aio-{}", worker_id))
                .spawn(move || worker_loop(inner, worker_id))?;
            pool.handles.push(handle);
        }
        kdebug!("async pool started: {} threads, max_pending {}", n, config.max_pending);
        Ok(pool)
    }

    /// Queue `event` to run `handler` on a worker.
    ///
    /// Returns false (dropping the event) when the pool is at capacity or
    /// shut down.
    pub fn dispatch(&self, event: AsyncEvent, handler: Handler) -> bool {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return false;
        }
        let reserved = self.inner.outstanding.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < self.inner.max_pending).then_some(n + 1)
        });
        if reserved.is_err() {
            kdebug!("async pool full, refusing task {}", event.task_id);
            return false;
        }
        self.inner.lock_queue().push_back(Job { event, handler });
        self.inner.cond.notify_one();
        true
    }

    /// Mark a still-queued event as canceled. It will complete with
    /// `Error::Canceled` without running its handler. Returns false when
    /// the event has already been picked up or is unknown.
    pub fn cancel(&self, task_id: u64) -> bool {
        let mut queue = self.inner.lock_queue();
        match queue.iter_mut().find(|job| job.event.task_id == task_id) {
            Some(job) => {
                job.event.canceled = true;
                true
            }
            None => false,
        }
    }

    /// Take one finished event, if any
    pub fn pop_completed(&self) -> Option<AsyncEvent> {
        let event = self.inner.done.pop()?;
        self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);
        Some(event)
    }

    /// Events waiting for a worker
    pub fn queue_size(&self) -> usize {
        self.inner.lock_queue().len()
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    pub fn total_workers(&self) -> usize {
        self.handles.len()
    }

    /// Events dispatched and not yet popped
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop the workers and join them. Queued events still run; events that
    /// arrive afterwards are refused. Idempotent.
    pub fn shutdown(&mut self) {
        {
            let _guard = self.inner.lock_queue();
            self.inner.shutdown.store(true, Ordering::Release);
        }
        self.inner.cond.notify_all();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                kerror!("async pool worker exited by panic");
            }
        }
    }
}

impl Drop for FixedPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker thread main loop
fn worker_loop(inner: Arc<PoolInner>, worker_id: usize) {
    loop {
        let job = {
            let mut queue = inner.lock_queue();
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                queue = inner.cond.wait(queue).unwrap_or_else(|e| e.into_inner());
            }
        };
        let Some(Job { mut event, handler }) = job else {
            break;
        };

        if event.canceled {
            event.error = Some(Error::Canceled);
            event.retval = None;
        } else {
            inner.active.fetch_add(1, Ordering::Relaxed);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&mut event)));
            inner.active.fetch_sub(1, Ordering::Relaxed);
            if outcome.is_err() {
                kerror!("async task {} handler panicked on worker {}", event.task_id, worker_id);
                event.error = Some(Error::WrongOperation("async handler panicked"));
            }
        }

        let token = event.task_id;
        inner.done.push(event);
        if let Err(e) = inner.notifier.notify(token) {
            kerror!("async task {} completion notify failed: {}", token, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    /// Records notified tokens in memory
    #[derive(Default)]
    struct VecNotifier {
        tokens: Mutex<Vec<u64>>,
    }

    impl Notifier for VecNotifier {
        fn notify(&self, token: u64) -> Result<()> {
            self.tokens.lock().unwrap().push(token);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Add {
        a: isize,
        b: isize,
    }

    fn add_handler(ev: &mut AsyncEvent) {
        let r = ev.request::<Add>().unwrap();
        ev.retval = Some(r.a + r.b);
    }

    /// Blocks its worker until the test releases it
    #[derive(Debug)]
    struct Gate {
        rx: Mutex<mpsc::Receiver<()>>,
    }

    fn gate_handler(ev: &mut AsyncEvent) {
        let _ = ev.request::<Gate>().unwrap().rx.lock().unwrap().recv();
        ev.retval = Some(0);
    }

    fn wait_completed(pool: &FixedPool) -> AsyncEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(ev) = pool.pop_completed() {
                return ev;
            }
            assert!(Instant::now() < deadline, "timed out waiting for completion");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_dispatch_and_complete() {
        let notifier = Arc::new(VecNotifier::default());
        let pool = FixedPool::new(PoolConfig { threads: 2, max_pending: 16 }, notifier.clone()).unwrap();
        assert_eq!(pool.total_workers(), 2);

        let ev = AsyncEvent::new(Add { a: 2, b: 3 });
        let id = ev.task_id;
        assert!(pool.dispatch(ev, add_handler));

        let done = wait_completed(&pool);
        assert_eq!(done.task_id, id);
        assert_eq!(done.retval, Some(5));
        assert!(done.error.is_none());
        assert_eq!(pool.outstanding(), 0);

        // Joining the workers orders the notify after the pop above.
        drop(pool);
        assert_eq!(*notifier.tokens.lock().unwrap(), vec![id]);
    }

    #[test]
    fn test_dispatch_refused_at_capacity() {
        let notifier = Arc::new(VecNotifier::default());
        let pool = FixedPool::new(PoolConfig { threads: 1, max_pending: 2 }, notifier).unwrap();
        let (tx, rx) = mpsc::channel();

        assert!(pool.dispatch(AsyncEvent::new(Gate { rx: Mutex::new(rx) }), gate_handler));
        assert!(pool.dispatch(AsyncEvent::new(Add { a: 1, b: 1 }), add_handler));
        assert!(!pool.dispatch(AsyncEvent::new(Add { a: 1, b: 1 }), add_handler));
        assert_eq!(pool.outstanding(), 2);

        tx.send(()).unwrap();
        wait_completed(&pool);
        wait_completed(&pool);
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.dispatch(AsyncEvent::new(Add { a: 1, b: 1 }), add_handler));
        wait_completed(&pool);
    }

    #[test]
    fn test_cancel_queued_event() {
        let notifier = Arc::new(VecNotifier::default());
        let pool = FixedPool::new(PoolConfig { threads: 1, max_pending: 8 }, notifier).unwrap();
        let (tx, rx) = mpsc::channel();

        let gate = AsyncEvent::new(Gate { rx: Mutex::new(rx) });
        let gate_id = gate.task_id;
        assert!(pool.dispatch(gate, gate_handler));

        let victim = AsyncEvent::new(Add { a: 4, b: 4 });
        let victim_id = victim.task_id;
        assert!(pool.dispatch(victim, add_handler));

        // Give the single worker time to pick up the gate.
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.queue_size() != 1 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        assert!(pool.cancel(victim_id));
        assert!(!pool.cancel(gate_id));
        tx.send(()).unwrap();

        let first = wait_completed(&pool);
        assert_eq!(first.task_id, gate_id);
        let second = wait_completed(&pool);
        assert_eq!(second.task_id, victim_id);
        assert_eq!(second.error, Some(Error::Canceled));
        assert_eq!(second.retval, None);
        assert!(second.catch_error());
    }

    #[test]
    fn test_handler_panic_is_contained() {
        fn boom(_ev: &mut AsyncEvent) {
            panic!("boom");
        }
        let notifier = Arc::new(VecNotifier::default());
        let pool = FixedPool::new(PoolConfig { threads: 1, max_pending: 4 }, notifier).unwrap();
        assert!(pool.dispatch(AsyncEvent::new(Add { a: 0, b: 0 }), boom));
        let done = wait_completed(&pool);
        assert!(matches!(done.error, Some(Error::WrongOperation(_))));

        // The worker survives.
        assert!(pool.dispatch(AsyncEvent::new(Add { a: 1, b: 2 }), add_handler));
        assert_eq!(wait_completed(&pool).retval, Some(3));
    }

    #[test]
    fn test_shutdown_refuses_new_work() {
        let notifier = Arc::new(VecNotifier::default());
        let mut pool = FixedPool::new(PoolConfig { threads: 2, max_pending: 4 }, notifier).unwrap();
        pool.shutdown();
        assert!(pool.is_shutdown());
        assert_eq!(pool.total_workers(), 0);
        assert!(!pool.dispatch(AsyncEvent::new(Add { a: 1, b: 1 }), add_handler));
        pool.shutdown();
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let notifier = Arc::new(VecNotifier::default());
        assert!(FixedPool::new(PoolConfig { threads: 1, max_pending: 0 }, notifier).is_err());
    }
}
