//! Bridge between the reactor thread and the async thread pool.
//!
//! `dispatch()` hands an `AsyncEvent` to the pool and remembers the
//! completion callback on the reactor thread. Pool threads report finished
//! task ids through a `CompletionPipe` registered as an internal reader; the
//! reactor drains it, pops the finished events and runs each callback
//! exactly once. The pool is created lazily on first dispatch, one per
//! reactor thread.

use prefork_core::error::Result;
use prefork_core::event::{AsyncEvent, Handler};
use prefork_core::event_loop::{EventLoop, ExitKey};
use prefork_core::{kdebug, kerror, kwarn};
use prefork_module::{CompletionPipe, FixedPool, PoolConfig};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::reactor;

/// Completion callback, run on the reactor thread
pub type Callback = Box<dyn FnOnce(AsyncEvent)>;

pub struct AsyncThreads {
    pool: RefCell<FixedPool>,
    pipe: Arc<CompletionPipe>,
    callbacks: RefCell<HashMap<u64, Callback>>,
    task_num: Cell<usize>,
    tokens: RefCell<Vec<u64>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<AsyncThreads>>> = const { RefCell::new(None) };
}

fn current() -> Option<Rc<AsyncThreads>> {
    CURRENT.with(|c| c.borrow().clone())
}

fn get_or_init() -> Result<Rc<AsyncThreads>> {
    if let Some(at) = current() {
        return Ok(at);
    }
    let r = reactor::init()?;
    let config = RuntimeConfig::from_env();
    config.validate()?;

    let pipe = Arc::new(CompletionPipe::create()?);
    let pool = FixedPool::new(
        PoolConfig { threads: config.aio_threads, max_pending: config.aio_max_pending },
        pipe.clone(),
    )?;
    let at = Rc::new(AsyncThreads {
        pool: RefCell::new(pool),
        pipe,
        callbacks: RefCell::new(HashMap::new()),
        task_num: Cell::new(0),
        tokens: RefCell::new(Vec::new()),
    });

    let weak = Rc::downgrade(&at);
    r.add_reader(
        at.pipe.read_fd(),
        true,
        Box::new(move |_| {
            if let Some(at) = weak.upgrade() {
                at.on_readable();
            }
        }),
    )?;
    let weak = Rc::downgrade(&at);
    r.set_exit_condition(
        ExitKey::AsyncThreads,
        Box::new(move |_| weak.upgrade().map_or(true, |at| at.task_num.get() == 0)),
    );

    CURRENT.with(|c| *c.borrow_mut() = Some(Rc::clone(&at)));
    kdebug!("async threads started: {} workers", config.aio_threads);
    Ok(at)
}

impl AsyncThreads {
    fn on_readable(&self) {
        {
            let mut tokens = self.tokens.borrow_mut();
            tokens.clear();
            if let Err(e) = self.pipe.drain(&mut tokens) {
                kwarn!("async completion pipe read failed: {}", e);
            }
        }
        loop {
            let Some(event) = self.pool.borrow().pop_completed() else {
                break;
            };
            let callback = self.callbacks.borrow_mut().remove(&event.task_id);
            match callback {
                Some(cb) => {
                    self.task_num.set(self.task_num.get().saturating_sub(1));
                    cb(event);
                }
                None => kerror!("async task {} completed without a callback", event.task_id),
            }
        }
    }
}

/// Run `handler(&mut event)` on the pool and `callback(event)` on this
/// thread once it is done. Returns false, dropping the event, when the pool
/// is at capacity or cannot be started.
pub fn dispatch<C>(event: AsyncEvent, handler: Handler, callback: C) -> bool
where
    C: FnOnce(AsyncEvent) + 'static,
{
    let at = match get_or_init() {
        Ok(at) => at,
        Err(e) => {
            kwarn!("async threads unavailable: {}", e);
            return false;
        }
    };
    let task_id = event.task_id;
    at.callbacks.borrow_mut().insert(task_id, Box::new(callback));
    if !at.pool.borrow().dispatch(event, handler) {
        at.callbacks.borrow_mut().remove(&task_id);
        return false;
    }
    at.task_num.set(at.task_num.get() + 1);
    true
}

/// Cancel a task that has not started yet. Its callback still runs, with
/// `error == Some(Canceled)` and `retval == None`.
pub fn cancel(task_id: u64) -> bool {
    current().map_or(false, |at| at.pool.borrow().cancel(task_id))
}

/// Tasks dispatched whose callback has not run yet
pub fn task_num() -> usize {
    current().map_or(0, |at| at.task_num.get())
}

/// Tasks waiting for a pool thread
pub fn queue_size() -> usize {
    current().map_or(0, |at| at.pool.borrow().queue_size())
}

pub fn worker_num() -> usize {
    current().map_or(0, |at| at.pool.borrow().total_workers())
}

/// Whether this thread has a running pool
pub fn is_active() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

/// Stop and join the pool. Pending callbacks are dropped without running.
pub fn shutdown() {
    let Some(at) = CURRENT.with(|c| c.borrow_mut().take()) else {
        return;
    };
    at.pool.borrow_mut().shutdown();
    if let Some(r) = reactor::current() {
        r.del(at.pipe.read_fd());
        r.remove_exit_condition(ExitKey::AsyncThreads);
    }
    let dropped = at.callbacks.borrow_mut().drain().count();
    if dropped > 0 {
        kwarn!("async threads shut down with {} callbacks pending", dropped);
    }
}
