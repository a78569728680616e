//! Async event — the unit of work handed to the background thread pool.
//!
//! An `AsyncEvent` is created on the reactor thread, moved into the pool,
//! executed by exactly one pool thread, moved back through the done queue
//! and finally handed by value to the caller's completion callback.
//! Ownership moves at every step, so no two threads ever touch the same
//! event at once.
//!
//! The request payload is opaque to the dispatch machinery. Handlers
//! downcast it to the concrete request type they understand.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Error;

/// Payload carried by an `AsyncEvent`.
///
/// Blanket-implemented for every `Any + Send + Debug` type.
pub trait AsyncRequest: Any + Send + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send + fmt::Debug> AsyncRequest for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Executor run on a pool thread. Mutates `retval`/`error` in place.
pub type Handler = fn(&mut AsyncEvent);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// One dispatched unit of blocking work
#[derive(Debug)]
pub struct AsyncEvent {
    /// Process-unique task id, also the completion-pipe token
    pub task_id: u64,
    /// Set before execution to skip the blocking work
    pub canceled: bool,
    /// Outcome error, `None` on success
    pub error: Option<Error>,
    /// Opaque input/output payload
    pub request: Box<dyn AsyncRequest>,
    /// Handler result; stays `None` for canceled events
    pub retval: Option<isize>,
    /// Creation time, seconds since the epoch
    pub timestamp: f64,
}

impl AsyncEvent {
    /// Wrap `request` into a fresh event with a new task id
    pub fn new<R: AsyncRequest>(request: R) -> Self {
        Self {
            task_id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            canceled: false,
            error: None,
            request: Box::new(request),
            retval: None,
            timestamp: microtime(),
        }
    }

    /// True when the error is an expected outcome (timeout or cancellation)
    /// rather than a hard failure.
    #[inline]
    pub fn catch_error(&self) -> bool {
        matches!(self.error, Some(Error::Timeout) | Some(Error::Canceled))
    }

    /// Borrow the payload as `R`
    pub fn request<R: AsyncRequest>(&self) -> Option<&R> {
        (*self.request).as_any().downcast_ref::<R>()
    }

    /// Mutably borrow the payload as `R`
    pub fn request_mut<R: AsyncRequest>(&mut self) -> Option<&mut R> {
        (*self.request).as_any_mut().downcast_mut::<R>()
    }

    /// Seconds elapsed since the event was created
    pub fn elapsed(&self) -> f64 {
        microtime() - self.timestamp
    }
}

fn microtime() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
