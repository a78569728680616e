//! Completion notification abstraction.
//!
//! A `Notifier` wakes the reactor thread when an async task has finished.
//! Only the task id travels through the notifier; the event itself is handed
//! back through the pool's done queue.
//!
//! # Implementors
//!
//! - `CompletionPipe` (default): writes the 8-byte task id to a pipe whose
//!   read end is registered in the reactor. Writes of `TOKEN_SIZE` bytes are
//!   below PIPE_BUF and therefore atomic.

use crate::error::Result;

/// Wakes the reactor when a task completes.
///
/// **Contract:**
/// - `notify()` is called once per completed task, after the event has been
///   made available to the consumer.
/// - `notify()` may be called from any pool thread concurrently.
pub trait Notifier: Send + Sync {
    /// Signal that task `token` has completed.
    fn notify(&self, token: u64) -> Result<()>;
}
