//! Compile-time defaults for `RuntimeConfig`

/// Upper bound on the auto-sized async pool
pub const AIO_THREADS_MAX: usize = 8;

/// Lower bound on the auto-sized async pool
pub const AIO_THREADS_MIN: usize = 2;

/// Maximum async events in flight per reactor thread
pub const AIO_MAX_PENDING: usize = 1024;

/// Default `Worker::read()` size
pub const READ_BUFFER_SIZE: usize = prefork_core::constants::PIPE_READ_SIZE;

/// Keep the reactor alive while signal handlers are armed
pub const WAIT_SIGNAL: bool = true;

/// Longest single poll(2) wait, milliseconds
pub const POLL_TIMEOUT_MS: u64 = 1000;

/// min(8, max(2, nproc / 2))
pub fn aio_threads() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    (cpus / 2).clamp(AIO_THREADS_MIN, AIO_THREADS_MAX)
}
