//! # prefork-runtime
//!
//! Process-level services for prefork.
//!
//! This crate provides:
//! - A single-threaded poll(2) reactor, one per thread
//! - The signal table with reactor-side dispatch
//! - Worker processes: creation, fork, pipes, message queues
//! - The async-threads bridge between the reactor and the thread pool
//! - Process utilities (reaping, daemonizing, affinity, priority)
//! - Environment-driven configuration

pub mod config;
pub mod reactor;
pub mod signal;
pub mod process;
pub mod worker;
pub mod async_threads;

// Re-exports
pub use config::RuntimeConfig;
pub use reactor::Reactor;
pub use signal::{ItimerKind, SignalAction, SignalHandler};
pub use process::{cpu_num, daemon, wait_process, ExitStatus, PriorityWhich};
pub use worker::{
    EntryFn, EntryResult, ExportedChannel, PipeClose, QueueMode, Worker, WorkerOptions, WorkerSettings,
};
