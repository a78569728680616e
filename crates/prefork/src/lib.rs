//! # prefork - worker processes around a single-threaded reactor
//!
//! Spawn cooperating worker processes, talk to them over socket pairs or
//! SysV message queues, turn OS signals into ordinary loop callbacks and
//! push blocking work onto a thread pool without blocking the loop.
//!
//! ## Quick Start
//!
//! ```ignore
//! use prefork::{PipeType, Worker, WorkerOptions};
//!
//! fn main() -> prefork::Result<()> {
//!     let mut worker = Worker::create(
//!         |w: &mut Worker| {
//!             let msg = w.read(0)?;
//!             w.write(&msg.to_ascii_uppercase())?;
//!             Ok(())
//!         },
//!         WorkerOptions::default().pipe_type(PipeType::Datagram),
//!     )?;
//!
//!     worker.start()?;
//!     worker.write(b"ping")?;
//!     assert_eq!(worker.read(0)?, b"PING");
//!     prefork::wait_process(true)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        Worker, signal(), async_threads::dispatch()          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Reactor (one per thread)                   │
//! │      poll(2), deferred callbacks, exit conditions           │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌─────────────┐
//!    │  Signal   │      │  Worker   │      │ Async pool  │
//!    │ wake pipe │      │  pipes    │      │ completion  │
//!    └───────────┘      └───────────┘      │    pipe     │
//!                              │           └─────────────┘
//!                              ▼                   │
//!    ┌──────────────────────────────────┐          ▼
//!    │ Worker processes (fork)          │   ┌─────────────┐
//!    │ socketpair / SysV msg queue      │   │ OS threads  │
//!    └──────────────────────────────────┘   └─────────────┘
//! ```

// Re-export core types
pub use prefork_core::{
    errno, AsyncEvent, AsyncRequest, Error, EventLoop, ExitCondition, ExitKey, Handler, Notifier, Result,
};
pub use prefork_core::{kdebug, kerror, kinfo, kprintln, ktrace, kwarn};
pub use prefork_core::constants;
pub use prefork_core::{env, kprint};

// Re-export default implementations
pub use prefork_module::{
    ftok_key, CompletionPipe, FixedPool, GetaddrinfoRequest, GethostbynameRequest, MessageQueue, PipeEnd,
    PipeSocket, PipeType, PoolConfig, QueueStat, UnixPipe,
};
pub use prefork_module::resolver;

// Re-export runtime
pub use prefork_runtime::{async_threads, config, process, reactor, signal};
pub use prefork_runtime::{
    cpu_num, daemon, wait_process, EntryResult, ExitStatus, ExportedChannel, ItimerKind, PipeClose, PriorityWhich,
    QueueMode, Reactor, RuntimeConfig, SignalAction, Worker, WorkerOptions, WorkerSettings,
};
