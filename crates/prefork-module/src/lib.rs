//! # prefork-module — Default (safe) implementations
//!
//! This crate provides the OS-backed building blocks used by
//! `prefork-runtime`. Each impl prioritizes correctness and simplicity.
//!
//! ## Default stack
//!
//! | Concern             | Default Impl       | Backing                      |
//! |---------------------|--------------------|------------------------------|
//! | Worker pipe         | UnixPipe           | socketpair(AF_UNIX)          |
//! | Message queue       | MessageQueue       | SysV msgget/msgsnd/msgrcv    |
//! | Notifier            | CompletionPipe     | pipe2, 8-byte task tokens    |
//! | Async thread pool   | FixedPool          | Mutex + Condvar, SegQueue    |
//! | Async requests      | resolver           | getaddrinfo                  |

pub mod unix_pipe;
pub mod msg_queue;
pub mod completion_pipe;
pub mod fixed_pool;
pub mod resolver;

pub use unix_pipe::{PipeEnd, PipeSocket, PipeType, UnixPipe};
pub use msg_queue::{ftok_key, MessageQueue, QueueStat};
pub use completion_pipe::CompletionPipe;
pub use fixed_pool::{FixedPool, PoolConfig};
pub use resolver::{GetaddrinfoRequest, GethostbynameRequest};
