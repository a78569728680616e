//! # prefork-core
//!
//! Core types and traits for prefork, the worker-process and async-dispatch
//! toolkit.
//!
//! This crate holds no process-level state. Everything that forks, installs
//! signal handlers or runs an event loop lives in `prefork-runtime`; default
//! OS-backed implementations live in `prefork-module`.
//!
//! ## Modules
//!
//! - `error` - Error taxonomy shared by every crate
//! - `event` - `AsyncEvent` and the request payload contract
//! - `event_loop` - The reactor contract consumed by workers, signals and async threads
//! - `notifier` - Completion notification trait
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod error;
pub mod event;
pub mod event_loop;
pub mod notifier;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use error::{errno, Error, Result};
pub use event::{AsyncEvent, AsyncRequest, Handler};
pub use event_loop::{EventLoop, ExitCondition, ExitKey};
pub use notifier::Notifier;
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

/// Shared limits and sizes
pub mod constants {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            /// Upper bound (exclusive) on signal numbers the signal table tracks
            pub const SIGNO_MAX: i32 = 65;
        } else {
            /// Upper bound (exclusive) on signal numbers the signal table tracks
            pub const SIGNO_MAX: i32 = 33;
        }
    }

    /// Largest payload a single message-queue message can carry
    pub const MSG_MAX: usize = 8192;

    /// Default `read()` size for worker pipes
    pub const PIPE_READ_SIZE: usize = 8192;

    /// Size of one completion token on the async completion pipe
    pub const TOKEN_SIZE: usize = std::mem::size_of::<u64>();

    /// Largest valid process exit code
    pub const EXIT_CODE_MAX: i32 = 255;
}
