//! Safe signal dispatch
//!
//! Raw delivery only marks the signal pending and wakes the reactor; user
//! handlers run later, on the reactor thread, outside signal context.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    } else {
        compile_error!("prefork signals require a unix target");
    }
}
