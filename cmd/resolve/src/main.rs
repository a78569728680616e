//! Resolve hostnames on the async thread pool
//!
//! Every name on the command line is looked up concurrently; results are
//! printed from the reactor thread as they complete.
//!
//! Run: ./target/release/prefork-resolve localhost example.com
//!      PREFORK_AIO_THREADS=2 ./target/release/prefork-resolve a.test b.test

use prefork::resolver::{handler_getaddrinfo, resolve_error_str};
use prefork::{async_threads, kerror, reactor, AsyncEvent, Error, GetaddrinfoRequest};

use std::cell::Cell;
use std::rc::Rc;

fn main() {
    let names: Vec<String> = std::env::args().skip(1).collect();
    let names = if names.is_empty() { vec!["localhost".to_string()] } else { names };

    let failures = Rc::new(Cell::new(0usize));
    for name in &names {
        let req = GetaddrinfoRequest::new(name.clone(), libc::AF_UNSPEC, libc::SOCK_STREAM, 0, None);
        let event = AsyncEvent::new(req);
        let failures = Rc::clone(&failures);
        let cb_failures = Rc::clone(&failures);
        let dispatched = async_threads::dispatch(event, handler_getaddrinfo, move |ev| {
            let failures = &cb_failures;
            let Some(req) = ev.request::<GetaddrinfoRequest>() else {
                return;
            };
            match &ev.error {
                None => {
                    let mut addrs = req.parse_result();
                    addrs.dedup();
                    println!("{:<32} {} ({:.3}s)", req.hostname, addrs.join(" "), ev.elapsed());
                }
                Some(Error::Resolve(code)) => {
                    failures.set(failures.get() + 1);
                    println!("{:<32} error: {}", req.hostname, resolve_error_str(*code));
                }
                Some(e) => {
                    failures.set(failures.get() + 1);
                    println!("{:<32} error: {}", req.hostname, e);
                }
            }
        });
        if !dispatched {
            kerror!("could not dispatch lookup for {}", name);
            failures.set(failures.get() + 1);
        }
    }

    if !reactor::is_available() {
        std::process::exit(1);
    }
    if let Err(e) = reactor::run() {
        kerror!("reactor failed: {}", e);
        std::process::exit(2);
    }
    async_threads::shutdown();
    reactor::free();

    if failures.get() > 0 {
        std::process::exit(1);
    }
}
