//! Fork-based worker scenarios.
//!
//! `wait_process` reaps any child, so tests that fork run one at a time.

use prefork_core::error::Error;
use prefork_core::event_loop::EventLoop;
use prefork_module::{PipeEnd, PipeType};
use prefork_runtime::{reactor, wait_process, PipeClose, QueueMode, Worker, WorkerOptions};

use std::sync::{Mutex, MutexGuard};

fn serial() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn reap(pid: i32) -> i32 {
    let status = wait_process(true).unwrap().expect("a child should have exited");
    assert_eq!(status.pid, pid);
    assert_eq!(status.signal, None);
    status.code
}

#[test]
fn test_stream_pipe_roundtrip() {
    let _g = serial();
    let mut w = Worker::create(
        |w: &mut Worker| {
            let msg = w.read(0)?;
            w.write(&msg)?;
            Ok(())
        },
        WorkerOptions::default().pipe_type(PipeType::Stream),
    )
    .unwrap();

    let pid = w.start().unwrap();
    assert!(pid > 0);
    assert_eq!(w.pid(), pid);
    assert_eq!(w.pipe_current(), Some(PipeEnd::Master));

    w.write(b"x").unwrap();
    assert_eq!(w.read(16).unwrap(), b"x");
    assert_eq!(reap(pid), 0);
}

#[test]
fn test_datagram_uppercase_echo() {
    let _g = serial();
    let mut w = Worker::create(
        |w: &mut Worker| {
            let msg = w.read(0)?;
            w.write(&msg.to_ascii_uppercase())?;
            Ok(())
        },
        WorkerOptions::default().pipe_type(PipeType::Datagram),
    )
    .unwrap();

    let pid = w.start().unwrap();
    w.write(b"ping").unwrap();
    assert_eq!(w.read(0).unwrap(), b"PING");
    assert_eq!(reap(pid), 0);
}

#[test]
fn test_coroutine_worker_runs_its_reactor() {
    let _g = serial();
    let mut w = Worker::create(
        |w: &mut Worker| {
            let Some(r) = reactor::current() else {
                w.exit(3)?;
                return Ok(());
            };
            let fd = w.pipe_fd().ok_or("worker has no pipe")?;
            // Nothing is read here; the reactor started after this entry
            // returns delivers the message.
            r.add_reader(
                fd,
                false,
                Box::new(|fd| {
                    let mut buf = [0u8; 64];
                    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                    if n > 0 {
                        let mut reply = b"loop:".to_vec();
                        reply.extend_from_slice(&buf[..n as usize]);
                        unsafe { libc::write(fd, reply.as_ptr() as *const libc::c_void, reply.len()) };
                    }
                    if let Some(r) = reactor::current() {
                        r.del(fd);
                    }
                }),
            )?;
            Ok(())
        },
        WorkerOptions::default().pipe_type(PipeType::Datagram).enable_coroutine(true),
    )
    .unwrap();

    let pid = w.start().unwrap();
    w.write(b"ping").unwrap();
    assert_eq!(w.read(0).unwrap(), b"loop:ping");
    assert_eq!(reap(pid), 0);
}

#[test]
fn test_start_twice_while_alive() {
    let _g = serial();
    let mut w = Worker::create(
        |w: &mut Worker| {
            // Block until the parent says goodbye.
            let _ = w.read(0)?;
            Ok(())
        },
        WorkerOptions::default(),
    )
    .unwrap();

    let pid = w.start().unwrap();
    assert_eq!(w.start(), Err(Error::AlreadyStarted));
    w.write(b"bye").unwrap();
    assert_eq!(reap(pid), 0);
}

#[test]
fn test_entry_error_still_exits_cleanly() {
    let _g = serial();
    let mut w = Worker::create(
        |_: &mut Worker| Err("entry failed on purpose".into()),
        WorkerOptions::default().pipe_type(PipeType::None),
    )
    .unwrap();
    let pid = w.start().unwrap();
    assert_eq!(reap(pid), 0);
}

#[test]
fn test_worker_exit_code_is_clamped() {
    let _g = serial();
    let mut w = Worker::create(
        |w: &mut Worker| {
            w.exit(300)?;
            Ok(())
        },
        WorkerOptions::default().pipe_type(PipeType::None),
    )
    .unwrap();
    let pid = w.start().unwrap();
    assert_eq!(reap(pid), 1);
}

#[test]
fn test_queue_between_processes() {
    let _g = serial();
    let mut w = Worker::create(
        |w: &mut Worker| {
            w.push(b"from child")?;
            Ok(())
        },
        WorkerOptions::default().pipe_type(PipeType::None),
    )
    .unwrap();
    w.use_queue(Some(libc::IPC_PRIVATE), QueueMode::Balanced, true, None).unwrap();

    let pid = w.start().unwrap();
    assert_eq!(w.pop(0).unwrap(), b"from child");
    assert_eq!(reap(pid), 0);
    w.free_queue().unwrap();
}

#[test]
fn test_redirected_stdio_reaches_parent() {
    let _g = serial();
    let mut w = Worker::create(
        |_: &mut Worker| {
            use std::io::Write;
            let mut out = std::io::stdout();
            out.write_all(b"hello from stdout")?;
            out.flush()?;
            let mut err = std::io::stderr();
            err.write_all(b", hello from stderr")?;
            err.flush()?;
            Ok(())
        },
        WorkerOptions::default().redirect_stdio(true),
    )
    .unwrap();
    assert_eq!(w.pipe_type(), PipeType::Stream);

    let pid = w.start().unwrap();
    assert_eq!(reap(pid), 0);
    w.close(PipeClose::Worker).unwrap();

    let mut got = Vec::new();
    loop {
        let chunk = w.read(64).unwrap();
        if chunk.is_empty() {
            break;
        }
        got.extend(chunk);
    }
    assert_eq!(got, b"hello from stdout, hello from stderr");
}
