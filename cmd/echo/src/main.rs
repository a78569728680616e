//! prefork end-to-end smoke test
//!
//! Exercises the whole stack in one process tree:
//!   Part A — Worker pipes: datagram ping/PING, stream echo
//!   Part B — Message queue shared with a worker
//!   Part C — Signals dispatched through the reactor
//!   Part D — Async dispatch onto the thread pool
//!
//! Run: ./target/release/prefork-echo

use prefork::{
    async_threads, reactor, signal, wait_process, AsyncEvent, GethostbynameRequest, PipeType, QueueMode,
    SignalAction, Worker, WorkerOptions,
};

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok {
            self.pass(name);
        } else {
            self.fail(name, reason);
        }
    }

    fn result<T, E: std::fmt::Display>(&mut self, name: &str, r: Result<T, E>) -> Option<T> {
        match r {
            Ok(v) => {
                self.pass(name);
                Some(v)
            }
            Err(e) => {
                self.fail(name, &e.to_string());
                None
            }
        }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!("  Total: {}  Passed: {}  Failed: {}", self.total, self.passed, self.failed);
        println!("{}", LINE);
    }
}

fn reap(t: &mut TestRunner, name: &str, pid: i32) {
    match wait_process(true) {
        Ok(Some(st)) => t.check(name, st.pid == pid && st.code == 0, &format!("{:?}", st)),
        Ok(None) => t.fail(name, "no child reaped"),
        Err(e) => t.fail(name, &e.to_string()),
    }
}

// ── Part A ──

fn part_pipes(t: &mut TestRunner) {
    t.section("Part A — Worker pipes");

    let upper = Worker::create(
        |w: &mut Worker| {
            let msg = w.read(0)?;
            w.write(&msg.to_ascii_uppercase())?;
            Ok(())
        },
        WorkerOptions::default().pipe_type(PipeType::Datagram),
    );
    if let Some(mut w) = t.result("create datagram worker", upper) {
        if let Some(pid) = t.result("fork datagram worker", w.start()) {
            t.result("write \"ping\"", w.write(b"ping"));
            let reply = w.read(0);
            t.check("read \"PING\"", reply.as_deref() == Ok(b"PING".as_slice()), &format!("{:?}", reply));
            reap(t, "datagram worker exits 0", pid);
        }
    }

    let echo = Worker::create(
        |w: &mut Worker| {
            let msg = w.read(0)?;
            w.write(&msg)?;
            Ok(())
        },
        WorkerOptions::default().pipe_type(PipeType::Stream),
    );
    if let Some(mut w) = t.result("create stream worker", echo) {
        if let Some(pid) = t.result("fork stream worker", w.start()) {
            t.result("write one byte", w.write(b"x"));
            let reply = w.read(16);
            t.check("byte echoed back", reply.as_deref() == Ok(b"x".as_slice()), &format!("{:?}", reply));
            reap(t, "stream worker exits 0", pid);
        }
    }
}

// ── Part B ──

fn part_queue(t: &mut TestRunner) {
    t.section("Part B — Message queue");

    let worker = Worker::create(
        |w: &mut Worker| {
            let job = w.pop(0)?;
            w.push(&[job.as_slice(), b"-done"].concat())?;
            Ok(())
        },
        WorkerOptions::default().pipe_type(PipeType::None),
    );
    let Some(mut w) = t.result("create queue worker", worker) else {
        return;
    };
    if t.result("attach private queue", w.use_queue(Some(libc::IPC_PRIVATE), QueueMode::Balanced, true, None)).is_none() {
        return;
    }
    t.result("push job", w.push(b"job"));
    if let Some(pid) = t.result("fork queue worker", w.start()) {
        reap(t, "queue worker exits 0", pid);
        let reply = w.pop(0);
        t.check("reply popped", reply.as_deref() == Ok(b"job-done".as_slice()), &format!("{:?}", reply));
    }
    t.result("destroy queue", w.free_queue());
}

// ── Part C ──

fn part_signals(t: &mut TestRunner) {
    t.section("Part C — Signals");

    if t.result("init reactor", reactor::init()).is_none() {
        return;
    }
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    let installed = signal::signal(
        signal::SIGUSR1,
        SignalAction::Handler(Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })),
    );
    t.result("install SIGUSR1 handler", installed);
    t.check("armed count is 1", signal::armed_count() == 1, &signal::armed_count().to_string());

    t.result("kill(self, SIGUSR1)", signal::kill(std::process::id() as i32, signal::SIGUSR1));
    t.check("not run in signal context", hits.load(Ordering::SeqCst) == 0, "handler ran early");
    let _ = reactor::run_once(Some(Duration::from_millis(200)));
    t.check("handler ran once", hits.load(Ordering::SeqCst) == 1, &hits.load(Ordering::SeqCst).to_string());

    t.result("clear SIGUSR1", signal::signal(signal::SIGUSR1, SignalAction::Clear));
    t.check("armed count back to 0", signal::armed_count() == 0, &signal::armed_count().to_string());
}

// ── Part D ──

fn part_async(t: &mut TestRunner) {
    t.section("Part D — Async dispatch");

    let answer = Rc::new(RefCell::new(None));
    let a = Rc::clone(&answer);
    let ok = async_threads::dispatch(
        AsyncEvent::new(GethostbynameRequest::new("127.0.0.1", libc::AF_INET)),
        prefork::resolver::handler_gethostbyname,
        move |ev| {
            *a.borrow_mut() = ev.request::<GethostbynameRequest>().and_then(|r| r.addr.clone());
        },
    );
    t.check("dispatch gethostbyname", ok, "pool refused the task");
    t.check("task outstanding", async_threads::task_num() == 1, &async_threads::task_num().to_string());
    t.result("run reactor to completion", reactor::run());
    let got = answer.borrow().clone();
    t.check("resolved 127.0.0.1", got.as_deref() == Some("127.0.0.1"), &format!("{:?}", got));
    t.check("no task outstanding", async_threads::task_num() == 0, &async_threads::task_num().to_string());

    async_threads::shutdown();
    reactor::free();
}

fn main() {
    let mut t = TestRunner::new();

    // Forking needs a single-threaded parent, so the pool comes last.
    part_pipes(&mut t);
    part_queue(&mut t);
    part_signals(&mut t);
    part_async(&mut t);

    t.summary();
    if t.failed > 0 {
        std::process::exit(1);
    }
}
