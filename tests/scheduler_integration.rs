//! Scheduler integration tests
//!
//! These tests drive real processor and worker threads through the public
//! coroutine API.

use h2sched::config::{IoWorkerKind, SchedulerConfig};
use h2sched::http::transport::{io_source, MemoryTransport, Transport};
use h2sched::runtime::{Action, Context, Coroutine, Error, IoSource, PollEvents, Scheduler, Waker};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn scheduler(io_worker: IoWorkerKind) -> Scheduler {
    let config = SchedulerConfig {
        processors: Some(2),
        io_worker,
        drain_timeout_ms: 500,
        ..SchedulerConfig::default()
    };
    Scheduler::new(&config).unwrap()
}

const TIMEOUT: Duration = Duration::from_secs(5);

struct Counter {
    steps: usize,
    total: Arc<AtomicUsize>,
}

impl Coroutine for Counter {
    fn act(&mut self, _cx: &mut Context<'_>) -> Action {
        if self.steps == 0 {
            return Action::Finish;
        }
        self.steps -= 1;
        self.total.fetch_add(1, Ordering::Relaxed);
        if self.steps % 3 == 0 {
            Action::Yield
        } else {
            Action::Continue
        }
    }
}

#[test]
fn test_many_tasks_finish() {
    let scheduler = scheduler(IoWorkerKind::Event);
    let total = Arc::new(AtomicUsize::new(0));
    for _ in 0..200 {
        scheduler
            .submit(Counter {
                steps: 50,
                total: Arc::clone(&total),
            })
            .unwrap();
    }
    assert!(scheduler.wait_all_finished(TIMEOUT));
    assert_eq!(total.load(Ordering::Relaxed), 200 * 50);
    assert_eq!(scheduler.tasks_count(), 0);
    assert_eq!(scheduler.failed_count(), 0);
    assert_eq!(scheduler.processors_count(), 2);
}

struct Sleeper {
    started: Option<Instant>,
    elapsed: Arc<Mutex<Option<Duration>>>,
}

impl Coroutine for Sleeper {
    fn act(&mut self, _cx: &mut Context<'_>) -> Action {
        match self.started {
            None => {
                self.started = Some(Instant::now());
                Action::sleep(Duration::from_millis(30))
            }
            Some(started) => {
                *self.elapsed.lock() = Some(started.elapsed());
                Action::Finish
            }
        }
    }
}

#[test]
fn test_timer_wait() {
    let scheduler = scheduler(IoWorkerKind::Event);
    let elapsed = Arc::new(Mutex::new(None));
    scheduler
        .submit(Sleeper {
            started: None,
            elapsed: Arc::clone(&elapsed),
        })
        .unwrap();
    assert!(scheduler.wait_all_finished(TIMEOUT));
    let elapsed = elapsed.lock().take().unwrap();
    assert!(elapsed >= Duration::from_millis(30), "woke after {:?}", elapsed);
}

struct Parked {
    slot: Arc<Mutex<Option<Waker>>>,
    woken: Arc<AtomicBool>,
    parked: bool,
}

impl Coroutine for Parked {
    fn act(&mut self, cx: &mut Context<'_>) -> Action {
        if self.parked {
            self.woken.store(true, Ordering::Release);
            return Action::Finish;
        }
        self.parked = true;
        *self.slot.lock() = Some(cx.waker());
        Action::WaitRepeat
    }
}

#[test]
fn test_wait_repeat_resumed_by_waker() {
    let scheduler = scheduler(IoWorkerKind::Event);
    let slot = Arc::new(Mutex::new(None));
    let woken = Arc::new(AtomicBool::new(false));
    let id = scheduler
        .submit(Parked {
            slot: Arc::clone(&slot),
            woken: Arc::clone(&woken),
            parked: false,
        })
        .unwrap();

    let deadline = Instant::now() + TIMEOUT;
    let waker = loop {
        if let Some(waker) = slot.lock().clone() {
            break waker;
        }
        assert!(Instant::now() < deadline, "task never parked");
        thread::sleep(Duration::from_millis(1));
    };
    assert_eq!(waker.task_id(), id);
    assert!(!woken.load(Ordering::Acquire));

    waker.wake();
    assert!(scheduler.wait_all_finished(TIMEOUT));
    assert!(woken.load(Ordering::Acquire));
}

#[test]
fn test_wake_before_park_is_remembered() {
    struct WakesItself {
        rounds: usize,
    }

    impl Coroutine for WakesItself {
        fn act(&mut self, cx: &mut Context<'_>) -> Action {
            if self.rounds == 0 {
                return Action::Finish;
            }
            self.rounds -= 1;
            cx.waker().wake();
            Action::WaitRepeat
        }
    }

    let scheduler = scheduler(IoWorkerKind::Event);
    scheduler.submit(WakesItself { rounds: 100 }).unwrap();
    assert!(scheduler.wait_all_finished(TIMEOUT));
}

struct Failing {
    recover: bool,
    recovered: Arc<AtomicBool>,
}

impl Coroutine for Failing {
    fn act(&mut self, _cx: &mut Context<'_>) -> Action {
        Action::error("step failed")
    }

    fn handle_error(&mut self, error: Error) -> Action {
        if self.recover {
            self.recovered.store(true, Ordering::Release);
            Action::Finish
        } else {
            Action::Error(error)
        }
    }
}

#[test]
fn test_error_handling() {
    let scheduler = scheduler(IoWorkerKind::Event);
    let recovered = Arc::new(AtomicBool::new(false));
    let total = Arc::new(AtomicUsize::new(0));

    scheduler
        .submit(Failing {
            recover: true,
            recovered: Arc::clone(&recovered),
        })
        .unwrap();
    scheduler
        .submit(Failing {
            recover: false,
            recovered: Arc::new(AtomicBool::new(false)),
        })
        .unwrap();
    scheduler
        .submit(Counter {
            steps: 10,
            total: Arc::clone(&total),
        })
        .unwrap();

    assert!(scheduler.wait_all_finished(TIMEOUT));
    assert!(recovered.load(Ordering::Acquire));
    assert_eq!(scheduler.failed_count(), 1);
    assert_eq!(total.load(Ordering::Relaxed), 10);
}

#[test]
fn test_panic_is_contained() {
    struct Panics;

    impl Coroutine for Panics {
        fn act(&mut self, _cx: &mut Context<'_>) -> Action {
            panic!("boom");
        }
    }

    let scheduler = scheduler(IoWorkerKind::Event);
    let total = Arc::new(AtomicUsize::new(0));
    scheduler.submit(Panics).unwrap();
    scheduler
        .submit(Counter {
            steps: 5,
            total: Arc::clone(&total),
        })
        .unwrap();
    assert!(scheduler.wait_all_finished(TIMEOUT));
    assert_eq!(scheduler.failed_count(), 1);
    assert_eq!(total.load(Ordering::Relaxed), 5);
}

struct Forever {
    aborted: Arc<AtomicBool>,
}

impl Coroutine for Forever {
    fn act(&mut self, _cx: &mut Context<'_>) -> Action {
        Action::WaitRepeat
    }

    fn on_abort(&mut self) {
        self.aborted.store(true, Ordering::Release);
    }
}

#[test]
fn test_abort() {
    let scheduler = scheduler(IoWorkerKind::Event);
    let aborted = Arc::new(AtomicBool::new(false));
    let id = scheduler
        .submit(Forever {
            aborted: Arc::clone(&aborted),
        })
        .unwrap();

    assert!(!scheduler.wait_all_finished(Duration::from_millis(50)));
    assert!(scheduler.abort(id));
    assert!(scheduler.wait_all_finished(TIMEOUT));
    assert!(aborted.load(Ordering::Acquire));
    assert!(!scheduler.abort(id));
    assert_eq!(scheduler.failed_count(), 0);
}

#[test]
fn test_abort_sleeping_task() {
    let scheduler = scheduler(IoWorkerKind::Event);
    let elapsed = Arc::new(Mutex::new(None));

    struct LongSleep;

    impl Coroutine for LongSleep {
        fn act(&mut self, _cx: &mut Context<'_>) -> Action {
            Action::sleep(Duration::from_secs(3600))
        }
    }

    let id = scheduler.submit(LongSleep).unwrap();
    scheduler
        .submit(Sleeper {
            started: None,
            elapsed: Arc::clone(&elapsed),
        })
        .unwrap();
    thread::sleep(Duration::from_millis(20));
    assert!(scheduler.abort(id));
    assert!(scheduler.wait_all_finished(TIMEOUT));
    assert!(elapsed.lock().is_some());
}

struct Parent {
    children: usize,
    total: Arc<AtomicUsize>,
}

impl Coroutine for Parent {
    fn act(&mut self, cx: &mut Context<'_>) -> Action {
        for _ in 0..self.children {
            let child = Counter {
                steps: 4,
                total: Arc::clone(&self.total),
            };
            if let Err(err) = cx.spawn(child) {
                return Action::Error(err);
            }
        }
        Action::Finish
    }
}

#[test]
fn test_spawn_from_task() {
    let scheduler = scheduler(IoWorkerKind::Event);
    let total = Arc::new(AtomicUsize::new(0));
    scheduler
        .submit(Parent {
            children: 10,
            total: Arc::clone(&total),
        })
        .unwrap();
    assert!(scheduler.wait_all_finished(TIMEOUT));
    assert_eq!(total.load(Ordering::Relaxed), 40);
}

#[test]
fn test_shutdown_stops_accepting() {
    let scheduler = scheduler(IoWorkerKind::Event);
    let handle = scheduler.handle();
    assert!(handle.is_accepting());
    scheduler.shutdown();
    assert!(!handle.is_accepting());

    let total = Arc::new(AtomicUsize::new(0));
    let err = handle.submit(Counter { steps: 1, total }).unwrap_err();
    assert!(matches!(err, Error::Shutdown));
}

#[test]
fn test_shutdown_aborts_stuck_tasks() {
    let scheduler = scheduler(IoWorkerKind::Event);
    let aborted = Arc::new(AtomicBool::new(false));
    scheduler
        .submit(Forever {
            aborted: Arc::clone(&aborted),
        })
        .unwrap();
    scheduler.shutdown();
    assert!(aborted.load(Ordering::Acquire));
    assert_eq!(scheduler.tasks_count(), 0);
}

/// Reads one byte from a transport, suspending until it arrives
struct ReadOne {
    transport: Arc<dyn Transport>,
    source: Arc<dyn IoSource>,
    got: Arc<Mutex<Option<u8>>>,
}

impl Coroutine for ReadOne {
    fn act(&mut self, _cx: &mut Context<'_>) -> Action {
        let mut buf = [0u8; 1];
        match self.transport.read(&mut buf) {
            Ok(1) => {
                *self.got.lock() = Some(buf[0]);
                Action::Finish
            }
            Ok(_) => Action::error("unexpected end of input"),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                Action::wait_read(Arc::clone(&self.source))
            }
            Err(err) => Action::error(err),
        }
    }
}

fn run_read_one(io_worker: IoWorkerKind) {
    let scheduler = scheduler(io_worker);
    let memory = Arc::new(MemoryTransport::new());
    let transport: Arc<dyn Transport> = memory.clone();
    let got = Arc::new(Mutex::new(None));
    scheduler
        .submit(ReadOne {
            source: io_source(&transport),
            transport,
            got: Arc::clone(&got),
        })
        .unwrap();

    thread::sleep(Duration::from_millis(30));
    assert!(got.lock().is_none());
    memory.push_input(b"z");
    assert!(scheduler.wait_all_finished(TIMEOUT));
    assert_eq!(*got.lock(), Some(b'z'));
}

#[test]
fn test_io_wait_naive_worker() {
    run_read_one(IoWorkerKind::Naive);
}

#[test]
fn test_io_wait_without_descriptor_on_event_scheduler() {
    run_read_one(IoWorkerKind::Event);
}

struct Socket(UnixStream);

impl IoSource for Socket {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.0.as_raw_fd(),
            events: if events.is_read() { libc::POLLIN } else { libc::POLLOUT },
            revents: 0,
        };
        let timeout = timeout.map_or(-1, |d| d.as_millis() as i32);
        let n = unsafe { libc::poll(&mut pfd, 1, timeout) };
        Ok(n > 0)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.0.as_raw_fd())
    }
}

struct ReadSocket {
    socket: Arc<Socket>,
    got: Arc<Mutex<Vec<u8>>>,
}

impl Coroutine for ReadSocket {
    fn act(&mut self, _cx: &mut Context<'_>) -> Action {
        let mut buf = [0u8; 16];
        match (&self.socket.0).read(&mut buf) {
            Ok(0) => Action::Finish,
            Ok(n) => {
                self.got.lock().extend_from_slice(&buf[..n]);
                Action::Continue
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                Action::wait_read(Arc::clone(&self.socket) as Arc<dyn IoSource>)
            }
            Err(err) => Action::error(err),
        }
    }
}

#[test]
fn test_io_wait_socket() {
    for kind in [IoWorkerKind::Event, IoWorkerKind::Naive] {
        let scheduler = scheduler(kind);
        let (reader, mut writer) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        let got = Arc::new(Mutex::new(Vec::new()));
        scheduler
            .submit(ReadSocket {
                socket: Arc::new(Socket(reader)),
                got: Arc::clone(&got),
            })
            .unwrap();

        for chunk in [&b"hello "[..], b"world"] {
            thread::sleep(Duration::from_millis(20));
            writer.write_all(chunk).unwrap();
        }
        drop(writer);
        assert!(scheduler.wait_all_finished(TIMEOUT), "{:?} worker stalled", kind);
        assert_eq!(&got.lock()[..], b"hello world");
    }
}

/// Borrowed descriptor that can be closed under a waiting task
struct Descriptor(RawFd);

impl IoSource for Descriptor {
    fn poll(&self, _events: PollEvents, _timeout: Option<Duration>) -> io::Result<bool> {
        Ok(false)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.0)
    }
}

struct WaitReadable {
    source: Arc<Descriptor>,
    aborted: Arc<AtomicBool>,
}

impl Coroutine for WaitReadable {
    fn act(&mut self, _cx: &mut Context<'_>) -> Action {
        Action::wait_read(Arc::clone(&self.source) as Arc<dyn IoSource>)
    }

    fn on_abort(&mut self) {
        self.aborted.store(true, Ordering::Release);
    }
}

#[test]
fn test_shutdown_with_closed_descriptor() {
    let scheduler = scheduler(IoWorkerKind::Event);
    let (reader, writer) = UnixStream::pair().unwrap();
    let aborted = Arc::new(AtomicBool::new(false));
    scheduler
        .submit(WaitReadable {
            source: Arc::new(Descriptor(reader.as_raw_fd())),
            aborted: Arc::clone(&aborted),
        })
        .unwrap();
    thread::sleep(Duration::from_millis(30));

    // Unregistering from the poller fails once the descriptor is gone
    drop(reader);
    drop(writer);
    scheduler.shutdown();
    assert!(aborted.load(Ordering::Acquire));
    assert_eq!(scheduler.tasks_count(), 0);
}
