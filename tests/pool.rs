//! End-to-end pool tests against real worker processes.
//!
//! These drive the public API with the bundled `stoker-worker` binary as
//! the child process.

use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use stoker::{Config, Error, Payload, PoolEvent, StaticPool};

/// Path to the bundled worker binary.
fn worker_bin() -> &'static str {
    env!("CARGO_BIN_EXE_stoker-worker")
}

/// Command factory for the worker binary with extra arguments.
fn worker_cmd(args: &'static [&'static str]) -> stoker::CommandFactory {
    Arc::new(move || {
        let mut cmd = Command::new(worker_bin());
        cmd.args(args);
        cmd
    })
}

fn pool_config(num_workers: usize, max_jobs: u64) -> Config {
    Config {
        num_workers,
        max_jobs,
        allocate_timeout: Duration::from_secs(10),
        ..Config::default()
    }
}

fn body(payload: &Payload) -> &[u8] {
    &payload.body
}

/// Wait until the pool has exactly one dispatchable worker and return its
/// pid. Rotation replaces workers in the background, so settle first.
fn settled_pid(pool: &StaticPool) -> i32 {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let workers = pool.workers();
        if workers.len() == 1 && workers[0].state().is_active() {
            return workers[0].pid();
        }
        assert!(Instant::now() < deadline, "pool never settled on one worker");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn alive(pid: i32) -> bool {
    std::path::Path::new(&format!("/proc/{}", pid)).exists()
}

#[test]
fn happy_path_two_workers_five_jobs() {
    let pool = StaticPool::new(pool_config(2, 0), worker_cmd(&[])).expect("pool");

    for i in 0..5 {
        let reply = pool
            .exec(&Payload::from_body(format!("echo:ok-{}", i)))
            .expect("exec");
        assert_eq!(body(&reply), format!("ok-{}", i).as_bytes());
    }

    let workers = pool.workers();
    assert_eq!(workers.len(), 2);
    let total_execs: u64 = workers.iter().map(|w| w.state().num_execs()).sum();
    assert_eq!(total_execs, 5);

    pool.destroy();
}

#[test]
fn max_jobs_rotates_through_three_workers() {
    let constructed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&constructed);
    let listener: stoker::Listener = Arc::new(move |event: &PoolEvent| {
        if matches!(event, PoolEvent::WorkerConstruct { .. }) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    let pool = StaticPool::with_listeners(pool_config(1, 3), worker_cmd(&[]), vec![listener])
        .expect("pool");

    let mut pids = Vec::new();
    for i in 0..7 {
        let reply = pool
            .exec(&Payload::from_body(format!("echo:{}", i)))
            .expect("exec");
        assert_eq!(body(&reply), format!("{}", i).as_bytes());
        pids.push(settled_pid(&pool));
    }

    let distinct: std::collections::HashSet<_> = pids.iter().copied().collect();
    assert_eq!(distinct.len(), 3, "pids were {:?}", pids);
    for pid in &distinct {
        assert!(
            pids.iter().filter(|p| *p == pid).count() <= 3,
            "a worker exceeded its quota: {:?}",
            pids
        );
    }
    assert_eq!(constructed.load(Ordering::SeqCst), 3);

    pool.destroy();
}

#[test]
fn stop_request_rotates_and_retries() {
    let pool =
        StaticPool::new(pool_config(1, 0), worker_cmd(&["--stop-after", "2"])).expect("pool");

    let first_pid = settled_pid(&pool);
    let reply = pool.exec(&Payload::from_body("echo:one")).expect("exec");
    assert_eq!(body(&reply), b"one");

    // The worker answers its second job with the stop request; the pool
    // retires it and retries on a replacement, invisibly to the caller.
    let reply = pool.exec(&Payload::from_body("echo:two")).expect("exec");
    assert_eq!(body(&reply), b"two");

    let second_pid = settled_pid(&pool);
    assert_ne!(first_pid, second_pid);
    assert!(!alive(first_pid), "retired worker still running");

    let reply = pool.exec(&Payload::from_body("echo:three")).expect("exec");
    assert_eq!(body(&reply), b"three");

    pool.destroy();
}

#[test]
fn exec_deadline_fires_and_pool_recovers() {
    let pool = StaticPool::new(pool_config(1, 0), worker_cmd(&[])).expect("pool");
    let slow_pid = settled_pid(&pool);

    let start = Instant::now();
    let err = pool
        .exec_with_deadline(Duration::from_millis(150), &Payload::from_body("sleep:5000"))
        .expect_err("deadline must fire");
    assert!(matches!(err, Error::ExecTimeout));
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "deadline fired too late: {:?}",
        start.elapsed()
    );

    // The stalled worker is retired and replaced.
    let reply = pool.exec(&Payload::from_body("echo:next")).expect("exec");
    assert_eq!(body(&reply), b"next");
    assert_ne!(settled_pid(&pool), slow_pid);

    pool.destroy();
}

#[test]
fn spawn_failure_surfaces_at_initialize() {
    let err = StaticPool::new(
        pool_config(2, 0),
        Arc::new(|| Command::new("/nonexistent/stoker-worker")),
    )
    .expect_err("spawn must fail");
    assert!(matches!(err, Error::Spawn(_)));
}

#[test]
fn handshake_timeout_surfaces_at_initialize() {
    let cfg = Config {
        num_workers: 1,
        allocate_timeout: Duration::from_millis(300),
        ..Config::default()
    };
    let before = Instant::now();
    let err = StaticPool::new(cfg, worker_cmd(&["--skip-handshake"])).expect_err("no handshake");
    assert!(matches!(err, Error::HandshakeTimeout));
    assert!(before.elapsed() < Duration::from_secs(5));
}

#[test]
fn crashed_worker_is_replaced() {
    let pool = StaticPool::new(pool_config(1, 0), worker_cmd(&[])).expect("pool");
    let crashed_pid = settled_pid(&pool);

    let err = pool
        .exec(&Payload::from_body("crash"))
        .expect_err("worker crashed mid-job");
    assert!(matches!(err, Error::Network(_)), "got {:?}", err);

    let reply = pool.exec(&Payload::from_body("echo:back")).expect("exec");
    assert_eq!(body(&reply), b"back");
    assert_ne!(settled_pid(&pool), crashed_pid);

    pool.destroy();
}

#[test]
fn job_error_keeps_worker_alive() {
    let pool = StaticPool::new(pool_config(1, 0), worker_cmd(&[])).expect("pool");
    let pid = settled_pid(&pool);

    let err = pool
        .exec(&Payload::from_body("fail:bad input"))
        .expect_err("job error");
    match err {
        Error::SoftJob(message) => assert_eq!(message, "bad input"),
        other => panic!("expected SoftJob, got {:?}", other),
    }

    // Same process serves the next job.
    let reply = pool.exec(&Payload::from_body("echo:again")).expect("exec");
    assert_eq!(body(&reply), b"again");
    assert_eq!(settled_pid(&pool), pid);

    pool.destroy();
}

#[test]
fn debug_mode_runs_one_worker_per_request() {
    let cfg = Config {
        num_workers: 4,
        debug: true,
        allocate_timeout: Duration::from_secs(10),
        ..Config::default()
    };
    let pool = StaticPool::new(cfg, worker_cmd(&[])).expect("pool");
    assert!(pool.workers().is_empty());

    let reply = pool.exec(&Payload::from_body("echo:dbg")).expect("exec");
    assert_eq!(body(&reply), b"dbg");
    assert!(pool.workers().is_empty());

    pool.destroy();
}

#[test]
fn destroy_drains_in_flight_work() {
    let pool = Arc::new(StaticPool::new(pool_config(4, 0), worker_cmd(&[])).expect("pool"));
    let pids: Vec<i32> = pool.workers().iter().map(|w| w.pid()).collect();
    assert_eq!(pids.len(), 4);

    let results: Arc<Mutex<Vec<stoker::Result<Payload>>>> = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for _ in 0..100 {
        let pool = Arc::clone(&pool);
        let results = Arc::clone(&results);
        handles.push(std::thread::spawn(move || {
            let result = pool.exec(&Payload::from_body("sleep:50"));
            results.lock().unwrap().push(result);
        }));
    }

    std::thread::sleep(Duration::from_millis(75));
    pool.destroy();

    for handle in handles {
        handle.join().unwrap();
    }

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 100);
    let mut completed = 0;
    for result in results.iter() {
        match result {
            Ok(reply) => {
                assert_eq!(body(reply), b"slept");
                completed += 1;
            }
            // Anything that missed the drain gets a clean shutdown error.
            Err(Error::WatcherStopped) | Err(Error::NoFreeWorkers) => {}
            Err(other) => panic!("unexpected error during drain: {:?}", other),
        }
    }
    assert!(completed >= 4, "only {} jobs completed", completed);

    // Nothing gets served after destroy, and no worker process survived it.
    let err = pool
        .exec(&Payload::from_body("echo:late"))
        .expect_err("pool is down");
    assert!(matches!(err, Error::WatcherStopped));
    for pid in pids {
        assert!(!alive(pid), "worker {} outlived destroy", pid);
    }
    assert!(pool.workers().is_empty());
}

#[test]
fn construct_events_precede_first_exec() {
    let events: Arc<Mutex<Vec<PoolEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let listener: stoker::Listener = Arc::new(move |event: &PoolEvent| {
        sink.lock().unwrap().push(event.clone());
    });
    let pool = StaticPool::with_listeners(pool_config(2, 0), worker_cmd(&[]), vec![listener])
        .expect("pool");

    {
        let events = events.lock().unwrap();
        let constructs = events
            .iter()
            .filter(|e| matches!(e, PoolEvent::WorkerConstruct { .. }))
            .count();
        assert_eq!(constructs, 2);
    }

    pool.exec(&Payload::from_body("echo:x")).expect("exec");
    pool.destroy();

    // Drain settles every worker with a destruct event.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let events = events.lock().unwrap();
        let destructs = events
            .iter()
            .filter(|e| matches!(e, PoolEvent::WorkerDestruct { .. }))
            .count();
        if destructs == 2 {
            break;
        }
        drop(events);
        assert!(Instant::now() < deadline, "destruct events never arrived");
        std::thread::sleep(Duration::from_millis(10));
    }
}
