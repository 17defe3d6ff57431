//! Construction, accounting and shutdown of whole runtimes
//!
//! Each test builds its own runtime, so they take a lock to keep at most one
//! alive at a time.

use parking_lot::Mutex;
use std::panic;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use ufiber::{InvariantViolation, Runtime, RuntimeConfig, RuntimeError};

static SERIAL: Mutex<()> = Mutex::new(());

/// Start `rt`, or None when io_uring is unavailable
fn started(rt: Runtime) -> Option<Runtime> {
    match rt.start() {
        Ok(()) => Some(rt),
        Err(RuntimeError::ProcessorInit { reason, .. }) => {
            eprintln!("io_uring unavailable, skipping: {}", reason);
            None
        }
        Err(e) => panic!("runtime start failed: {}", e),
    }
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !cond() {
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

#[test]
fn test_single_runtime_per_process() {
    let _serial = SERIAL.lock();
    let first = Runtime::new(RuntimeConfig::new().num_processors(1)).unwrap();
    ufiber::set_log_level(ufiber::LogLevel::Off);
    let second = panic::catch_unwind(|| Runtime::new(RuntimeConfig::new().num_processors(1)));
    ufiber::set_log_level(ufiber::LogLevel::Info);
    let payload = match second {
        Ok(_) => panic!("second runtime was constructed"),
        Err(payload) => payload,
    };
    assert!(payload.is::<InvariantViolation>());
    drop(first);

    let again = Runtime::new(RuntimeConfig::new().num_processors(1));
    assert!(again.is_ok());
}

#[test]
fn test_invalid_config_rejected() {
    let _serial = SERIAL.lock();
    let result = Runtime::new(RuntimeConfig::new().ring_entries(100));
    assert!(matches!(result, Err(RuntimeError::InvalidConfig(_))));

    // A rejected config does not hold the process-wide slot
    assert!(Runtime::new(RuntimeConfig::new()).is_ok());
}

#[test]
fn test_every_spawn_reaches_terminal_state() {
    let _serial = SERIAL.lock();
    let rt = Runtime::new(RuntimeConfig::new().num_processors(2)).unwrap();
    let Some(rt) = started(rt) else { return };

    const N: u64 = 500;
    for i in 0..N {
        rt.spawn(move || {
            if i % 2 == 0 {
                ufiber::yield_now();
            }
            if i % 50 == 0 {
                panic!("fiber {} fails on purpose", i);
            }
        });
    }

    let failures = N.div_ceil(50);
    assert!(wait_for(|| {
        let s = rt.stats();
        s.completed + s.failed == N
    }));
    let stats = rt.stats();
    assert_eq!(stats.spawned, N);
    assert_eq!(stats.failed, failures);
    assert_eq!(stats.completed, N - failures);

    // Nothing finishes twice
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(rt.stats().completed + rt.stats().failed, N);
    rt.shutdown();
}

#[test]
fn test_start_is_idempotent() {
    let _serial = SERIAL.lock();
    let rt = Runtime::new(RuntimeConfig::new().num_processors(2)).unwrap();
    assert!(!rt.is_started());
    let Some(rt) = started(rt) else { return };
    assert!(rt.is_started());
    assert!(rt.start().is_ok());
    assert_eq!(rt.block_on(|| 5).unwrap(), 5);
    rt.shutdown();
    assert!(!rt.is_started());
}

#[test]
fn test_no_restart_after_shutdown() {
    let _serial = SERIAL.lock();
    let rt = Runtime::new(RuntimeConfig::new().num_processors(1)).unwrap();
    let Some(rt) = started(rt) else { return };
    let handle = rt.handle();
    rt.shutdown();

    assert!(matches!(rt.start(), Err(RuntimeError::NotInRuntime)));
    assert!(matches!(handle.try_spawn(|| {}), Err(RuntimeError::NotInRuntime)));
    assert!(matches!(rt.try_spawn(|| {}), Err(RuntimeError::NotInRuntime)));
    assert_eq!(rt.stats().spawned, 0);
}

#[test]
fn test_shutdown_with_blocked_fibers() {
    let _serial = SERIAL.lock();
    let rt = Runtime::new(RuntimeConfig::new().num_processors(2)).unwrap();
    let Some(rt) = started(rt) else { return };

    let (tx, rx) = mpsc::channel();
    for _ in 0..4 {
        let tx = tx.clone();
        rt.spawn(move || {
            let _ = tx.send(());
            ufiber::sleep(Duration::from_secs(3600));
        });
    }
    for _ in 0..4 {
        rx.recv_timeout(Duration::from_secs(30)).unwrap();
    }

    let start = Instant::now();
    rt.shutdown();
    assert!(start.elapsed() < Duration::from_secs(5));
}
