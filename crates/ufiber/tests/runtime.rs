mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use ufiber::RuntimeError;

#[test]
fn test_block_on_returns_value() {
    let Some(rt) = common::runtime() else { return };
    let value = rt.block_on(|| 6 * 7).unwrap();
    assert_eq!(value, 42);
}

#[test]
fn test_block_on_runs_in_fiber() {
    let Some(rt) = common::runtime() else { return };
    let (in_fiber, on_processor) = rt
        .block_on(|| (ufiber::is_in_fiber(), ufiber::current_processor_id()))
        .unwrap();
    assert!(in_fiber);
    assert!(on_processor.is_some());
    assert!(!ufiber::is_in_fiber());
}

#[test]
fn test_block_on_reports_panic() {
    let Some(rt) = common::runtime() else { return };
    let before = rt.stats().failed;
    let result = rt.block_on(|| -> u32 { panic!("boom in fiber") });
    match result {
        Err(RuntimeError::FiberFailed(reason)) => assert!(reason.contains("boom in fiber")),
        other => panic!("expected FiberFailed, got {:?}", other),
    }

    // The processor survives and keeps scheduling
    assert_eq!(rt.block_on(|| 1).unwrap(), 1);
    let deadline = Instant::now() + common::RECV_TIMEOUT;
    while rt.stats().failed <= before && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(rt.stats().failed > before);
}

#[test]
fn test_spawn_from_fiber() {
    let Some(rt) = common::runtime() else { return };
    let (tx, rx) = mpsc::channel();
    rt.block_on(move || {
        for i in 0..16 {
            let tx = tx.clone();
            ufiber::spawn(move || {
                let _ = tx.send(i);
            });
        }
    })
    .unwrap();

    let mut got = common::recv_n(&rx, 16);
    got.sort_unstable();
    assert_eq!(got, (0..16).collect::<Vec<_>>());
}

#[test]
fn test_spawn_from_outside_thread() {
    let Some(rt) = common::runtime() else { return };
    let handle = rt.handle();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        handle.spawn(move || {
            let _ = tx.send(ufiber::is_in_fiber());
        });
    })
    .join()
    .unwrap();
    assert!(rx.recv_timeout(common::RECV_TIMEOUT).unwrap());
}

#[test]
fn test_free_spawn_outside_runtime_fails() {
    let result = ufiber::try_spawn(|| {});
    assert!(matches!(result, Err(RuntimeError::NotInRuntime)));
}

#[test]
fn test_yield_interleaves() {
    let Some(rt) = common::runtime() else { return };
    let (tx, rx) = mpsc::channel();
    for _ in 0..8 {
        let tx = tx.clone();
        rt.spawn(move || {
            let mut count = 0;
            for _ in 0..1000 {
                ufiber::yield_now();
                count += 1;
            }
            let _ = tx.send(count);
        });
    }
    assert!(common::recv_n(&rx, 8).iter().all(|&c| c == 1000));
}

#[test]
fn test_sleep_suspends_for_duration() {
    let Some(rt) = common::runtime() else { return };
    let elapsed = rt
        .block_on(|| {
            let start = Instant::now();
            ufiber::sleep(Duration::from_millis(50));
            start.elapsed()
        })
        .unwrap();
    assert!(elapsed >= Duration::from_millis(50), "slept {:?}", elapsed);
}

#[test]
fn test_sleeping_fiber_does_not_block_processor() {
    let Some(rt) = common::runtime() else { return };
    let (tx, rx) = mpsc::channel();
    rt.block_on(move || {
        let sleepers: usize = 64;
        for _ in 0..sleepers {
            let tx = tx.clone();
            ufiber::spawn(move || {
                ufiber::sleep(Duration::from_millis(100));
                let _ = tx.send(());
            });
        }
    })
    .unwrap();

    let start = Instant::now();
    common::recv_n(&rx, 64);
    // Sleeping one at a time would take 64 * 100ms / 4 processors
    assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());
}

#[test]
fn test_one_shot_timer_fires_once() {
    let Some(rt) = common::runtime() else { return };
    let (tx, rx) = mpsc::channel();
    let start = Instant::now();
    rt.add_timer(
        Duration::from_millis(30),
        move || {
            let _ = tx.send(ufiber::is_in_fiber());
        },
        false,
    );

    assert!(rx.recv_timeout(common::RECV_TIMEOUT).unwrap());
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_recurring_timer_until_cancelled() {
    let Some(rt) = common::runtime() else { return };
    let fires = Arc::new(AtomicUsize::new(0));
    let f = fires.clone();
    let timer = rt.add_timer(
        Duration::from_millis(10),
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    let deadline = Instant::now() + common::RECV_TIMEOUT;
    while fires.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(fires.load(Ordering::SeqCst) >= 3);

    assert!(timer.cancel());
    // Let a callback fiber that was already spawned finish
    std::thread::sleep(Duration::from_millis(30));
    let settled = fires.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(fires.load(Ordering::SeqCst), settled);
}

#[test]
fn test_condition_timer_skips_dropped_condition() {
    let Some(rt) = common::runtime() else { return };
    let fires = Arc::new(AtomicUsize::new(0));
    let cond = Arc::new(());

    let f = fires.clone();
    rt.add_condition_timer(
        Duration::from_millis(20),
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        Arc::downgrade(&cond),
        false,
    );
    drop(cond);

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fires.load(Ordering::SeqCst), 0);
}

#[test]
fn test_timer_from_fiber() {
    let Some(rt) = common::runtime() else { return };
    let (tx, rx) = mpsc::channel();
    rt.block_on(move || {
            ufiber::add_timer(
            Duration::from_millis(10),
            move || {
                let _ = tx.send(());
            },
            false,
        );
    })
    .unwrap();
    assert!(rx.recv_timeout(common::RECV_TIMEOUT).is_ok());
}

#[test]
fn test_work_spreads_across_processors() {
    let Some(rt) = common::runtime() else { return };
    let (tx, rx) = mpsc::channel();
    rt.block_on(move || {
        for _ in 0..64 {
            let tx = tx.clone();
            ufiber::spawn(move || {
                let mut seen = HashSet::new();
                let start = Instant::now();
                while start.elapsed() < Duration::from_millis(20) {
                    if let Some(id) = ufiber::current_processor_id() {
                        seen.insert(id);
                    }
                    ufiber::yield_now();
                }
                let _ = tx.send(seen);
            });
        }
    })
    .unwrap();

    let processors: HashSet<usize> = common::recv_n(&rx, 64).into_iter().flatten().collect();
    assert!(processors.len() > 1, "all fibers ran on {:?}", processors);
    assert!(rt.stats().stolen > 0);
}
