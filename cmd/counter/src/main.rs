//! Synchronization demo
//!
//! Ten fibers each bump a shared counter a million times, first with
//! unsynchronized read-modify-write and then under a [`ufiber::Mutex`].
//! Afterwards a condition variable hand-off and a semaphore-limited pool.
//!
//! Usage:
//!     cargo run --release -p ufiber-counter [fibers] [iterations]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use ufiber::{kinfo, ConditionVariable, Mutex, Runtime, RuntimeConfig, Semaphore};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let fibers: u32 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(10);
    let iterations: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(1_000_000);

    let runtime = match Runtime::new(RuntimeConfig::from_env()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };
    println!(
        "{} fibers x {} increments on {} processors",
        fibers,
        iterations,
        runtime.num_processors()
    );

    let result = runtime.block_on(move || {
        unsynchronized(fibers, iterations);
        with_mutex(fibers, iterations);
        condvar_handoff();
        bounded_pool(2, 4);
    });
    if let Err(e) = result {
        eprintln!("demo failed: {}", e);
    }
    runtime.shutdown();
}

/// Block the calling fiber until `n` permits have been released on `done`
fn wait_all(done: &Semaphore, n: u32) {
    for _ in 0..n {
        done.acquire();
    }
}

fn unsynchronized(fibers: u32, iterations: u64) {
    let sum = Arc::new(AtomicU64::new(0));
    let done = Arc::new(Semaphore::new(0));
    let start = Instant::now();
    for _ in 0..fibers {
        let sum = sum.clone();
        let done = done.clone();
        ufiber::spawn(move || {
            for i in 0..iterations {
                // Separate load and store: updates from other fibers get lost
                let v = sum.load(Ordering::Relaxed);
                if i % 4096 == 0 {
                    ufiber::yield_now();
                }
                sum.store(v + 1, Ordering::Relaxed);
            }
            done.release();
        });
    }
    wait_all(&done, fibers);
    println!(
        "sum without mutex: {} (expected {}) in {:?}",
        sum.load(Ordering::Relaxed),
        fibers as u64 * iterations,
        start.elapsed()
    );
}

fn with_mutex(fibers: u32, iterations: u64) {
    let sum = Arc::new(Mutex::new(0u64));
    let done = Arc::new(Semaphore::new(0));
    let start = Instant::now();
    for _ in 0..fibers {
        let sum = sum.clone();
        let done = done.clone();
        ufiber::spawn(move || {
            for _ in 0..iterations {
                *sum.lock() += 1;
            }
            done.release();
        });
    }
    wait_all(&done, fibers);
    println!(
        "sum with mutex:    {} (expected {}) in {:?}",
        *sum.lock(),
        fibers as u64 * iterations,
        start.elapsed()
    );
}

fn condvar_handoff() {
    let state = Arc::new((Mutex::new(false), ConditionVariable::new()));
    let s = state.clone();
    ufiber::spawn(move || {
        ufiber::sleep(Duration::from_millis(100));
        *s.0.lock() = true;
        s.1.notify_one();
    });

    let start = Instant::now();
    let (lock, cond) = &*state;
    let guard = cond.wait_while(lock.lock(), |ready| !*ready);
    drop(guard);
    println!("condition signalled after {:?}", start.elapsed());
}

fn bounded_pool(permits: u32, jobs: u32) {
    let sem = Arc::new(Semaphore::new(permits));
    let done = Arc::new(Semaphore::new(0));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for job in 0..jobs {
        let (sem, done) = (sem.clone(), done.clone());
        let (active, peak) = (active.clone(), peak.clone());
        ufiber::spawn(move || {
            sem.acquire();
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            kinfo!("job {} working", job);
            ufiber::sleep(Duration::from_millis(20 * (job as u64 + 1)));
            active.fetch_sub(1, Ordering::SeqCst);
            sem.release();
            done.release();
        });
    }
    wait_all(&done, jobs);
    println!(
        "{} jobs through {} permits, peak concurrency {}",
        jobs,
        permits,
        peak.load(Ordering::SeqCst)
    );
}
