//! Basic ufiber example
//!
//! Spawns fibers that yield, sleep and fire timers across several processors.
//!
//! # Environment Variables
//!
//! - `UFIBER_FLUSH_EPRINT=1` - Flush debug output immediately (useful for crash debugging)
//! - `UFIBER_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `UFIBER_NUM_PROCESSORS=4` - Processor threads (0 = one per CPU)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use ufiber::{kdebug, kinfo, Runtime, RuntimeConfig};

// UFIBER_LOG_LEVEL=debug UFIBER_FLUSH_EPRINT=1 cargo run -p ufiber-basic
fn main() {
    println!("=== ufiber Basic Example ===\n");

    let config = RuntimeConfig::from_env().num_processors(4);
    let runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };

    let completed = Arc::new(AtomicUsize::new(0));
    let ticks = Arc::new(AtomicUsize::new(0));

    let c = completed.clone();
    let t = ticks.clone();
    let result = runtime.block_on(move || {
        kinfo!("Spawning fibers...");

        for i in 1..=8 {
            let c = c.clone();
            let id = ufiber::spawn(move || {
                kdebug!("[fiber {}] started on processor {:?}", i, ufiber::current_processor_id());
                for j in 0..3 {
                    kdebug!("[fiber {}] iteration {}", i, j);
                    ufiber::yield_now();
                }
                ufiber::sleep(Duration::from_millis(10 * i));
                kdebug!("[fiber {}] finished", i);
                c.fetch_add(1, Ordering::SeqCst);
            });
            println!("Spawned fiber {} (ID={})", i, id);
        }

        let t2 = t.clone();
        let timer = ufiber::add_timer(
            Duration::from_millis(20),
            move || {
                t2.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );

        let start = Instant::now();
        while c.load(Ordering::SeqCst) < 8 && start.elapsed() < Duration::from_secs(10) {
            ufiber::sleep(Duration::from_millis(5));
        }
        timer.cancel();
        c.load(Ordering::SeqCst)
    });

    match result {
        Ok(count) => kinfo!("{} fiber(s) completed", count),
        Err(e) => eprintln!("block_on failed: {}", e),
    }

    println!("Timer ticks: {}", ticks.load(Ordering::SeqCst));
    println!("Stats: {:?}", runtime.stats());
    runtime.shutdown();
    println!("\n=== Example Complete ===");
}

