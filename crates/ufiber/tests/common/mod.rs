//! Shared harness for the integration tests
//!
//! Only one runtime may exist per process, so every test in a binary runs on
//! the same lazily started runtime. Tests return early when io_uring cannot
//! be set up (old kernel, seccomp).

#![allow(dead_code)]

use std::sync::mpsc::Receiver;
use std::sync::OnceLock;
use std::time::Duration;
use ufiber::{Runtime, RuntimeConfig, RuntimeError};

static RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();

/// Generous bound for results that should arrive in milliseconds
pub const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime with 4 processors
pub fn runtime() -> Option<&'static Runtime> {
    runtime_with(|config| config)
}

/// Runtime built from `tweak(defaults)` on first use; later calls ignore `tweak`
pub fn runtime_with(tweak: impl FnOnce(RuntimeConfig) -> RuntimeConfig) -> Option<&'static Runtime> {
    RUNTIME
        .get_or_init(|| {
            let config = tweak(RuntimeConfig::new().num_processors(4));
            let rt = Runtime::new(config).expect("runtime construction");
            match rt.start() {
                Ok(()) => Some(rt),
                // Ring setup happens on the processor threads
                Err(RuntimeError::ProcessorInit { reason, .. }) => {
                    eprintln!("io_uring unavailable, skipping: {}", reason);
                    None
                }
                Err(e) => panic!("runtime start failed: {}", e),
            }
        })
        .as_ref()
}

/// Collect exactly `n` values from `rx`
pub fn recv_n<T>(rx: &Receiver<T>, n: usize) -> Vec<T> {
    (0..n)
        .map(|i| {
            rx.recv_timeout(RECV_TIMEOUT)
                .unwrap_or_else(|e| panic!("value {} of {} not received: {}", i + 1, n, e))
        })
        .collect()
}
