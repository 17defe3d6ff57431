//! Error types for the fiber runtime

use thiserror::Error;

/// Errors surfaced by runtime construction and lifecycle operations
///
/// I/O results never travel through this type: awaited kernel operations
/// report a raw negative errno, matching the POSIX call they stand in for.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Runtime configuration rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// mmap/mprotect of a fiber stack failed (raw errno)
    #[error("fiber stack allocation failed (errno {0})")]
    StackAllocation(i32),

    /// io_uring instance could not be created
    #[error("io_uring setup failed: {0}")]
    RingSetup(#[source] std::io::Error),

    /// Processor thread could not be spawned
    #[error("failed to spawn processor thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// A processor failed to come up
    #[error("processor {id} failed to start: {reason}")]
    ProcessorInit { id: usize, reason: String },

    /// Operation requires a running runtime
    #[error("not running inside a runtime")]
    NotInRuntime,

    /// A fiber's entry function panicked
    #[error("fiber failed: {0}")]
    FiberFailed(String),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(RuntimeError::NotInRuntime.to_string(), "not running inside a runtime");
        assert_eq!(
            RuntimeError::StackAllocation(12).to_string(),
            "fiber stack allocation failed (errno 12)"
        );
        let e = RuntimeError::ProcessorInit { id: 3, reason: "ring".into() };
        assert_eq!(e.to_string(), "processor 3 failed to start: ring");
    }

    #[test]
    fn test_ring_setup_source() {
        use std::error::Error as _;
        let e = RuntimeError::RingSetup(std::io::Error::from_raw_os_error(12));
        assert!(e.source().is_some());
    }
}
