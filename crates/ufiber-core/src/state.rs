//! Fiber state types

use core::fmt;

/// State of a fiber
///
/// `Init -> Exec -> {Term | Except}`, with `Exec -> Ready` on a voluntary
/// yield and `Exec -> Blocked -> Ready` around an awaited kernel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created (or recycled) with an entry function, never resumed
    Init = 0,

    /// Yielded voluntarily, waiting in a run queue
    Ready = 1,

    /// Currently executing on a processor
    Exec = 2,

    /// Suspended until its outstanding completions are reaped
    Blocked = 3,

    /// Entry function returned
    Term = 4,

    /// Entry function panicked
    Except = 5,
}

impl FiberState {
    /// Check if a processor may switch into a fiber in this state
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Ready)
    }

    /// Check if this fiber has terminated (returned or panicked)
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// Check if the fiber's stack holds no live frames
    ///
    /// Only such fibers may be destroyed or reinitialized.
    #[inline]
    pub const fn is_disposable(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Term | FiberState::Except)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Exec,
            3 => FiberState::Blocked,
            4 => FiberState::Term,
            _ => FiberState::Except,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Init => write!(f, "INIT"),
            FiberState::Ready => write!(f, "READY"),
            FiberState::Exec => write!(f, "EXEC"),
            FiberState::Blocked => write!(f, "BLOCKED"),
            FiberState::Term => write!(f, "TERM"),
            FiberState::Except => write!(f, "EXCEPT"),
        }
    }
}

/// How a fiber's entry function ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberExit {
    /// Returned normally
    Completed,
    /// Panicked; carries the panic message
    Failed(String),
}

impl FiberExit {
    /// Terminal state corresponding to this exit
    pub fn state(&self) -> FiberState {
        match self {
            FiberExit::Completed => FiberState::Term,
            FiberExit::Failed(_) => FiberState::Except,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(FiberState::Init.is_resumable());
        assert!(FiberState::Ready.is_resumable());
        assert!(!FiberState::Exec.is_resumable());
        assert!(!FiberState::Blocked.is_resumable());
        assert!(!FiberState::Term.is_resumable());

        assert!(FiberState::Term.is_terminated());
        assert!(FiberState::Except.is_terminated());
        assert!(!FiberState::Blocked.is_terminated());

        assert!(FiberState::Init.is_disposable());
        assert!(FiberState::Except.is_disposable());
        assert!(!FiberState::Ready.is_disposable());
        assert!(!FiberState::Exec.is_disposable());
    }

    #[test]
    fn test_state_u8_roundtrip() {
        for v in 0u8..=5 {
            assert_eq!(u8::from(FiberState::from(v)), v);
        }
    }

    #[test]
    fn test_exit_state() {
        assert_eq!(FiberExit::Completed.state(), FiberState::Term);
        assert_eq!(FiberExit::Failed("boom".into()).state(), FiberState::Except);
    }
}
