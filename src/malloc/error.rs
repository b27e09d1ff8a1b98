use std::fmt;

/// Failures surfaced by the allocator's back end.
///
/// Only resource exhaustion travels through this type; invariant violations
/// (page-map inconsistency, un-merged neighbors, negative allocated counts)
/// are bugs and abort via `assert!`/`panic!` instead.
#[derive(Debug)]
pub enum MemError {
    /// The OS refused to map new address space.
    MapFailed(std::io::Error),
    /// Faulting released pages back in failed (`mprotect`).
    CommitFailed(std::io::Error),
    /// Unmapping a region failed (`munmap`).
    ReleaseFailed(std::io::Error),
    /// Growing the heap would exceed the configured hard limit.
    HardLimitExceeded { requested: usize, limit: usize },
    InitializationFailed(String),
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemError::MapFailed(e) => write!(f, "VM mapping failed: {e}"),
            MemError::CommitFailed(e) => write!(f, "VM commit failed: {e}"),
            MemError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            MemError::HardLimitExceeded { requested, limit } => write!(
                f,
                "heap hard limit exceeded: requested {requested} bytes with limit {limit}"
            ),
            MemError::InitializationFailed(msg) => write!(f, "initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for MemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MemError::MapFailed(e) | MemError::CommitFailed(e) | MemError::ReleaseFailed(e) => {
                Some(e)
            }
            MemError::HardLimitExceeded { .. } | MemError::InitializationFailed(_) => None,
        }
    }
}
