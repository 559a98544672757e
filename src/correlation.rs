//! Correlation ids for matching asynchronous replies to their submission.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Locally assigned id stamped on a submission and on every callback
/// registered for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Placeholder carried by an orchestrator that has not submitted yet.
    pub const NONE: Self = Self(0);

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Source of strictly increasing correlation ids.
///
/// Owned explicitly and shared (via `Arc`) by every orchestrator that must
/// draw from one sequence. Ids start at 1; `CorrelationId::NONE` is never issued.
#[derive(Debug)]
pub struct CorrelationRegistry {
    next: AtomicU64,
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationRegistry {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> CorrelationId {
        CorrelationId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
