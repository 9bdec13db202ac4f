//! Wall-clock source for commit stamps.

use chrono::Utc;

use crate::identity::Timestamp;

/// Source of the wall-clock time written as `commit_stamp`.
///
/// Stamps are only used for time-range reads, never for ordering, so a
/// clock that jumps backwards degrades `get_to` results but cannot corrupt
/// a stream.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> Timestamp;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}
