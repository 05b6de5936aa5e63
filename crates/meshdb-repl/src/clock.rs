//! Per-node logical clock for origin timestamps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch from the wall clock.
pub fn wall_clock_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Hands out origin timestamps that never go backwards on this node,
/// even if the wall clock does.
#[derive(Debug, Default)]
pub struct NodeClock {
    last_us: AtomicU64,
}

impl NodeClock {
    /// Create a clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp: the wall clock, or one past the last issued value if
    /// the wall clock has not advanced.
    pub fn now_us(&self) -> u64 {
        self.observe(wall_clock_us())
    }

    /// Fold an externally supplied timestamp into the clock and return the
    /// timestamp actually issued.
    pub fn observe(&self, candidate_us: u64) -> u64 {
        let mut issued = candidate_us;
        // fetch_update only fails if the closure returns None
        let _ = self
            .last_us
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                issued = if candidate_us > last { candidate_us } else { last + 1 };
                Some(issued)
            });
        issued
    }

    /// Advance the clock past a timestamp seen on a replicated write so later
    /// local writes order after it.
    pub fn witness(&self, remote_us: u64) {
        self.last_us.fetch_max(remote_us, Ordering::AcqRel);
    }

    /// Last timestamp handed out.
    pub fn last_us(&self) -> u64 {
        self.last_us.load(Ordering::Acquire)
    }
}
