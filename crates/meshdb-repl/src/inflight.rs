//! Bounded in-flight tracking for sink applies.
//!
//! A ring of `N` single-permit slots. The `K`th acquisition waits on slot
//! `K mod N`, i.e. on whatever acquisition `K - N` started, so admission stays
//! in arrival order and at most `N` permits are ever held at once.

use crate::error::{ReplError, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default number of slots.
pub const DEFAULT_INFLIGHT_SLOTS: usize = 100;

/// Held while one sink apply is in flight; dropping it frees the slot.
#[derive(Debug)]
pub struct InflightPermit {
    slot: usize,
    in_flight: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl InflightPermit {
    /// Ring slot this permit occupies.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for InflightPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Ring of single-permit slots.
#[derive(Debug)]
pub struct InflightRing {
    slots: Vec<Arc<Semaphore>>,
    counter: AtomicU64,
    in_flight: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

impl InflightRing {
    /// Create a ring with `size` slots (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: (0..size).map(|_| Arc::new(Semaphore::new(1))).collect(),
            counter: AtomicU64::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of permits ever held at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    /// Wait for the next slot in the ring and take it.
    pub async fn acquire(&self) -> Result<InflightPermit> {
        let k = self.counter.fetch_add(1, Ordering::AcqRel);
        let slot = (k % self.slots.len() as u64) as usize;
        let permit = Arc::clone(&self.slots[slot])
            .acquire_owned()
            .await
            .map_err(|_| ReplError::Shutdown)?;

        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        Ok(InflightPermit {
            slot,
            in_flight: Arc::clone(&self.in_flight),
            _permit: permit,
        })
    }

    /// Wait until every permit handed out so far has been released.
    pub async fn drain(&self) -> Result<()> {
        for slot in &self.slots {
            let _permit = slot.acquire().await.map_err(|_| ReplError::Shutdown)?;
        }
        Ok(())
    }
}
