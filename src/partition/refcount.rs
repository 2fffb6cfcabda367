//! Partition reference counting.
//!
//! A partition's count starts at a baseline made of the internal
//! subsystems that subscribe to its lifetime. External subscribers hold a
//! [`RefGuard`] that adds one while it lives. Teardown succeeds only by
//! atomically swapping a count equal to the baseline for a retired marker,
//! so a subscriber racing with teardown either lands before (and teardown
//! fails with `StillInUse`) or after (and the subscribe fails).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{PartitionError, PartitionResult};

const RETIRED: u32 = u32::MAX;

#[derive(Debug, Default)]
pub struct RefCount {
    count: AtomicU32,
    baseline: AtomicU32,
}

impl RefCount {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an internal subsystem reference. Raises the baseline too.
    pub fn acquire_internal(&self) {
        self.baseline.fetch_add(1, Ordering::SeqCst);
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Add an external subscriber.
    pub fn subscribe(self: &Arc<Self>) -> PartitionResult<RefGuard> {
        self.count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                (c != RETIRED && c < RETIRED - 1).then_some(c + 1)
            })
            .map_err(|_| PartitionError::NotFound("partition is being torn down".into()))?;
        Ok(RefGuard { rc: self.clone() })
    }

    fn release(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| (c != RETIRED && c > 0).then(|| c - 1));
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn baseline(&self) -> u32 {
        self.baseline.load(Ordering::SeqCst)
    }

    /// External subscribers currently attached.
    pub fn subscribers(&self) -> u32 {
        let count = self.count();
        if count == RETIRED {
            0
        } else {
            count.saturating_sub(self.baseline())
        }
    }

    pub fn is_safe_to_destroy(&self) -> bool {
        self.count() == self.baseline()
    }

    pub fn is_retired(&self) -> bool {
        self.count() == RETIRED
    }

    /// Retire the count if nothing beyond the baseline holds it.
    pub fn try_retire(&self) -> PartitionResult<()> {
        let baseline = self.baseline();
        self.count
            .compare_exchange(baseline, RETIRED, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|current| {
                PartitionError::StillInUse(format!(
                    "{} subscribers above baseline {baseline}",
                    current.saturating_sub(baseline)
                ))
            })
    }
}

/// An external subscription. Dropping it releases the reference.
#[derive(Debug)]
pub struct RefGuard {
    rc: Arc<RefCount>,
}

impl RefGuard {
    pub fn count(&self) -> &RefCount {
        &self.rc
    }
}

impl Drop for RefGuard {
    fn drop(&mut self) {
        self.rc.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_tracks_internal_refs() {
        let rc = RefCount::new();
        rc.acquire_internal();
        rc.acquire_internal();
        assert_eq!(rc.count(), 2);
        assert_eq!(rc.baseline(), 2);
        assert!(rc.is_safe_to_destroy());
    }

    #[test]
    fn test_subscriber_blocks_retire() {
        let rc = RefCount::new();
        rc.acquire_internal();

        let guard = rc.subscribe().unwrap();
        assert_eq!(rc.subscribers(), 1);
        assert!(matches!(rc.try_retire(), Err(PartitionError::StillInUse(_))));

        drop(guard);
        assert_eq!(rc.count(), rc.baseline());
        rc.try_retire().unwrap();
        assert!(rc.is_retired());
    }

    #[test]
    fn test_subscribe_after_retire_fails() {
        let rc = RefCount::new();
        rc.try_retire().unwrap();
        assert!(rc.subscribe().is_err());
        assert!(rc.try_retire().is_err());
    }

    #[test]
    fn test_count_never_drops_below_baseline() {
        let rc = RefCount::new();
        rc.acquire_internal();
        let a = rc.subscribe().unwrap();
        let b = rc.subscribe().unwrap();
        drop(a);
        drop(b);
        assert_eq!(rc.count(), 1);
        assert!(rc.count() >= rc.baseline());
    }

    #[test]
    fn test_concurrent_subscribers() {
        let rc = RefCount::new();
        rc.acquire_internal();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rc = rc.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _g = rc.subscribe().unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(rc.is_safe_to_destroy());
    }
}
