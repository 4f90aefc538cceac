//! Concurrency slot management.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Manages the execution slots shared by every dispatched execution.
///
/// A slot is held as an [`OwnedSemaphorePermit`] for as long as an
/// execution is PREPARING, RUNNING or PAUSED; dropping the permit frees the
/// slot.
#[derive(Debug, Clone)]
pub struct ResourceScheduler {
    slots: Arc<Semaphore>,
    max_concurrent: usize,
}

impl ResourceScheduler {
    /// Create a scheduler with `max_concurrent` slots.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Check if a new execution could start now.
    pub fn can_start(&self) -> bool {
        self.slots.available_permits() > 0
    }

    /// Claim a slot without waiting.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    /// Slots currently held.
    pub fn running(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.slots.available_permits())
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Configured ceiling.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_bounded_and_released_on_drop() {
        let scheduler = ResourceScheduler::new(2);
        let a = scheduler.try_acquire().unwrap();
        let _b = scheduler.try_acquire().unwrap();

        assert!(!scheduler.can_start());
        assert!(scheduler.try_acquire().is_none());
        assert_eq!(scheduler.running(), 2);

        drop(a);
        assert_eq!(scheduler.running(), 1);
        assert_eq!(scheduler.available(), 1);
        assert!(scheduler.try_acquire().is_some());
    }
}
