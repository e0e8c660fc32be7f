//! Aggregate loading/progress tracking for in-flight operations.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counts pending operations and derives loading state and progress from them.
///
/// Progress is `completed / total` over the current busy period. When the
/// last pending operation finishes both totals reset, so the next batch
/// starts again from zero.
#[derive(Debug, Default)]
pub struct OperationCounter {
    pending: AtomicU64,
    completed: AtomicU64,
    total: AtomicU64,
}

impl OperationCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one new operation.
    pub fn increment(&self) {
        self.increase_by(1);
    }

    /// Register `n` new operations at once.
    pub fn increase_by(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.pending.fetch_add(n, Ordering::AcqRel);
        self.total.fetch_add(n, Ordering::AcqRel);
    }

    /// Mark one operation as finished. Does nothing when nothing is pending.
    pub fn decrement(&self) {
        let previous = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1));
        match previous {
            Ok(1) => {
                self.completed.store(0, Ordering::Release);
                self.total.store(0, Ordering::Release);
            }
            Ok(_) => {
                self.completed.fetch_add(1, Ordering::AcqRel);
            }
            Err(_) => {}
        }
    }

    /// Number of operations still pending.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn loading(&self) -> bool {
        self.pending() > 0
    }

    /// Fraction of the current batch that has completed, in `[0, 1]`.
    #[must_use]
    pub fn progress(&self) -> f64 {
        let total = self.total.load(Ordering::Acquire);
        if self.pending() == 0 || total == 0 {
            return 1.0;
        }
        let completed = self.completed.load(Ordering::Acquire);
        (completed as f64 / total as f64).clamp(0.0, 1.0)
    }

    /// Register an operation that finishes when the returned guard drops.
    #[must_use]
    pub fn track(self: &Arc<Self>) -> OperationGuard {
        self.increment();
        OperationGuard {
            counter: Arc::clone(self),
        }
    }
}

/// Decrements its counter when dropped.
#[derive(Debug)]
pub struct OperationGuard {
    counter: Arc<OperationCounter>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.counter.decrement();
    }
}
