use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bounded count of concurrently executing runs.
///
/// The scheduler acquires a slot before spawning a run worker and the slot
/// releases itself when dropped, so a panicking worker can never leak
/// capacity. Cheap to clone; all clones share one counter.
#[derive(Clone, Debug)]
pub struct RunBudget {
    inner: Arc<BudgetInner>,
}

#[derive(Debug)]
struct BudgetInner {
    limit: usize,
    active: AtomicUsize,
}

impl RunBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                limit: limit.max(1),
                active: AtomicUsize::new(0),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Fraction of the budget currently in use.
    pub fn utilization(&self) -> f64 {
        self.active() as f64 / self.inner.limit as f64
    }

    /// Claim a slot if one is free.
    pub fn try_acquire(&self) -> Option<RunSlot> {
        let mut current = self.inner.active.load(Ordering::Acquire);
        loop {
            if current >= self.inner.limit {
                return None;
            }
            match self.inner.active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(RunSlot {
                    budget: self.clone(),
                }),
                Err(actual) => current = actual,
            }
        }
    }
}

/// An acquired execution slot; capacity returns when this drops.
#[derive(Debug)]
pub struct RunSlot {
    budget: RunBudget,
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.budget.inner.active.fetch_sub(1, Ordering::AcqRel);
    }
}
