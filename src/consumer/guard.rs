//! Mutual exclusion of pulls on one consumer handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-consumer flag: set while a fetch or continuous pull owns the consumer.
#[derive(Clone, Debug, Default)]
pub(crate) struct SubscriptionFlag {
    active: Arc<AtomicBool>,
}

impl SubscriptionFlag {
    /// Claim the consumer. Returns `None` when another pull holds it.
    pub(crate) fn try_acquire(&self) -> Option<SubscriptionGuard> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SubscriptionGuard {
                active: self.active.clone(),
                released: AtomicBool::new(false),
            })
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Ownership of the consumer's subscription flag.
///
/// Released exactly once, either explicitly or on drop.
#[derive(Debug)]
pub(crate) struct SubscriptionGuard {
    active: Arc<AtomicBool>,
    released: AtomicBool,
}

impl SubscriptionGuard {
    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.active.store(false, Ordering::Release);
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.release();
    }
}
