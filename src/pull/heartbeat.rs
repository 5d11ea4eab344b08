//! Heartbeat monitor: a restartable liveness deadline with its own timer thread.
//!
//! The deadline is a single atomic timestamp (nanoseconds since the monitor's
//! epoch, 0 when disarmed). The receiving side resets it on every frame with
//! a release store; the timer thread reads it with acquire loads and disarms
//! it with a compare-and-swap before firing, so a reset racing with expiry
//! either wins (no fire) or lands after the fire and re-arms the deadline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::trace;

struct Deadline {
    epoch: Instant,
    at: AtomicU64,
    timeout: Duration,
    cancelled: AtomicBool,
}

impl Deadline {
    fn now(&self) -> u64 {
        // never 0, which means disarmed
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX).max(1)
    }

    fn reset(&self) {
        let at = self
            .now()
            .saturating_add(u64::try_from(self.timeout.as_nanos()).unwrap_or(u64::MAX));
        self.at.store(at, Ordering::Release);
    }
}

/// Cheap handle for resetting the deadline from the transport's delivery thread.
#[derive(Clone)]
pub(crate) struct HeartbeatHandle {
    deadline: Arc<Deadline>,
}

impl HeartbeatHandle {
    /// Push the deadline `timeout` into the future, arming it if needed.
    pub(crate) fn reset(&self) {
        self.deadline.reset();
    }

    /// Stop the deadline until the next `reset`.
    pub(crate) fn disarm(&self) {
        self.deadline.at.store(0, Ordering::Release);
    }
}

/// Owner of the timer thread. Dropping the monitor cancels it.
pub(crate) struct HeartbeatMonitor {
    handle: HeartbeatHandle,
    thread: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    /// Start a disarmed monitor. `on_missed` runs on the timer thread each
    /// time an armed deadline elapses; the deadline is disarmed first.
    pub(crate) fn spawn<F>(timeout: Duration, on_missed: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let deadline = Arc::new(Deadline {
            epoch: Instant::now(),
            at: AtomicU64::new(0),
            timeout,
            cancelled: AtomicBool::new(false),
        });

        let shared = deadline.clone();
        let thread = thread::spawn(move || loop {
            if shared.cancelled.load(Ordering::Acquire) {
                break;
            }
            let at = shared.at.load(Ordering::Acquire);
            if at == 0 {
                thread::park_timeout(shared.timeout);
                continue;
            }
            let now = shared.now();
            if now < at {
                thread::park_timeout(Duration::from_nanos(at - now));
                continue;
            }
            if shared
                .at
                .compare_exchange(at, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                trace!(?timeout, "heartbeat deadline elapsed");
                on_missed();
            }
        });

        Self {
            handle: HeartbeatHandle { deadline },
            thread: Some(thread),
        }
    }

    pub(crate) fn handle(&self) -> HeartbeatHandle {
        self.handle.clone()
    }

    pub(crate) fn reset(&self) {
        self.handle.reset();
    }

    pub(crate) fn disarm(&self) {
        self.handle.disarm();
    }

    /// Stop the timer thread. Idempotent; must not be called from `on_missed`.
    pub(crate) fn cancel(&mut self) {
        self.handle.deadline.cancelled.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.cancel();
    }
}
