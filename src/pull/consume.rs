//! Push dispatcher: continuous pull delivering to a callback.

use std::sync::Arc;
use std::thread::JoinHandle;

use super::continuous::{self, HandlerSink, LoopShared, PullStats};
use super::options::ConsumeOptions;
use crate::consumer::PullConsumer;
use crate::error::ConsumerError;
use crate::message::Msg;

pub(crate) fn start<F>(
    consumer: &PullConsumer,
    handler: F,
    options: &ConsumeOptions,
) -> Result<ConsumeContext, ConsumerError>
where
    F: FnMut(Result<Msg, ConsumerError>) + Send + 'static,
{
    let config = options.resolve()?;
    let (shared, handle) = continuous::spawn(consumer, config, HandlerSink::new(handler))?;
    Ok(ConsumeContext {
        shared,
        handle: Some(handle),
    })
}

/// Handle of a running `consume`.
///
/// The handler runs on the dispatcher's own thread, once per message or
/// surfaced error, and never after `stop()` returns on that thread. Dropping
/// the context stops the subscription without waiting for the thread.
pub struct ConsumeContext {
    shared: Arc<LoopShared>,
    handle: Option<JoinHandle<()>>,
}

impl ConsumeContext {
    /// Stop consuming and free the consumer. Idempotent.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Whether the subscription has ended, by `stop()` or a terminal error.
    pub fn is_stopped(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn stats(&self) -> PullStats {
        self.shared.stats()
    }

    /// A handle that can stop this subscription from elsewhere, including
    /// from inside the handler.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Wait until the subscription ends and return its final counters.
    ///
    /// Must not be called from the handler.
    pub fn join(mut self) -> PullStats {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.shared.stats()
    }
}

impl Drop for ConsumeContext {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl std::fmt::Debug for ConsumeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumeContext")
            .field("stopped", &self.is_stopped())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Clonable stop switch of a `consume` subscription.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<LoopShared>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_closed()
    }
}
