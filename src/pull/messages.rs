//! Pull iterator: continuous pull exposed as a blocking `next()`.

use std::cmp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::continuous::{self, ChannelSink, LoopShared, PullStats};
use super::options::MessagesOptions;
use super::MAX_BUFFERED;
use crate::consumer::PullConsumer;
use crate::error::ConsumerError;
use crate::message::Msg;

pub(crate) fn start(
    consumer: &PullConsumer,
    options: &MessagesOptions,
) -> Result<MessagesIter, ConsumerError> {
    let config = options.resolve()?;
    let (tx, rx) = mpsc::sync_channel(cmp::min(config.request.batch, MAX_BUFFERED));
    let (shared, _handle) = continuous::spawn(consumer, config, ChannelSink::new(tx))?;
    Ok(MessagesIter {
        rx: Mutex::new(rx),
        shared,
        closed: AtomicBool::new(false),
    })
}

/// Blocking iterator over a continuous pull.
///
/// `next()` returns messages in delivery order, interleaved with surfaced
/// errors such as `NoHeartbeat`. After `stop()`, or once the subscription
/// ended on a terminal error, every call fails with `MsgIteratorClosed`.
/// The iterator is `Sync`: `stop()` from another thread wakes a blocked
/// `next()`.
pub struct MessagesIter {
    rx: Mutex<Receiver<Result<Msg, ConsumerError>>>,
    shared: Arc<LoopShared>,
    closed: AtomicBool,
}

impl MessagesIter {
    /// Block until the next message or error.
    pub fn next(&self) -> Result<Msg, ConsumerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConsumerError::MsgIteratorClosed);
        }
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        match rx.recv() {
            Ok(item) if !self.closed.load(Ordering::Acquire) => item,
            _ => {
                self.closed.store(true, Ordering::Release);
                Err(ConsumerError::MsgIteratorClosed)
            }
        }
    }

    /// Like `next()`, giving up after `timeout` with `Ok(None)`.
    pub fn next_timeout(&self, timeout: Duration) -> Result<Option<Msg>, ConsumerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConsumerError::MsgIteratorClosed);
        }
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        match rx.recv_timeout(timeout) {
            Ok(_) if self.closed.load(Ordering::Acquire) => Err(ConsumerError::MsgIteratorClosed),
            Ok(item) => item.map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                self.closed.store(true, Ordering::Release);
                Err(ConsumerError::MsgIteratorClosed)
            }
        }
    }

    /// Stop pulling and free the consumer. Idempotent.
    ///
    /// Buffered messages are discarded unacknowledged; the server redelivers
    /// them according to the consumer's ack policy.
    pub fn stop(&self) {
        self.closed.store(true, Ordering::Release);
        self.shared.stop();
        // a blocked `next()` holds the lock only while the buffer is empty
        if let Ok(rx) = self.rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PullStats {
        self.shared.stats()
    }
}

impl Drop for MessagesIter {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl std::fmt::Debug for MessagesIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagesIter")
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}
