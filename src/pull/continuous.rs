//! Continuous pull loop shared by the iterator and the push dispatcher.
//!
//! One thread owns the loop. Everything it reacts to arrives as a
//! `LoopEvent` on a single channel:
//!
//! ```text
//!  transport inbox ──Frame──────┐
//!  heartbeat monitor ─Missed────┤
//!  connection watcher ─Conn─────┼──► loop thread ──► sink (channel / handler)
//!  stop() ──────────Stop────────┘         │
//!                                         └── publish pull request
//! ```
//!
//! A request is issued on start and whenever the allowance of the previous
//! one is exhausted, the server closes it (expiry, byte ceiling) or liveness
//! fails. Requests that cannot be sent because the transport is down are
//! re-issued when the connection comes back.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::allowance::Allowance;
use super::classify::{classify, StatusOutcome};
use super::heartbeat::HeartbeatMonitor;
use super::options::ContinuousConfig;
use crate::consumer::{PullConsumer, SubscriptionGuard};
use crate::error::{ConsumerError, TransportError};
use crate::message::Msg;
use crate::transport::{
    pull_request_subject, ConnectionEvent, SubscriptionId, Transport, TransportMessage,
};

const BACKOFF_SLICE: Duration = Duration::from_millis(10);

/// Counters of a continuous pull.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PullStats {
    pub requests_sent: u64,
    pub messages_delivered: u64,
    pub heartbeats_missed: u64,
    pub errors_surfaced: u64,
}

#[derive(Default)]
struct Counters {
    requests_sent: AtomicU64,
    messages_delivered: AtomicU64,
    heartbeats_missed: AtomicU64,
    errors_surfaced: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PullStats {
        PullStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            heartbeats_missed: self.heartbeats_missed.load(Ordering::Relaxed),
            errors_surfaced: self.errors_surfaced.load(Ordering::Relaxed),
        }
    }
}

pub(crate) enum LoopEvent {
    Frame(TransportMessage),
    HeartbeatMissed,
    Connection(ConnectionEvent),
    Stop,
}

/// State shared between the loop thread and the caller-facing handle.
pub(crate) struct LoopShared {
    closed: AtomicBool,
    guard: SubscriptionGuard,
    transport: Arc<dyn Transport>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    events: Mutex<Sender<LoopEvent>>,
    counters: Counters,
}

impl LoopShared {
    /// End the subscription: stop listening, free the consumer and wake the
    /// loop. Idempotent and callable from any thread, including a handler.
    pub(crate) fn stop(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscriptions = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for sid in subscriptions {
            let _ = self.transport.unsubscribe(sid);
        }
        self.guard.release();
        let _ = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(LoopEvent::Stop);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn stats(&self) -> PullStats {
        self.counters.snapshot()
    }

    fn track(&self, sid: SubscriptionId) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sid);
    }
}

/// Where the loop hands messages and errors.
pub(crate) trait Sink: Send + 'static {
    /// Deliver one item. Returns `false` once the loop should end.
    fn deliver(&mut self, item: Result<Msg, ConsumerError>, shared: &LoopShared) -> bool;
}

/// Bounded channel towards a pull iterator. A full buffer blocks the loop
/// until the iterator takes an item or drains the buffer on stop.
pub(crate) struct ChannelSink {
    tx: SyncSender<Result<Msg, ConsumerError>>,
}

impl ChannelSink {
    pub(crate) fn new(tx: SyncSender<Result<Msg, ConsumerError>>) -> Self {
        Self { tx }
    }
}

impl Sink for ChannelSink {
    fn deliver(&mut self, item: Result<Msg, ConsumerError>, shared: &LoopShared) -> bool {
        self.tx.send(item).is_ok() && !shared.is_closed()
    }
}

/// Caller-supplied callback of a push dispatcher.
pub(crate) struct HandlerSink<F> {
    handler: F,
}

impl<F> HandlerSink<F> {
    pub(crate) fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> Sink for HandlerSink<F>
where
    F: FnMut(Result<Msg, ConsumerError>) + Send + 'static,
{
    fn deliver(&mut self, item: Result<Msg, ConsumerError>, shared: &LoopShared) -> bool {
        (self.handler)(item);
        !shared.is_closed()
    }
}

/// Claim the consumer, subscribe, send the first request and start the loop thread.
pub(crate) fn spawn<S: Sink>(
    consumer: &PullConsumer,
    config: ContinuousConfig,
    sink: S,
) -> Result<(Arc<LoopShared>, JoinHandle<()>), ConsumerError> {
    let payload = config.request.to_json()?;
    let guard = consumer.acquire()?;
    let transport = consumer.transport().clone();
    let (events_tx, events_rx) = mpsc::channel();

    let shared = Arc::new(LoopShared {
        closed: AtomicBool::new(false),
        guard,
        transport: transport.clone(),
        subscriptions: Mutex::new(Vec::new()),
        events: Mutex::new(events_tx.clone()),
        counters: Counters::default(),
    });

    let missed_tx = Mutex::new(events_tx.clone());
    let monitor = HeartbeatMonitor::spawn(config.liveness, move || {
        if let Ok(tx) = missed_tx.lock() {
            let _ = tx.send(LoopEvent::HeartbeatMissed);
        }
    });

    let inbox = transport.new_inbox();
    let heartbeat = monitor.handle();
    let frames_tx = Mutex::new(events_tx.clone());
    let subscribed = transport.subscribe(
        &inbox,
        Arc::new(move |frame| {
            heartbeat.reset();
            if let Ok(tx) = frames_tx.lock() {
                let _ = tx.send(LoopEvent::Frame(frame));
            }
        }),
    );
    let connection_tx = Mutex::new(events_tx);
    let watched = subscribed.and_then(|sid| {
        shared.track(sid);
        transport.watch_connection(Arc::new(move |event| {
            if let Ok(tx) = connection_tx.lock() {
                let _ = tx.send(LoopEvent::Connection(event));
            }
        }))
    });
    match watched {
        Ok(sid) => shared.track(sid),
        Err(err) => {
            shared.stop();
            return Err(err.into());
        }
    }

    let mut pull_loop = PullLoop {
        subject: pull_request_subject(consumer.stream(), consumer.name()),
        stream: consumer.stream().to_string(),
        consumer: consumer.name().to_string(),
        inbox,
        allowance: Allowance::for_request(&config.request),
        payload,
        config,
        shared: shared.clone(),
        monitor,
        events: events_rx,
        sink,
        failures: 0,
        awaiting_reconnect: false,
    };
    if let Err(err) = pull_loop.pull() {
        shared.stop();
        return Err(err);
    }
    debug!(
        stream = %pull_loop.stream,
        consumer = %pull_loop.consumer,
        batch = pull_loop.config.request.batch,
        max_bytes = pull_loop.config.request.max_bytes,
        "continuous pull started"
    );

    let handle = thread::spawn(move || pull_loop.run());
    Ok((shared, handle))
}

struct PullLoop<S> {
    config: ContinuousConfig,
    payload: Vec<u8>,
    subject: String,
    inbox: String,
    stream: String,
    consumer: String,
    shared: Arc<LoopShared>,
    monitor: HeartbeatMonitor,
    events: Receiver<LoopEvent>,
    sink: S,
    allowance: Allowance,
    /// Consecutive failures since the last delivered message.
    failures: u32,
    awaiting_reconnect: bool,
}

impl<S: Sink> PullLoop<S> {
    fn run(mut self) {
        while let Ok(event) = self.events.recv() {
            if self.shared.is_closed() {
                break;
            }
            let keep_going = match event {
                LoopEvent::Stop => false,
                LoopEvent::Frame(frame) => self.on_frame(frame),
                LoopEvent::HeartbeatMissed => self.on_heartbeat_missed(),
                LoopEvent::Connection(ConnectionEvent::Reconnected) => {
                    debug!(stream = %self.stream, consumer = %self.consumer, "connection restored, pulling again");
                    self.pull_or_wait()
                }
                LoopEvent::Connection(ConnectionEvent::Disconnected) => {
                    debug!(stream = %self.stream, consumer = %self.consumer, "connection lost");
                    true
                }
            };
            if !keep_going {
                break;
            }
        }

        self.monitor.cancel();
        self.shared.stop();
        debug!(
            stream = %self.stream,
            consumer = %self.consumer,
            stats = ?self.shared.stats(),
            "continuous pull stopped"
        );
    }

    fn on_frame(&mut self, frame: TransportMessage) -> bool {
        let Some(status) = frame.status.clone() else {
            self.allowance.consume(frame.size());
            let exhausted = self.allowance.is_exhausted();
            if exhausted {
                // nothing more can arrive on this request
                self.monitor.disarm();
            }
            self.failures = 0;
            let msg = Msg::new(frame, self.shared.transport.clone());
            if !self.deliver(Ok(msg)) {
                return false;
            }
            return !exhausted || self.pull_or_wait();
        };

        match classify(&status, &self.stream, &self.consumer) {
            StatusOutcome::Heartbeat => true,
            StatusOutcome::MaxBytesExceeded if self.allowance.is_unused(&self.config.request) => {
                // the request was closed without room for the next message
                self.monitor.disarm();
                let max_bytes = self.config.request.max_bytes;
                warn!(
                    stream = %self.stream,
                    consumer = %self.consumer,
                    max_bytes,
                    "next message exceeds max bytes"
                );
                let pause = self.config.request.idle_heartbeat;
                self.retry_after(Err(ConsumerError::MessageTooLarge { max_bytes }), pause)
            }
            StatusOutcome::EndOfBatch
            | StatusOutcome::RequestExpired
            | StatusOutcome::BatchCompleted
            | StatusOutcome::MaxBytesExceeded => {
                trace!(
                    stream = %self.stream,
                    consumer = %self.consumer,
                    code = status.code,
                    remaining = self.allowance.messages(),
                    "pull request closed by server"
                );
                self.pull_or_wait()
            }
            StatusOutcome::Terminal(err) => {
                warn!(stream = %self.stream, consumer = %self.consumer, error = %err, "continuous pull ended by server");
                self.deliver(Err(err));
                false
            }
            StatusOutcome::Transient(err) => {
                warn!(stream = %self.stream, consumer = %self.consumer, error = %err, "transient pull failure");
                self.retry_after(Err(err), Duration::ZERO)
            }
            StatusOutcome::Unrecognized(err) => {
                debug!(stream = %self.stream, consumer = %self.consumer, code = status.code, "unrecognized status");
                self.deliver(Err(err))
            }
        }
    }

    fn on_heartbeat_missed(&mut self) -> bool {
        self.shared
            .counters
            .heartbeats_missed
            .fetch_add(1, Ordering::Relaxed);
        warn!(
            stream = %self.stream,
            consumer = %self.consumer,
            timeout = ?self.config.liveness,
            "no heartbeat received"
        );
        self.retry_after(Err(ConsumerError::NoHeartbeat), Duration::ZERO)
    }

    /// Surface a recoverable failure, then pull again unless the retry policy
    /// is exhausted. The pause before the next request is the policy backoff,
    /// but never shorter than `min_pause`.
    fn retry_after(&mut self, failure: Result<Msg, ConsumerError>, min_pause: Duration) -> bool {
        self.failures += 1;
        let exhausted = self.config.retry.exhausted(self.failures);
        if !self.deliver(failure) || exhausted {
            if exhausted {
                warn!(
                    stream = %self.stream,
                    consumer = %self.consumer,
                    failures = self.failures,
                    "retry attempts exhausted"
                );
            }
            return false;
        }
        self.backoff(min_pause) && self.pull_or_wait()
    }

    /// Sleep out the retry backoff, giving up early on stop.
    fn backoff(&self, min_pause: Duration) -> bool {
        let until = Instant::now() + self.config.retry.backoff.max(min_pause);
        loop {
            if self.shared.is_closed() {
                return false;
            }
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(BACKOFF_SLICE));
        }
    }

    /// Issue a request; when the transport is down, wait for the reconnect
    /// event instead of surfacing an error.
    fn pull_or_wait(&mut self) -> bool {
        match self.pull() {
            Ok(()) => true,
            Err(ConsumerError::Transport(TransportError::Disconnected)) => {
                if !self.awaiting_reconnect {
                    warn!(
                        stream = %self.stream,
                        consumer = %self.consumer,
                        "transport disconnected, waiting for reconnect"
                    );
                }
                self.awaiting_reconnect = true;
                true
            }
            Err(err) => self.deliver(Err(err)),
        }
    }

    fn pull(&mut self) -> Result<(), ConsumerError> {
        self.allowance = Allowance::for_request(&self.config.request);
        self.monitor.reset();
        if let Err(err) = self
            .shared
            .transport
            .publish(&self.subject, Some(&self.inbox), &self.payload)
        {
            self.monitor.disarm();
            return Err(err.into());
        }
        self.awaiting_reconnect = false;
        let sent = self
            .shared
            .counters
            .requests_sent
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        trace!(stream = %self.stream, consumer = %self.consumer, sent, "pull request sent");
        Ok(())
    }

    fn deliver(&mut self, item: Result<Msg, ConsumerError>) -> bool {
        if self.shared.is_closed() {
            return false;
        }
        let counter = match item {
            Ok(_) => &self.shared.counters.messages_delivered,
            Err(_) => &self.shared.counters.errors_surfaced,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.sink.deliver(item, &self.shared)
    }
}
