//! In-memory stream service for testing and single-process scenarios.
//!
//! `InMemoryServer` plays both sides of the wire: it is a `Transport` the pull
//! engine can run on, and it implements the stream-storage half of the pull
//! protocol:
//! - Streams store messages published on their subjects
//! - Durable consumers keep a cursor, pending acks and waiting pull requests
//! - Pull requests are served in arrival order, honouring batch, max bytes,
//!   expiry, idle heartbeats and `no_wait`
//! - `shutdown()` / `start()` / `restart()` simulate a service outage
//!
//! Handlers run on the thread that triggered the delivery (a publisher or the
//! timer thread) while the server lock is held, so they must not call back
//! into the server.
//!
//! ## Example
//!
//! ```
//! use sourced_pull::transport::{InMemoryServer, StreamConfig, Transport};
//! use sourced_pull::consumer::ConsumerConfig;
//!
//! let server = InMemoryServer::new();
//! server.add_stream(StreamConfig::new("foo").with_subjects(&["FOO.*"])).unwrap();
//! let info = server.add_consumer("foo", ConsumerConfig::durable("cons")).unwrap();
//! assert_eq!(info.name, "cons");
//!
//! server.publish("FOO.123", None, b"m1").unwrap();
//! assert_eq!(server.message_count("foo"), Some(1));
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{
    next_id, subject_matches, validate_subject, ConnectionEvent, ConnectionHandler,
    MessageHandler, Status, SubscriptionId, Transport, TransportError, TransportMessage,
    ACK_PREFIX, API_PREFIX,
};
use crate::consumer::{
    AckPolicy, ApiError, ApiResponse, ConsumerConfig, ConsumerInfo, DeliverPolicy, SequenceInfo,
};
use crate::error::ConsumerError;
use crate::pull::PullRequest;

const TICK: Duration = Duration::from_millis(1);

/// Stream definition: a name and the subjects it captures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subjects: Vec::new(),
        }
    }

    pub fn with_subjects(mut self, subjects: &[&str]) -> Self {
        self.subjects = subjects.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// In-process stream service implementing `Transport`.
///
/// Cheap to clone; clones share the same state. The timer thread driving
/// expiries and heartbeats exits once the last clone is dropped.
#[derive(Clone)]
pub struct InMemoryServer {
    inner: Arc<Mutex<ServerState>>,
}

struct ServerState {
    running: bool,
    subscriptions: HashMap<SubscriptionId, (String, MessageHandler)>,
    watchers: HashMap<SubscriptionId, ConnectionHandler>,
    streams: HashMap<String, StoredStream>,
}

struct StoredStream {
    config: StreamConfig,
    messages: Vec<StoredMessage>,
    consumers: HashMap<String, ConsumerState>,
}

struct StoredMessage {
    sequence: u64,
    subject: String,
    payload: Vec<u8>,
}

struct ConsumerState {
    config: ConsumerConfig,
    created: SystemTime,
    /// Index into the stream of the next never-delivered message.
    next_index: usize,
    consumer_seq: u64,
    delivered_stream_seq: u64,
    /// Stream sequence -> delivery count, for messages awaiting an ack.
    pending_acks: HashMap<u64, u64>,
    redeliver: VecDeque<u64>,
    ack_floor: SequenceInfo,
    num_redelivered: u64,
    waiting: VecDeque<WaitingRequest>,
}

struct WaitingRequest {
    reply: String,
    remaining: usize,
    bytes_remaining: Option<usize>,
    expires_at: Option<Instant>,
    heartbeat: Option<Duration>,
    next_heartbeat: Option<Instant>,
    no_wait: bool,
}

type Subscriptions = HashMap<SubscriptionId, (String, MessageHandler)>;

impl Default for InMemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryServer {
    /// Create a running server and its timer thread.
    pub fn new() -> Self {
        let server = Self {
            inner: Arc::new(Mutex::new(ServerState {
                running: true,
                subscriptions: HashMap::new(),
                watchers: HashMap::new(),
                streams: HashMap::new(),
            })),
        };

        let weak = Arc::downgrade(&server.inner);
        thread::spawn(move || loop {
            thread::sleep(TICK);
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let mut state = inner.lock().unwrap_or_else(PoisonError::into_inner);
            state.tick(Instant::now());
        });

        server
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a stream. Re-adding an identical stream is a no-op.
    pub fn add_stream(&self, config: StreamConfig) -> Result<(), ConsumerError> {
        let mut state = self.state();
        if let Some(existing) = state.streams.get(&config.name) {
            if existing.config == config {
                return Ok(());
            }
            return Err(api_error(400, "stream name already in use"));
        }
        debug!(stream = %config.name, subjects = ?config.subjects, "stream created");
        state.streams.insert(
            config.name.clone(),
            StoredStream {
                config,
                messages: Vec::new(),
                consumers: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Create a consumer on `stream`, generating a name when none is given.
    pub fn add_consumer(
        &self,
        stream: &str,
        mut config: ConsumerConfig,
    ) -> Result<ConsumerInfo, ConsumerError> {
        let mut state = self.state();
        let stored = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| api_error(404, "stream not found"))?;

        let name = config
            .durable_name
            .clone()
            .or_else(|| config.name.clone())
            .unwrap_or_else(generated_name);
        config.name = Some(name.clone());

        if let Some(existing) = stored.consumers.get(&name) {
            if existing.config == config {
                return Ok(existing.info(stream, &name, &stored.messages));
            }
            return Err(api_error(400, "consumer already exists"));
        }

        let next_index = match config.deliver_policy {
            DeliverPolicy::All => 0,
            DeliverPolicy::New => stored.messages.len(),
            DeliverPolicy::Last => stored.messages.len().saturating_sub(1),
        };
        let consumer = ConsumerState {
            config,
            created: SystemTime::now(),
            next_index,
            consumer_seq: 0,
            delivered_stream_seq: 0,
            pending_acks: HashMap::new(),
            redeliver: VecDeque::new(),
            ack_floor: SequenceInfo::default(),
            num_redelivered: 0,
            waiting: VecDeque::new(),
        };
        let info = consumer.info(stream, &name, &stored.messages);
        stored.consumers.insert(name.clone(), consumer);
        debug!(stream, consumer = %name, "consumer created");
        Ok(info)
    }

    /// Replace the configuration of an existing consumer, keeping its state.
    pub fn update_consumer(
        &self,
        stream: &str,
        mut config: ConsumerConfig,
    ) -> Result<ConsumerInfo, ConsumerError> {
        let mut state = self.state();
        let stored = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| api_error(404, "stream not found"))?;
        let name = config
            .durable_name
            .clone()
            .or_else(|| config.name.clone())
            .ok_or_else(|| api_error(400, "consumer name required"))?;
        let consumer = stored
            .consumers
            .get_mut(&name)
            .ok_or_else(|| api_error(404, "consumer not found"))?;
        config.name = Some(name.clone());
        consumer.config = config;
        Ok(consumer.info(stream, &name, &stored.messages))
    }

    /// Delete a consumer; its waiting pull requests receive `409 Consumer Deleted`.
    pub fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<(), ConsumerError> {
        let mut guard = self.state();
        let ServerState {
            streams,
            subscriptions,
            ..
        } = &mut *guard;
        let stored = streams
            .get_mut(stream)
            .ok_or_else(|| api_error(404, "stream not found"))?;
        let removed = stored
            .consumers
            .remove(consumer)
            .ok_or_else(|| api_error(404, "consumer not found"))?;
        for request in removed.waiting {
            dispatch(
                subscriptions,
                TransportMessage::status(
                    request.reply,
                    Status::new(Status::CONFLICT, "Consumer Deleted"),
                ),
            );
        }
        debug!(stream, consumer, "consumer deleted");
        Ok(())
    }

    /// Current state of a consumer, bypassing the transport.
    pub fn consumer_info(&self, stream: &str, consumer: &str) -> Result<ConsumerInfo, ConsumerError> {
        let state = self.state();
        state
            .describe(stream, consumer)
            .map_err(|err| api_error(err.code, &err.description))
    }

    /// Number of messages stored in a stream.
    pub fn message_count(&self, stream: &str) -> Option<usize> {
        self.state().streams.get(stream).map(|s| s.messages.len())
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Simulate an outage: waiting pull requests are lost, heartbeats stop and
    /// publish/request fail with `Disconnected` until `start()`.
    pub fn shutdown(&self) {
        let watchers = {
            let mut state = self.state();
            if !state.running {
                return;
            }
            state.running = false;
            for stream in state.streams.values_mut() {
                for consumer in stream.consumers.values_mut() {
                    consumer.waiting.clear();
                }
            }
            state.watchers.values().cloned().collect::<Vec<_>>()
        };
        debug!("server shut down");
        for watcher in watchers {
            watcher(ConnectionEvent::Disconnected);
        }
    }

    /// Resume after `shutdown()`; stored messages and consumer positions survive.
    pub fn start(&self) {
        let watchers = {
            let mut state = self.state();
            if state.running {
                return;
            }
            state.running = true;
            state.watchers.values().cloned().collect::<Vec<_>>()
        };
        debug!("server started");
        for watcher in watchers {
            watcher(ConnectionEvent::Reconnected);
        }
    }

    pub fn restart(&self) {
        self.shutdown();
        self.start();
    }
}

impl Transport for InMemoryServer {
    fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        validate_subject(subject)?;
        let mut state = self.state();
        if !state.running {
            return Err(TransportError::Disconnected);
        }

        let mut message = TransportMessage::new(subject, payload.to_vec());
        message.reply = reply.map(str::to_string);
        dispatch(&state.subscriptions, message);

        if subject.starts_with(ACK_PREFIX) {
            state.handle_ack(subject, payload);
        } else if subject.starts_with(API_PREFIX) {
            if let Some((stream, consumer)) = parse_pull_subject(subject) {
                if let Some(reply) = reply {
                    state.handle_pull(stream, consumer, reply, payload);
                }
            }
        } else {
            state.store(subject, payload);
        }
        Ok(())
    }

    fn request(
        &self,
        subject: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<TransportMessage, TransportError> {
        validate_subject(subject)?;
        if let Some((stream, consumer)) = parse_info_subject(subject) {
            let state = self.state();
            if !state.running {
                return Err(TransportError::Disconnected);
            }
            let body = match state.describe(stream, consumer) {
                Ok(info) => serde_json::to_vec(&ApiResponse::Ok(info)),
                Err(error) => serde_json::to_vec(&ApiResponse::<ConsumerInfo>::Err { error }),
            }
            .map_err(|_| TransportError::NoResponders(subject.to_string()))?;
            return Ok(TransportMessage::new(subject, body));
        }

        if !self
            .state()
            .subscriptions
            .values()
            .any(|(pattern, _)| subject_matches(pattern, subject))
        {
            return Err(TransportError::NoResponders(subject.to_string()));
        }

        let inbox = self.new_inbox();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let sid = self.subscribe(
            &inbox,
            Arc::new(move |msg| {
                if let Ok(tx) = tx.lock() {
                    let _ = tx.send(msg);
                }
            }),
        )?;
        let result = self
            .publish(subject, Some(&inbox), payload)
            .and_then(|()| rx.recv_timeout(timeout).map_err(|_| TransportError::Timeout));
        self.unsubscribe(sid)?;
        result
    }

    fn subscribe(
        &self,
        subject: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, TransportError> {
        validate_subject(subject)?;
        let id = next_id();
        self.state()
            .subscriptions
            .insert(id, (subject.to_string(), handler));
        trace!(subject, id, "subscribed");
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        let mut state = self.state();
        state.subscriptions.remove(&id);
        state.watchers.remove(&id);
        Ok(())
    }

    fn watch_connection(
        &self,
        handler: ConnectionHandler,
    ) -> Result<SubscriptionId, TransportError> {
        let id = next_id();
        self.state().watchers.insert(id, handler);
        Ok(id)
    }
}

impl ServerState {
    fn describe(&self, stream: &str, consumer: &str) -> Result<ConsumerInfo, ApiError> {
        let stored = self
            .streams
            .get(stream)
            .ok_or_else(ApiError::stream_not_found)?;
        let state = stored
            .consumers
            .get(consumer)
            .ok_or_else(ApiError::consumer_not_found)?;
        Ok(state.info(stream, consumer, &stored.messages))
    }

    fn store(&mut self, subject: &str, payload: &[u8]) {
        let ServerState {
            streams,
            subscriptions,
            ..
        } = self;
        for (name, stream) in streams.iter_mut() {
            if !stream
                .config
                .subjects
                .iter()
                .any(|pattern| subject_matches(pattern, subject))
            {
                continue;
            }
            let sequence = stream.messages.len() as u64 + 1;
            stream.messages.push(StoredMessage {
                sequence,
                subject: subject.to_string(),
                payload: payload.to_vec(),
            });
            trace!(stream = %name, sequence, subject, "message stored");
            for (consumer_name, consumer) in stream.consumers.iter_mut() {
                consumer.serve(name, consumer_name, &stream.messages, subscriptions);
            }
        }
    }

    fn handle_pull(&mut self, stream: &str, consumer: &str, reply: &str, payload: &[u8]) {
        let ServerState {
            streams,
            subscriptions,
            ..
        } = self;
        let respond = |status: Status| {
            dispatch(subscriptions, TransportMessage::status(reply, status));
        };

        let request = if payload.is_empty() {
            PullRequest::new(1)
        } else {
            match PullRequest::from_json(payload) {
                Ok(request) => request,
                Err(_) => return respond(Status::new(Status::BAD_REQUEST, "Bad Request")),
            }
        };
        if request.validate().is_err() {
            return respond(Status::new(Status::BAD_REQUEST, "Bad Request"));
        }

        let Some(stored) = streams.get_mut(stream) else {
            return respond(Status::new(Status::CONFLICT, "Consumer Deleted"));
        };
        let Some(state) = stored.consumers.get_mut(consumer) else {
            return respond(Status::new(Status::CONFLICT, "Consumer Deleted"));
        };
        if state.waiting.len() >= state.config.max_waiting {
            return respond(Status::new(Status::CONFLICT, "Exceeded MaxWaiting"));
        }

        let now = Instant::now();
        let heartbeat = (!request.idle_heartbeat.is_zero()).then_some(request.idle_heartbeat);
        trace!(stream, consumer, batch = request.batch, no_wait = request.no_wait, "pull request received");
        state.waiting.push_back(WaitingRequest {
            reply: reply.to_string(),
            remaining: request.batch,
            bytes_remaining: (request.max_bytes > 0).then_some(request.max_bytes),
            expires_at: (!request.expires.is_zero() && !request.no_wait)
                .then(|| now + request.expires),
            heartbeat,
            next_heartbeat: heartbeat.map(|hb| now + hb),
            no_wait: request.no_wait,
        });
        state.serve(stream, consumer, &stored.messages, subscriptions);

        // no_wait requests never linger past what is buffered right now
        let mut kept = VecDeque::with_capacity(state.waiting.len());
        for request in state.waiting.drain(..) {
            if request.no_wait {
                dispatch(
                    subscriptions,
                    TransportMessage::status(
                        request.reply,
                        Status::new(Status::NO_MESSAGES, "No Messages"),
                    ),
                );
            } else {
                kept.push_back(request);
            }
        }
        state.waiting = kept;
    }

    fn handle_ack(&mut self, subject: &str, payload: &[u8]) {
        let tokens: Vec<&str> = subject.split('.').collect();
        if tokens.len() < 9 {
            return;
        }
        let (stream, consumer) = (tokens[2], tokens[3]);
        let Ok(stream_seq) = tokens[5].parse::<u64>() else {
            return;
        };
        let consumer_seq = tokens[6].parse::<u64>().unwrap_or_default();

        let ServerState {
            streams,
            subscriptions,
            ..
        } = self;
        let Some(stored) = streams.get_mut(stream) else {
            return;
        };
        let Some(state) = stored.consumers.get_mut(consumer) else {
            return;
        };

        match payload {
            b"-NAK" => {
                if state.pending_acks.contains_key(&stream_seq) {
                    state.redeliver.push_back(stream_seq);
                    state.serve(stream, consumer, &stored.messages, subscriptions);
                }
            }
            b"+WPI" => {}
            // +ACK, +TERM and the empty ack all settle the message
            _ => {
                if state.pending_acks.remove(&stream_seq).is_some() {
                    state.redeliver.retain(|seq| *seq != stream_seq);
                    if stream_seq > state.ack_floor.stream_seq {
                        state.ack_floor = SequenceInfo {
                            consumer_seq,
                            stream_seq,
                        };
                    }
                }
            }
        }
    }

    fn tick(&mut self, now: Instant) {
        if !self.running {
            return;
        }
        let ServerState {
            streams,
            subscriptions,
            ..
        } = self;
        for stream in streams.values_mut() {
            for consumer in stream.consumers.values_mut() {
                consumer.waiting.retain_mut(|request| {
                    if !has_interest(subscriptions, &request.reply) {
                        return false;
                    }
                    if request.expires_at.is_some_and(|at| at <= now) {
                        dispatch(
                            subscriptions,
                            TransportMessage::status(
                                request.reply.clone(),
                                Status::new(Status::REQUEST_TIMEOUT, "Request Timeout"),
                            ),
                        );
                        return false;
                    }
                    if let (Some(hb), Some(at)) = (request.heartbeat, request.next_heartbeat) {
                        if at <= now {
                            dispatch(
                                subscriptions,
                                TransportMessage::status(
                                    request.reply.clone(),
                                    Status::new(Status::IDLE_HEARTBEAT, "Idle Heartbeat"),
                                ),
                            );
                            request.next_heartbeat = Some(now + hb);
                        }
                    }
                    true
                });
            }
        }
    }
}

impl ConsumerState {
    fn matches_filter(&self, subject: &str) -> bool {
        self.config
            .filter_subject
            .as_deref()
            .map_or(true, |filter| subject_matches(filter, subject))
    }

    /// Next stream sequence to deliver: redeliveries first, then new messages.
    fn peek_next(&self, messages: &[StoredMessage]) -> Option<(u64, Option<usize>)> {
        if let Some(seq) = self.redeliver.front() {
            return Some((*seq, None));
        }
        messages[self.next_index.min(messages.len())..]
            .iter()
            .enumerate()
            .find(|(_, m)| self.matches_filter(&m.subject))
            .map(|(offset, m)| (m.sequence, Some(self.next_index + offset)))
    }

    fn num_pending(&self, messages: &[StoredMessage]) -> u64 {
        messages[self.next_index.min(messages.len())..]
            .iter()
            .filter(|m| self.matches_filter(&m.subject))
            .count() as u64
    }

    fn serve(
        &mut self,
        stream: &str,
        consumer: &str,
        messages: &[StoredMessage],
        subscriptions: &Subscriptions,
    ) {
        let now = Instant::now();
        while let Some(request) = self.waiting.front() {
            if !has_interest(subscriptions, &request.reply) {
                self.waiting.pop_front();
                continue;
            }
            let Some((sequence, index)) = self.peek_next(messages) else {
                break;
            };
            let stored = &messages[(sequence - 1) as usize];
            let delivered = self.pending_acks.get(&sequence).map_or(1, |count| count + 1);
            let pending = self.num_pending(messages).saturating_sub(u64::from(index.is_some()));
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_nanos());
            let reply = format!(
                "{}.{}.{}.{}.{}.{}.{}.{}",
                ACK_PREFIX,
                stream,
                consumer,
                delivered,
                sequence,
                self.consumer_seq + 1,
                timestamp,
                pending
            );
            let message = TransportMessage::new(stored.subject.clone(), stored.payload.clone())
                .with_reply(reply);
            let size = message.size();
            let target = request.reply.clone();

            if request.bytes_remaining.is_some_and(|bytes| size > bytes) {
                self.waiting.pop_front();
                dispatch(
                    subscriptions,
                    TransportMessage::status(
                        target,
                        Status::new(Status::CONFLICT, "Message Size Exceeds MaxBytes"),
                    ),
                );
                continue;
            }

            match index {
                Some(index) => self.next_index = index + 1,
                None => {
                    self.redeliver.pop_front();
                    self.num_redelivered += 1;
                }
            }
            self.consumer_seq += 1;
            self.delivered_stream_seq = self.delivered_stream_seq.max(sequence);
            if self.config.ack_policy != AckPolicy::None {
                self.pending_acks.insert(sequence, delivered);
            }

            deliver_to(subscriptions, &target, message);

            let done = {
                let request = match self.waiting.front_mut() {
                    Some(request) => request,
                    None => break,
                };
                request.remaining -= 1;
                if let Some(bytes) = request.bytes_remaining.as_mut() {
                    *bytes -= size;
                }
                request.next_heartbeat = request.heartbeat.map(|hb| now + hb);
                request.remaining == 0 || request.bytes_remaining == Some(0)
            };
            if done {
                self.waiting.pop_front();
            }
        }
    }

    fn info(&self, stream: &str, name: &str, messages: &[StoredMessage]) -> ConsumerInfo {
        ConsumerInfo {
            stream_name: stream.to_string(),
            name: name.to_string(),
            created: self.created,
            config: self.config.clone(),
            delivered: SequenceInfo {
                consumer_seq: self.consumer_seq,
                stream_seq: self.delivered_stream_seq,
            },
            ack_floor: self.ack_floor,
            num_ack_pending: self.pending_acks.len() as u64,
            num_redelivered: self.num_redelivered,
            num_waiting: self.waiting.len() as u64,
            num_pending: self.num_pending(messages),
        }
    }
}

/// Deliver `message` to every subscription whose pattern matches its subject.
fn dispatch(subscriptions: &Subscriptions, message: TransportMessage) {
    let subject = message.subject.clone();
    deliver_to(subscriptions, &subject, message);
}

/// Deliver a stream message to the inbox of a pull request. The message keeps
/// its own subject; only the routing uses the inbox.
fn deliver_to(subscriptions: &Subscriptions, inbox: &str, message: TransportMessage) {
    for (pattern, handler) in subscriptions.values() {
        if subject_matches(pattern, inbox) {
            handler(message.clone());
        }
    }
}

fn has_interest(subscriptions: &Subscriptions, subject: &str) -> bool {
    subscriptions
        .values()
        .any(|(pattern, _)| subject_matches(pattern, subject))
}

fn parse_pull_subject(subject: &str) -> Option<(&str, &str)> {
    let rest = subject.strip_prefix(API_PREFIX)?.strip_prefix(".CONSUMER.MSG.NEXT.")?;
    rest.split_once('.')
}

fn parse_info_subject(subject: &str) -> Option<(&str, &str)> {
    let rest = subject.strip_prefix(API_PREFIX)?.strip_prefix(".CONSUMER.INFO.")?;
    rest.split_once('.')
}

fn generated_name() -> String {
    format!("C{:012X}", next_id())
}

fn api_error(code: u16, description: &str) -> ConsumerError {
    ConsumerError::Api {
        code,
        description: description.to_string(),
    }
}
