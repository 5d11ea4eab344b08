//! Delivered messages and their acknowledgement handle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;

use crate::error::ConsumerError;
use crate::transport::{Transport, TransportMessage, ACK_PREFIX};

const ACK: &[u8] = b"+ACK";
const NAK: &[u8] = b"-NAK";
const IN_PROGRESS: &[u8] = b"+WPI";
const TERM: &[u8] = b"+TERM";

/// Delivery metadata carried in a message's ack subject.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MsgMetadata {
    pub stream: String,
    pub consumer: String,
    /// How many times this message has been delivered, starting at 1.
    pub delivered: u64,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    pub timestamp: SystemTime,
    /// Messages still pending for the consumer after this one.
    pub pending: u64,
}

impl MsgMetadata {
    /// Parse `$JS.ACK.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.<ts>.<pending>`.
    pub fn parse(reply: &str) -> Result<Self, ConsumerError> {
        let invalid = || ConsumerError::InvalidMetadata(reply.to_string());
        let rest = reply
            .strip_prefix(ACK_PREFIX)
            .and_then(|rest| rest.strip_prefix('.'))
            .ok_or_else(invalid)?;
        let tokens: Vec<&str> = rest.split('.').collect();
        if tokens.len() < 7 {
            return Err(invalid());
        }
        let number = |index: usize| tokens[index].parse::<u64>().map_err(|_| invalid());

        Ok(Self {
            stream: tokens[0].to_string(),
            consumer: tokens[1].to_string(),
            delivered: number(2)?,
            stream_sequence: number(3)?,
            consumer_sequence: number(4)?,
            timestamp: UNIX_EPOCH + Duration::from_nanos(number(5)?),
            pending: number(6)?,
        })
    }
}

/// A message delivered by a fetch or continuous pull.
///
/// Holds the transport it arrived on so it can be acknowledged from any
/// thread. Each message settles at most once: after `ack`, `nak` or `term`
/// further acknowledgements fail with `AlreadyAcknowledged`.
pub struct Msg {
    subject: String,
    reply: Option<String>,
    headers: Vec<(String, String)>,
    payload: Vec<u8>,
    size: usize,
    transport: Arc<dyn Transport>,
    acked: AtomicBool,
}

impl Msg {
    pub(crate) fn new(message: TransportMessage, transport: Arc<dyn Transport>) -> Self {
        let size = message.size();
        Self {
            subject: message.subject,
            reply: message.reply,
            headers: message.headers,
            payload: message.payload,
            size,
            transport,
            acked: AtomicBool::new(false),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn reply(&self) -> Option<&str> {
        self.reply.as_deref()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First value of header `key`.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn data(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as UTF-8, if valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Wire size, as counted against a pull request's byte budget.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn metadata(&self) -> Result<MsgMetadata, ConsumerError> {
        let reply = self
            .reply
            .as_deref()
            .ok_or_else(|| ConsumerError::InvalidMetadata("message has no reply subject".into()))?;
        MsgMetadata::parse(reply)
    }

    /// Decode a bitcode-encoded payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        Ok(bitcode::deserialize(&self.payload)?)
    }

    /// Decode a JSON payload.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }

    /// Acknowledge successful processing.
    pub fn ack(&self) -> Result<(), ConsumerError> {
        self.settle(ACK)
    }

    /// Request redelivery.
    pub fn nak(&self) -> Result<(), ConsumerError> {
        self.settle(NAK)
    }

    /// Stop redelivery without marking the message as processed.
    pub fn term(&self) -> Result<(), ConsumerError> {
        self.settle(TERM)
    }

    /// Signal that work is ongoing; may be sent any number of times before
    /// the message is settled.
    pub fn in_progress(&self) -> Result<(), ConsumerError> {
        if self.is_acked() {
            return Err(ConsumerError::AlreadyAcknowledged);
        }
        self.send_ack(IN_PROGRESS)
    }

    fn settle(&self, kind: &[u8]) -> Result<(), ConsumerError> {
        if self.acked.swap(true, Ordering::AcqRel) {
            return Err(ConsumerError::AlreadyAcknowledged);
        }
        let result = self.send_ack(kind);
        if result.is_err() {
            self.acked.store(false, Ordering::Release);
        }
        result
    }

    fn send_ack(&self, kind: &[u8]) -> Result<(), ConsumerError> {
        let reply = self
            .reply
            .as_deref()
            .ok_or_else(|| ConsumerError::InvalidMetadata("message has no reply subject".into()))?;
        self.transport.publish(reply, None, kind)?;
        Ok(())
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Msg")
            .field("subject", &self.subject)
            .field("reply", &self.reply)
            .field("headers", &self.headers)
            .field("size", &self.size)
            .field("acked", &self.is_acked())
            .finish_non_exhaustive()
    }
}
