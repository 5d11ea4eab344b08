//! Consumer configuration and state snapshots, as returned by the describe call.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Acknowledgement policy of a consumer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    #[default]
    Explicit,
    None,
    All,
}

/// Where a new consumer starts reading the stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    #[default]
    All,
    New,
    Last,
}

/// Consumer configuration as stored by the stream service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub deliver_policy: DeliverPolicy,
    #[serde(default)]
    pub ack_policy: AckPolicy,
    #[serde(default = "default_ack_wait", with = "crate::nanos")]
    pub ack_wait: Duration,
    #[serde(default = "default_max_deliver")]
    pub max_deliver: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,
    #[serde(default = "default_max_waiting")]
    pub max_waiting: usize,
    #[serde(default = "default_max_ack_pending")]
    pub max_ack_pending: i64,
}

fn default_ack_wait() -> Duration {
    Duration::from_secs(30)
}

fn default_max_deliver() -> i64 {
    -1
}

fn default_max_waiting() -> usize {
    512
}

fn default_max_ack_pending() -> i64 {
    1000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            durable_name: None,
            name: None,
            description: None,
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::Explicit,
            ack_wait: default_ack_wait(),
            max_deliver: default_max_deliver(),
            filter_subject: None,
            max_waiting: default_max_waiting(),
            max_ack_pending: default_max_ack_pending(),
        }
    }
}

impl ConsumerConfig {
    /// Configuration for a durable consumer with the given name.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            durable_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    pub fn with_deliver_policy(mut self, policy: DeliverPolicy) -> Self {
        self.deliver_policy = policy;
        self
    }

    pub fn with_filter_subject(mut self, subject: impl Into<String>) -> Self {
        self.filter_subject = Some(subject.into());
        self
    }

    pub fn with_ack_wait(mut self, wait: Duration) -> Self {
        self.ack_wait = wait;
        self
    }
}

/// Consumer and stream sequence pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceInfo {
    pub consumer_seq: u64,
    pub stream_seq: u64,
}

/// Snapshot of a consumer's configuration and delivery state.
///
/// Snapshots are replaced wholesale; they are never patched in place.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub stream_name: String,
    pub name: String,
    pub created: SystemTime,
    pub config: ConsumerConfig,
    #[serde(default)]
    pub delivered: SequenceInfo,
    #[serde(default)]
    pub ack_floor: SequenceInfo,
    #[serde(default)]
    pub num_ack_pending: u64,
    #[serde(default)]
    pub num_redelivered: u64,
    #[serde(default)]
    pub num_waiting: u64,
    #[serde(default)]
    pub num_pending: u64,
}

/// Error body of an API response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: u16,
    #[serde(default)]
    pub err_code: u16,
    #[serde(default)]
    pub description: String,
}

impl ApiError {
    pub const CONSUMER_NOT_FOUND: u16 = 10014;
    pub const STREAM_NOT_FOUND: u16 = 10059;

    pub fn consumer_not_found() -> Self {
        Self {
            code: 404,
            err_code: Self::CONSUMER_NOT_FOUND,
            description: "consumer not found".to_string(),
        }
    }

    pub fn stream_not_found() -> Self {
        Self {
            code: 404,
            err_code: Self::STREAM_NOT_FOUND,
            description: "stream not found".to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.err_code == Self::CONSUMER_NOT_FOUND || self.err_code == Self::STREAM_NOT_FOUND
    }
}

/// Describe call response: either an error body or the consumer info.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiResponse<T> {
    Err { error: ApiError },
    Ok(T),
}
