//! Options for one-shot and continuous pulls.
//!
//! Options are plain structs with `with_*` builders and serde support so they
//! can be loaded from configuration files. Validation happens when a pull is
//! started, before anything is sent.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::request::PullRequest;
use crate::error::ConsumerError;

/// Expiry used when none is configured.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(30);

/// Batch size of a continuous pull when neither batch nor byte limit is set.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Batch size of a continuous pull limited only by bytes.
pub const BYTES_ONLY_BATCH_SIZE: usize = 1_000_000;

/// Idle heartbeat intervals default to half the expiry, capped here.
pub const MAX_IDLE_HEARTBEAT: Duration = Duration::from_secs(30);

/// Number of heartbeat intervals without any frame before liveness fails.
pub const MISSED_HEARTBEATS: u32 = 2;

/// Options for `fetch` and `fetch_no_wait`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    /// How long the server keeps the request open.
    #[serde(with = "crate::nanos")]
    pub expiry: Duration,
    /// Byte ceiling of the batch; 0 means unlimited.
    pub max_bytes: usize,
    /// Caller deadline; the batch ends early with what has arrived so far.
    #[serde(skip)]
    pub deadline: Option<Instant>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            expiry: DEFAULT_EXPIRY,
            max_bytes: 0,
            deadline: None,
        }
    }
}

impl FetchOptions {
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Build the request descriptor for a batch of `batch` messages.
    pub(crate) fn to_request(&self, batch: usize, no_wait: bool) -> Result<PullRequest, ConsumerError> {
        if self.expiry.is_zero() {
            return Err(ConsumerError::InvalidOption(
                "fetch expiry must be greater than 0".to_string(),
            ));
        }
        let request = PullRequest::new(batch)
            .with_max_bytes(self.max_bytes)
            .with_expires(self.expiry)
            .with_no_wait(no_wait);
        request.validate()?;
        Ok(request)
    }
}

/// Bounds on the self-healing loop of a continuous pull.
///
/// A failure is a missed heartbeat or a transient server error. The count
/// resets whenever a message is delivered.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before the subscription ends; `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Pause before re-issuing a request after a failure.
    #[serde(with = "crate::nanos")]
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub(crate) fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures > max)
    }
}

/// Options for `consume` and `messages`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumeOptions {
    pub batch_size: Option<usize>,
    pub max_bytes: usize,
    /// Expiry of each pull request; zero means the default.
    #[serde(with = "crate::nanos")]
    pub expiry: Duration,
    #[serde(with = "crate::nanos::option")]
    pub idle_heartbeat: Option<Duration>,
    pub retry: RetryPolicy,
}

/// Options of the pull iterator; identical to the push dispatcher's.
pub type MessagesOptions = ConsumeOptions;

impl ConsumeOptions {
    pub fn with_batch_size(mut self, batch: usize) -> Self {
        self.batch_size = Some(batch);
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_idle_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.idle_heartbeat = Some(heartbeat);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Apply defaults and check invariants.
    pub(crate) fn resolve(&self) -> Result<ContinuousConfig, ConsumerError> {
        let batch = match (self.batch_size, self.max_bytes) {
            (Some(0), _) => {
                return Err(ConsumerError::InvalidOption(
                    "batch size must be greater than 0".to_string(),
                ))
            }
            (Some(batch), _) => batch,
            (None, 0) => DEFAULT_BATCH_SIZE,
            (None, _) => BYTES_ONLY_BATCH_SIZE,
        };
        let expiry = if self.expiry.is_zero() {
            DEFAULT_EXPIRY
        } else {
            self.expiry
        };
        let heartbeat = match self.idle_heartbeat {
            Some(hb) if hb.is_zero() => {
                return Err(ConsumerError::InvalidOption(
                    "idle heartbeat must be greater than 0".to_string(),
                ))
            }
            Some(hb) => hb,
            None => (expiry / 2).min(MAX_IDLE_HEARTBEAT),
        };
        if heartbeat >= expiry {
            return Err(ConsumerError::InvalidOption(format!(
                "idle heartbeat {:?} must be shorter than expiry {:?}",
                heartbeat, expiry
            )));
        }

        let request = PullRequest::new(batch)
            .with_max_bytes(self.max_bytes)
            .with_expires(expiry)
            .with_idle_heartbeat(heartbeat);
        request.validate()?;

        Ok(ContinuousConfig {
            request,
            liveness: heartbeat * MISSED_HEARTBEATS,
            retry: self.retry.clone(),
        })
    }
}

/// Validated settings of a continuous pull.
#[derive(Clone, Debug)]
pub(crate) struct ContinuousConfig {
    /// Template re-issued on every request cycle.
    pub request: PullRequest,
    /// Silence tolerated before `NoHeartbeat`.
    pub liveness: Duration,
    pub retry: RetryPolicy,
}
