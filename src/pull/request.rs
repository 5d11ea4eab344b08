//! Pull request descriptor and its JSON wire form.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConsumerError;

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

/// A bounded, time-limited ask for up to `batch` messages or `max_bytes` bytes.
///
/// Zero `max_bytes` means unlimited, zero `expires` means the server default,
/// zero `idle_heartbeat` disables heartbeats.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub batch: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_bytes: usize,
    #[serde(
        default,
        with = "crate::nanos",
        skip_serializing_if = "crate::nanos::is_zero"
    )]
    pub expires: Duration,
    #[serde(
        default,
        with = "crate::nanos",
        skip_serializing_if = "crate::nanos::is_zero"
    )]
    pub idle_heartbeat: Duration,
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_wait: bool,
}

impl PullRequest {
    pub fn new(batch: usize) -> Self {
        Self {
            batch,
            ..Default::default()
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_expires(mut self, expires: Duration) -> Self {
        self.expires = expires;
        self
    }

    pub fn with_idle_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.idle_heartbeat = heartbeat;
        self
    }

    pub fn with_no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    /// Check the descriptor invariants: a positive batch, and heartbeats that
    /// arrive strictly before the request expires.
    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.batch == 0 {
            return Err(ConsumerError::InvalidOption(
                "batch size must be greater than 0".to_string(),
            ));
        }
        if !self.expires.is_zero()
            && !self.idle_heartbeat.is_zero()
            && self.idle_heartbeat >= self.expires
        {
            return Err(ConsumerError::InvalidOption(format!(
                "idle heartbeat {:?} must be shorter than expiry {:?}",
                self.idle_heartbeat, self.expires
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ConsumerError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ConsumerError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
