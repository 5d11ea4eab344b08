//! Client-side accounting of what the outstanding pull request may still deliver.

use super::request::PullRequest;

/// Remaining capacity of the current pull request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Allowance {
    messages: usize,
    /// `None` when the request has no byte ceiling.
    bytes: Option<usize>,
}

impl Allowance {
    pub(crate) fn for_request(request: &PullRequest) -> Self {
        Self {
            messages: request.batch,
            bytes: (request.max_bytes > 0).then_some(request.max_bytes),
        }
    }

    /// Account for one delivered message of `size` wire bytes.
    pub(crate) fn consume(&mut self, size: usize) {
        self.messages = self.messages.saturating_sub(1);
        if let Some(bytes) = self.bytes.as_mut() {
            *bytes = bytes.saturating_sub(size);
        }
    }

    /// The request cannot deliver anything more.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.messages == 0 || self.bytes == Some(0)
    }

    /// Nothing has been delivered on `request` yet.
    pub(crate) fn is_unused(&self, request: &PullRequest) -> bool {
        *self == Self::for_request(request)
    }

    pub(crate) fn messages(&self) -> usize {
        self.messages
    }
}
