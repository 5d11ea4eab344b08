//! Pull engine: one-shot fetches and continuous pulls.
//!
//! - `fetch` sends a single request and collects one batch
//! - `continuous` runs the request/replenish loop behind `consume` (callback)
//!   and `messages` (iterator)
//! - `heartbeat` detects silent delivery paths, `classify` interprets the
//!   server's status frames

mod allowance;
pub mod classify;
pub(crate) mod consume;
pub(crate) mod continuous;
pub(crate) mod fetch;
mod heartbeat;
pub(crate) mod messages;
pub mod options;
pub mod request;

pub use classify::{classify, StatusOutcome};
pub use consume::{ConsumeContext, StopHandle};
pub use continuous::PullStats;
pub use fetch::MessageBatch;
pub use messages::MessagesIter;
pub use options::{ConsumeOptions, FetchOptions, MessagesOptions, RetryPolicy};
pub use request::PullRequest;

/// Largest number of delivered items buffered ahead of the caller.
pub(crate) const MAX_BUFFERED: usize = 1024;
