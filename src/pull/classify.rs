//! Maps server status frames to pull outcomes.

use crate::error::ConsumerError;
use crate::transport::Status;

/// What a status frame means for the pull that received it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusOutcome {
    /// Idle heartbeat: proof of liveness, nothing else.
    Heartbeat,
    /// Nothing buffered (`404`): the batch is over, or pull again.
    EndOfBatch,
    /// The request expired (`408`): pull again.
    RequestExpired,
    /// The server refused to queue the request: pull again.
    BatchCompleted,
    /// The next message does not fit the remaining byte budget and the
    /// request was closed. Benign once something was delivered on it.
    MaxBytesExceeded,
    /// The subscription cannot continue.
    Terminal(ConsumerError),
    /// Surface the error, then pull again.
    Transient(ConsumerError),
    /// Surface the error and keep going.
    Unrecognized(ConsumerError),
}

const CONSUMER_DELETED: &str = "consumer deleted";
const LEADERSHIP_CHANGE: &str = "leadership change";
const MAX_BYTES_EXCEEDED: &str = "message size exceeds maxbytes";
const MAX_WAITING_EXCEEDED: &str = "exceeded maxwaiting";
const MAX_BATCH_EXCEEDED: &str = "exceeded maxrequestbatch";

pub fn classify(status: &Status, stream: &str, consumer: &str) -> StatusOutcome {
    let description = status.description.to_ascii_lowercase();
    match status.code {
        Status::IDLE_HEARTBEAT => StatusOutcome::Heartbeat,
        Status::NO_MESSAGES => StatusOutcome::EndOfBatch,
        Status::REQUEST_TIMEOUT => StatusOutcome::RequestExpired,
        Status::BAD_REQUEST => {
            StatusOutcome::Terminal(ConsumerError::BadRequest(status.description.clone()))
        }
        Status::NO_RESPONDERS => StatusOutcome::Terminal(ConsumerError::ConsumerNotFound {
            stream: stream.to_string(),
            consumer: consumer.to_string(),
        }),
        Status::CONFLICT if description.starts_with(CONSUMER_DELETED) => {
            StatusOutcome::Terminal(ConsumerError::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            })
        }
        Status::CONFLICT if description.starts_with(LEADERSHIP_CHANGE) => {
            StatusOutcome::Transient(ConsumerError::LeadershipChanged)
        }
        Status::CONFLICT if description.starts_with(MAX_BYTES_EXCEEDED) => {
            StatusOutcome::MaxBytesExceeded
        }
        Status::CONFLICT
            if description.starts_with(MAX_WAITING_EXCEEDED)
                || description.starts_with(MAX_BATCH_EXCEEDED) =>
        {
            StatusOutcome::BatchCompleted
        }
        code => StatusOutcome::Unrecognized(ConsumerError::UnexpectedStatus {
            code,
            description: status.description.clone(),
        }),
    }
}
