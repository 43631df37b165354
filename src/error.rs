use rdkafka::error::KafkaError;

use crate::types::TopicPartition;

/// Errors that can surface from [`crate::consumer::Consumer::subscribe`].
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("manual offset resolver failed: {0}")]
    ResolverFailed(String),
    #[error("the Runloop has already stopped")]
    RunloopGone,
}

/// Errors from a commit attempt (spec.md §4.2, §7).
#[derive(Debug, thiserror::Error, Clone)]
pub enum CommitError {
    /// The broker reported a retriable error and the retry policy was
    /// exhausted.
    #[error("commit retries exhausted, last error: {0}")]
    RetriesExhausted(String),
    /// A non-retriable broker failure. Terminates with the last error.
    #[error("fatal commit error: {0}")]
    Fatal(String),
    /// The Runloop has already stopped and cannot accept new commits.
    #[error("the Runloop has already stopped")]
    RunloopGone,
}

impl From<KafkaError> for CommitError {
    fn from(err: KafkaError) -> Self {
        if is_retriable(&err) {
            CommitError::RetriesExhausted(err.to_string())
        } else {
            CommitError::Fatal(err.to_string())
        }
    }
}

/// True for the broker-specific error kind that participates in the commit
/// retry policy (spec.md §6): anything rdkafka itself marks as a retriable
/// RDKafka-level error code.
pub fn is_retriable(err: &KafkaError) -> bool {
    match err {
        KafkaError::MessageConsumption(code)
        | KafkaError::MessageProduction(code)
        | KafkaError::ConsumerCommit(code) => code.is_retriable(),
        _ => false,
    }
}

/// A fatal poll-time error (spec.md §7): terminates the Runloop; all
/// partition queues are closed with this error; subsequent metadata calls
/// fail.
#[derive(Debug, thiserror::Error, Clone)]
#[error("poll error: {0}")]
pub struct PollError(pub String);

impl From<KafkaError> for PollError {
    fn from(err: KafkaError) -> Self {
        PollError(err.to_string())
    }
}

/// Top-level error union used by the façade's public API.
#[derive(Debug, thiserror::Error)]
pub enum RunloopError {
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("deserialization failed for {topic_partition}: {source}")]
    Deserialize {
        topic_partition: TopicPartition,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("the Runloop has already stopped")]
    Shutdown,
}
