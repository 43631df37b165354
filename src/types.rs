use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::runloop::RunloopHandle;

/// A broker-addressable shard of a topic; the unit of ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// An immutable record as delivered by the broker.
#[derive(Debug, Clone)]
pub struct Record {
    pub topic_partition: TopicPartition,
    pub offset: i64,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, Vec<u8>>,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

/// A `Record` plus an `Offset` handle that, when committed, tells the
/// Runloop the next-to-read position for this record's topic-partition.
///
/// Invariant: `Offset::value()` is always `record.offset + 1` — commits are
/// semi-open upper bounds, matching the broker's own commit convention.
#[derive(Debug)]
pub struct CommittableRecord {
    pub record: Record,
    pub offset: Offset,
}

/// A handle that submits a single topic-partition's next-to-read offset for
/// commit. Cheap to clone-by-value once (it is consumed by `commit`), and
/// safe to drop without committing (at-least-once, not exactly-once).
#[derive(Debug, Clone)]
pub struct Offset {
    pub(crate) topic_partition: TopicPartition,
    pub(crate) value: i64,
    pub(crate) handle: RunloopHandle,
}

impl Offset {
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    /// The next-to-read offset this handle would commit — `record.offset + 1`.
    pub fn value(&self) -> i64 {
        self.value
    }

    /// Submit this single offset for commit. Equivalent to
    /// `OffsetBatch::from(self).commit(policy)`.
    pub async fn commit(
        self,
        policy: crate::retry::RetryPolicy,
    ) -> Result<(), crate::error::CommitError> {
        let mut batch = crate::offset_batch::OffsetBatch::empty();
        batch.insert(self.topic_partition.clone(), self.value);
        batch.commit(&self.handle, policy).await
    }
}
