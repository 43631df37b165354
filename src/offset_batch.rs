use std::collections::BTreeMap;

use crate::error::CommitError;
use crate::retry::RetryPolicy;
use crate::runloop::RunloopHandle;
use crate::types::TopicPartition;

/// A commutative, associative merge of per-partition offsets — the
/// identity of the commit stream (spec.md §4.2).
///
/// Invariants (spec.md §4.2, tested below):
/// - `merge(a, empty) == a`
/// - `merge(a, b) == merge(b, a)`
/// - `merge(a, merge(b, c)) == merge(merge(a, b), c)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetBatch {
    offsets: BTreeMap<TopicPartition, i64>,
}

impl OffsetBatch {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TopicPartition, &i64)> {
        self.offsets.iter()
    }

    pub fn into_inner(self) -> BTreeMap<TopicPartition, i64> {
        self.offsets
    }

    /// Record `offset` for `tp`, keeping the larger value if one is
    /// already present. This is the single-entry form of `merge`.
    pub fn insert(&mut self, tp: TopicPartition, offset: i64) {
        self.offsets
            .entry(tp)
            .and_modify(|existing| *existing = (*existing).max(offset))
            .or_insert(offset);
    }

    /// Pointwise max over every topic-partition present in either batch.
    /// O(|a| + |b|).
    pub fn merge(a: &OffsetBatch, b: &OffsetBatch) -> OffsetBatch {
        let mut out = a.clone();
        for (tp, offset) in b.iter() {
            out.insert(tp.clone(), *offset);
        }
        out
    }

    pub fn merged_with(mut self, other: &OffsetBatch) -> OffsetBatch {
        for (tp, offset) in other.iter() {
            self.insert(tp.clone(), *offset);
        }
        self
    }

    /// Submit this batch to the Runloop and await completion, retrying
    /// retriable failures per `policy` (spec.md §4.2).
    pub async fn commit(
        &self,
        runloop: &RunloopHandle,
        policy: RetryPolicy,
    ) -> Result<(), CommitError> {
        if self.is_empty() {
            return Ok(());
        }

        let mut attempt = 0u32;
        loop {
            match runloop.submit_commit(self.clone()).await {
                Ok(()) => return Ok(()),
                Err(CommitError::RetriesExhausted(reason)) if attempt < policy.max_retries => {
                    tracing::warn!(attempt, %reason, "retriable commit failure, retrying");
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

impl From<crate::types::Offset> for OffsetBatch {
    fn from(offset: crate::types::Offset) -> Self {
        let mut batch = OffsetBatch::empty();
        batch.insert(offset.topic_partition, offset.value);
        batch
    }
}
