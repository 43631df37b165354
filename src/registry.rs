use dashmap::DashMap;

use crate::partition_queue::{new_partition_queue, PartitionQueue, PartitionQueueHandle};
use crate::types::TopicPartition;

/// Maps topic-partition to the outbound record queue backing its
/// user-visible stream (spec.md §4.3). Only the Runloop task ever mutates
/// this map (single-producer invariant of spec.md §5); `DashMap` is used
/// for the same reason the wider teacher workspace reaches for it
/// elsewhere (e.g. `kafka-deduplicator`'s store maps) — cheap concurrent
/// reads from ad-hoc lookups without a global lock.
#[derive(Default)]
pub struct PartitionStreamRegistry {
    queues: DashMap<TopicPartition, PartitionQueueHandle>,
}

impl PartitionStreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue for `tp` and return the consumer-side handle.
    /// Idempotent: if a queue for `tp` already exists and hasn't been
    /// drained, this is a no-op and returns `None` (the consumer handle
    /// was already handed out by the first `create`).
    pub fn create(&self, tp: TopicPartition, capacity: usize) -> Option<PartitionQueue> {
        if self.queues.contains_key(&tp) {
            return None;
        }
        let (handle, queue) = new_partition_queue(capacity);
        self.queues.insert(tp, handle);
        Some(queue)
    }

    pub fn lookup(&self, tp: &TopicPartition) -> Option<dashmap::mapref::one::Ref<'_, TopicPartition, PartitionQueueHandle>> {
        self.queues.get(tp)
    }

    /// Transition `tp`'s queue to Drained. A no-op if `tp` is unknown.
    pub fn drain(&self, tp: &TopicPartition) {
        if let Some(handle) = self.queues.get(tp) {
            handle.drain();
        }
    }

    /// Same as `drain`, but signals abnormal termination (partitions lost).
    pub fn fail(&self, tp: &TopicPartition, err: crate::error::PollError) {
        if let Some(handle) = self.queues.get(tp) {
            handle.fail(err);
        }
    }

    pub fn drain_all(&self) {
        for entry in self.queues.iter() {
            entry.value().drain();
        }
    }

    pub fn fail_all(&self, err: crate::error::PollError) {
        for entry in self.queues.iter() {
            entry.value().fail(err.clone());
        }
    }

    /// Remove entries whose queue has fully drained and closed — called
    /// periodically by the Runloop to bound registry growth across many
    /// rebalances.
    pub fn sweep_closed(&self) {
        self.queues
            .retain(|_, handle| handle.state() != crate::partition_queue::QueueState::Closed);
    }

    pub fn topic_partitions(&self) -> Vec<TopicPartition> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_idempotent_until_drained() {
        let registry = PartitionStreamRegistry::new();
        let tp = TopicPartition::new("t", 0);

        assert!(registry.create(tp.clone(), 4).is_some());
        assert!(registry.create(tp.clone(), 4).is_none());

        registry.drain(&tp);
        registry.queues.remove(&tp);
        assert!(registry.create(tp, 4).is_some());
    }

    #[test]
    fn lookup_misses_unknown_partition() {
        let registry = PartitionStreamRegistry::new();
        assert!(registry.lookup(&TopicPartition::new("t", 0)).is_none());
    }
}
