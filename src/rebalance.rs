use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaError;
use rdkafka::{ClientContext, Statistics, TopicPartitionList};

use tokio::sync::mpsc;

use crate::diagnostics::{DiagnosticsEvent, SharedDiagnosticsSink};
use crate::error::PollError;
use crate::partition_queue::PartitionQueue;
use crate::registry::PartitionStreamRegistry;
use crate::types::TopicPartition;

/// Resolves starting offsets for newly-assigned partitions under
/// `OffsetRetrieval::Manual` (spec.md §3). The Runloop awaits this
/// resolver and seeks every returned offset before the rebalance callback
/// returns, per spec.md §4.5.
#[async_trait]
pub trait OffsetResolver: Send + Sync {
    async fn resolve(
        &self,
        topic_partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, i64>, String>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutoOffsetReset {
    Earliest,
    Latest,
    None,
}

/// spec.md §3's `OffsetRetrieval` variant.
#[derive(Clone)]
pub enum OffsetRetrieval {
    Auto { reset: AutoOffsetReset },
    Manual { resolver: Arc<dyn OffsetResolver> },
}

/// `rdkafka`'s `ClientContext`/`ConsumerContext` implementation: this is
/// the mechanism the callback-driven rebalance listener of spec.md §4.5
/// actually runs through. Confirmed against the teacher workspace's own
/// `GenericConsumerContext` + `RebalanceHandler` split
/// (`kafka-deduplicator/src/kafka/test_utils.rs`), kept here in one
/// struct rather than split into a separate handler trait since this
/// crate has exactly one kind of consumer to support.
pub struct RunloopContext {
    pub(crate) registry: Arc<PartitionStreamRegistry>,
    pub(crate) assignment: Arc<Mutex<Vec<TopicPartition>>>,
    pub(crate) diagnostics: SharedDiagnosticsSink,
    pub(crate) offset_retrieval: OffsetRetrieval,
    pub(crate) per_partition_prefetch: usize,
    pub(crate) resolver_timeout: Duration,
    /// Fans newly-created partition queues out to whichever façade call
    /// (`partitioned_stream`/`plain_stream`) owns the receiving end.
    pub(crate) new_partition_tx: mpsc::UnboundedSender<(TopicPartition, PartitionQueue)>,
}

impl ClientContext for RunloopContext {
    fn stats(&self, _stats: Statistics) {
        // Signals the client loop is alive. This crate's liveness signal
        // is the Poll diagnostics event instead (emitted by the Runloop
        // itself on every tick), so there is nothing further to do here.
    }
}

impl ConsumerContext for RunloopContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, _rebalance: &Rebalance) {
        // All work happens in post_rebalance, after the broker has
        // confirmed the new assignment.
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(tpl) => self.handle_assigned(base_consumer, tpl),
            Rebalance::Revoke(tpl) => self.handle_revoked(tpl),
            Rebalance::Error(err) => self.handle_lost(err),
        }
    }
}

impl RunloopContext {
    fn handle_assigned(&self, base_consumer: &BaseConsumer<Self>, tpl: &TopicPartitionList) {
        let mut newly_assigned = Vec::new();
        {
            let mut assignment = self.assignment.lock().unwrap();
            for elem in tpl.elements() {
                let tp = TopicPartition::new(elem.topic(), elem.partition());
                if !assignment.contains(&tp) {
                    assignment.push(tp.clone());
                    newly_assigned.push(tp);
                }
            }
        }

        for tp in &newly_assigned {
            if let Some(queue) = self.registry.create(tp.clone(), self.per_partition_prefetch) {
                let _ = self.new_partition_tx.send((tp.clone(), queue));
            }
        }

        if let OffsetRetrieval::Manual { resolver } = &self.offset_retrieval {
            if !newly_assigned.is_empty() {
                self.seek_manual(base_consumer, resolver.as_ref(), &newly_assigned);
            }
        }

        self.diagnostics.emit(DiagnosticsEvent::PartitionsAssigned {
            topic_partitions: newly_assigned,
        });
    }

    fn handle_revoked(&self, tpl: &TopicPartitionList) {
        let mut revoked = Vec::new();
        {
            let mut assignment = self.assignment.lock().unwrap();
            for elem in tpl.elements() {
                let tp = TopicPartition::new(elem.topic(), elem.partition());
                assignment.retain(|existing| existing != &tp);
                revoked.push(tp);
            }
        }

        for tp in &revoked {
            self.registry.drain(tp);
        }

        self.diagnostics.emit(DiagnosticsEvent::PartitionsRevoked {
            topic_partitions: revoked,
        });
    }

    /// `rdkafka-rs` does not distinguish `onPartitionsLost` from
    /// `onPartitionsRevoked` the way the Java client does (no cooperative
    /// sticky "lost" hint is surfaced through `Rebalance`); a rebalance
    /// error is the closest analogue of an abnormal loss, so it is
    /// treated as a Lost event against whatever this context believes it
    /// currently owns.
    fn handle_lost(&self, err: &KafkaError) {
        tracing::warn!(%err, "rebalance error, treating current assignment as lost");
        let lost: Vec<TopicPartition> = self.assignment.lock().unwrap().clone();
        for tp in &lost {
            self.registry
                .fail(tp, PollError("partitions lost during rebalance".to_string()));
        }
        self.assignment.lock().unwrap().clear();

        self.diagnostics.emit(DiagnosticsEvent::PartitionsLost {
            topic_partitions: lost,
        });
    }

    /// Runs the (async, application-supplied) resolver to completion from
    /// inside the synchronous rebalance callback, bounded by
    /// `resolver_timeout`. This is the one intentional exception to "the
    /// listener must never block" (spec.md §4.5): the resolver is
    /// expected to be fast, and a timeout bounds the damage if it isn't.
    fn seek_manual(
        &self,
        base_consumer: &BaseConsumer<Self>,
        resolver: &dyn OffsetResolver,
        tps: &[TopicPartition],
    ) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::error!("no tokio runtime available to run the manual offset resolver");
                return;
            }
        };

        let resolved = handle.block_on(async {
            tokio::time::timeout(self.resolver_timeout, resolver.resolve(tps)).await
        });

        let offsets = match resolved {
            Ok(Ok(offsets)) => offsets,
            Ok(Err(reason)) => {
                tracing::error!(%reason, "manual offset resolver failed");
                return;
            }
            Err(_) => {
                tracing::error!("manual offset resolver timed out");
                return;
            }
        };

        for tp in tps {
            let Some(offset) = offsets.get(tp) else {
                continue;
            };
            if let Err(err) = base_consumer.seek(
                &tp.topic,
                tp.partition,
                rdkafka::Offset::Offset(*offset),
                Duration::from_secs(5),
            ) {
                tracing::error!(%tp, %err, "failed to seek to manually-resolved offset");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::producer::DefaultProducerContext;

    fn test_context() -> (mpsc::UnboundedReceiver<(TopicPartition, PartitionQueue)>, RunloopContext) {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = RunloopContext {
            registry: Arc::new(PartitionStreamRegistry::new()),
            assignment: Arc::new(Mutex::new(Vec::new())),
            diagnostics: crate::diagnostics::default_sink(),
            offset_retrieval: OffsetRetrieval::Auto {
                reset: AutoOffsetReset::Earliest,
            },
            per_partition_prefetch: 16,
            resolver_timeout: Duration::from_secs(5),
            new_partition_tx: tx,
        };
        (rx, context)
    }

    /// Exercises the rebalance listener directly against a single-broker
    /// mock, standing in for the two-real-consumer-groups setup a genuine
    /// rebalance would need.
    fn mock_client(
        context: RunloopContext,
    ) -> (
        rdkafka::mocking::MockCluster<'static, DefaultProducerContext>,
        BaseConsumer<RunloopContext>,
    ) {
        let cluster = rdkafka::mocking::MockCluster::new(1).expect("failed to create mock brokers");
        let client = rdkafka::ClientConfig::new()
            .set("bootstrap.servers", cluster.bootstrap_servers())
            .set("group.id", "rebalance-unit-test")
            .create_with_context(context)
            .expect("failed to create mock client");
        (cluster, client)
    }

    #[test]
    fn handle_assigned_registers_queue_and_notifies() {
        let (mut rx, context) = test_context();
        let registry = context.registry.clone();
        let assignment = context.assignment.clone();
        let (_cluster, client) = mock_client(context);

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("orders", 0);

        client.context().handle_assigned(&client, &tpl);

        let tp = TopicPartition::new("orders", 0);
        assert_eq!(assignment.lock().unwrap().as_slice(), &[tp.clone()]);
        assert!(registry.lookup(&tp).is_some());
        let (notified_tp, _queue) = rx.try_recv().expect("new partition notified");
        assert_eq!(notified_tp, tp);
    }

    #[test]
    fn handle_assigned_is_idempotent_for_already_owned_partitions() {
        let (mut rx, context) = test_context();
        let (_cluster, client) = mock_client(context);

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("orders", 0);

        client.context().handle_assigned(&client, &tpl);
        let _ = rx.try_recv().unwrap();

        client.context().handle_assigned(&client, &tpl);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn handle_revoked_drains_the_partition_and_drops_assignment() {
        let (_rx, context) = test_context();
        let registry = context.registry.clone();
        let assignment = context.assignment.clone();
        let (_cluster, client) = mock_client(context);

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("orders", 0);
        client.context().handle_assigned(&client, &tpl);

        client.context().handle_revoked(&tpl);

        assert!(assignment.lock().unwrap().is_empty());
        let tp = TopicPartition::new("orders", 0);
        let handle = registry.lookup(&tp).expect("queue entry still present after drain");
        assert_eq!(handle.state(), crate::partition_queue::QueueState::Drained);
    }
}
