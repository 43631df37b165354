use std::sync::Arc;

use crate::offset_batch::OffsetBatch;
use crate::types::TopicPartition;

/// Events the Runloop emits on every state transition (spec.md §6).
#[derive(Debug, Clone)]
pub enum DiagnosticsEvent {
    Poll { record_count: usize },
    Commit { batch: OffsetBatch },
    PartitionsAssigned { topic_partitions: Vec<TopicPartition> },
    PartitionsRevoked { topic_partitions: Vec<TopicPartition> },
    PartitionsLost { topic_partitions: Vec<TopicPartition> },
    /// Records observed for a topic-partition with no registered queue,
    /// dropped per spec.md §9's explicit "preserve this, but emit a
    /// diagnostics event" instruction.
    PartitionRecordsDropped {
        topic_partition: TopicPartition,
        record_count: usize,
    },
}

/// A fire-and-forget event sink (spec.md §2.6, §6). Delivery failures must
/// not affect the Runloop, so `emit` takes `&self` and returns nothing —
/// implementations that need to hand events off to another task should do
/// so with a non-blocking send (e.g. `try_send`) and drop events rather
/// than block the caller.
pub trait DiagnosticsSink: Send + Sync {
    fn emit(&self, event: DiagnosticsEvent);
}

/// Default sink: logs every event via `tracing`, the same granularity the
/// teacher's `kafka_producer.rs` uses for its own lifecycle logging.
#[derive(Debug, Default)]
pub struct TracingDiagnosticsSink;

impl DiagnosticsSink for TracingDiagnosticsSink {
    fn emit(&self, event: DiagnosticsEvent) {
        match event {
            DiagnosticsEvent::Poll { record_count } => {
                tracing::debug!(record_count, "poll");
            }
            DiagnosticsEvent::Commit { batch } => {
                tracing::debug!(partitions = batch.len(), "commit");
            }
            DiagnosticsEvent::PartitionsAssigned { topic_partitions } => {
                tracing::info!(?topic_partitions, "partitions assigned");
            }
            DiagnosticsEvent::PartitionsRevoked { topic_partitions } => {
                tracing::info!(?topic_partitions, "partitions revoked");
            }
            DiagnosticsEvent::PartitionsLost { topic_partitions } => {
                tracing::warn!(?topic_partitions, "partitions lost");
            }
            DiagnosticsEvent::PartitionRecordsDropped {
                topic_partition,
                record_count,
            } => {
                tracing::warn!(
                    %topic_partition,
                    record_count,
                    "dropped records for a partition with no registered queue"
                );
            }
        }
    }
}

pub type SharedDiagnosticsSink = Arc<dyn DiagnosticsSink>;

pub fn default_sink() -> SharedDiagnosticsSink {
    Arc::new(TracingDiagnosticsSink)
}
