use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::PollError;
use crate::types::CommittableRecord;

/// One poll's worth of records for a single topic-partition. Chunk
/// boundaries are preserved end-to-end (spec.md §4.3) so a consumer can
/// apply backpressure at the chunk granularity it was produced at.
pub type Chunk = Vec<CommittableRecord>;

/// The tagged terminal marker of spec.md §9's design note: using a variant
/// instead of closing the underlying channel lets a drain observe
/// order-preserving termination (a plain channel close can't distinguish
/// "drained cleanly" from "lost").
#[derive(Debug)]
pub enum PartitionItem {
    Chunk(Chunk),
    /// Producer-side closed cleanly (revocation, or graceful shutdown).
    End,
    /// Producer-side closed abnormally (partitions lost, or a fatal poll
    /// error that aborted the whole Runloop).
    Error(PollError),
}

/// Lifecycle state of a [`PartitionQueue`] (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Accepting new chunks.
    Open,
    /// Producer-side closed; consumer may still drain what's buffered.
    Drained,
    /// Drained and fully consumed; no more items will ever be produced.
    Closed,
}

/// Producer-side handle into a partition's queue, held by the Runloop.
pub struct PartitionQueueHandle {
    sender: mpsc::Sender<PartitionItem>,
    state: Arc<AtomicUsize>,
    backlog: Arc<AtomicUsize>,
}

const OPEN: usize = 0;
const DRAINED: usize = 1;
const CLOSED: usize = 2;

impl PartitionQueueHandle {
    pub fn state(&self) -> QueueState {
        match self.state.load(Ordering::Acquire) {
            OPEN => QueueState::Open,
            DRAINED => QueueState::Drained,
            _ => QueueState::Closed,
        }
    }

    /// Current number of chunks buffered but not yet consumed — the
    /// backlog the Runloop inspects to decide whether to pause this
    /// partition (spec.md §4.4 step 1).
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }

    /// Push one poll's records for this partition. A no-op once Drained.
    pub fn push(&self, chunk: Chunk) -> Result<(), Chunk> {
        if self.state() != QueueState::Open {
            return Err(chunk);
        }
        self.backlog.fetch_add(1, Ordering::AcqRel);
        match self.sender.try_send(PartitionItem::Chunk(chunk)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(item)) => {
                self.backlog.fetch_sub(1, Ordering::AcqRel);
                match item {
                    PartitionItem::Chunk(chunk) => Err(chunk),
                    _ => unreachable!(),
                }
            }
            Err(mpsc::error::TrySendError::Closed(item)) => {
                self.backlog.fetch_sub(1, Ordering::AcqRel);
                self.state.store(CLOSED, Ordering::Release);
                match item {
                    PartitionItem::Chunk(chunk) => Err(chunk),
                    _ => unreachable!(),
                }
            }
        }
    }

    /// Transition Open -> Drained and push the terminal marker. Idempotent.
    pub fn drain(&self) {
        if self
            .state
            .compare_exchange(OPEN, DRAINED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.sender.try_send(PartitionItem::End);
        }
    }

    /// Same as `drain`, but the terminal marker carries an error — used
    /// for `onPartitionsLost` and for a fatal poll error tearing down
    /// every queue at once (spec.md §4.5, §7).
    pub fn fail(&self, err: PollError) {
        self.state.store(DRAINED, Ordering::Release);
        let _ = self.sender.try_send(PartitionItem::Error(err));
    }
}

/// Consumer-side handle: an async `Stream` of [`Chunk`]s backing one
/// user-visible per-partition stream.
pub struct PartitionQueue {
    inner: ReceiverStream<PartitionItem>,
    state: Arc<AtomicUsize>,
    backlog: Arc<AtomicUsize>,
}

impl PartitionQueue {
    /// Pull the next chunk, or `None` once the queue is fully Closed.
    /// Returns `Some(Err(..))` exactly once if the terminal marker carried
    /// an error.
    pub async fn next_chunk(&mut self) -> Option<Result<Chunk, PollError>> {
        use tokio_stream::StreamExt;
        loop {
            match self.inner.next().await {
                Some(PartitionItem::Chunk(chunk)) => {
                    self.backlog.fetch_sub(1, Ordering::AcqRel);
                    return Some(Ok(chunk));
                }
                Some(PartitionItem::End) => {
                    self.state.store(CLOSED, Ordering::Release);
                    continue;
                }
                Some(PartitionItem::Error(err)) => {
                    self.state.store(CLOSED, Ordering::Release);
                    return Some(Err(err));
                }
                None => {
                    self.state.store(CLOSED, Ordering::Release);
                    return None;
                }
            }
        }
    }

    pub fn state(&self) -> QueueState {
        match self.state.load(Ordering::Acquire) {
            OPEN => QueueState::Open,
            DRAINED => QueueState::Drained,
            _ => QueueState::Closed,
        }
    }
}

/// Construct a new bounded partition queue. `capacity` bounds the number of
/// *chunks* in flight, not records — chunk-level backpressure per
/// spec.md §4.3.
pub fn new_partition_queue(capacity: usize) -> (PartitionQueueHandle, PartitionQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let state = Arc::new(AtomicUsize::new(OPEN));
    let backlog = Arc::new(AtomicUsize::new(0));

    let handle = PartitionQueueHandle {
        sender: tx,
        state: state.clone(),
        backlog: backlog.clone(),
    };
    let queue = PartitionQueue {
        inner: ReceiverStream::new(rx),
        state,
        backlog,
    };
    (handle, queue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommittableRecord, Offset, Record, TopicPartition};

    fn dummy_record(offset: i64) -> CommittableRecord {
        let tp = TopicPartition::new("t", 0);
        CommittableRecord {
            record: Record {
                topic_partition: tp.clone(),
                offset,
                timestamp: None,
                headers: Default::default(),
                key: None,
                value: None,
            },
            offset: Offset {
                topic_partition: tp,
                value: offset + 1,
                handle: crate::runloop::RunloopHandle::detached(),
            },
        }
    }

    #[tokio::test]
    async fn chunks_are_delivered_in_order() {
        let (handle, mut queue) = new_partition_queue(4);
        handle.push(vec![dummy_record(0), dummy_record(1)]).unwrap();
        handle.push(vec![dummy_record(2)]).unwrap();
        handle.drain();

        let first = queue.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].record.offset, 0);

        let second = queue.next_chunk().await.unwrap().unwrap();
        assert_eq!(second[0].record.offset, 2);

        assert!(queue.next_chunk().await.is_none());
        assert_eq!(queue.state(), QueueState::Closed);
    }

    #[test]
    fn push_after_drain_is_rejected() {
        let (handle, _queue) = new_partition_queue(4);
        handle.drain();
        assert!(handle.push(vec![dummy_record(0)]).is_err());
    }

    #[test]
    fn drain_is_idempotent() {
        let (handle, _queue) = new_partition_queue(4);
        handle.drain();
        handle.drain();
        assert_eq!(handle.state(), QueueState::Drained);
    }

    #[tokio::test]
    async fn fail_surfaces_error_then_closes() {
        let (handle, mut queue) = new_partition_queue(4);
        handle.fail(PollError("boom".to_string()));

        let result = queue.next_chunk().await.unwrap();
        assert!(result.is_err());
        assert!(queue.next_chunk().await.is_none());
    }
}
