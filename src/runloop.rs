use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::{Message, Offset as RdOffset, TopicPartitionList};
use tokio::sync::{mpsc, oneshot};

use crate::client_gate::ClientGate;
use crate::config::KafkaConsumerConfig;
use crate::diagnostics::{DiagnosticsEvent, SharedDiagnosticsSink};
use crate::error::{is_retriable, CommitError, PollError};
use crate::offset_batch::OffsetBatch;
use crate::rebalance::RunloopContext;
use crate::registry::PartitionStreamRegistry;
use crate::types::{CommittableRecord, Offset, Record, TopicPartition};

/// `Initializing → Running → StoppingGracefully → Stopped` (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunloopPhase {
    Initializing,
    Running,
    StoppingGracefully,
    Stopped,
}

/// Messages multiplexed into the Runloop over its single command channel
/// (spec.md §5's "command channel, single consumer = Runloop").
pub(crate) enum RunloopCommand {
    Commit(OffsetBatch, oneshot::Sender<Result<(), CommitError>>),
    Stop { graceful: bool },
}

/// Cloneable handle the façade and every `Offset`/`OffsetBatch` use to
/// submit work to the Runloop. Submitting is a bounded-channel send, so
/// holding a handle never requires touching the broker client directly.
#[derive(Clone)]
pub struct RunloopHandle {
    commands: Option<mpsc::Sender<RunloopCommand>>,
}

impl RunloopHandle {
    pub(crate) fn new(commands: mpsc::Sender<RunloopCommand>) -> Self {
        Self {
            commands: Some(commands),
        }
    }

    /// A handle with nothing on the other end — used by tests that need
    /// an `Offset` but will never commit it.
    pub fn detached() -> Self {
        Self { commands: None }
    }

    pub async fn submit_commit(&self, batch: OffsetBatch) -> Result<(), CommitError> {
        let commands = self.commands.as_ref().ok_or(CommitError::RunloopGone)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(RunloopCommand::Commit(batch, reply_tx))
            .await
            .map_err(|_| CommitError::RunloopGone)?;
        reply_rx.await.map_err(|_| CommitError::RunloopGone)?
    }

    /// Request shutdown. Never fails — a Runloop that's already gone has
    /// nothing left to stop.
    pub fn stop(&self, graceful: bool) {
        if let Some(commands) = &self.commands {
            let _ = commands.try_send(RunloopCommand::Stop { graceful });
        }
    }
}

/// spec.md §3's `RunloopState`, plus the `phase` field driving the state
/// machine of spec.md §4.4.
pub struct RunloopState {
    pub phase: RunloopPhase,
    pub paused_partitions: HashSet<TopicPartition>,
    pub shutdown_requested: bool,
    pub shutdown_graceful: bool,
}

impl Default for RunloopState {
    fn default() -> Self {
        Self {
            phase: RunloopPhase::Initializing,
            paused_partitions: HashSet::new(),
            shutdown_requested: false,
            shutdown_graceful: true,
        }
    }
}

/// The single-owner coordinator of spec.md §2/§4.4: multiplexes the
/// broker poll, commit submissions, and rebalance notifications over one
/// shared, non-reentrant client.
pub struct Runloop {
    gate: Arc<ClientGate>,
    registry: Arc<PartitionStreamRegistry>,
    assignment: Arc<Mutex<Vec<TopicPartition>>>,
    diagnostics: SharedDiagnosticsSink,
    config: KafkaConsumerConfig,
    commands_rx: mpsc::Receiver<RunloopCommand>,
    state: RunloopState,
    self_handle: RunloopHandle,
}

impl Runloop {
    pub(crate) fn new(
        client: BaseConsumer<RunloopContext>,
        registry: Arc<PartitionStreamRegistry>,
        assignment: Arc<Mutex<Vec<TopicPartition>>>,
        diagnostics: SharedDiagnosticsSink,
        config: KafkaConsumerConfig,
        commands_rx: mpsc::Receiver<RunloopCommand>,
        self_handle: RunloopHandle,
    ) -> Self {
        Self {
            gate: Arc::new(ClientGate::new(client)),
            registry,
            assignment,
            diagnostics,
            config,
            commands_rx,
            state: RunloopState::default(),
            self_handle,
        }
    }

    pub(crate) fn gate(&self) -> Arc<ClientGate> {
        self.gate.clone()
    }

    /// Drives the Runloop until a fatal error or a completed shutdown.
    /// Meant to be spawned as the one long-lived task owning the broker
    /// client for the consumer's lifetime (spec.md §4.4).
    pub async fn run(mut self) {
        self.state.phase = RunloopPhase::Running;
        let mut graceful_deadline: Option<Instant> = None;

        loop {
            let mut pending_commits: Vec<(OffsetBatch, oneshot::Sender<Result<(), CommitError>>)> =
                Vec::new();

            self.drain_commands(&mut pending_commits);

            if self.state.shutdown_requested && !self.state.shutdown_graceful {
                // Hard cancellation (spec.md §5): close every partition
                // queue with a terminal error rather than a clean End, so
                // a consumer mid-read can tell this wasn't a graceful stop.
                self.registry
                    .fail_all(PollError("consumer shut down".to_string()));
                self.fail_pending(pending_commits, CommitError::RunloopGone);
                self.state.phase = RunloopPhase::Stopped;
                break;
            }

            if self.state.shutdown_requested && self.state.phase != RunloopPhase::StoppingGracefully {
                // Entering graceful shutdown: stop admitting new records and
                // let every partition's queue drain to whatever is still
                // reading it (spec.md §4.4 step 5).
                self.state.phase = RunloopPhase::StoppingGracefully;
                self.registry.drain_all();
                graceful_deadline = Some(
                    Instant::now()
                        + Duration::from_millis(self.config.kafka_shutdown_deadline_ms as u64),
                );
            }

            self.apply_pause_resume().await;

            if self.state.phase != RunloopPhase::StoppingGracefully {
                match self.poll_once().await {
                    Ok((record_count, grouped)) => {
                        self.diagnostics.emit(DiagnosticsEvent::Poll { record_count });
                        self.dispatch(grouped);
                    }
                    Err(err) => {
                        self.registry.fail_all(err.clone());
                        self.fail_pending(pending_commits, CommitError::Fatal(err.0));
                        self.state.phase = RunloopPhase::Stopped;
                        break;
                    }
                }
            }

            self.commit_batch(pending_commits).await;

            if self.state.phase == RunloopPhase::StoppingGracefully {
                self.registry.sweep_closed();
                let all_drained = self.registry.topic_partitions().is_empty();
                let deadline_elapsed = graceful_deadline
                    .map(|deadline| Instant::now() >= deadline)
                    .unwrap_or(false);

                if all_drained || deadline_elapsed {
                    if deadline_elapsed && !all_drained {
                        tracing::warn!(
                            "graceful shutdown deadline elapsed with partitions still draining, forcing exit"
                        );
                        self.registry.fail_all(PollError(
                            "graceful shutdown deadline exceeded".to_string(),
                        ));
                    }
                    self.state.phase = RunloopPhase::Stopped;
                    break;
                }
            }

            if self.config.kafka_poll_interval_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.kafka_poll_interval_ms as u64))
                    .await;
            }
        }

        self.teardown_client().await;
        tracing::info!("Runloop stopped");
    }

    /// Releases the broker client (spec.md §5): attempts an `unsubscribe`
    /// so the group knows this member left, bounded by
    /// `kafka_close_timeout_ms` so a broker that never acks the group-leave
    /// can't hang teardown forever. The client itself is closed by
    /// `BaseConsumer`'s own `Drop` once this task's `gate` is dropped.
    async fn teardown_client(&self) {
        let gate = self.gate.clone();
        let deadline = Duration::from_millis(self.config.kafka_close_timeout_ms as u64);
        if tokio::time::timeout(deadline, gate.run(|client| client.unsubscribe()))
            .await
            .is_err()
        {
            tracing::warn!(
                "unsubscribe did not complete within kafka_close_timeout_ms, dropping client anyway"
            );
        }
    }

    /// Pull every currently-queued command off the channel without
    /// blocking. `NewPartition`/`Stop` are handled immediately;
    /// `Commit` requests are accumulated for this tick's merged commit
    /// (spec.md §4.4 step 4, "Commit batching" design note).
    fn drain_commands(
        &mut self,
        pending_commits: &mut Vec<(OffsetBatch, oneshot::Sender<Result<(), CommitError>>)>,
    ) {
        loop {
            match self.commands_rx.try_recv() {
                Ok(RunloopCommand::Commit(batch, reply)) => pending_commits.push((batch, reply)),
                Ok(RunloopCommand::Stop { graceful }) => {
                    self.state.shutdown_requested = true;
                    self.state.shutdown_graceful = graceful;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.state.shutdown_requested = true;
                    self.state.shutdown_graceful = false;
                    break;
                }
            }
        }
    }

    /// spec.md §4.4 step 1: pause a partition once its queue backlog
    /// reaches the prefetch high-water mark, resume it once it drops back
    /// down. Only the delta against the broker's current pause set is
    /// issued.
    async fn apply_pause_resume(&mut self) {
        let high_water = self.config.kafka_per_partition_prefetch;
        let owned = self.assignment.lock().unwrap().clone();

        let mut to_pause = Vec::new();
        let mut to_resume = Vec::new();

        for tp in &owned {
            let backlog = self
                .registry
                .lookup(tp)
                .map(|handle| handle.backlog())
                .unwrap_or(0);
            let should_pause = backlog >= high_water;
            let currently_paused = self.state.paused_partitions.contains(tp);

            if should_pause && !currently_paused {
                to_pause.push(tp.clone());
            } else if !should_pause && currently_paused {
                to_resume.push(tp.clone());
            }
        }

        if !to_pause.is_empty() {
            for tp in &to_pause {
                self.state.paused_partitions.insert(tp.clone());
            }
            self.set_pause_state(to_pause, true).await;
        }
        if !to_resume.is_empty() {
            for tp in &to_resume {
                self.state.paused_partitions.remove(tp);
            }
            self.set_pause_state(to_resume, false).await;
        }
    }

    async fn set_pause_state(&self, tps: Vec<TopicPartition>, pause: bool) {
        let gate = self.gate.clone();
        gate.run(move |client| {
            let mut tpl = TopicPartitionList::new();
            for tp in &tps {
                tpl.add_partition(&tp.topic, tp.partition);
            }
            let result = if pause { client.pause(&tpl) } else { client.resume(&tpl) };
            if let Err(err) = result {
                tracing::error!(%err, pause, "failed to update partition pause state");
            }
        })
        .await;
    }

    /// spec.md §4.4 step 2: poll once, bounded by `kafka_poll_timeout_ms`,
    /// grouping the records yielded into per-topic-partition chunks
    /// (spec.md §4.3's "one poll's records for one tp is one chunk").
    /// `librdkafka`'s `poll` is a blocking call from the Runloop's
    /// perspective (spec.md §5), so the whole batched drain runs on a
    /// blocking-pool thread via `ClientGate::run`.
    async fn poll_once(&self) -> Result<(usize, HashMap<TopicPartition, Vec<Record>>), PollError> {
        let timeout = Duration::from_millis(self.config.kafka_poll_timeout_ms as u64);
        self.gate
            .run(move |client| drain_available(client, timeout))
            .await
    }

    /// spec.md §4.4 step 3: for each topic-partition in the poll result,
    /// look up its queue and push one chunk; drop records for partitions
    /// with no registered queue (a brief, expected window around
    /// revocation), emitting the diagnostics event spec.md §9 asks for.
    fn dispatch(&self, grouped: HashMap<TopicPartition, Vec<Record>>) {
        for (tp, records) in grouped {
            let Some(handle) = self.registry.lookup(&tp) else {
                self.diagnostics.emit(DiagnosticsEvent::PartitionRecordsDropped {
                    topic_partition: tp,
                    record_count: records.len(),
                });
                continue;
            };

            let chunk: Vec<CommittableRecord> = records
                .into_iter()
                .map(|record| {
                    let offset = Offset {
                        topic_partition: record.topic_partition.clone(),
                        value: record.offset + 1,
                        handle: self.handle_for_offsets(),
                    };
                    CommittableRecord { record, offset }
                })
                .collect();

            if let Err(_dropped) = handle.push(chunk) {
                tracing::warn!(%tp, "partition queue closed, dropping chunk");
            }
        }
    }

    /// Set by `Consumer::subscribe` after construction; stored so
    /// `dispatch` can stamp every `Offset` it mints with a working commit
    /// handle. A plain field rather than a constructor argument because
    /// the handle and the Runloop are constructed together and the
    /// channel's sender side is what the handle wraps.
    fn handle_for_offsets(&self) -> RunloopHandle {
        self.self_handle.clone()
    }

    /// spec.md §4.4 step 4: merge every pending commit into one effective
    /// batch and submit a single commit per tick.
    async fn commit_batch(
        &self,
        pending: Vec<(OffsetBatch, oneshot::Sender<Result<(), CommitError>>)>,
    ) {
        if pending.is_empty() {
            return;
        }

        let merged = pending
            .iter()
            .map(|(batch, _)| batch)
            .fold(OffsetBatch::empty(), |acc, batch| acc.merged_with(batch));

        self.diagnostics.emit(DiagnosticsEvent::Commit {
            batch: merged.clone(),
        });

        let gate = self.gate.clone();
        let offsets = merged.into_inner();
        let result = gate
            .run(move |client| {
                let mut tpl = TopicPartitionList::new();
                for (tp, offset) in &offsets {
                    tpl.add_partition_offset(&tp.topic, tp.partition, RdOffset::Offset(*offset))?;
                }
                client.commit(&tpl, CommitMode::Sync)
            })
            .await;

        match result {
            Ok(()) => {
                for (_, reply) in pending {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(err) => {
                let retriable = is_retriable(&err);
                for (_, reply) in pending {
                    let commit_err = if retriable {
                        CommitError::RetriesExhausted(err.to_string())
                    } else {
                        CommitError::Fatal(err.to_string())
                    };
                    let _ = reply.send(Err(commit_err));
                }
            }
        }
    }

    fn fail_pending(
        &self,
        pending: Vec<(OffsetBatch, oneshot::Sender<Result<(), CommitError>>)>,
        err: CommitError,
    ) {
        for (_, reply) in pending {
            let _ = reply.send(Err(err.clone()));
        }
    }
}

/// Drains every message `librdkafka` can hand back within `timeout`,
/// grouping by topic-partition. Rebalance callbacks (if the broker has
/// one pending) fire synchronously inside `client.poll` per spec.md §4.5.
fn drain_available(
    client: &BaseConsumer<RunloopContext>,
    timeout: Duration,
) -> Result<(usize, HashMap<TopicPartition, Vec<Record>>), PollError> {
    let deadline = Instant::now() + timeout;
    let mut grouped: HashMap<TopicPartition, Vec<Record>> = HashMap::new();
    let mut count = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        match client.poll(remaining) {
            Some(Ok(msg)) => {
                let tp = TopicPartition::new(msg.topic(), msg.partition());
                let headers = msg
                    .headers()
                    .map(|hs| {
                        hs.iter()
                            .filter_map(|h| {
                                h.value.map(|v| (h.key.to_string(), v.to_vec()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                grouped.entry(tp.clone()).or_default().push(Record {
                    topic_partition: tp,
                    offset: msg.offset(),
                    timestamp: msg.timestamp().to_millis(),
                    headers,
                    key: msg.key().map(|k| k.to_vec()),
                    value: msg.payload().map(|v| v.to_vec()),
                });
                count += 1;
            }
            Some(Err(err)) => return Err(err.into()),
            None => break,
        }
    }

    Ok((count, grouped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{default_sink, DiagnosticsSink};
    use crate::rebalance::{AutoOffsetReset, OffsetRetrieval};
    use rdkafka::producer::DefaultProducerContext;
    use std::sync::Mutex as StdMutex;

    fn test_runloop(
        per_partition_prefetch: usize,
    ) -> (rdkafka::mocking::MockCluster<'static, DefaultProducerContext>, Runloop) {
        let cluster = rdkafka::mocking::MockCluster::new(1).expect("failed to create mock brokers");
        let registry = Arc::new(PartitionStreamRegistry::new());
        let assignment = Arc::new(Mutex::new(Vec::new()));
        let (new_partition_tx, _new_partition_rx) = mpsc::unbounded_channel();

        let context = RunloopContext {
            registry: registry.clone(),
            assignment: assignment.clone(),
            diagnostics: default_sink(),
            offset_retrieval: OffsetRetrieval::Auto {
                reset: AutoOffsetReset::Earliest,
            },
            per_partition_prefetch,
            resolver_timeout: Duration::from_secs(5),
            new_partition_tx,
        };

        let client: BaseConsumer<RunloopContext> = rdkafka::ClientConfig::new()
            .set("bootstrap.servers", cluster.bootstrap_servers())
            .set("group.id", "runloop-unit-test")
            .create_with_context(context)
            .expect("failed to create mock client");

        let mut config = KafkaConsumerConfig::for_test("runloop-unit-test");
        config.kafka_per_partition_prefetch = per_partition_prefetch;
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let handle = RunloopHandle::new(commands_tx);
        let runloop = Runloop::new(
            client,
            registry,
            assignment,
            default_sink(),
            config,
            commands_rx,
            handle,
        );
        (cluster, runloop)
    }

    /// spec.md §8's backpressure scenario: a partition whose queue backlog
    /// reaches the prefetch high-water mark gets paused, and resumed once
    /// the backlog drops.
    #[tokio::test]
    async fn apply_pause_resume_tracks_backlog_high_water_mark() {
        let (_cluster, mut runloop) = test_runloop(2);
        let tp = TopicPartition::new("orders", 0);
        let mut consumer_side = runloop
            .registry
            .create(tp.clone(), 4)
            .expect("queue created");
        runloop.assignment.lock().unwrap().push(tp.clone());

        {
            let producer_side = runloop.registry.lookup(&tp).expect("queue registered");
            producer_side.push(vec![]).expect("push 1");
            producer_side.push(vec![]).expect("push 2");
        }

        runloop.apply_pause_resume().await;
        assert!(runloop.state.paused_partitions.contains(&tp));

        // Consuming both chunks drops the backlog back to zero.
        consumer_side.next_chunk().await.unwrap().unwrap();
        consumer_side.next_chunk().await.unwrap().unwrap();

        runloop.apply_pause_resume().await;
        assert!(!runloop.state.paused_partitions.contains(&tp));
    }

    /// spec.md §4.4 step 3 / §9: records for a topic-partition with no
    /// registered queue are dropped, and a diagnostics event is emitted.
    #[test]
    fn dispatch_drops_records_for_unregistered_partition_and_emits_diagnostic() {
        struct RecordingSink(StdMutex<Vec<DiagnosticsEvent>>);
        impl DiagnosticsSink for RecordingSink {
            fn emit(&self, event: DiagnosticsEvent) {
                self.0.lock().unwrap().push(event);
            }
        }

        let (_cluster, mut runloop) = test_runloop(16);
        let sink = Arc::new(RecordingSink(StdMutex::new(Vec::new())));
        runloop.diagnostics = sink.clone();

        let tp = TopicPartition::new("orphaned", 0);
        let mut grouped = HashMap::new();
        grouped.insert(
            tp.clone(),
            vec![Record {
                topic_partition: tp.clone(),
                offset: 0,
                timestamp: None,
                headers: Default::default(),
                key: None,
                value: None,
            }],
        );

        runloop.dispatch(grouped);

        let events = sink.0.lock().unwrap();
        assert!(events.iter().any(|event| matches!(
            event,
            DiagnosticsEvent::PartitionRecordsDropped { topic_partition, record_count }
                if *topic_partition == tp && *record_count == 1
        )));
    }

    /// spec.md §8's graceful-shutdown scenario: once a `Stop { graceful:
    /// true }` command lands, registered partitions are drained rather than
    /// torn down, and the Runloop only reaches `Stopped` once every queue
    /// has actually been read to completion.
    #[tokio::test]
    async fn graceful_shutdown_waits_for_registered_partitions_to_drain() {
        let (_cluster, runloop) = test_runloop(16);
        let tp = TopicPartition::new("orders", 0);
        let mut consumer_side = runloop
            .registry
            .create(tp.clone(), 4)
            .expect("queue created");
        runloop.assignment.lock().unwrap().push(tp);

        let handle = runloop.self_handle.clone();
        let drain_task = tokio::spawn(async move { while consumer_side.next_chunk().await.is_some() {} });
        let run_task = tokio::spawn(runloop.run());

        handle.stop(true);

        tokio::time::timeout(Duration::from_secs(5), run_task)
            .await
            .expect("runloop did not shut down within timeout")
            .expect("runloop task panicked");
        tokio::time::timeout(Duration::from_secs(5), drain_task)
            .await
            .expect("consumer side never observed the drain")
            .expect("consumer task panicked");
    }
}
