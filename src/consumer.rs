use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, Consumer as _};
use rdkafka::{ClientConfig, Offset as RdOffset, TopicPartitionList};
use regex::Regex;
use tokio::sync::mpsc;

use crate::client_gate::ClientGate;
use crate::config::KafkaConsumerConfig;
use crate::diagnostics::{self, SharedDiagnosticsSink};
use crate::error::{RunloopError, SubscribeError};
use crate::offset_batch::OffsetBatch;
use crate::partition_queue::PartitionQueue;
use crate::rebalance::{OffsetRetrieval, OffsetResolver, RunloopContext};
use crate::registry::PartitionStreamRegistry;
use crate::retry::RetryPolicy;
use crate::runloop::{Runloop, RunloopHandle};
use crate::types::{CommittableRecord, TopicPartition};

/// spec.md §3's `Subscription` variant.
pub enum Subscription {
    Topics(HashSet<String>),
    Pattern(Regex),
    Manual(HashSet<TopicPartition>),
}

/// Deserializes a topic's raw bytes into `T`. A pure function per
/// spec.md §1 ("a pure function (topic, bytes) → value that may fail");
/// kept external to the Runloop, as an injected collaborator, exactly as
/// spec.md scopes it.
pub trait Deserializer<T>: Send + Sync {
    fn deserialize(
        &self,
        topic: &str,
        bytes: &[u8],
    ) -> Result<T, Box<dyn std::error::Error + Send + Sync>>;
}

/// Convenience deserializer for any `serde::de::DeserializeOwned` type,
/// grounded in the teacher's `SingleTopicConsumer::json_recv`.
pub struct JsonDeserializer<T>(std::marker::PhantomData<T>);

impl<T> Default for JsonDeserializer<T> {
    fn default() -> Self {
        Self(std::marker::PhantomData)
    }
}

impl<T: serde::de::DeserializeOwned + Send + Sync> Deserializer<T> for JsonDeserializer<T> {
    fn deserialize(
        &self,
        _topic: &str,
        bytes: &[u8],
    ) -> Result<T, Box<dyn std::error::Error + Send + Sync>> {
        serde_json::from_slice(bytes).map_err(|e| Box::new(e) as _)
    }
}

/// A deserialized, committable record (spec.md §3's `CommittableRecord`,
/// with `key`/`value` resolved from raw bytes by the caller's
/// deserializers instead of left as bytes).
pub struct DeserializedRecord<K, V> {
    pub topic_partition: TopicPartition,
    pub offset: crate::types::Offset,
    pub timestamp: Option<i64>,
    pub key: Option<K>,
    pub value: Option<V>,
}

fn deserialize_chunk<KD, VD, K, V>(
    key_de: &KD,
    val_de: &VD,
    chunk: Vec<CommittableRecord>,
) -> Vec<Result<DeserializedRecord<K, V>, RunloopError>>
where
    KD: Deserializer<K>,
    VD: Deserializer<V>,
{
    chunk
        .into_iter()
        .map(|committable| {
            let topic = committable.record.topic_partition.topic.clone();
            let key = match committable.record.key.as_deref() {
                Some(bytes) => match key_de.deserialize(&topic, bytes) {
                    Ok(k) => Some(k),
                    Err(source) => {
                        return Err(RunloopError::Deserialize {
                            topic_partition: committable.record.topic_partition.clone(),
                            source,
                        })
                    }
                },
                None => None,
            };
            let value = match committable.record.value.as_deref() {
                Some(bytes) => match val_de.deserialize(&topic, bytes) {
                    Ok(v) => Some(v),
                    Err(source) => {
                        return Err(RunloopError::Deserialize {
                            topic_partition: committable.record.topic_partition.clone(),
                            source,
                        })
                    }
                },
                None => None,
            };

            Ok(DeserializedRecord {
                topic_partition: committable.record.topic_partition,
                offset: committable.offset,
                timestamp: committable.record.timestamp,
                key,
                value,
            })
        })
        .collect()
}

/// The per-partition inner stream of spec.md §4.6's `partitionedStream`.
pub struct PartitionRecordStream<K, V> {
    queue: PartitionQueue,
    key_de: Arc<dyn Deserializer<K>>,
    val_de: Arc<dyn Deserializer<V>>,
}

impl<K, V> PartitionRecordStream<K, V> {
    /// Yields the next chunk, with each record's deserialization resolved
    /// independently — one bad record fails only that record's `Result`
    /// without terminating the chunk or the stream (spec.md §7's
    /// "deserializer failures fail the inner stream for that chunk" is
    /// interpreted at the finest grain spec.md's data model supports,
    /// since `CommittableRecord` already carries one record at a time).
    pub async fn next_chunk(&mut self) -> Option<Result<Vec<Result<DeserializedRecord<K, V>, RunloopError>>, RunloopError>> {
        match self.queue.next_chunk().await? {
            Ok(chunk) => Some(Ok(deserialize_chunk(
                self.key_de.as_ref(),
                self.val_de.as_ref(),
                chunk,
            ))),
            Err(poll_err) => Some(Err(RunloopError::Poll(poll_err))),
        }
    }
}

/// The outer stream of spec.md §4.6's `partitionedStream`: yields a new
/// `(TopicPartition, PartitionRecordStream)` pair every time the Runloop
/// assigns a partition this façade hasn't seen before.
pub struct NewPartitionStream<K, V> {
    rx: mpsc::UnboundedReceiver<(TopicPartition, PartitionQueue)>,
    key_de: Arc<dyn Deserializer<K>>,
    val_de: Arc<dyn Deserializer<V>>,
}

impl<K, V> NewPartitionStream<K, V> {
    pub async fn next(&mut self) -> Option<(TopicPartition, PartitionRecordStream<K, V>)> {
        let (tp, queue) = self.rx.recv().await?;
        Some((
            tp,
            PartitionRecordStream {
                queue,
                key_de: self.key_de.clone(),
                val_de: self.val_de.clone(),
            },
        ))
    }
}

struct Inner {
    gate: Arc<ClientGate>,
    registry: Arc<PartitionStreamRegistry>,
    assignment: Arc<Mutex<Vec<TopicPartition>>>,
    handle: RunloopHandle,
    config: KafkaConsumerConfig,
    offset_retrieval: OffsetRetrieval,
    new_partition_tx: mpsc::UnboundedSender<(TopicPartition, PartitionQueue)>,
    new_partition_rx: Mutex<Option<mpsc::UnboundedReceiver<(TopicPartition, PartitionQueue)>>>,
    subscription: Mutex<Option<String>>,
}

/// The public surface of this crate (spec.md §4.6): subscribe, stream
/// constructors, commit-then-process helper, and metadata passthroughs.
/// `Clone`-via-`Arc`, in the shape of the teacher's `SingleTopicConsumer`.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

impl Consumer {
    /// Builds the broker client, wires up the rebalance context, and
    /// spawns the Runloop as the one long-lived task owning it for the
    /// consumer's lifetime (spec.md §4.4). Does not subscribe yet — call
    /// [`Consumer::subscribe`] next.
    pub fn new(
        config: KafkaConsumerConfig,
        offset_retrieval: OffsetRetrieval,
        diagnostics: Option<SharedDiagnosticsSink>,
    ) -> Result<Self, SubscribeError> {
        let diagnostics = diagnostics.unwrap_or_else(diagnostics::default_sink);
        let registry = Arc::new(PartitionStreamRegistry::new());
        let assignment = Arc::new(Mutex::new(Vec::new()));
        let (new_partition_tx, new_partition_rx) = mpsc::unbounded_channel();

        let context = RunloopContext {
            registry: registry.clone(),
            assignment: assignment.clone(),
            diagnostics: diagnostics.clone(),
            offset_retrieval: offset_retrieval.clone(),
            per_partition_prefetch: config.kafka_per_partition_prefetch,
            resolver_timeout: Duration::from_secs(30),
            new_partition_tx: new_partition_tx.clone(),
        };

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("group.id", &config.kafka_consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset);

        if let Some(client_id) = &config.kafka_client_id {
            client_config.set("client.id", client_id);
        }
        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        for (k, v) in &config.extra_properties {
            client_config.set(k, v);
        }

        tracing::debug!("rdkafka configuration: {:?}", client_config);
        let client: BaseConsumer<RunloopContext> = client_config.create_with_context(context)?;

        let (commands_tx, commands_rx) = mpsc::channel(1024);
        let handle = RunloopHandle::new(commands_tx);

        let runloop = Runloop::new(
            client,
            registry.clone(),
            assignment.clone(),
            diagnostics,
            config.clone(),
            commands_rx,
            handle.clone(),
        );
        let gate = runloop.gate();
        tokio::spawn(runloop.run());

        Ok(Self {
            inner: Arc::new(Inner {
                gate,
                registry,
                assignment,
                handle,
                config,
                offset_retrieval,
                new_partition_tx,
                new_partition_rx: Mutex::new(Some(new_partition_rx)),
                subscription: Mutex::new(None),
            }),
        })
    }

    /// spec.md §4.6: idempotent for an identical call.
    pub async fn subscribe(&self, subscription: Subscription) -> Result<(), SubscribeError> {
        {
            let mut current = self.inner.subscription.lock().unwrap();
            let description = match &subscription {
                Subscription::Topics(topics) => format!("topics:{topics:?}"),
                Subscription::Pattern(re) => format!("pattern:{re}"),
                Subscription::Manual(tps) => format!("manual:{tps:?}"),
            };
            if current.as_deref() == Some(description.as_str()) {
                return Ok(());
            }
            *current = Some(description);
        }

        match &subscription {
            Subscription::Topics(topics) => {
                let topics: Vec<String> = topics.iter().cloned().collect();
                self.inner
                    .gate
                    .run(move |client| {
                        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
                        client.subscribe(&refs)
                    })
                    .await?;
            }
            Subscription::Pattern(pattern) => {
                let topic_pattern = format!("^{}$", pattern.as_str());
                self.inner
                    .gate
                    .run(move |client| client.subscribe(&[topic_pattern.as_str()]))
                    .await?;
            }
            Subscription::Manual(tps) => {
                let tps: Vec<TopicPartition> = tps.iter().cloned().collect();

                // Resolve offsets before touching the client at all, so
                // the assign+seek below is one indivisible unit of work
                // under the gate: nothing else (in particular, the
                // Runloop's own poll) can slip in and read this
                // assignment before it's been seeked.
                let offsets = match &self.inner.offset_retrieval {
                    OffsetRetrieval::Manual { resolver } => resolver
                        .resolve(&tps)
                        .await
                        .map_err(SubscribeError::ResolverFailed)?,
                    OffsetRetrieval::Auto { .. } => HashMap::new(),
                };

                let mut tpl = TopicPartitionList::new();
                for tp in &tps {
                    tpl.add_partition(&tp.topic, tp.partition);
                }
                let tps_for_gate = tps.clone();
                self.inner
                    .gate
                    .run(move |client| {
                        client.assign(&tpl)?;
                        for tp in &tps_for_gate {
                            let Some(offset) = offsets.get(tp) else {
                                continue;
                            };
                            client.seek(
                                &tp.topic,
                                tp.partition,
                                RdOffset::Offset(*offset),
                                Duration::from_secs(5),
                            )?;
                        }
                        Ok::<(), rdkafka::error::KafkaError>(())
                    })
                    .await?;

                {
                    let mut assignment = self.inner.assignment.lock().unwrap();
                    for tp in &tps {
                        if !assignment.contains(tp) {
                            assignment.push(tp.clone());
                        }
                    }
                }

                for tp in &tps {
                    if let Some(queue) = self
                        .inner
                        .registry
                        .create(tp.clone(), self.inner.config.kafka_per_partition_prefetch)
                    {
                        let _ = self.inner.new_partition_tx.send((tp.clone(), queue));
                    }
                }
            }
        }

        Ok(())
    }

    /// spec.md §4.6: lazy stream of `(tp, inner stream)`. Can only be
    /// called once per `Consumer` — the underlying notification channel
    /// has a single owner, matching the single-consumer-per-queue model
    /// of spec.md §5.
    pub fn partitioned_stream<K, V>(
        &self,
        key_de: impl Deserializer<K> + 'static,
        val_de: impl Deserializer<V> + 'static,
    ) -> Option<NewPartitionStream<K, V>> {
        let rx = self.inner.new_partition_rx.lock().unwrap().take()?;
        Some(NewPartitionStream {
            rx,
            key_de: Arc::new(key_de),
            val_de: Arc::new(val_de),
        })
    }

    /// spec.md §4.6: unordered merge of all inner streams. `buffer` bounds
    /// how many deserialized records may be queued ahead of the caller —
    /// the "bounded concurrency" of spec.md's contract table.
    pub fn plain_stream<K, V>(
        &self,
        key_de: impl Deserializer<K> + 'static,
        val_de: impl Deserializer<V> + 'static,
        buffer: usize,
    ) -> Option<mpsc::Receiver<Result<DeserializedRecord<K, V>, RunloopError>>>
    where
        K: Send + 'static,
        V: Send + 'static,
    {
        let mut new_partitions = self.partitioned_stream(key_de, val_de)?;
        let (tx, rx) = mpsc::channel(buffer.max(1));

        tokio::spawn(async move {
            while let Some((_tp, mut inner)) = new_partitions.next().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    while let Some(chunk) = inner.next_chunk().await {
                        match chunk {
                            Ok(records) => {
                                for record in records {
                                    if tx.send(record).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(err) => {
                                let _ = tx.send(Err(err)).await;
                                return;
                            }
                        }
                    }
                });
            }
        });

        Some(rx)
    }

    /// spec.md §4.6: transitions to `StoppingGracefully`; returns
    /// immediately and never fails.
    pub fn stop_consumption(&self) {
        self.inner.handle.stop(true);
    }

    /// Hard cancellation (spec.md §5): aborts the Runloop immediately
    /// rather than draining.
    pub fn shutdown_now(&self) {
        self.inner.handle.stop(false);
    }

    pub async fn commit(
        &self,
        batch: OffsetBatch,
        policy: RetryPolicy,
    ) -> Result<(), crate::error::CommitError> {
        batch.commit(&self.inner.handle, policy).await
    }

    pub fn subscription(&self) -> Option<String> {
        self.inner.subscription.lock().unwrap().clone()
    }

    pub fn assignment(&self) -> Vec<TopicPartition> {
        self.inner.assignment.lock().unwrap().clone()
    }

    pub async fn list_topics(
        &self,
        timeout: Duration,
    ) -> Result<Vec<String>, RunloopError> {
        self.inner
            .gate
            .run(move |client| {
                let metadata = client.fetch_metadata(None, timeout)?;
                Ok::<_, rdkafka::error::KafkaError>(
                    metadata.topics().iter().map(|t| t.name().to_string()).collect(),
                )
            })
            .await
            .map_err(RunloopError::from)
    }

    pub async fn beginning_offsets(
        &self,
        tps: Vec<TopicPartition>,
        timeout: Duration,
    ) -> Result<Vec<(TopicPartition, i64)>, RunloopError> {
        self.inner
            .gate
            .run(move |client| {
                let mut out = Vec::with_capacity(tps.len());
                for tp in tps {
                    let (low, _high) = client.fetch_watermarks(&tp.topic, tp.partition, timeout)?;
                    out.push((tp, low));
                }
                Ok::<_, rdkafka::error::KafkaError>(out)
            })
            .await
            .map_err(RunloopError::from)
    }

    pub async fn end_offsets(
        &self,
        tps: Vec<TopicPartition>,
        timeout: Duration,
    ) -> Result<Vec<(TopicPartition, i64)>, RunloopError> {
        self.inner
            .gate
            .run(move |client| {
                let mut out = Vec::with_capacity(tps.len());
                for tp in tps {
                    let (_low, high) = client.fetch_watermarks(&tp.topic, tp.partition, timeout)?;
                    out.push((tp, high));
                }
                Ok::<_, rdkafka::error::KafkaError>(out)
            })
            .await
            .map_err(RunloopError::from)
    }

    /// Non-preferred migration-compatibility passthrough (spec.md §9's
    /// open question): prefer `OffsetRetrieval::Manual` for new code.
    #[deprecated(note = "prefer OffsetRetrieval::Manual at subscribe time")]
    pub async fn seek_to_beginning(&self, tp: TopicPartition, timeout: Duration) -> Result<(), RunloopError> {
        self.inner
            .gate
            .run(move |client| client.seek(&tp.topic, tp.partition, RdOffset::Beginning, timeout))
            .await
            .map_err(RunloopError::from)
    }

    #[deprecated(note = "prefer OffsetRetrieval::Manual at subscribe time")]
    pub async fn seek_to_end(&self, tp: TopicPartition, timeout: Duration) -> Result<(), RunloopError> {
        self.inner
            .gate
            .run(move |client| client.seek(&tp.topic, tp.partition, RdOffset::End, timeout))
            .await
            .map_err(RunloopError::from)
    }

    #[deprecated(note = "prefer OffsetRetrieval::Manual at subscribe time")]
    pub async fn seek_to_timestamp(
        &self,
        tp: TopicPartition,
        timestamp_ms: i64,
        timeout: Duration,
    ) -> Result<(), RunloopError> {
        self.inner
            .gate
            .run(move |client| {
                let mut tpl = TopicPartitionList::new();
                tpl.add_partition_offset(&tp.topic, tp.partition, RdOffset::Offset(timestamp_ms))?;
                let resolved = client.offsets_for_times(tpl, timeout)?;
                for elem in resolved.elements() {
                    client.seek(elem.topic(), elem.partition(), elem.offset(), timeout)?;
                }
                Ok::<(), rdkafka::error::KafkaError>(())
            })
            .await
            .map_err(RunloopError::from)
    }
}

/// spec.md §4.6's `processAndCommit` helper: runs `effect` over every
/// record from `plain_stream`, aggregating acknowledged offsets into one
/// batch and driving commits with `policy`. At-least-once: on
/// termination, in-flight uncommitted offsets are lost (spec.md §4.6).
pub async fn process_and_commit<K, V, F, Fut>(
    consumer: &Consumer,
    key_de: impl Deserializer<K> + 'static,
    val_de: impl Deserializer<V> + 'static,
    buffer: usize,
    commit_every: usize,
    policy: RetryPolicy,
    mut effect: F,
) -> Result<(), RunloopError>
where
    K: Send + 'static,
    V: Send + 'static,
    F: FnMut(Option<K>, Option<V>) -> Fut,
    Fut: std::future::Future<Output = Result<(), RunloopError>>,
{
    let Some(mut stream) = consumer.plain_stream(key_de, val_de, buffer) else {
        return Err(RunloopError::Shutdown);
    };

    let mut batch = OffsetBatch::empty();
    let mut processed = 0usize;

    while let Some(item) = stream.recv().await {
        let record = item?;
        effect(record.key, record.value).await?;
        batch.insert(record.topic_partition, record.offset.value());
        processed += 1;

        if processed >= commit_every {
            batch.commit(&consumer.inner.handle, policy).await?;
            batch = OffsetBatch::empty();
            processed = 0;
        }
    }

    if !batch.is_empty() {
        batch.commit(&consumer.inner.handle, policy).await?;
    }

    Ok(())
}
