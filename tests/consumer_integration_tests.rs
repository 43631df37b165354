use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, Result};
use kafka_runloop_consumer::consumer::{JsonDeserializer, Subscription};
use kafka_runloop_consumer::rebalance::{OffsetResolver, OffsetRetrieval};
use kafka_runloop_consumer::retry::RetryPolicy;
use kafka_runloop_consumer::test_utils::create_mock_consumer;
use kafka_runloop_consumer::types::TopicPartition;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Event {
    id: u32,
}

async fn produce(bootstrap: &str, topic: &str, partition: i32, events: &[Event]) -> Result<()> {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", bootstrap)
        .set("message.timeout.ms", "5000")
        .create()?;

    for event in events {
        let payload = serde_json::to_vec(event)?;
        let key = event.id.to_string();
        producer
            .send(
                FutureRecord::to(topic)
                    .partition(partition)
                    .payload(&payload)
                    .key(&key),
                Timeout::After(Duration::from_secs(5)),
            )
            .await
            .map_err(|(err, _)| anyhow!(err))?;
    }
    Ok(())
}

#[tokio::test]
async fn plain_stream_yields_produced_records_in_order() -> Result<()> {
    init_logging();
    let (cluster, consumer) = create_mock_consumer("rt-plain-stream").await;
    let topic = "rt-plain-stream-topic";

    produce(
        &cluster.bootstrap_servers(),
        topic,
        0,
        &[Event { id: 1 }, Event { id: 2 }, Event { id: 3 }],
    )
    .await?;

    consumer
        .subscribe(Subscription::Topics(HashSet::from([topic.to_string()])))
        .await?;

    let mut stream = consumer
        .plain_stream(
            JsonDeserializer::<u32>::default(),
            JsonDeserializer::<Event>::default(),
            16,
        )
        .expect("plain_stream can only be claimed once per consumer");

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let record = tokio::time::timeout(Duration::from_secs(10), stream.recv())
            .await?
            .ok_or_else(|| anyhow!("stream ended before yielding all records"))??;
        seen.push(record.value.expect("value present"));
        record.offset.commit(RetryPolicy::default()).await?;
    }

    assert_eq!(seen, vec![Event { id: 1 }, Event { id: 2 }, Event { id: 3 }]);
    Ok(())
}

#[tokio::test]
async fn plain_stream_interleaves_records_from_multiple_partitions() -> Result<()> {
    init_logging();
    let (cluster, consumer) = create_mock_consumer("rt-multi-partition").await;
    let topic_a = "rt-multi-partition-a";
    let topic_b = "rt-multi-partition-b";

    produce(
        &cluster.bootstrap_servers(),
        topic_a,
        0,
        &[Event { id: 1 }, Event { id: 2 }],
    )
    .await?;
    produce(
        &cluster.bootstrap_servers(),
        topic_b,
        0,
        &[Event { id: 3 }, Event { id: 4 }],
    )
    .await?;

    consumer
        .subscribe(Subscription::Topics(HashSet::from([
            topic_a.to_string(),
            topic_b.to_string(),
        ])))
        .await?;

    let mut stream = consumer
        .plain_stream(
            JsonDeserializer::<u32>::default(),
            JsonDeserializer::<Event>::default(),
            16,
        )
        .expect("plain_stream can only be claimed once per consumer");

    let mut seen = HashSet::new();
    while seen.len() < 4 {
        let record = tokio::time::timeout(Duration::from_secs(10), stream.recv())
            .await?
            .ok_or_else(|| anyhow!("stream ended before yielding all records"))??;
        seen.insert((record.topic_partition.topic.clone(), record.value.expect("value present").id));
        record.offset.commit(RetryPolicy::default()).await?;
    }

    assert_eq!(
        seen,
        HashSet::from([
            (topic_a.to_string(), 1),
            (topic_a.to_string(), 2),
            (topic_b.to_string(), 3),
            (topic_b.to_string(), 4),
        ])
    );
    Ok(())
}

/// A trivial resolver that always seeks to a fixed offset, used to exercise
/// `Subscription::Manual` + `OffsetRetrieval::Manual` together.
struct FixedOffsetResolver(i64);

#[async_trait::async_trait]
impl OffsetResolver for FixedOffsetResolver {
    async fn resolve(
        &self,
        topic_partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, i64>, String> {
        Ok(topic_partitions
            .iter()
            .map(|tp| (tp.clone(), self.0))
            .collect())
    }
}

#[tokio::test]
async fn manual_subscription_seeks_past_earlier_records() -> Result<()> {
    init_logging();
    let cluster = rdkafka::mocking::MockCluster::<'static, rdkafka::producer::DefaultProducerContext>::new(1)
        .expect("failed to create mock brokers");
    let topic = "rt-manual-seek-topic";

    produce(
        &cluster.bootstrap_servers(),
        topic,
        0,
        &[Event { id: 1 }, Event { id: 2 }, Event { id: 3 }],
    )
    .await?;

    let consumer = kafka_runloop_consumer::consumer::Consumer::new(
        test_config(&cluster.bootstrap_servers(), "rt-manual-seek"),
        OffsetRetrieval::Manual {
            resolver: std::sync::Arc::new(FixedOffsetResolver(2)),
        },
        None,
    )?;

    let tp = TopicPartition::new(topic, 0);
    consumer
        .subscribe(Subscription::Manual(HashSet::from([tp])))
        .await?;

    let mut stream = consumer
        .plain_stream(
            JsonDeserializer::<u32>::default(),
            JsonDeserializer::<Event>::default(),
            16,
        )
        .expect("plain_stream can only be claimed once per consumer");

    let record = tokio::time::timeout(Duration::from_secs(10), stream.recv())
        .await?
        .ok_or_else(|| anyhow!("stream ended before yielding a record"))??;

    assert_eq!(record.value, Some(Event { id: 3 }));
    Ok(())
}

fn test_config(
    bootstrap: &str,
    group: &str,
) -> kafka_runloop_consumer::config::KafkaConsumerConfig {
    kafka_runloop_consumer::config::KafkaConsumerConfig {
        kafka_hosts: bootstrap.to_string(),
        kafka_consumer_group: group.to_string(),
        kafka_client_id: None,
        kafka_tls: false,
        kafka_close_timeout_ms: 5000,
        kafka_poll_interval_ms: 0,
        kafka_poll_timeout_ms: 200,
        kafka_per_partition_prefetch: 16,
        kafka_consumer_offset_reset: "earliest".to_string(),
        kafka_shutdown_deadline_ms: 10_000,
        extra_properties: HashMap::new(),
    }
}
