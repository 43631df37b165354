use rdkafka::mocking::MockCluster;
use rdkafka::producer::DefaultProducerContext;

use crate::config::KafkaConsumerConfig;
use crate::consumer::Consumer;
use crate::rebalance::{AutoOffsetReset, OffsetRetrieval};

/// Spins up a single-broker mock cluster and a [`Consumer`] pointed at it,
/// mirroring the teacher's `create_mock_kafka`.
pub async fn create_mock_consumer(group: &str) -> (MockCluster<'static, DefaultProducerContext>, Consumer) {
    let cluster = MockCluster::new(1).expect("failed to create mock brokers");

    let config = KafkaConsumerConfig {
        kafka_hosts: cluster.bootstrap_servers(),
        ..KafkaConsumerConfig::for_test(group)
    };

    let consumer = Consumer::new(
        config,
        OffsetRetrieval::Auto {
            reset: AutoOffsetReset::Earliest,
        },
        None,
    )
    .expect("failed to create mocked kafka consumer");

    (cluster, consumer)
}
