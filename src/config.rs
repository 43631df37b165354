use std::collections::HashMap;

use envconfig::Envconfig;

/// Env-sourced fields of a [`KafkaConsumerConfig`], split out because
/// `envconfig::Envconfig` has no notion of a free-form map field (the
/// `extra_properties` passthrough), mirroring the teacher's split between
/// `KafkaConfig` and `ConsumerConfig`.
#[derive(Envconfig, Clone, Debug)]
struct EnvFields {
    #[envconfig(default = "localhost:9092")]
    kafka_hosts: String,

    kafka_consumer_group: String,

    kafka_client_id: Option<String>,

    #[envconfig(default = "false")]
    kafka_tls: bool,

    /// Deadline for `unsubscribe`/`close` during a hard-cancellation
    /// teardown (spec.md §5, "Cancellation").
    #[envconfig(default = "5000")]
    kafka_close_timeout_ms: u32,

    /// Minimum spacing between Runloop ticks. `0` means poll as fast as the
    /// client allows.
    #[envconfig(default = "0")]
    kafka_poll_interval_ms: u32,

    /// How long a single `poll` call may block waiting for records.
    #[envconfig(default = "200")]
    kafka_poll_timeout_ms: u32,

    /// High-water mark (in chunks) for a partition's queue backlog before
    /// the Runloop pauses that partition. This is spec.md's
    /// `perPartitionChunkPrefetch`.
    #[envconfig(default = "16")]
    kafka_per_partition_prefetch: usize,

    /// `earliest` | `latest` | `none` — feeds `OffsetRetrieval::Auto`.
    #[envconfig(default = "earliest")]
    kafka_consumer_offset_reset: String,

    /// Deadline for graceful shutdown (spec.md §4.4 step 5): once reached,
    /// any still-pending commits are abandoned and the Runloop exits.
    #[envconfig(default = "10000")]
    kafka_shutdown_deadline_ms: u32,
}

/// Configuration for a [`crate::consumer::Consumer`]. Loaded via
/// [`KafkaConsumerConfig::init_from_env`], mirroring the teacher's
/// `KafkaConfig` / `ConsumerConfig` shape.
#[derive(Clone, Debug)]
pub struct KafkaConsumerConfig {
    pub kafka_hosts: String,
    pub kafka_consumer_group: String,
    pub kafka_client_id: Option<String>,
    pub kafka_tls: bool,
    pub kafka_close_timeout_ms: u32,
    pub kafka_poll_interval_ms: u32,
    pub kafka_poll_timeout_ms: u32,
    pub kafka_per_partition_prefetch: usize,
    pub kafka_consumer_offset_reset: String,
    pub kafka_shutdown_deadline_ms: u32,
    /// Arbitrary extra `librdkafka` properties, forwarded verbatim to
    /// `rdkafka::ClientConfig`. Not environment-sourced — set with
    /// [`KafkaConsumerConfig::with_extra_properties`] after loading.
    pub extra_properties: HashMap<String, String>,
}

impl KafkaConsumerConfig {
    pub fn init_from_env() -> Result<Self, envconfig::Error> {
        let f = EnvFields::init_from_env()?;
        Ok(Self {
            kafka_hosts: f.kafka_hosts,
            kafka_consumer_group: f.kafka_consumer_group,
            kafka_client_id: f.kafka_client_id,
            kafka_tls: f.kafka_tls,
            kafka_close_timeout_ms: f.kafka_close_timeout_ms,
            kafka_poll_interval_ms: f.kafka_poll_interval_ms,
            kafka_poll_timeout_ms: f.kafka_poll_timeout_ms,
            kafka_per_partition_prefetch: f.kafka_per_partition_prefetch,
            kafka_consumer_offset_reset: f.kafka_consumer_offset_reset,
            kafka_shutdown_deadline_ms: f.kafka_shutdown_deadline_ms,
            extra_properties: HashMap::new(),
        })
    }

    pub fn with_extra_properties(mut self, props: HashMap<String, String>) -> Self {
        self.extra_properties = props;
        self
    }

    /// A config with sane defaults for tests, needing only a broker
    /// address and group id filled in.
    pub(crate) fn for_test(group: &str) -> Self {
        Self {
            kafka_hosts: "localhost:9092".to_string(),
            kafka_consumer_group: group.to_string(),
            kafka_client_id: None,
            kafka_tls: false,
            kafka_close_timeout_ms: 5000,
            kafka_poll_interval_ms: 0,
            kafka_poll_timeout_ms: 200,
            kafka_per_partition_prefetch: 16,
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_shutdown_deadline_ms: 10000,
            extra_properties: HashMap::new(),
        }
    }
}
