//! Kafka producer metrics.

use relay_statsd::{CounterMetric, DistributionMetric};

pub enum KafkaCounters {
    /// Number of errors reported by the librdkafka client outside of message delivery.
    ///
    /// These include, for example, brokers going down or failing name resolution.
    ClientError,

    /// Number of messages acknowledged by the broker.
    ///
    /// This metric is tagged with:
    /// - `topic`: The Kafka topic being produced to.
    ProduceStatusSuccess,

    /// Number of messages that failed to be produced.
    ///
    /// This metric is tagged with:
    /// - `topic`: The Kafka topic being produced to.
    ProduceStatusError,
}

impl CounterMetric for KafkaCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::ClientError => "kafka.client.error",
            Self::ProduceStatusSuccess => "producer.produce_status.success",
            Self::ProduceStatusError => "producer.produce_status.error",
        }
    }
}

pub enum KafkaDistributions {
    /// Number of messages in a produced batch.
    ///
    /// This metric is tagged with:
    /// - `topic`: The Kafka topic being produced to.
    BatchSize,
}

impl DistributionMetric for KafkaDistributions {
    fn name(&self) -> &'static str {
        match self {
            Self::BatchSize => "kafka.batch_size",
        }
    }
}
