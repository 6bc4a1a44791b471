use std::fmt;
use std::time::Duration;

use rdkafka::producer::{FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use relay_statsd::metric;

use crate::client::{
    BrokerClient, ClientError, Connector, ProduceError, ProducerErrors, Record, is_unreachable,
};
use crate::config::KafkaConfig;
use crate::statsd::{KafkaCounters, KafkaDistributions};

mod utils;
pub use utils::{CaptureErrorContext, FutureProducer};

/// Creates [`KafkaClient`]s from a [`KafkaConfig`].
#[derive(Debug)]
pub struct KafkaConnector {
    config: KafkaConfig,
}

impl KafkaConnector {
    /// Creates a connector for the given configuration.
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

impl Connector for KafkaConnector {
    type Client = KafkaClient;

    async fn connect(&self) -> Result<KafkaClient, ClientError> {
        let producer: FutureProducer = self
            .config
            .client_config()
            .create_with_context(CaptureErrorContext)
            .map_err(ClientError::InvalidConfig)?;

        // librdkafka connects lazily, so request the broker list to verify the connection.
        let probe = producer.clone();
        let timeout = self.config.timeout;
        let result = tokio::task::spawn_blocking(move || {
            probe.client().fetch_metadata(None, timeout).map(drop)
        })
        .await
        .map_err(|_| ClientError::Interrupted)?;

        match result {
            Ok(()) => Ok(KafkaClient { producer, timeout }),
            Err(error) if is_unreachable(&error) => Err(ClientError::OutOfBrokers(error)),
            Err(error) => Err(ClientError::Connect(error)),
        }
    }
}

/// A connection to Kafka producing records to explicit partitions.
#[derive(Clone)]
pub struct KafkaClient {
    producer: FutureProducer,
    timeout: Duration,
}

impl fmt::Debug for KafkaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaClient")
            .field("producer", &"<FutureProducer>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl BrokerClient for KafkaClient {
    async fn partition_count(&self, topic: &str) -> Result<i32, ClientError> {
        let producer = self.producer.clone();
        let topic = topic.to_owned();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            let metadata = producer
                .client()
                .fetch_metadata(Some(&topic), timeout)
                .map_err(ClientError::Metadata)?;

            let topic_metadata = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .ok_or_else(|| ClientError::UnknownTopic(topic.clone()))?;

            if let Some(error) = topic_metadata.error() {
                return Err(ClientError::Topic {
                    topic: topic.clone(),
                    code: error.into(),
                });
            }

            Ok(topic_metadata.partitions().len() as i32)
        })
        .await
        .map_err(|_| ClientError::Interrupted)?
    }

    async fn send_batch(&self, topic: &str, records: &[Record]) -> Result<(), ProducerErrors> {
        metric!(
            distribution(KafkaDistributions::BatchSize) = records.len() as u64,
            topic = topic
        );

        let deliveries = records.iter().map(|record| {
            let future_record = FutureRecord::<(), [u8]>::to(topic)
                .partition(record.partition)
                .payload(record.payload.as_slice());
            self.producer
                .send(future_record, Timeout::After(self.timeout))
        });

        let results = futures::future::join_all(deliveries).await;

        let errors: Vec<_> = results
            .into_iter()
            .zip(records)
            .enumerate()
            .filter_map(|(index, (result, record))| {
                let (error, _message) = result.err()?;
                Some(ProduceError {
                    index,
                    partition: record.partition,
                    error,
                })
            })
            .collect();

        let failed = errors.len();
        metric!(
            counter(KafkaCounters::ProduceStatusSuccess) += (records.len() - failed) as i64,
            topic = topic
        );

        if errors.is_empty() {
            return Ok(());
        }

        metric!(
            counter(KafkaCounters::ProduceStatusError) += failed as i64,
            topic = topic
        );
        Err(ProducerErrors::new(errors, records.len()))
    }

    async fn close(self) {
        let Self { producer, timeout } = self;
        let result = tokio::task::spawn_blocking(move || producer.flush(timeout)).await;

        match result {
            Ok(Ok(())) => relay_log::debug!("kafka producer closed"),
            Ok(Err(error)) => relay_log::warn!(
                error = &error as &dyn std::error::Error,
                "failed to flush kafka producer on close"
            ),
            Err(_) => relay_log::warn!("kafka producer close was interrupted"),
        }
    }
}
