use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

/// Errors raised while connecting to Kafka or reading topic metadata.
#[derive(Debug, Error)]
pub enum ClientError {
    /// None of the configured brokers could be reached.
    ///
    /// This error is transient, the connection can be retried.
    #[error("no kafka brokers available")]
    OutOfBrokers(#[source] KafkaError),

    /// Failed to create a kafka producer because of the invalid configuration.
    #[error("failed to create kafka producer: invalid kafka config")]
    InvalidConfig(#[source] KafkaError),

    /// The brokers are reachable but rejected the connection.
    #[error("failed to connect to kafka")]
    Connect(#[source] KafkaError),

    /// Fetching the cluster metadata failed.
    #[error("failed to fetch kafka metadata")]
    Metadata(#[source] KafkaError),

    /// The topic does not exist in the cluster metadata.
    #[error("topic {0} does not exist")]
    UnknownTopic(String),

    /// The broker reported an error for the topic.
    #[error("failed to get partitions for topic {topic}: {code}")]
    Topic {
        /// The topic name.
        topic: String,
        /// The error reported by the broker.
        code: RDKafkaErrorCode,
    },

    /// A blocking call into librdkafka did not complete.
    #[error("kafka operation was interrupted")]
    Interrupted,
}

impl ClientError {
    /// Returns `true` if no broker could be reached and the connection may be retried.
    pub fn is_out_of_brokers(&self) -> bool {
        matches!(self, Self::OutOfBrokers(_))
    }
}

/// Returns `true` if the error indicates that no broker is currently reachable.
pub(crate) fn is_unreachable(error: &KafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::Resolve
        )
    )
}

/// A serialized message addressed to an explicit partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// Destination partition in `[0, partition_count)`.
    pub partition: i32,
    /// The encoded message.
    pub payload: Vec<u8>,
}

/// The delivery failure of a single record in a batch.
#[derive(Debug)]
pub struct ProduceError {
    /// Index of the record in the submitted batch.
    pub index: usize,
    /// The partition the record was addressed to.
    pub partition: i32,
    /// The error reported by the producer.
    pub error: KafkaError,
}

/// Errors of a batch that was not fully acknowledged.
///
/// Only the records listed here failed, but the batch is considered failed as a whole.
#[derive(Debug, Default)]
pub struct ProducerErrors {
    errors: Vec<ProduceError>,
    total: usize,
}

impl ProducerErrors {
    /// Creates the error for a batch of `total` records.
    pub fn new(errors: Vec<ProduceError>, total: usize) -> Self {
        Self { errors, total }
    }

    /// Returns the individual record failures.
    pub fn errors(&self) -> &[ProduceError] {
        &self.errors
    }

    /// Aggregates the failures by kind, returning how often each error was seen.
    pub fn by_kind(&self) -> BTreeMap<String, usize> {
        let mut kinds = BTreeMap::new();
        for error in &self.errors {
            *kinds.entry(error.error.to_string()).or_default() += 1;
        }
        kinds
    }
}

impl fmt::Display for ProducerErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to deliver {} of {} messages",
            self.errors.len(),
            self.total
        )
    }
}

impl std::error::Error for ProducerErrors {}

/// Establishes connections to the broker cluster.
pub trait Connector: Send + Sync + 'static {
    /// The client returned for an established connection.
    type Client: BrokerClient;

    /// Opens a connection to the configured brokers.
    ///
    /// Returns [`ClientError::OutOfBrokers`] if no broker can be reached right now.
    fn connect(&self) -> impl Future<Output = Result<Self::Client, ClientError>> + Send;
}

/// An open connection to the broker cluster.
///
/// The client stays open until [`close`](Self::close) is called.
pub trait BrokerClient: Send + Sync + 'static {
    /// Returns the number of partitions of `topic`.
    fn partition_count(&self, topic: &str)
    -> impl Future<Output = Result<i32, ClientError>> + Send;

    /// Produces all records to `topic` and resolves once every record is acknowledged.
    ///
    /// If any record fails, the returned error lists the failed records.
    fn send_batch(
        &self,
        topic: &str,
        records: &[Record],
    ) -> impl Future<Output = Result<(), ProducerErrors>> + Send;

    /// Flushes outstanding messages and closes the connection.
    fn close(self) -> impl Future<Output = ()> + Send;
}
