use std::sync::Arc;
use std::time::Duration;

use relay_kafka::{BrokerClient, ClientError, Connector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

/// Connection state of a route.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected. Either not started yet, waiting to retry or shut down.
    #[default]
    Disconnected,
    /// Connecting to the brokers and reading topic metadata.
    Bootstrapping,
    /// Connected. Batches are flushed.
    Ready,
    /// The connection could not be established. The route does not forward any metrics.
    Fatal,
}

/// An unrecoverable error while establishing the broker connection.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// No broker was reachable on any attempt.
    #[error("no kafka brokers available after {attempts} attempts")]
    OutOfBrokers {
        /// The number of connection attempts.
        attempts: u32,
        /// The error of the last attempt.
        #[source]
        source: ClientError,
    },
    /// The connection was rejected.
    #[error("failed to initialize kafka producer")]
    Connect(#[source] ClientError),
    /// The partitions of the topic could not be retrieved.
    #[error("failed to get partitions for topic {topic}")]
    Partitions {
        /// The topic name.
        topic: String,
        /// The metadata error.
        #[source]
        source: ClientError,
    },
    /// The topic has no partitions, which indicates that the cluster is not ready.
    #[error("retrieved 0 partitions for topic {0}, kafka might not be in a ready state")]
    NoPartitions(String),
}

/// An established connection with the partition count of the topic.
#[derive(Debug)]
pub(crate) struct Connection<C> {
    pub client: C,
    pub partitions: i32,
}

/// Establishes the broker connection of a route.
#[derive(Debug)]
pub(crate) struct Bootstrapper<'a> {
    pub key: &'a Arc<str>,
    pub topic: &'a str,
    pub retry_interval: Duration,
    pub max_attempts: u32,
    pub state: &'a watch::Sender<ConnectionState>,
}

impl Bootstrapper<'_> {
    /// Connects and resolves the partition count of the topic.
    ///
    /// Connections failing because no broker is reachable are retried up to `max_attempts` times
    /// in total. All other errors are returned immediately.
    pub async fn run<C: Connector>(
        &self,
        connector: &C,
    ) -> Result<Connection<C::Client>, BootstrapError> {
        let client = self.connect(connector).await?;

        let partitions = match client.partition_count(self.topic).await {
            Ok(partitions) if partitions > 0 => partitions,
            Ok(_) => {
                client.close().await;
                return Err(BootstrapError::NoPartitions(self.topic.to_owned()));
            }
            Err(source) => {
                client.close().await;
                return Err(BootstrapError::Partitions {
                    topic: self.topic.to_owned(),
                    source,
                });
            }
        };

        Ok(Connection { client, partitions })
    }

    async fn connect<C: Connector>(&self, connector: &C) -> Result<C::Client, BootstrapError> {
        let mut attempts = 0;

        loop {
            self.state.send_replace(ConnectionState::Bootstrapping);

            let error = match connector.connect().await {
                Ok(client) => return Ok(client),
                Err(error) if error.is_out_of_brokers() => error,
                Err(error) => return Err(BootstrapError::Connect(error)),
            };

            attempts += 1;
            relay_log::warn!(
                route = &**self.key,
                error = &error as &dyn std::error::Error,
                "connection attempt {attempts} of {} failed",
                self.max_attempts,
            );

            if attempts >= self.max_attempts {
                return Err(BootstrapError::OutOfBrokers {
                    attempts,
                    source: error,
                });
            }

            self.state.send_replace(ConnectionState::Disconnected);
            tokio::time::sleep(self.retry_interval).await;
        }
    }
}
