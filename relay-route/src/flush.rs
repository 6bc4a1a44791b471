use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use relay_kafka::{BrokerClient, ProducerErrors, Record};
use relay_metrics::{MetricData, PartitionError, Partitioner};
use relay_statsd::metric;
use thiserror::Error;
use tokio::time::Instant;

use crate::stats::RouteStats;
use crate::statsd::{RouteCounters, RouteDistributions, RouteTimers};

/// What caused a flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlushTrigger {
    /// The periodic flush interval elapsed.
    Ticker,
    /// The batch reached its maximum size.
    Size,
    /// The route is shutting down.
    Shutdown,
    /// An explicit flush request. Not issued by routes at the moment.
    Manual,
}

impl FlushTrigger {
    /// Returns the name used in metric tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Size => "size",
            Self::Shutdown => "shutdown",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed attempt to deliver a batch.
#[derive(Debug, Error)]
enum FlushError {
    #[error("failed to assign partitions")]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Produce(#[from] ProducerErrors),
}

/// Submits batches to the broker, retrying until they are fully acknowledged.
#[derive(Debug)]
pub(crate) struct FlushExecutor<C> {
    key: Arc<str>,
    client: C,
    topic: String,
    partitions: i32,
    partitioner: Partitioner,
    retry_interval: Duration,
    stats: Arc<RouteStats>,
}

impl<C: BrokerClient> FlushExecutor<C> {
    pub fn new(
        key: Arc<str>,
        client: C,
        topic: String,
        partitions: i32,
        partitioner: Partitioner,
        retry_interval: Duration,
        stats: Arc<RouteStats>,
    ) -> Self {
        Self {
            key,
            client,
            topic,
            partitions,
            partitioner,
            retry_interval,
            stats,
        }
    }

    /// Returns the broker client so it can be closed.
    pub fn into_client(self) -> C {
        self.client
    }

    /// Delivers the batch and clears it.
    ///
    /// Does not return before the brokers acknowledged every metric of the batch. Failed
    /// attempts are retried after the retry interval, indefinitely.
    pub async fn flush(&self, batch: &mut Vec<MetricData>, trigger: FlushTrigger) {
        let payloads = self.encode(batch);
        let count = payloads.len();
        let size: usize = payloads.iter().map(|(_, payload)| payload.len()).sum();

        loop {
            let start = Instant::now();
            let result = self.attempt(&payloads).await;
            let elapsed = start.elapsed();

            match result {
                Ok(()) => {
                    relay_log::debug!(
                        route = &*self.key,
                        "sent {count} metrics in {elapsed:?}, {size} bytes"
                    );
                    self.stats.add_delivered(count as u64);
                    metric!(
                        counter(RouteCounters::MetricsOut) += count as i64,
                        route = &*self.key
                    );
                    metric!(
                        timer(RouteTimers::FlushDuration) = elapsed,
                        route = &*self.key,
                        trigger = trigger.as_str()
                    );
                    metric!(
                        distribution(RouteDistributions::FlushSize) = size as u64,
                        route = &*self.key,
                        trigger = trigger.as_str()
                    );
                    batch.clear();
                    return;
                }
                Err(error) => {
                    if let FlushError::Produce(ref errors) = error {
                        for (kind, seen) in errors.by_kind() {
                            relay_log::warn!(route = &*self.key, "seen {seen} times: {kind}");
                        }
                    }

                    self.stats.inc_flush_errors();
                    metric!(
                        counter(RouteCounters::FlushErrors) += 1,
                        route = &*self.key
                    );
                    relay_log::warn!(
                        route = &*self.key,
                        error = &error as &dyn std::error::Error,
                        "failed to submit data, retrying in {:?} (attempt took {elapsed:?})",
                        self.retry_interval,
                    );
                }
            }

            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Submits all payloads as one batch.
    async fn attempt(&self, payloads: &[(&MetricData, Vec<u8>)]) -> Result<(), FlushError> {
        let records = self.records(payloads)?;
        self.client.send_batch(&self.topic, &records).await?;
        Ok(())
    }

    /// Serializes the batch. Metrics that cannot be serialized are skipped and counted.
    fn encode<'a>(&self, batch: &'a [MetricData]) -> Vec<(&'a MetricData, Vec<u8>)> {
        batch
            .iter()
            .filter_map(|metric| match metric.encode() {
                Ok(payload) => Some((metric, payload)),
                Err(error) => {
                    relay_log::error!(
                        route = &*self.key,
                        error = &error as &dyn std::error::Error,
                        metric = metric.id.as_str(),
                        "failed to encode metric, skipping",
                    );
                    self.stats.inc_decode_failed();
                    metric!(
                        counter(RouteCounters::MetricsDropped) += 1,
                        route = &*self.key,
                        reason = "invalid"
                    );
                    None
                }
            })
            .collect()
    }

    /// Assigns every payload to a partition of the topic.
    fn records(&self, payloads: &[(&MetricData, Vec<u8>)]) -> Result<Vec<Record>, PartitionError> {
        payloads
            .iter()
            .map(|(metric, payload)| {
                Ok(Record {
                    partition: self.partitioner.partition(metric, self.partitions)?,
                    payload: payload.clone(),
                })
            })
            .collect()
    }
}
