use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use relay_kafka::{BrokerClient, Connector, KafkaConnector};
use relay_metrics::{Partitioner, Schemas};
use relay_statsd::metric;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};

use crate::accumulator::Accumulator;
use crate::admission::Gate;
use crate::bootstrap::{BootstrapError, Bootstrapper, ConnectionState};
use crate::config::{ConfigError, RouteConfig};
use crate::flush::FlushExecutor;
use crate::matcher::Matcher;
use crate::stats::RouteStats;
use crate::statsd::{RouteCounters, RouteGauges};

/// A fatal error of a running route.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The broker connection could not be established.
    #[error("failed to bootstrap kafka connection")]
    Bootstrap(#[from] BootstrapError),
    /// The background task panicked or was cancelled.
    #[error("route task terminated unexpectedly")]
    Terminated(#[from] JoinError),
}

/// Counters and state of a route at one point in time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RouteSnapshot {
    /// The route key.
    pub key: String,
    /// Capacity of the buffer.
    pub buffer_size: usize,
    /// Lines currently waiting in the buffer.
    pub buffered: u64,
    /// Lines dropped because the buffer was full.
    pub dropped_queue_full: u64,
    /// Lines that could not be decoded or encoded.
    pub decode_failed: u64,
    /// Metrics acknowledged by the brokers.
    pub delivered: u64,
    /// Failed flush attempts.
    pub flush_errors: u64,
    /// Lines thrown away with the buffer after the route failed to connect.
    pub discarded: u64,
    /// The connection state.
    pub state: ConnectionState,
}

/// Everything the background task needs, resolved from a valid [`RouteConfig`].
struct Pipeline {
    key: Arc<str>,
    config: RouteConfig,
    schemas: Schemas,
    partitioner: Partitioner,
    stats: Arc<RouteStats>,
}

/// A route forwarding carbon lines to a Kafka topic as MessagePack encoded metrics.
///
/// Lines submitted with [`dispatch`](Self::dispatch) are buffered and decoded by a background
/// task, which batches them and produces each batch to the topic. A batch is flushed when it
/// reaches `flush_max_num` metrics and every `flush_max_wait_ms`. Failed flushes are retried until
/// the brokers acknowledge the whole batch.
///
/// The background task first connects to the brokers. Lines submitted before the connection is
/// established wait in the buffer.
#[derive(Debug)]
pub struct KafkaMdmRoute {
    key: Arc<str>,
    matcher: Matcher,
    buffer_size: usize,
    gate: Gate,
    stats: Arc<RouteStats>,
    state: watch::Receiver<ConnectionState>,
    task: Mutex<Option<JoinHandle<Result<(), RouteError>>>>,
}

impl KafkaMdmRoute {
    /// Creates a route producing to Kafka with the configured brokers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn kafka(key: impl Into<String>, config: RouteConfig) -> Result<Self, ConfigError> {
        let connector = KafkaConnector::new(config.kafka_config()?);
        Self::new(key, config, connector)
    }

    /// Creates a route and starts its background task.
    ///
    /// Returns immediately. The connection is established in the background, see
    /// [`wait_ready`](Self::wait_ready). Must be called from within a tokio runtime.
    pub fn new<C: Connector>(
        key: impl Into<String>,
        config: RouteConfig,
        connector: C,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        config.kafka_config()?;
        let matcher = config.matcher()?;
        let partitioner = Partitioner::new(config.partition_by()?);
        let schemas = config.load_schemas()?;

        let key: Arc<str> = key.into().into();
        let stats = Arc::<RouteStats>::default();
        let buffer_size = config.buffer_size;

        let (gate, rx) = Gate::new(
            key.clone(),
            config.admission_policy(),
            buffer_size,
            stats.clone(),
        );
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);

        let pipeline = Pipeline {
            key: key.clone(),
            config,
            schemas,
            partitioner,
            stats: stats.clone(),
        };
        let task = tokio::spawn(run(pipeline, connector, rx, state_tx));

        Ok(Self {
            key,
            matcher,
            buffer_size,
            gate,
            stats,
            state,
            task: Mutex::new(Some(task)),
        })
    }

    /// Returns the route key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns `true` if the line belongs on this route.
    pub fn matches(&self, line: &[u8]) -> bool {
        self.matcher.matches(line)
    }

    /// Submits a line to the route.
    ///
    /// With the blocking policy this waits until the buffer has capacity, otherwise lines
    /// submitted to a full buffer are dropped and counted. Lines submitted after
    /// [`shutdown`](Self::shutdown) are discarded.
    pub async fn dispatch(&self, line: impl Into<Bytes>) {
        self.gate.submit(line.into()).await;
    }

    /// Explicit flush requests are not supported, batches are flushed by size and time only.
    pub fn flush(&self) -> Result<(), RouteError> {
        Ok(())
    }

    /// Stops accepting lines, flushes the remaining batch and closes the broker connection.
    ///
    /// Dispatches still waiting for buffer capacity return without admitting their line.
    /// Waits until the background task terminated. A flush that keeps failing delays the
    /// shutdown indefinitely. Returns the fatal error of the route, if any. Subsequent calls
    /// return immediately.
    pub async fn shutdown(&self) -> Result<(), RouteError> {
        self.gate.close();

        let Some(task) = self.task.lock().take() else {
            return Ok(());
        };

        task.await?
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Waits until the route is connected or failed to connect and returns the state.
    pub async fn wait_ready(&self) -> ConnectionState {
        let mut state = self.state.clone();
        let result = state
            .wait_for(|state| matches!(state, ConnectionState::Ready | ConnectionState::Fatal))
            .await
            .map(|state| *state);

        // The task ended before it connected.
        result.unwrap_or_else(|_| *state.borrow())
    }

    /// Returns the current counters of the route.
    pub fn snapshot(&self) -> RouteSnapshot {
        RouteSnapshot {
            key: self.key.to_string(),
            buffer_size: self.buffer_size,
            buffered: self.stats.buffered(),
            dropped_queue_full: self.stats.dropped_queue_full(),
            decode_failed: self.stats.decode_failed(),
            delivered: self.stats.delivered(),
            flush_errors: self.stats.flush_errors(),
            discarded: self.stats.discarded(),
            state: self.state(),
        }
    }
}

/// The background task of a route: connects, then batches and flushes until the buffer closes.
async fn run<C: Connector>(
    pipeline: Pipeline,
    connector: C,
    rx: mpsc::Receiver<Bytes>,
    state: watch::Sender<ConnectionState>,
) -> Result<(), RouteError> {
    let Pipeline {
        key,
        config,
        schemas,
        partitioner,
        stats,
    } = pipeline;

    metric!(
        gauge(RouteGauges::BufferSize) = config.buffer_size as u64,
        route = &*key
    );

    let bootstrapper = Bootstrapper {
        key: &key,
        topic: &config.topic,
        retry_interval: config.connect_retry_interval(),
        max_attempts: config.connect_max_attempts,
        state: &state,
    };

    let connection = match bootstrapper.run(&connector).await {
        Ok(connection) => connection,
        Err(error) => {
            // No more lines can be admitted once the receiver is gone.
            drop(rx);
            let discarded = stats.take_buffered();
            stats.add_discarded(discarded);
            state.send_replace(ConnectionState::Fatal);

            metric!(
                counter(RouteCounters::MetricsDropped) += discarded as i64,
                route = &*key,
                reason = "fatal"
            );
            relay_log::error!(
                route = &*key,
                error = &error as &dyn std::error::Error,
                "route failed to connect and stopped, {discarded} lines are discarded",
            );
            return Err(error.into());
        }
    };

    relay_log::info!(
        route = &*key,
        "now connected to kafka, topic {} has {} partitions",
        config.topic,
        connection.partitions,
    );
    state.send_replace(ConnectionState::Ready);

    let executor = FlushExecutor::new(
        key.clone(),
        connection.client,
        config.topic.clone(),
        connection.partitions,
        partitioner,
        config.flush_retry_interval(),
        stats.clone(),
    );
    let accumulator = Accumulator::new(
        key.clone(),
        rx,
        schemas,
        config.org_id,
        config.flush_max_num,
        config.flush_max_wait(),
        executor,
        stats,
    );

    let executor = accumulator.run().await;
    executor.into_client().close().await;
    state.send_replace(ConnectionState::Disconnected);

    relay_log::info!(route = &*key, "route shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use relay_metrics::{MetricData, PartitionBy};
    use relay_test::{ConnectFailure, MockBroker};
    use tokio::time::Instant;

    use super::*;

    fn config() -> RouteConfig {
        RouteConfig {
            brokers: vec!["kafka:9092".to_owned()],
            topic: "mdm".to_owned(),
            schemas: Some("[default]\npattern = .*\nretentions = 10s:1d\n".to_owned()),
            buffer_size: 100,
            flush_max_num: 10,
            ..Default::default()
        }
    }

    fn decode(broker: &MockBroker) -> Vec<MetricData> {
        broker
            .batches()
            .iter()
            .flat_map(|batch| &batch.records)
            .map(|record| rmp_serde::from_slice(&record.payload).unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_conservation() {
        relay_test::setup();
        let broker = MockBroker::new(4);
        broker.hold();

        let config = RouteConfig {
            buffer_size: 5,
            ..config()
        };
        let route = KafkaMdmRoute::new("kafka", config, broker.clone()).unwrap();

        let lines = [
            "a 1 100", "b 1 100", "c 1 100", "garbage", "d 1 100", "e 1 100", "f 1 100",
            "g 1 100", "h", "i 1 100",
        ];
        for line in lines {
            route.dispatch(line).await;
        }

        broker.release();
        route.shutdown().await.unwrap();

        let snapshot = route.snapshot();
        assert_eq!(snapshot.dropped_queue_full, 5);
        assert_eq!(snapshot.decode_failed, 1);
        assert_eq!(snapshot.delivered, 4);
        assert_eq!(
            snapshot.delivered + snapshot.dropped_queue_full + snapshot.decode_failed,
            lines.len() as u64
        );
        assert_eq!(broker.delivered(), 4);
        assert_eq!(snapshot.buffered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_by_size() {
        let broker = MockBroker::new(4);
        let config = RouteConfig {
            flush_max_num: 3,
            flush_max_wait_ms: 10_000,
            ..config()
        };
        let route = KafkaMdmRoute::new("kafka", config, broker.clone()).unwrap();
        let start = Instant::now();

        for line in ["a 1 100", "b 1 100", "c 1 100"] {
            route.dispatch(line).await;
        }

        broker.wait_for_batches(1).await;
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(broker.batches()[0].records.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_by_time() {
        let broker = MockBroker::new(4);
        let route = KafkaMdmRoute::new("kafka", config(), broker.clone()).unwrap();
        let start = Instant::now();

        route.dispatch("a 1 100").await;
        route.dispatch("b 1 100").await;

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(broker.batches().is_empty());

        broker.wait_for_batches(1).await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));
        assert_eq!(broker.batches()[0].records.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_on_full() {
        let broker = MockBroker::new(4);
        broker.hold();

        let config = RouteConfig {
            buffer_size: 4,
            ..config()
        };
        let route = KafkaMdmRoute::new("kafka", config, broker.clone()).unwrap();

        for i in 0..6 {
            route.dispatch(format!("a.{i} 1 100")).await;
        }

        let snapshot = route.snapshot();
        assert_eq!(snapshot.dropped_queue_full, 2);
        assert_eq!(snapshot.buffered, 4);

        broker.release();
        route.shutdown().await.unwrap();
        assert_eq!(broker.delivered(), 4);
        assert_eq!(route.snapshot().buffered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_waits_for_consumer() {
        let broker = MockBroker::new(4);
        broker.hold();

        let config = RouteConfig {
            buffer_size: 1,
            blocking: true,
            ..config()
        };
        let route = Arc::new(KafkaMdmRoute::new("kafka", config, broker.clone()).unwrap());
        route.dispatch("a 1 100").await;

        let pending = tokio::spawn({
            let route = route.clone();
            async move { route.dispatch("b 1 100").await }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!pending.is_finished());
        assert_eq!(route.snapshot().buffered, 1);

        broker.release();
        pending.await.unwrap();

        route.shutdown().await.unwrap();
        assert_eq!(broker.delivered(), 2);
        assert_eq!(route.snapshot().dropped_queue_full, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_retries() {
        relay_test::setup();
        let broker = MockBroker::new(4);
        broker.fail_sends(3);

        let route = KafkaMdmRoute::new("kafka", config(), broker.clone()).unwrap();
        for line in ["a 1 100", "b 2 100", "c;dc=ams 3 100"] {
            route.dispatch(line).await;
        }

        broker.wait_for_batches(1).await;

        let attempts = broker.send_attempts();
        assert_eq!(attempts.len(), 4);
        for pair in attempts.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_millis(100));
        }
        assert_eq!(route.snapshot().flush_errors, 3);

        let delivered = decode(&broker);
        let names: Vec<_> = delivered.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(delivered[2].tags, ["dc=ams"]);
        assert_eq!(delivered[1].value, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_fills_while_flush_retries() {
        relay_test::setup();
        let broker = MockBroker::new(4);
        broker.fail_sends(3);

        let config = RouteConfig {
            buffer_size: 3,
            flush_max_num: 1,
            ..config()
        };
        let route = KafkaMdmRoute::new("kafka", config, broker.clone()).unwrap();
        let start = Instant::now();

        route.dispatch("a 1 100").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(route.snapshot().buffered, 0);
        assert_eq!(route.snapshot().flush_errors, 1);

        for line in ["b 1 100", "c 1 100", "d 1 100", "e 1 100"] {
            route.dispatch(line).await;
        }

        let snapshot = route.snapshot();
        assert_eq!(snapshot.buffered, 3);
        assert_eq!(snapshot.dropped_queue_full, 1);

        // Still retrying the first batch, nothing else is flushed in between.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let snapshot = route.snapshot();
        assert_eq!(snapshot.buffered, 3);
        assert_eq!(snapshot.flush_errors, 3);
        assert!(broker.batches().is_empty());

        broker.wait_for_batches(4).await;
        let attempts = broker.send_attempts();
        assert_eq!(attempts.len(), 7);
        assert_eq!(attempts[3] - start, Duration::from_millis(300));
        assert!(broker.batches().iter().all(|batch| batch.records.len() == 1));

        let names: Vec<_> = decode(&broker).into_iter().map(|m| m.name).collect();
        assert_eq!(names, ["a", "b", "c", "d"]);

        let snapshot = route.snapshot();
        assert_eq!(snapshot.delivered, 4);
        assert_eq!(snapshot.buffered, 0);
        assert_eq!(snapshot.flush_errors, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_buffer_scenario() {
        let broker = MockBroker::new(4);
        let config = RouteConfig {
            buffer_size: 2,
            flush_max_num: 10,
            ..config()
        };
        let route = KafkaMdmRoute::new("kafka", config, broker.clone()).unwrap();

        route.dispatch("a 1 100").await;
        route.dispatch("b 1 100").await;
        route.dispatch("c 1 100").await;

        let snapshot = route.snapshot();
        assert_eq!(snapshot.dropped_queue_full, 1);
        assert_eq!(snapshot.buffered, 2);

        broker.wait_for_batches(1).await;
        assert_eq!(broker.batches()[0].records.len(), 2);
        assert_eq!(route.snapshot().buffered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_buffered() {
        let broker = MockBroker::new(4);
        let route = KafkaMdmRoute::new("kafka", config(), broker.clone()).unwrap();
        let start = Instant::now();

        route.dispatch("a 1 100").await;
        route.shutdown().await.unwrap();

        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(broker.batches().len(), 1);
        assert_eq!(decode(&broker)[0].name, "a");
        assert_eq!(broker.closed(), 1);
        assert_eq!(route.state(), ConnectionState::Disconnected);

        // Later lines and shutdowns have no effect.
        route.dispatch("b 1 100").await;
        route.shutdown().await.unwrap();
        assert_eq!(broker.batches().len(), 1);
        assert_eq!(broker.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_series_same_partition() {
        let broker = MockBroker::new(16);
        let config = RouteConfig {
            flush_max_num: 2,
            partition_by: "bySeriesWithTags".to_owned(),
            ..config()
        };
        let route = KafkaMdmRoute::new("kafka", config, broker.clone()).unwrap();

        for line in ["a;x=1 1 100", "b 1 100", "a;x=1 2 110", "b 2 110"] {
            route.dispatch(line).await;
        }
        broker.wait_for_batches(2).await;

        let batches = broker.batches();
        assert_eq!(batches[0].records[0].partition, batches[1].records[0].partition);
        assert_eq!(batches[0].records[1].partition, batches[1].records[1].partition);

        let partitioner = Partitioner::new(PartitionBy::BySeriesWithTags);
        let delivered = decode(&broker);
        assert_eq!(
            batches[0].records[0].partition,
            partitioner.partition(&delivered[0], 16).unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_retries() {
        let broker = MockBroker::new(4).with_connect_failure(ConnectFailure::OutOfBrokers(2));
        let route = KafkaMdmRoute::new("kafka", config(), broker.clone()).unwrap();
        let start = Instant::now();

        route.dispatch("a 1 100").await;
        assert_eq!(route.wait_ready().await, ConnectionState::Ready);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(broker.connect_attempts(), 3);

        route.shutdown().await.unwrap();
        assert_eq!(broker.delivered(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_gives_up() {
        relay_test::setup();
        let broker =
            MockBroker::new(4).with_connect_failure(ConnectFailure::OutOfBrokers(usize::MAX));
        let config = RouteConfig {
            connect_max_attempts: 3,
            ..config()
        };
        let route = KafkaMdmRoute::new("kafka", config, broker.clone()).unwrap();

        route.dispatch("a 1 100").await;
        route.dispatch("b 1 100").await;
        assert_eq!(route.snapshot().buffered, 2);

        assert_eq!(route.wait_ready().await, ConnectionState::Fatal);
        assert_eq!(broker.connect_attempts(), 3);

        let error = route.shutdown().await.unwrap_err();
        assert!(matches!(
            error,
            RouteError::Bootstrap(BootstrapError::OutOfBrokers { attempts: 3, .. })
        ));

        let snapshot = route.snapshot();
        assert_eq!(snapshot.buffered, 0);
        assert_eq!(snapshot.discarded, 2);
        assert_eq!(snapshot.delivered, 0);

        // The buffer is gone, lines are discarded.
        route.dispatch("c 1 100").await;
        assert_eq!(route.snapshot().buffered, 0);
        assert_eq!(route.snapshot().discarded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_connection_is_fatal() {
        let broker = MockBroker::new(4).with_connect_failure(ConnectFailure::Rejected);
        let route = KafkaMdmRoute::new("kafka", config(), broker.clone()).unwrap();

        assert_eq!(route.wait_ready().await, ConnectionState::Fatal);
        assert!(matches!(
            route.shutdown().await,
            Err(RouteError::Bootstrap(BootstrapError::Connect(_)))
        ));
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let new = |config| KafkaMdmRoute::new("kafka", config, MockBroker::new(4));

        let error = new(RouteConfig {
            codec: "lz4".to_owned(),
            ..config()
        })
        .unwrap_err();
        assert!(matches!(error, ConfigError::Kafka(_)));

        let error = new(RouteConfig {
            partition_by: "byMetric".to_owned(),
            ..config()
        })
        .unwrap_err();
        assert!(matches!(error, ConfigError::PartitionBy(_)));

        let error = new(RouteConfig {
            regex: "(".to_owned(),
            ..config()
        })
        .unwrap_err();
        assert!(matches!(error, ConfigError::Matcher(_)));

        let error = new(RouteConfig {
            schemas: None,
            ..config()
        })
        .unwrap_err();
        assert!(matches!(error, ConfigError::MissingSchemas));
    }

    #[tokio::test]
    async fn test_matches() {
        let config = RouteConfig {
            prefix: "servers.".to_owned(),
            ..config()
        };
        let route = KafkaMdmRoute::new("kafka", config, MockBroker::new(4)).unwrap();

        assert!(route.matches(b"servers.cpu 1 100"));
        assert!(!route.matches(b"hosts.cpu 1 100"));
        assert!(route.flush().is_ok());
        assert_eq!(route.key(), "kafka");
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot() {
        let broker = MockBroker::new(4);
        let route = KafkaMdmRoute::new("kafka", config(), broker.clone()).unwrap();

        route.dispatch("a 1 100").await;
        route.dispatch("invalid").await;
        route.wait_ready().await;
        broker.wait_for_batches(1).await;

        insta::assert_json_snapshot!(route.snapshot(), @r#"
        {
          "key": "kafka",
          "buffer_size": 100,
          "buffered": 0,
          "dropped_queue_full": 0,
          "decode_failed": 1,
          "delivered": 1,
          "flush_errors": 0,
          "discarded": 0,
          "state": "ready"
        }
        "#);
    }

    #[test]
    fn test_route_metrics() {
        let captures = relay_statsd::with_capturing_test_client(|| {
            tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap()
                .block_on(async {
                    let broker = MockBroker::new(4);
                    broker.hold();
                    let config = RouteConfig {
                        buffer_size: 1,
                        ..config()
                    };
                    let route = KafkaMdmRoute::new("kafka", config, broker.clone()).unwrap();

                    route.dispatch("a 1 100").await;
                    route.dispatch("b 1 100").await;
                    broker.release();
                    route.shutdown().await.unwrap();
                })
        });

        assert_eq!(
            captures[..3],
            [
                "route.metrics.dropped:1|c|#route:kafka,reason:queue_full",
                "route.buffer_size:1|g|#route:kafka",
                "route.metrics.out:1|c|#route:kafka",
            ]
        );
        assert!(captures[3].starts_with("route.flush.duration:"));
        assert!(captures[3].ends_with("|d|#route:kafka,trigger:shutdown"));
        assert!(captures[4].starts_with("route.flush.size:"));
        assert!(captures[4].ends_with("|d|#route:kafka,trigger:shutdown"));
        assert_eq!(captures.len(), 5);
    }
}
