//! Helpers for testing routes and their broker interaction.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output is
//!    captured by the test runner. All logs emitted with [`relay_log`] will show up for test
//!    failures or when run with `--nocapture`.
//!  - Use [`MockBroker`] in place of a Kafka connector. It records every delivered batch and can
//!    be scripted to fail connections and sends.
//!
//! # Example
//!
//! ```no_run
//! #[test]
//! fn my_test() {
//!     relay_test::setup();
//!
//!     relay_log::debug!("hello, world!");
//! }
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use relay_kafka::{
    BrokerClient, ClientError, Connector, KafkaError, ProduceError, ProducerErrors,
    RDKafkaErrorCode, Record,
};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from this crate and mutes all other logs.
pub fn setup() {
    relay_log::init_test!();
}

/// A batch delivered to the [`MockBroker`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    /// The topic the batch was produced to.
    pub topic: String,
    /// The records in submission order.
    pub records: Vec<Record>,
}

/// How connection attempts to the [`MockBroker`] fail.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Connections succeed.
    #[default]
    None,
    /// The first `n` connections fail because no broker is reachable.
    OutOfBrokers(usize),
    /// All connections fail with a non-retryable error.
    Rejected,
}

#[derive(Debug, Default)]
struct State {
    partitions: i32,
    connect_failure: ConnectFailure,
    metadata_failure: bool,
    send_failures: usize,
    connect_attempts: usize,
    send_attempts: Vec<Instant>,
    batches: Vec<Batch>,
    closed: usize,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    delivered: Notify,
    open: watch::Sender<bool>,
}

/// An in-memory broker cluster implementing [`Connector`] and [`BrokerClient`].
///
/// Clones share their state, so a test keeps one handle while the route owns another.
#[derive(Clone, Debug)]
pub struct MockBroker {
    inner: Arc<Inner>,
}

impl MockBroker {
    /// Creates a healthy broker with a topic of `partitions` partitions.
    pub fn new(partitions: i32) -> Self {
        let state = State {
            partitions,
            ..Default::default()
        };

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                delivered: Notify::new(),
                open: watch::Sender::new(true),
            }),
        }
    }

    /// Scripts how connection attempts fail.
    pub fn with_connect_failure(self, failure: ConnectFailure) -> Self {
        self.inner.state.lock().connect_failure = failure;
        self
    }

    /// Makes every partition lookup fail.
    pub fn with_metadata_failure(self) -> Self {
        self.inner.state.lock().metadata_failure = true;
        self
    }

    /// Makes the next `n` batch submissions fail.
    pub fn fail_sends(&self, n: usize) {
        self.inner.state.lock().send_failures = n;
    }

    /// Suspends connection attempts until [`release`](Self::release) is called.
    pub fn hold(&self) {
        self.inner.open.send_replace(false);
    }

    /// Lets held connection attempts proceed.
    pub fn release(&self) {
        self.inner.open.send_replace(true);
    }

    /// Returns the number of connection attempts so far.
    pub fn connect_attempts(&self) -> usize {
        self.inner.state.lock().connect_attempts
    }

    /// Returns the start time of every batch submission, including failed ones.
    pub fn send_attempts(&self) -> Vec<Instant> {
        self.inner.state.lock().send_attempts.clone()
    }

    /// Returns all successfully delivered batches.
    pub fn batches(&self) -> Vec<Batch> {
        self.inner.state.lock().batches.clone()
    }

    /// Returns the total number of delivered records.
    pub fn delivered(&self) -> usize {
        self.inner
            .state
            .lock()
            .batches
            .iter()
            .map(|batch| batch.records.len())
            .sum()
    }

    /// Returns how often a client was closed.
    pub fn closed(&self) -> usize {
        self.inner.state.lock().closed
    }

    /// Waits until at least `n` batches were delivered.
    pub async fn wait_for_batches(&self, n: usize) {
        loop {
            let notified = self.inner.delivered.notified();
            if self.inner.state.lock().batches.len() >= n {
                return;
            }
            notified.await;
        }
    }
}

impl Connector for MockBroker {
    type Client = Self;

    async fn connect(&self) -> Result<Self, ClientError> {
        let mut open = self.inner.open.subscribe();
        open.wait_for(|open| *open)
            .await
            .map_err(|_| ClientError::Interrupted)?;

        let mut state = self.inner.state.lock();
        state.connect_attempts += 1;

        match state.connect_failure {
            ConnectFailure::None => Ok(self.clone()),
            ConnectFailure::OutOfBrokers(remaining) if remaining > 0 => {
                state.connect_failure = ConnectFailure::OutOfBrokers(remaining - 1);
                Err(ClientError::OutOfBrokers(KafkaError::MetadataFetch(
                    RDKafkaErrorCode::AllBrokersDown,
                )))
            }
            ConnectFailure::OutOfBrokers(_) => Ok(self.clone()),
            ConnectFailure::Rejected => Err(ClientError::Connect(KafkaError::MetadataFetch(
                RDKafkaErrorCode::SaslAuthenticationFailed,
            ))),
        }
    }
}

impl BrokerClient for MockBroker {
    async fn partition_count(&self, topic: &str) -> Result<i32, ClientError> {
        let state = self.inner.state.lock();
        if state.metadata_failure {
            return Err(ClientError::UnknownTopic(topic.to_owned()));
        }
        Ok(state.partitions)
    }

    async fn send_batch(&self, topic: &str, records: &[Record]) -> Result<(), ProducerErrors> {
        let mut state = self.inner.state.lock();
        state.send_attempts.push(Instant::now());

        if state.send_failures > 0 {
            state.send_failures -= 1;
            let errors = records
                .iter()
                .enumerate()
                .map(|(index, record)| ProduceError {
                    index,
                    partition: record.partition,
                    error: KafkaError::MessageProduction(if index % 2 == 0 {
                        RDKafkaErrorCode::NotEnoughReplicas
                    } else {
                        RDKafkaErrorCode::MessageTimedOut
                    }),
                })
                .collect();
            return Err(ProducerErrors::new(errors, records.len()));
        }

        state.batches.push(Batch {
            topic: topic.to_owned(),
            records: records.to_vec(),
        });
        drop(state);

        self.inner.delivered.notify_waiters();
        Ok(())
    }

    async fn close(self) {
        self.inner.state.lock().closed += 1;
    }
}
