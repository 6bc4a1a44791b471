//! Kafka-related functionality.
//!
//! This crate provides the configuration of the Kafka producer used by the metrics routes and
//! the [`KafkaConnector`], which establishes a [`KafkaClient`] to produce batches of records to
//! explicit partitions of a topic.
//!
//! # Usage
//!
//! ```no_run
//! # async fn produce() -> Result<(), Box<dyn std::error::Error>> {
//! use std::time::Duration;
//!
//! use relay_kafka::{BrokerClient, Compression, Connector, KafkaConfig, KafkaConnector, Record};
//!
//! let config = KafkaConfig {
//!     brokers: vec!["localhost:9092".to_owned()],
//!     compression: Compression::Snappy,
//!     timeout: Duration::from_secs(2),
//!     params: Vec::new(),
//! };
//!
//! let client = KafkaConnector::new(config).connect().await?;
//! let partitions = client.partition_count("mdm").await?;
//!
//! let records = [Record {
//!     partition: 0 % partitions,
//!     payload: b"...".to_vec(),
//! }];
//! client.send_batch("mdm", &records).await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod client;
mod config;
mod producer;
mod statsd;

pub use client::*;
pub use config::*;
pub use producer::*;

#[doc(no_inline)]
pub use rdkafka::error::{KafkaError, RDKafkaErrorCode};
