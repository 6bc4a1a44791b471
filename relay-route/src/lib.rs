//! A metrics relay route producing carbon metrics to Kafka.
//!
//! The [`KafkaMdmRoute`] accepts carbon plaintext lines from any number of callers and forwards
//! them to a Kafka topic as MessagePack encoded metric records:
//!
//! ```text
//! dispatch ──▶ bounded buffer ──▶ accumulator ──▶ flush executor ──▶ kafka
//! ```
//!
//!  - The admission gate feeds lines into a bounded buffer. A full buffer either blocks the
//!    caller or drops the line, depending on the configured [`AdmissionPolicy`].
//!  - A single background task decodes lines into a batch and flushes it when it reaches
//!    `flush_max_num` metrics or the periodic `flush_max_wait_ms` elapses.
//!  - A flush is retried until the brokers acknowledge the entire batch. While a flush is
//!    pending, lines keep accumulating in the buffer.
//!  - Before any flush, the task connects to the brokers and reads the partition count of the
//!    topic. If no broker is reachable, it retries for a bounded number of attempts.
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use relay_route::{KafkaMdmRoute, RouteConfig};
//!
//! let config = RouteConfig {
//!     brokers: vec!["localhost:9092".to_owned()],
//!     topic: "mdm".to_owned(),
//!     schemas_file: Some("/etc/carbon-relay/storage-schemas.conf".into()),
//!     ..Default::default()
//! };
//!
//! let route = KafkaMdmRoute::kafka("kafka-mdm", config)?;
//! let line = b"servers.web-1.cpu.user 42.5 1700000000";
//! if route.matches(line) {
//!     route.dispatch(line.to_vec()).await;
//! }
//! route.shutdown().await?;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]

mod accumulator;
mod admission;
mod bootstrap;
mod config;
mod flush;
mod matcher;
mod route;
mod stats;
mod statsd;

pub use admission::AdmissionPolicy;
pub use bootstrap::{BootstrapError, ConnectionState};
pub use config::*;
pub use flush::FlushTrigger;
pub use matcher::Matcher;
pub use route::*;
