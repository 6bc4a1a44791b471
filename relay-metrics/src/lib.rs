//! Metric data protocol for the Kafka metrics routes.
//!
//! Metrics arrive as carbon plaintext lines, `name value timestamp`, and are decoded into
//! [`MetricData`] records. The name may carry tags separated by `;`:
//!
//! ```text
//! servers.web-1.cpu.user 42.5 1700000000
//! servers.cpu.user;host=web-1;dc=ams 42.5 1700000000
//! ```
//!
//! Decoding needs a set of storage [`Schemas`], which determine the interval of the series. The
//! record's identity is derived from its name, tags and interval and is used by the
//! [`Partitioner`] to assign the record to a stable Kafka partition.
//!
//! # Example
//!
//! ```
//! use relay_metrics::{PartitionBy, Partitioner, Schemas, parse_metric};
//!
//! let schemas = Schemas::parse("[default]\npattern = .*\nretentions = 10s:1d\n").unwrap();
//! let metric = parse_metric(b"servers.cpu.user 42.5 1700000000", &schemas, 1).unwrap();
//! assert_eq!(metric.interval, 10);
//!
//! let partitioner = Partitioner::new(PartitionBy::BySeries);
//! let partition = partitioner.partition(&metric, 8).unwrap();
//! assert!((0..8).contains(&partition));
//! ```
#![warn(missing_docs)]

mod parse;
mod partition;
mod protocol;
mod schemas;

pub use parse::*;
pub use partition::*;
pub use protocol::*;
pub use schemas::*;
