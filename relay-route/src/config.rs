//! Configuration of a Kafka metrics route.

use std::path::PathBuf;
use std::time::Duration;

use relay_kafka::{Compression, KafkaConfig, KafkaConfigParam};
use relay_metrics::{PartitionBy, SchemaError, Schemas, UnknownPartitionBy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::admission::AdmissionPolicy;
use crate::matcher::Matcher;

/// An error in the route configuration. A route with an invalid configuration never starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The Kafka producer configuration is invalid.
    #[error("invalid kafka configuration")]
    Kafka(#[from] relay_kafka::ConfigError),
    /// The partitioning strategy is not known.
    #[error("failed to initialize partitioner")]
    PartitionBy(#[from] UnknownPartitionBy),
    /// The matcher regex does not compile.
    #[error("invalid matcher expression")]
    Matcher(#[from] regex::Error),
    /// The storage schemas could not be loaded.
    #[error("failed to load storage schemas")]
    Schemas(#[from] SchemaError),
    /// Neither a schemas file nor inline schemas were configured.
    #[error("no storage schemas configured")]
    MissingSchemas,
    /// Both a schemas file and inline schemas were configured.
    #[error("both a schemas file and inline schemas are configured")]
    AmbiguousSchemas,
    /// The topic name is empty.
    #[error("no topic configured")]
    MissingTopic,
    /// A size or duration that must be positive is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Configuration of a [`KafkaMdmRoute`](crate::KafkaMdmRoute).
///
/// All fields except the brokers, the topic and the schemas have defaults:
///
/// ```yaml
/// brokers: ["kafka:9092"]
/// topic: mdm
/// schemas_file: /etc/carbon-relay/storage-schemas.conf
/// prefix: "servers."
/// blocking: true
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Only lines starting with this prefix are routed.
    pub prefix: String,
    /// Only lines containing this substring are routed.
    pub sub: String,
    /// Only lines matching this regular expression are routed.
    pub regex: String,
    /// Kafka broker endpoints in `host:port` form.
    pub brokers: Vec<String>,
    /// Topic to produce to.
    pub topic: String,
    /// Compression codec, one of `none`, `gzip` or `snappy`.
    pub codec: String,
    /// Partitioning strategy, one of `byOrg`, `bySeries`, `bySeriesWithTags` or
    /// `bySeriesWithTagsFnv`.
    pub partition_by: String,
    /// Path of a `storage-schemas.conf` file.
    pub schemas_file: Option<PathBuf>,
    /// Contents of a `storage-schemas.conf` file, as an alternative to `schemas_file`.
    pub schemas: Option<String>,
    /// Maximum number of lines waiting to be batched.
    ///
    /// Each line is about 100 bytes, so the default buffers about 1GB.
    pub buffer_size: usize,
    /// Wait for buffer capacity instead of dropping lines when the buffer is full.
    pub blocking: bool,
    /// Organization to publish metrics under.
    pub org_id: i32,
    /// Flush as soon as the batch holds this many metrics.
    pub flush_max_num: usize,
    /// Interval of the periodic flush in milliseconds.
    pub flush_max_wait_ms: u64,
    /// Timeout of a single broker request in milliseconds.
    pub timeout_ms: u64,
    /// Delay between two attempts of a failed flush in milliseconds.
    pub flush_retry_interval_ms: u64,
    /// Delay between two connection attempts in milliseconds.
    pub connect_retry_interval_ms: u64,
    /// Number of consecutive connection attempts before the route gives up.
    pub connect_max_attempts: u32,
    /// Raw librdkafka parameters applied on top of the defaults.
    pub kafka_params: Vec<KafkaConfigParam>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            sub: String::new(),
            regex: String::new(),
            brokers: Vec::new(),
            topic: String::new(),
            codec: Compression::default().to_string(),
            partition_by: PartitionBy::default().to_string(),
            schemas_file: None,
            schemas: None,
            buffer_size: 10_000_000,
            blocking: false,
            org_id: 1,
            flush_max_num: 10_000,
            flush_max_wait_ms: 500,
            timeout_ms: 2_000,
            flush_retry_interval_ms: 100,
            connect_retry_interval_ms: 1_000,
            connect_max_attempts: 300,
            kafka_params: Vec::new(),
        }
    }
}

impl RouteConfig {
    /// Returns the admission policy for full buffers.
    pub fn admission_policy(&self) -> AdmissionPolicy {
        if self.blocking {
            AdmissionPolicy::Blocking
        } else {
            AdmissionPolicy::DropOnFull
        }
    }

    /// Returns the interval of the periodic flush.
    pub fn flush_max_wait(&self) -> Duration {
        Duration::from_millis(self.flush_max_wait_ms)
    }

    /// Returns the delay between two attempts of a failed flush.
    pub fn flush_retry_interval(&self) -> Duration {
        Duration::from_millis(self.flush_retry_interval_ms)
    }

    /// Returns the delay between two connection attempts.
    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }

    /// Builds the route matcher.
    pub fn matcher(&self) -> Result<Matcher, ConfigError> {
        Ok(Matcher::new(&self.prefix, &self.sub, &self.regex)?)
    }

    /// Resolves the partitioning strategy.
    pub fn partition_by(&self) -> Result<PartitionBy, ConfigError> {
        Ok(self.partition_by.parse()?)
    }

    /// Loads the storage schemas from the configured source.
    pub fn load_schemas(&self) -> Result<Schemas, ConfigError> {
        let schemas = match (&self.schemas_file, &self.schemas) {
            (Some(path), None) => Schemas::from_file(path)?,
            (None, Some(source)) => Schemas::parse(source)?,
            (None, None) => return Err(ConfigError::MissingSchemas),
            (Some(_), Some(_)) => return Err(ConfigError::AmbiguousSchemas),
        };
        Ok(schemas)
    }

    /// Builds the Kafka producer configuration.
    pub fn kafka_config(&self) -> Result<KafkaConfig, ConfigError> {
        let config = KafkaConfig {
            brokers: self.brokers.clone(),
            compression: self.codec.parse()?,
            timeout: Duration::from_millis(self.timeout_ms),
            params: self.kafka_params.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the sizes and intervals of the route.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.is_empty() {
            return Err(ConfigError::MissingTopic);
        }

        let positive = [
            ("buffer_size", self.buffer_size as u64),
            ("flush_max_num", self.flush_max_num as u64),
            ("flush_max_wait_ms", self.flush_max_wait_ms),
            ("timeout_ms", self.timeout_ms),
            ("connect_max_attempts", u64::from(self.connect_max_attempts)),
        ];
        if let Some((name, _)) = positive.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(name));
        }

        Ok(())
    }
}
