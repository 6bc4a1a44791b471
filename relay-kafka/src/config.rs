//! Configuration primitives to configure the kafka producer and properly set up the connection.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of times librdkafka retries to produce a single message before reporting a failure.
const MESSAGE_SEND_MAX_RETRIES: &str = "10";

/// Kafka configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The compression codec is not one of `none`, `gzip` or `snappy`.
    #[error("unknown compression codec {0:?}")]
    UnknownCompression(String),
    /// No broker endpoints were configured.
    #[error("at least one kafka broker must be configured")]
    NoBrokers,
}

/// Compression codec applied to produced message sets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Compression {
    /// No compression.
    None,
    /// Gzip compression.
    Gzip,
    /// Snappy compression.
    #[default]
    Snappy,
}

impl Compression {
    /// Returns the name of the codec as understood by librdkafka.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "snappy" => Ok(Self::Snappy),
            other => Err(ConfigError::UnknownCompression(other.to_owned())),
        }
    }
}

impl TryFrom<String> for Compression {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Compression> for String {
    fn from(value: Compression) -> Self {
        value.as_str().to_owned()
    }
}

/// A name value pair of Kafka config parameter.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct KafkaConfigParam {
    /// Name of the Kafka config parameter.
    pub name: String,
    /// Value of the Kafka config parameter.
    pub value: String,
}

/// Config for creating a Kafka producer.
///
/// The producer always waits for all in-sync replicas to acknowledge a message. Additional
/// librdkafka parameters can be passed through [`params`](Self::params), they are applied last and
/// may override the defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KafkaConfig {
    /// Broker endpoints used to bootstrap the connection, in `host:port` form.
    pub brokers: Vec<String>,
    /// Compression codec for produced message sets.
    pub compression: Compression,
    /// Timeout of a single request to the broker.
    pub timeout: Duration,
    /// Raw parameters for the Kafka producer configuration.
    pub params: Vec<KafkaConfigParam>,
}

impl KafkaConfig {
    /// Checks that the configuration can be used to create a producer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.iter().all(|broker| broker.trim().is_empty()) {
            return Err(ConfigError::NoBrokers);
        }
        Ok(())
    }

    /// Returns the librdkafka client configuration.
    pub fn client_config(&self) -> ClientConfig {
        let timeout_ms = self.timeout.as_millis().max(1).to_string();

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", self.brokers.join(","))
            // Wait for all in-sync replicas to ack the message.
            .set("acks", "all")
            .set("message.send.max.retries", MESSAGE_SEND_MAX_RETRIES)
            .set("compression.codec", self.compression.as_str())
            .set("request.timeout.ms", &timeout_ms)
            .set("message.timeout.ms", &timeout_ms);

        for config_p in &self.params {
            client_config.set(config_p.name.as_str(), config_p.value.as_str());
        }

        client_config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> KafkaConfig {
        KafkaConfig {
            brokers: vec!["kafka-1:9092".to_owned(), "kafka-2:9092".to_owned()],
            compression: Compression::Gzip,
            timeout: Duration::from_millis(1500),
            params: vec![KafkaConfigParam {
                name: "client.id".to_owned(),
                value: "carbon-relay".to_owned(),
            }],
        }
    }

    #[test]
    fn test_compression_from_str() {
        assert_eq!("none".parse(), Ok(Compression::None));
        assert_eq!("gzip".parse(), Ok(Compression::Gzip));
        assert_eq!("snappy".parse(), Ok(Compression::Snappy));
        assert_eq!(
            "lz4".parse::<Compression>(),
            Err(ConfigError::UnknownCompression("lz4".to_owned()))
        );
    }

    #[test]
    fn test_compression_from_yaml() {
        let compression: Compression = serde_yaml::from_str("gzip").unwrap();
        assert_eq!(compression, Compression::Gzip);

        let error = serde_yaml::from_str::<Compression>("zstd").unwrap_err();
        assert!(error.to_string().contains("unknown compression codec"));
    }

    #[test]
    fn test_client_config() {
        let client_config = config().client_config();

        assert_eq!(
            client_config.get("bootstrap.servers"),
            Some("kafka-1:9092,kafka-2:9092")
        );
        assert_eq!(client_config.get("acks"), Some("all"));
        assert_eq!(client_config.get("compression.codec"), Some("gzip"));
        assert_eq!(client_config.get("request.timeout.ms"), Some("1500"));
        assert_eq!(client_config.get("message.timeout.ms"), Some("1500"));
        assert_eq!(client_config.get("message.send.max.retries"), Some("10"));
        assert_eq!(client_config.get("client.id"), Some("carbon-relay"));
    }

    #[test]
    fn test_params_override_defaults() {
        let mut config = config();
        config.params.push(KafkaConfigParam {
            name: "message.send.max.retries".to_owned(),
            value: "3".to_owned(),
        });

        let client_config = config.client_config();
        assert_eq!(client_config.get("message.send.max.retries"), Some("3"));
    }

    #[test]
    fn test_validate_brokers() {
        assert_eq!(config().validate(), Ok(()));

        let mut config = config();
        config.brokers = vec![" ".to_owned()];
        assert_eq!(config.validate(), Err(ConfigError::NoBrokers));
    }
}
