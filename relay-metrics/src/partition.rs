use std::fmt;
use std::hash::Hasher as _;
use std::str::FromStr;

use hash32::{FnvHasher, Hasher as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::MetricData;

/// An error returned when a partitioning strategy name is not known.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown partitioning strategy {0:?}")]
pub struct UnknownPartitionBy(String);

/// An error returned by [`Partitioner::partition`].
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    /// The topic has no partitions to assign to.
    #[error("invalid partition count {0}")]
    InvalidPartitionCount(i32),
}

/// Selects which part of a metric determines its partition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PartitionBy {
    /// All series of an organization share a partition.
    ByOrg,
    /// Partition by metric name.
    #[default]
    BySeries,
    /// Partition by metric name and tags.
    BySeriesWithTags,
    /// Partition by metric name and tags, with an unsigned modulo of the hash.
    BySeriesWithTagsFnv,
}

impl PartitionBy {
    /// Returns the configuration name of the strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ByOrg => "byOrg",
            Self::BySeries => "bySeries",
            Self::BySeriesWithTags => "bySeriesWithTags",
            Self::BySeriesWithTagsFnv => "bySeriesWithTagsFnv",
        }
    }
}

impl fmt::Display for PartitionBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitionBy {
    type Err = UnknownPartitionBy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "byOrg" => Self::ByOrg,
            "bySeries" => Self::BySeries,
            "bySeriesWithTags" => Self::BySeriesWithTags,
            "bySeriesWithTagsFnv" => Self::BySeriesWithTagsFnv,
            other => return Err(UnknownPartitionBy(other.to_owned())),
        })
    }
}

impl TryFrom<String> for PartitionBy {
    type Error = UnknownPartitionBy;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PartitionBy> for String {
    fn from(value: PartitionBy) -> Self {
        value.as_str().to_owned()
    }
}

/// Assigns metrics to Kafka partitions.
///
/// The partition is a pure function of the partition key and the partition count, so a series
/// keeps its partition as long as the topic is not resized.
#[derive(Clone, Copy, Debug, Default)]
pub struct Partitioner {
    by: PartitionBy,
}

impl Partitioner {
    /// Creates a partitioner for the given strategy.
    pub fn new(by: PartitionBy) -> Self {
        Self { by }
    }

    /// Returns the bytes hashed to determine the partition of `metric`.
    ///
    /// Tags are expected to be sorted, which [`MetricData::set_id`] guarantees.
    pub fn key(&self, metric: &MetricData) -> Vec<u8> {
        match self.by {
            PartitionBy::ByOrg => metric.org_id.to_le_bytes().to_vec(),
            PartitionBy::BySeries => metric.name.as_bytes().to_vec(),
            PartitionBy::BySeriesWithTags | PartitionBy::BySeriesWithTagsFnv => {
                let mut key = metric.name.clone();
                for tag in &metric.tags {
                    key.push(';');
                    key.push_str(tag);
                }
                key.into_bytes()
            }
        }
    }

    /// Returns the partition of `metric` in `[0, partition_count)`.
    pub fn partition(
        &self,
        metric: &MetricData,
        partition_count: i32,
    ) -> Result<i32, PartitionError> {
        if partition_count <= 0 {
            return Err(PartitionError::InvalidPartitionCount(partition_count));
        }

        let mut hasher = FnvHasher::default();
        hasher.write(&self.key(metric));
        let hash = hasher.finish32();

        let partition = match self.by {
            PartitionBy::BySeriesWithTagsFnv => (hash % partition_count as u32) as i32,
            _ => ((hash as i32) % partition_count).abs(),
        };

        Ok(partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(name: &str, tags: &[&str]) -> MetricData {
        let mut metric = MetricData {
            org_id: 1,
            name: name.to_owned(),
            interval: 10,
            tags: tags.iter().map(|t| (*t).to_owned()).collect(),
            ..Default::default()
        };
        metric.set_id();
        metric
    }

    #[test]
    fn test_partition_by_from_str() {
        assert_eq!("byOrg".parse(), Ok(PartitionBy::ByOrg));
        assert_eq!("bySeries".parse(), Ok(PartitionBy::BySeries));
        assert_eq!("bySeriesWithTags".parse(), Ok(PartitionBy::BySeriesWithTags));
        assert_eq!(
            "bySeriesWithTagsFnv".parse(),
            Ok(PartitionBy::BySeriesWithTagsFnv)
        );
        assert_eq!(
            "byMetric".parse::<PartitionBy>(),
            Err(UnknownPartitionBy("byMetric".to_owned()))
        );

        let by: PartitionBy = serde_yaml::from_str("bySeriesWithTags").unwrap();
        assert_eq!(by, PartitionBy::BySeriesWithTags);
        assert_eq!(by.to_string(), "bySeriesWithTags");
    }

    #[test]
    fn test_keys() {
        let metric = metric("servers.cpu.user", &["host=web-1", "dc=ams"]);

        let key = |by| Partitioner::new(by).key(&metric);
        assert_eq!(key(PartitionBy::ByOrg), [1, 0, 0, 0]);
        assert_eq!(key(PartitionBy::BySeries), b"servers.cpu.user");
        assert_eq!(
            key(PartitionBy::BySeriesWithTags),
            b"servers.cpu.user;dc=ams;host=web-1"
        );
        assert_eq!(
            key(PartitionBy::BySeriesWithTagsFnv),
            key(PartitionBy::BySeriesWithTags)
        );
    }

    #[test]
    fn test_partition_values() {
        let tagged = metric("servers.cpu.user", &["host=web-1", "dc=ams"]);
        let partition = |by, metric: &MetricData, n| Partitioner::new(by).partition(metric, n);

        assert_eq!(partition(PartitionBy::BySeries, &tagged, 7), Ok(3));
        assert_eq!(partition(PartitionBy::BySeries, &tagged, 8), Ok(4));
        assert_eq!(partition(PartitionBy::ByOrg, &tagged, 7), Ok(1));
        assert_eq!(partition(PartitionBy::BySeriesWithTags, &tagged, 7), Ok(4));
        assert_eq!(partition(PartitionBy::BySeriesWithTagsFnv, &tagged, 7), Ok(0));
    }

    #[test]
    fn test_signed_and_unsigned_modulo() {
        // The FNV-1a hash of "a" has the sign bit set.
        let metric = metric("a", &[]);

        assert_eq!(
            Partitioner::new(PartitionBy::BySeriesWithTags).partition(&metric, 7),
            Ok(6)
        );
        assert_eq!(
            Partitioner::new(PartitionBy::BySeriesWithTagsFnv).partition(&metric, 7),
            Ok(5)
        );
    }

    #[test]
    fn test_partition_is_stable() {
        let partitioner = Partitioner::new(PartitionBy::BySeries);
        let first = partitioner.partition(&metric("servers.a", &[]), 32).unwrap();

        for _ in 0..10 {
            assert_eq!(
                partitioner.partition(&metric("servers.a", &[]), 32),
                Ok(first)
            );
        }

        for n in 1..64 {
            let p = partitioner.partition(&metric("servers.b", &[]), n).unwrap();
            assert!((0..n).contains(&p));
        }
    }

    #[test]
    fn test_invalid_partition_count() {
        let partitioner = Partitioner::default();
        assert_eq!(
            partitioner.partition(&metric("a", &[]), 0),
            Err(PartitionError::InvalidPartitionCount(0))
        );
        assert_eq!(
            partitioner.partition(&metric("a", &[]), -1),
            Err(PartitionError::InvalidPartitionCount(-1))
        );
    }
}
