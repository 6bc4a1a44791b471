use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Unit assigned to all metrics decoded from carbon lines.
pub const DEFAULT_UNIT: &str = "unknown";

/// Metric type assigned to all metrics decoded from carbon lines.
pub const DEFAULT_MTYPE: &str = "gauge";

/// Error returned by [`MetricData::encode`].
pub type EncodeError = rmp_serde::encode::Error;

/// A single data point of a series.
///
/// Encoded as a MessagePack map with the field names in `PascalCase`, which is the format the
/// downstream time series store consumes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricData {
    /// Identity of the series, see [`MetricData::set_id`].
    pub id: String,
    /// The organization (tenant) owning the series.
    pub org_id: i32,
    /// Name of the series without tags.
    pub name: String,
    /// Expected interval between two data points in seconds.
    pub interval: i32,
    /// The value of this data point.
    pub value: f64,
    /// The unit of the value.
    pub unit: String,
    /// Unix timestamp of the data point in seconds.
    pub time: i64,
    /// The metric type.
    pub mtype: String,
    /// Tags of the series in `key=value` form.
    pub tags: Vec<String>,
}

impl MetricData {
    /// Computes and stores the identity of the series.
    ///
    /// The identity is `{org_id}.{digest}`, where the digest is the hex encoded MD5 over the name,
    /// unit, metric type, interval and the sorted tags, each separated by a zero byte. Tags are
    /// sorted in place.
    pub fn set_id(&mut self) {
        self.tags.sort_unstable();

        let mut buffer = String::with_capacity(self.name.len() + 64);
        buffer.push_str(&self.name);
        buffer.push('\0');
        buffer.push_str(&self.unit);
        buffer.push('\0');
        buffer.push_str(&self.mtype);
        buffer.push('\0');
        write!(buffer, "{}", self.interval).ok();
        for tag in &self.tags {
            buffer.push('\0');
            buffer.push_str(tag);
        }

        self.id = format!("{}.{:x}", self.org_id, md5::compute(buffer.as_bytes()));
    }

    /// Serializes the data point into its binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        rmp_serde::to_vec_named(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric() -> MetricData {
        MetricData {
            org_id: 1,
            name: "servers.cpu.user".to_owned(),
            interval: 10,
            value: 42.5,
            unit: DEFAULT_UNIT.to_owned(),
            time: 1_700_000_000,
            mtype: DEFAULT_MTYPE.to_owned(),
            tags: vec!["host=web-1".to_owned(), "dc=ams".to_owned()],
            ..Default::default()
        }
    }

    #[test]
    fn test_set_id_format() {
        let mut metric = metric();
        metric.set_id();

        let (org, digest) = metric.id.split_once('.').unwrap();
        assert_eq!(org, "1");
        assert_eq!(digest.len(), 32);
        assert!(digest.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(metric.tags, ["dc=ams", "host=web-1"]);
    }

    #[test]
    fn test_set_id_digest() {
        let mut metric = metric();
        metric.set_id();

        let expected = md5::compute(b"servers.cpu.user\0unknown\0gauge\x0010\0dc=ams\0host=web-1");
        assert_eq!(metric.id, format!("1.{expected:x}"));
    }

    #[test]
    fn test_id_ignores_value_and_time() {
        let mut a = metric();
        let mut b = MetricData {
            value: -1.0,
            time: 1_800_000_000,
            tags: vec!["dc=ams".to_owned(), "host=web-1".to_owned()],
            ..metric()
        };
        a.set_id();
        b.set_id();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_id_depends_on_org_and_interval() {
        let mut base = metric();
        let mut other_org = MetricData {
            org_id: 2,
            ..metric()
        };
        let mut other_interval = MetricData {
            interval: 60,
            ..metric()
        };
        base.set_id();
        other_org.set_id();
        other_interval.set_id();

        assert_ne!(base.id, other_org.id);
        assert!(other_org.id.starts_with("2."));
        assert_ne!(base.id, other_interval.id);
    }

    #[test]
    fn test_encode_named_fields() {
        let mut metric = metric();
        metric.set_id();

        let encoded = metric.encode().unwrap();
        // fixmap with 9 entries, followed by the first key "Id"
        assert_eq!(encoded[0], 0x89);
        assert_eq!(&encoded[1..4], b"\xa2Id");

        let decoded: MetricData = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(decoded, metric);
    }
}
