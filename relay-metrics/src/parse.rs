use std::str;

use thiserror::Error;

use crate::protocol::{DEFAULT_MTYPE, DEFAULT_UNIT, MetricData};
use crate::schemas::Schemas;

/// An error returned when a carbon line cannot be decoded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The line is not valid UTF-8.
    #[error("metric line is not valid utf-8")]
    Utf8,
    /// The line does not consist of exactly `name value timestamp`.
    #[error("expected 3 fields, found {0}")]
    FieldCount(usize),
    /// The metric name is empty.
    #[error("empty metric name")]
    EmptyName,
    /// A tag is not of the form `key=value`.
    #[error("invalid tag {0:?}")]
    InvalidTag(String),
    /// The value is not a number.
    #[error("invalid value {0:?}")]
    InvalidValue(String),
    /// The timestamp is not an unsigned number of seconds.
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    /// No storage schema matches the metric name.
    #[error("no storage schema matches {0:?}")]
    NoSchema(String),
}

/// Decodes a carbon plaintext line into a [`MetricData`] with its identity set.
///
/// The line has the form `name[;tag=value...] value timestamp`. The interval is taken from the
/// first schema matching the full name including tags.
pub fn parse_metric(raw: &[u8], schemas: &Schemas, org_id: i32) -> Result<MetricData, ParseError> {
    let line = str::from_utf8(raw).map_err(|_| ParseError::Utf8)?.trim();

    let fields: Vec<&str> = line.split_ascii_whitespace().collect();
    let [full_name, value, timestamp] = fields[..] else {
        return Err(ParseError::FieldCount(fields.len()));
    };

    let mut parts = full_name.split(';');
    let name = parts.next().unwrap_or_default();
    if name.is_empty() {
        return Err(ParseError::EmptyName);
    }

    let tags = parts
        .map(|tag| match tag.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => Ok(tag.to_owned()),
            _ => Err(ParseError::InvalidTag(tag.to_owned())),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let value: f64 = value
        .parse()
        .map_err(|_| ParseError::InvalidValue(value.to_owned()))?;
    let timestamp: u32 = timestamp
        .parse()
        .map_err(|_| ParseError::InvalidTimestamp(timestamp.to_owned()))?;

    let schema = schemas
        .matching(full_name)
        .ok_or_else(|| ParseError::NoSchema(full_name.to_owned()))?;

    let mut metric = MetricData {
        id: String::new(),
        org_id,
        name: name.to_owned(),
        interval: schema.interval() as i32,
        value,
        unit: DEFAULT_UNIT.to_owned(),
        time: i64::from(timestamp),
        mtype: DEFAULT_MTYPE.to_owned(),
        tags,
    };
    metric.set_id();

    Ok(metric)
}
