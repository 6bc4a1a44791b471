//! Storage schemas in the graphite `storage-schemas.conf` format.
//!
//! ```text
//! [carbon]
//! pattern = ^carbon\.
//! retentions = 60:90d
//!
//! [default]
//! pattern = .*
//! retentions = 10s:1d,1min:30d
//! ```

use std::fs;
use std::path::Path;
use std::str::FromStr;

use regex::Regex;
use thiserror::Error;

/// An error raised while reading storage schemas.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The schemas file could not be read.
    #[error("failed to read schemas file")]
    Io(#[from] std::io::Error),
    /// A line is neither a section header, a comment nor a `key = value` pair.
    #[error("line {line}: invalid syntax")]
    Syntax {
        /// The 1-based line number.
        line: usize,
    },
    /// A `key = value` pair appears before the first section.
    #[error("line {line}: property outside of a section")]
    NoSection {
        /// The 1-based line number.
        line: usize,
    },
    /// The pattern is not a valid regular expression.
    #[error("schema {section}: invalid pattern")]
    Pattern {
        /// The section name.
        section: String,
        /// The regex compilation error.
        #[source]
        source: regex::Error,
    },
    /// The section has no pattern.
    #[error("schema {0}: missing pattern")]
    MissingPattern(String),
    /// The section has no retentions.
    #[error("schema {0}: missing retentions")]
    MissingRetentions(String),
    /// A retention definition could not be parsed.
    #[error("schema {section}: invalid retention {retention:?}")]
    Retention {
        /// The section name.
        section: String,
        /// The offending retention definition.
        retention: String,
    },
    /// The priority is not an integer.
    #[error("schema {0}: invalid priority")]
    Priority(String),
    /// No schema has the catch-all pattern `.*`.
    #[error("no default schema with pattern .* found")]
    NoDefault,
}

/// One archive of a schema: a resolution and how long it is kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Retention {
    /// Seconds per point.
    pub seconds_per_point: u32,
    /// Number of points kept.
    pub num_points: u32,
}

impl FromStr for Retention {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (precision, retention) = s.trim().split_once(':').ok_or(())?;
        let seconds_per_point = parse_duration(precision)?;
        if seconds_per_point == 0 {
            return Err(());
        }

        // A bare number is a point count, a duration is converted to points.
        let num_points = match retention.trim().parse::<u32>() {
            Ok(points) => points,
            Err(_) => parse_duration(retention)? / seconds_per_point,
        };

        Ok(Self {
            seconds_per_point,
            num_points,
        })
    }
}

/// Parses `<number>[unit]` into seconds.
fn parse_duration(s: &str) -> Result<u32, ()> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: u32 = number.parse().map_err(|_| ())?;

    let multiplier = match unit {
        "" | "s" | "sec" | "second" | "seconds" => 1,
        "m" | "min" | "minute" | "minutes" => 60,
        "h" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 604_800,
        "y" | "year" | "years" => 31_536_000,
        _ => return Err(()),
    };

    number.checked_mul(multiplier).ok_or(())
}

/// A single storage schema.
#[derive(Clone, Debug)]
pub struct Schema {
    /// Name of the section defining this schema.
    pub name: String,
    /// Metric names matching this pattern use the schema.
    pub pattern: Regex,
    /// Archives ordered from the highest to the lowest resolution.
    pub retentions: Vec<Retention>,
    /// Schemas with a higher priority are matched first.
    pub priority: i64,
}

impl Schema {
    /// Returns the interval of the highest resolution archive in seconds.
    pub fn interval(&self) -> u32 {
        self.retentions
            .first()
            .map_or(0, |retention| retention.seconds_per_point)
    }
}

/// An ordered list of storage schemas.
#[derive(Clone, Debug)]
pub struct Schemas {
    schemas: Vec<Schema>,
}

#[derive(Default)]
struct Section {
    name: String,
    pattern: Option<String>,
    retentions: Option<String>,
    priority: Option<String>,
}

impl Section {
    fn into_schema(self) -> Result<Schema, SchemaError> {
        let Self {
            name,
            pattern,
            retentions,
            priority,
        } = self;

        let pattern = pattern.ok_or_else(|| SchemaError::MissingPattern(name.clone()))?;
        let pattern = Regex::new(&pattern).map_err(|source| SchemaError::Pattern {
            section: name.clone(),
            source,
        })?;

        let retentions = retentions
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .filter(|r| !r.trim().is_empty())
            .map(|r| {
                r.parse().map_err(|()| SchemaError::Retention {
                    section: name.clone(),
                    retention: r.trim().to_owned(),
                })
            })
            .collect::<Result<Vec<Retention>, _>>()?;
        if retentions.is_empty() {
            return Err(SchemaError::MissingRetentions(name));
        }

        let priority = match priority {
            Some(priority) => priority
                .parse()
                .map_err(|_| SchemaError::Priority(name.clone()))?,
            None => 0,
        };

        Ok(Schema {
            name,
            pattern,
            retentions,
            priority,
        })
    }
}

impl Schemas {
    /// Parses schemas from the contents of a `storage-schemas.conf` file.
    pub fn parse(source: &str) -> Result<Self, SchemaError> {
        let mut sections: Vec<Section> = Vec::new();

        for (index, line) in source.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let name = name
                    .strip_suffix(']')
                    .ok_or(SchemaError::Syntax { line: index + 1 })?;
                sections.push(Section {
                    name: name.trim().to_owned(),
                    ..Default::default()
                });
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or(SchemaError::Syntax { line: index + 1 })?;
            let section = sections
                .last_mut()
                .ok_or(SchemaError::NoSection { line: index + 1 })?;

            let value = Some(value.trim().to_owned());
            match key.trim() {
                "pattern" => section.pattern = value,
                "retentions" => section.retentions = value,
                "priority" => section.priority = value,
                _ => (),
            }
        }

        let mut schemas = sections
            .into_iter()
            .map(Section::into_schema)
            .collect::<Result<Vec<_>, _>>()?;

        if !schemas.iter().any(|schema| schema.pattern.as_str() == ".*") {
            return Err(SchemaError::NoDefault);
        }

        // Stable sort keeps the file order within a priority.
        schemas.sort_by(|a, b| b.priority.cmp(&a.priority));

        Ok(Self { schemas })
    }

    /// Reads and parses a `storage-schemas.conf` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Returns the first schema whose pattern matches the metric name.
    pub fn matching(&self, name: &str) -> Option<&Schema> {
        self.schemas
            .iter()
            .find(|schema| schema.pattern.is_match(name))
    }

    /// Returns all schemas in match order.
    pub fn iter(&self) -> impl Iterator<Item = &Schema> {
        self.schemas.iter()
    }
}
