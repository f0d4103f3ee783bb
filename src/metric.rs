//! Metric identity: tags, canonical full names, and the `put` ingest record.

use crate::error::DbError;
use crate::types::{Timestamp, Value};

use std::fmt;
use std::hash::{Hash, Hasher};

/// A `key=value` pair attached to a metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    pub key: String,
    pub value: String,
    /// `key=value`, as stored in the index.
    pub raw: String,
}

impl Tag {
    pub fn new(key: &str, value: &str) -> Result<Self, DbError> {
        validate_tag_part("key", key)?;
        validate_tag_part("value", value)?;
        if key.contains('=') {
            return Err(DbError::InvalidArgument(format!(
                "tag key {:?} must not contain '='",
                key
            )));
        }
        Ok(Self {
            key: key.to_string(),
            value: value.to_string(),
            raw: format!("{}={}", key, value),
        })
    }

    /// Parses `key=value`, splitting on the first `=`.
    pub fn parse(raw: &str) -> Result<Self, DbError> {
        match raw.split_once('=') {
            Some((key, value)) => Self::new(key, value),
            None => Err(DbError::InvalidArgument(format!(
                "malformed tag {:?}: expected key=value",
                raw
            ))),
        }
    }
}

fn validate_tag_part(what: &str, s: &str) -> Result<(), DbError> {
    if s.trim().is_empty() {
        return Err(DbError::InvalidArgument(format!("tag {} must not be blank", what)));
    }
    if s.chars().any(char::is_whitespace) {
        return Err(DbError::InvalidArgument(format!(
            "tag {} {:?} must not contain whitespace",
            what, s
        )));
    }
    Ok(())
}

/// A metric name plus its tags.
///
/// Two metrics are equal when their full names are equal.
#[derive(Debug, Clone)]
pub struct Metric {
    pub name: String,
    pub tags: Vec<Tag>,
    full_name: String,
}

impl Metric {
    /// Builds a metric from raw `key=value` strings. Blank entries are skipped.
    pub fn new<S: AsRef<str>>(name: &str, raw_tags: &[S]) -> Result<Self, DbError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DbError::InvalidArgument("metric name must not be blank".to_string()));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(DbError::InvalidArgument(format!(
                "metric name {:?} must not contain whitespace",
                name
            )));
        }
        let tags = raw_tags
            .iter()
            .map(|t| t.as_ref().trim())
            .filter(|t| !t.is_empty())
            .map(Tag::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_tags(name, tags))
    }

    fn from_tags(name: &str, tags: Vec<Tag>) -> Self {
        let mut raws: Vec<&str> = tags.iter().map(|t| t.raw.as_str()).collect();
        raws.sort_unstable();
        let full_name = if raws.is_empty() {
            name.to_string()
        } else {
            format!("{} {}", name, raws.join(" "))
        };
        Self {
            name: name.to_string(),
            tags,
            full_name,
        }
    }

    /// Name followed by the sorted raw tags, space separated.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }
}

impl PartialEq for Metric {
    fn eq(&self, other: &Self) -> bool {
        self.full_name == other.full_name
    }
}

impl Eq for Metric {}

impl Hash for Metric {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.full_name.hash(state);
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name)
    }
}

/// One parsed `put <metric> <ts> <value> [k=v ...]` line.
#[derive(Debug, Clone, PartialEq)]
pub struct PutRecord {
    pub metric: Metric,
    pub timestamp: Timestamp,
    pub value: Value,
}

impl PutRecord {
    pub fn parse(line: &str) -> Result<Self, DbError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.first() {
            Some(&"put") => {}
            _ => {
                return Err(DbError::InvalidArgument(format!(
                    "ingest line must start with 'put': {:?}",
                    line
                )))
            }
        }
        if parts.len() < 4 {
            return Err(DbError::InvalidArgument(format!(
                "ingest line needs a metric, timestamp and value: {:?}",
                line
            )));
        }
        let timestamp = parts[2].parse::<Timestamp>().map_err(|e| {
            DbError::InvalidArgument(format!("bad timestamp {:?}: {}", parts[2], e))
        })?;
        let value = parts[3]
            .parse::<Value>()
            .map_err(|e| DbError::InvalidArgument(format!("bad value {:?}: {}", parts[3], e)))?;
        let metric = Metric::new(parts[1], &parts[4..])?;
        Ok(Self {
            metric,
            timestamp,
            value,
        })
    }
}
