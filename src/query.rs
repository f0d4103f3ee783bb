//! Query model: tag matchers, the query mini-language, and aggregation modes.

use crate::error::DbError;

use regex::Regex;
use std::fmt;
use std::str::FromStr;

/// Kind of a [`TagMatcher`], used for display and partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    Exact,
    Wildcard,
    IWildcard,
    LiteralOr,
    ILiteralOr,
    NotLiteralOr,
    NotILiteralOr,
    Regexp,
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchType::Exact => "exact",
            MatchType::Wildcard => "wildcard",
            MatchType::IWildcard => "iwildcard",
            MatchType::LiteralOr => "literal_or",
            MatchType::ILiteralOr => "iliteral_or",
            MatchType::NotLiteralOr => "not_literal_or",
            MatchType::NotILiteralOr => "not_iliteral_or",
            MatchType::Regexp => "regexp",
        };
        f.write_str(s)
    }
}

/// A predicate on one tag key.
#[derive(Debug, Clone)]
pub enum TagMatcher {
    Exact {
        key: String,
        value: String,
    },
    /// Glob over the tag value; `*` matches any run of characters.
    Wildcard {
        key: String,
        pattern: String,
        case_insensitive: bool,
    },
    /// Value equals one of the `|`-separated alternatives.
    LiteralOr {
        key: String,
        pattern: String,
        case_insensitive: bool,
    },
    /// Excludes series whose value equals one of the `|`-separated alternatives.
    NotLiteralOr {
        key: String,
        pattern: String,
        case_insensitive: bool,
    },
    /// Regex search (not anchored) over the tag value.
    Regexp { key: String, regex: Regex },
}

impl TagMatcher {
    pub fn exact(key: &str, value: &str) -> Result<Self, DbError> {
        require_key(key)?;
        if value.trim().is_empty() {
            return Err(DbError::InvalidArgument(format!(
                "exact matcher on {:?} needs a value",
                key
            )));
        }
        Ok(TagMatcher::Exact {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn wildcard(key: &str, pattern: &str) -> Result<Self, DbError> {
        Self::glob(key, pattern, false)
    }

    pub fn iwildcard(key: &str, pattern: &str) -> Result<Self, DbError> {
        Self::glob(key, pattern, true)
    }

    fn glob(key: &str, pattern: &str, case_insensitive: bool) -> Result<Self, DbError> {
        require_key(key)?;
        if !pattern.contains('*') {
            return Err(DbError::InvalidArgument(format!(
                "wildcard pattern {:?} must contain '*'",
                pattern
            )));
        }
        Ok(TagMatcher::Wildcard {
            key: key.to_string(),
            pattern: pattern.to_string(),
            case_insensitive,
        })
    }

    pub fn literal_or(key: &str, pattern: &str) -> Result<Self, DbError> {
        require_key(key)?;
        Ok(TagMatcher::LiteralOr {
            key: key.to_string(),
            pattern: pattern.to_string(),
            case_insensitive: false,
        })
    }

    pub fn iliteral_or(key: &str, pattern: &str) -> Result<Self, DbError> {
        require_key(key)?;
        Ok(TagMatcher::LiteralOr {
            key: key.to_string(),
            pattern: pattern.to_string(),
            case_insensitive: true,
        })
    }

    pub fn not_literal_or(key: &str, pattern: &str) -> Result<Self, DbError> {
        require_key(key)?;
        Ok(TagMatcher::NotLiteralOr {
            key: key.to_string(),
            pattern: pattern.to_string(),
            case_insensitive: false,
        })
    }

    pub fn not_iliteral_or(key: &str, pattern: &str) -> Result<Self, DbError> {
        require_key(key)?;
        Ok(TagMatcher::NotLiteralOr {
            key: key.to_string(),
            pattern: pattern.to_string(),
            case_insensitive: true,
        })
    }

    pub fn regexp(key: &str, pattern: &str) -> Result<Self, DbError> {
        require_key(key)?;
        let regex = Regex::new(pattern).map_err(|e| {
            DbError::InvalidArgument(format!("invalid regex {:?}: {}", pattern, e))
        })?;
        Ok(TagMatcher::Regexp {
            key: key.to_string(),
            regex,
        })
    }

    pub fn key(&self) -> &str {
        match self {
            TagMatcher::Exact { key, .. }
            | TagMatcher::Wildcard { key, .. }
            | TagMatcher::LiteralOr { key, .. }
            | TagMatcher::NotLiteralOr { key, .. }
            | TagMatcher::Regexp { key, .. } => key,
        }
    }

    pub fn pattern(&self) -> &str {
        match self {
            TagMatcher::Exact { value, .. } => value,
            TagMatcher::Wildcard { pattern, .. }
            | TagMatcher::LiteralOr { pattern, .. }
            | TagMatcher::NotLiteralOr { pattern, .. } => pattern,
            TagMatcher::Regexp { regex, .. } => regex.as_str(),
        }
    }

    pub fn match_type(&self) -> MatchType {
        match self {
            TagMatcher::Exact { .. } => MatchType::Exact,
            TagMatcher::Wildcard {
                case_insensitive: false,
                ..
            } => MatchType::Wildcard,
            TagMatcher::Wildcard { .. } => MatchType::IWildcard,
            TagMatcher::LiteralOr {
                case_insensitive: false,
                ..
            } => MatchType::LiteralOr,
            TagMatcher::LiteralOr { .. } => MatchType::ILiteralOr,
            TagMatcher::NotLiteralOr {
                case_insensitive: false,
                ..
            } => MatchType::NotLiteralOr,
            TagMatcher::NotLiteralOr { .. } => MatchType::NotILiteralOr,
            TagMatcher::Regexp { .. } => MatchType::Regexp,
        }
    }

    /// True for matchers that remove series instead of selecting them.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, TagMatcher::NotLiteralOr { .. })
    }

    /// Whether a single tag value satisfies this matcher.
    ///
    /// Exclusive matchers answer whether the value is one of the excluded alternatives.
    pub fn matches_value(&self, value: &str) -> bool {
        match self {
            TagMatcher::Exact { value: v, .. } => v == value,
            TagMatcher::Wildcard {
                pattern,
                case_insensitive: false,
                ..
            } => wildcard_match(pattern, value),
            TagMatcher::Wildcard { pattern, .. } => {
                wildcard_match(&pattern.to_lowercase(), &value.to_lowercase())
            }
            TagMatcher::LiteralOr {
                pattern,
                case_insensitive,
                ..
            }
            | TagMatcher::NotLiteralOr {
                pattern,
                case_insensitive,
                ..
            } => literal_or_match(pattern, value, *case_insensitive),
            TagMatcher::Regexp { regex, .. } => regex.is_match(value),
        }
    }
}

fn require_key(key: &str) -> Result<(), DbError> {
    if key.trim().is_empty() {
        return Err(DbError::InvalidArgument("tag key must not be blank".to_string()));
    }
    Ok(())
}

/// Non-empty `|`-separated alternatives of an OR pattern.
pub(crate) fn alternatives(pattern: &str) -> impl Iterator<Item = &str> {
    pattern.split('|').filter(|a| !a.is_empty())
}

fn literal_or_match(pattern: &str, value: &str, case_insensitive: bool) -> bool {
    if value.is_empty() {
        return false;
    }
    if case_insensitive {
        let value = value.to_lowercase();
        alternatives(pattern).any(|a| a.to_lowercase() == value)
    } else {
        alternatives(pattern).any(|a| a == value)
    }
}

impl PartialEq for TagMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.match_type() == other.match_type()
            && self.key() == other.key()
            && self.pattern() == other.pattern()
    }
}

impl fmt::Display for TagMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagMatcher::Exact { key, value } => write!(f, "{}={}", key, value),
            TagMatcher::Wildcard {
                key,
                pattern,
                case_insensitive: false,
            } if pattern == "*" => write!(f, "{}=*", key),
            other => write!(f, "{}={}({})", other.key(), other.match_type(), other.pattern()),
        }
    }
}

/// Glob match where `*` matches any (possibly empty) run of characters.
///
/// Literal components must appear in order and may not overlap: `a*a` needs two `a`s.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    if pattern.is_empty() {
        return value.is_empty();
    }
    let after_leading = pattern.trim_start_matches('*');
    let anchored_start = after_leading.len() == pattern.len();
    let core = after_leading.trim_end_matches('*');
    let anchored_end = core.len() == after_leading.len();
    if core.is_empty() {
        return true;
    }

    let mut parts: Vec<&str> = core.split('*').filter(|c| !c.is_empty()).collect();
    let mut start = 0;
    let mut end = value.len();

    if anchored_start {
        let first = parts.remove(0);
        if !value.starts_with(first) {
            return false;
        }
        start = first.len();
    }
    if anchored_end {
        match parts.pop() {
            Some(last) => {
                if !value[start..].ends_with(last) {
                    return false;
                }
                end = value.len() - last.len();
            }
            // the single component was consumed by the prefix check
            None => return start == value.len(),
        }
    }

    let mut haystack = &value[start..end];
    for part in parts {
        match haystack.find(part) {
            Some(i) => haystack = &haystack[i + part.len()..],
            None => return false,
        }
    }
    true
}

/// How matched series are combined across chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryAggregation {
    /// One series per metric, merged and deduplicated by timestamp.
    #[default]
    None,
    /// A single series summing every matched value at each timestamp.
    Zimsum,
}

impl fmt::Display for QueryAggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryAggregation::None => f.write_str("none"),
            QueryAggregation::Zimsum => f.write_str("zimsum"),
        }
    }
}

impl FromStr for QueryAggregation {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(QueryAggregation::None),
            "zimsum" => Ok(QueryAggregation::Zimsum),
            other => Err(DbError::InvalidArgument(format!(
                "unknown aggregation {:?}",
                other
            ))),
        }
    }
}

/// A metric name plus at most one matcher per tag key.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub metric_name: String,
    pub matchers: Vec<TagMatcher>,
}

impl Query {
    pub fn new(metric_name: &str, matchers: Vec<TagMatcher>) -> Result<Self, DbError> {
        let metric_name = metric_name.trim();
        if metric_name.is_empty() {
            return Err(DbError::InvalidArgument("query metric name must not be empty".to_string()));
        }
        for (i, m) in matchers.iter().enumerate() {
            if matchers[..i].iter().any(|prev| prev.key() == m.key()) {
                return Err(DbError::InvalidArgument(format!(
                    "only one matcher allowed per tag key, {:?} repeats",
                    m.key()
                )));
            }
        }
        Ok(Self {
            metric_name: metric_name.to_string(),
            matchers,
        })
    }

    /// Parses `<metric> [key=value|key=* ...]`.
    pub fn parse(s: &str) -> Result<Self, DbError> {
        let mut parts = s.split_whitespace();
        let metric_name = parts
            .next()
            .ok_or_else(|| DbError::InvalidArgument("empty query".to_string()))?;
        let matchers = parts
            .map(|raw| {
                let (key, value) = raw.split_once('=').ok_or_else(|| {
                    DbError::InvalidArgument(format!("malformed query tag {:?}", raw))
                })?;
                if value == "*" {
                    TagMatcher::wildcard(key, value)
                } else {
                    TagMatcher::exact(key, value)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(metric_name, matchers)
    }
}

impl FromStr for Query {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Query::parse(s)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metric_name)?;
        for m in &self.matchers {
            write!(f, " {}", m)?;
        }
        Ok(())
    }
}
