//! Inverted index from metric names and tags to series ids.
//!
//! Every created metric is indexed under four kinds of keys, all in one map: its full name,
//! its bare name, each tag key, and each raw `key=value`. Name, key and exact-value matching
//! are then bitmap intersections; glob, regex and case-insensitive matching fall back to
//! reading tag values out of the forward map for the ids still in play.
//!
//! A string can be indexed in more than one role (a metric named `host` and a tag key `host`).
//! Such keys are tracked, and ids read through them are checked against the forward map.

use crate::error::DbError;
use crate::metric::Metric;
use crate::query::{alternatives, Query, TagMatcher};
use crate::types::SeriesId;

use dashmap::DashMap;
use roaring::RoaringBitmap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

/// The first id handed out is `FIRST_ID_OFFSET + 1`; ids 0 and 1 are never issued.
const FIRST_ID_OFFSET: u32 = 1;

/// What an index key stands for. Bit flags, recorded per key in `TagStore::roles`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyRole {
    /// A bare metric name (or the full name of an untagged metric).
    Name = 1,
    /// A tag key.
    TagKey = 2,
    /// A raw `key=value` tag.
    Tag = 4,
}

impl KeyRole {
    fn bit(self) -> u8 {
        self as u8
    }

    /// Whether the stored full name really carries `key` in this role.
    fn holds(self, full_name: &str, key: &str) -> bool {
        let mut tokens = full_name.split(' ');
        match self {
            KeyRole::Name => tokens.next() == Some(key),
            KeyRole::TagKey => tag_value(full_name, key).is_some(),
            KeyRole::Tag => tokens.skip(1).any(|t| t == key),
        }
    }
}

/// Size of a [`TagStore`] at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagStoreStats {
    pub metrics: usize,
    pub index_keys: usize,
    /// Serialized size of every bitmap in the index.
    pub index_bytes: u64,
}

/// Assigns ids to metrics and resolves queries to id sets.
#[derive(Debug)]
pub struct TagStore {
    forward: DashMap<SeriesId, String>,
    index: DashMap<String, RoaringBitmap>,
    /// Role bits of every index key except tagged full names.
    roles: DashMap<String, u8>,
    last_id: AtomicU32,
    /// Serializes id assignment so one full name never receives two ids.
    create_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Default for TagStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TagStore {
    pub fn new() -> Self {
        Self {
            forward: DashMap::new(),
            index: DashMap::new(),
            roles: DashMap::new(),
            last_id: AtomicU32::new(FIRST_ID_OFFSET),
            create_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Existing id for `metric`, if any.
    pub fn get(&self, metric: &Metric) -> Option<SeriesId> {
        let full_name = metric.full_name();
        let ids = self.index.get(full_name)?;
        // A full name can share its index key with a bare name or tag key of another metric.
        let found = ids.iter().find(|id| {
            self.forward
                .get(id)
                .is_some_and(|name| name.as_str() == full_name)
        });
        found
    }

    /// Returns the id for `metric`, assigning and indexing a new one on first sight.
    pub fn get_or_create(&self, metric: &Metric) -> Result<SeriesId, DbError> {
        if self.is_closed() {
            return Err(DbError::Closed("tag store".to_string()));
        }
        if let Some(id) = self.get(metric) {
            return Ok(id);
        }

        let _guard = self.create_lock.lock()?;
        if let Some(id) = self.get(metric) {
            return Ok(id);
        }
        let id = self
            .last_id
            .load(Ordering::Relaxed)
            .checked_add(1)
            .ok_or_else(|| DbError::Internal("series id space exhausted".to_string()))?;
        self.last_id.store(id, Ordering::Relaxed);

        // Forward entry first: an index entry must never point at an unknown id.
        // Roles before index entries, so a reader never trusts a shared key unchecked.
        self.forward.insert(id, metric.full_name().to_string());
        self.add_role(&metric.name, KeyRole::Name);
        for tag in &metric.tags {
            self.add_role(&tag.key, KeyRole::TagKey);
            self.add_role(&tag.raw, KeyRole::Tag);
        }
        self.index_id(metric.full_name(), id);
        self.index_id(&metric.name, id);
        for tag in &metric.tags {
            self.index_id(&tag.key, id);
            self.index_id(&tag.raw, id);
        }
        Ok(id)
    }

    fn add_role(&self, key: &str, role: KeyRole) {
        *self.roles.entry(key.to_string()).or_default() |= role.bit();
    }

    fn index_id(&self, key: &str, id: SeriesId) {
        self.index.entry(key.to_string()).or_default().insert(id);
    }

    /// True when `key` is indexed in some role other than `role`.
    fn is_shared(&self, key: &str, role: KeyRole) -> bool {
        self.roles.get(key).is_some_and(|bits| *bits & !role.bit() != 0)
    }

    /// Ids indexed under `key` that really carry it in `role`.
    fn ids_for(&self, key: &str, role: KeyRole) -> RoaringBitmap {
        let Some(bm) = self.index.get(key) else {
            return RoaringBitmap::new();
        };
        if !self.is_shared(key, role) {
            return bm.value().clone();
        }
        bm.value()
            .iter()
            .filter(|id| {
                self.forward
                    .get(id)
                    .is_some_and(|name| role.holds(&name, key))
            })
            .collect()
    }

    /// Full name registered for `id`, or `""` when unknown.
    pub fn get_metric_name(&self, id: SeriesId) -> String {
        self.forward
            .get(&id)
            .map(|name| name.clone())
            .unwrap_or_default()
    }

    /// Ids matching `query`, ascending.
    pub fn lookup(&self, query: &Query) -> Vec<SeriesId> {
        self.lookup_ids(query).iter().collect()
    }

    pub fn lookup_ids(&self, query: &Query) -> RoaringBitmap {
        if self.is_closed() {
            return RoaringBitmap::new();
        }
        let (exclusive, inclusive): (Vec<&TagMatcher>, Vec<&TagMatcher>) =
            query.matchers.iter().partition(|m| m.is_exclusive());
        if exclusive.is_empty() {
            return self.included_ids(&query.metric_name, &inclusive);
        }

        // Exclusions alone still require the excluded keys to be present.
        let synthesized: Vec<TagMatcher> = if inclusive.is_empty() {
            exclusive
                .iter()
                .map(|m| TagMatcher::Wildcard {
                    key: m.key().to_string(),
                    pattern: "*".to_string(),
                    case_insensitive: false,
                })
                .collect()
        } else {
            Vec::new()
        };
        let inclusive: Vec<&TagMatcher> = if inclusive.is_empty() {
            synthesized.iter().collect()
        } else {
            inclusive
        };

        let mut ids = self.included_ids(&query.metric_name, &inclusive);
        if !ids.is_empty() {
            ids -= self.excluded_ids(&query.metric_name, &exclusive);
        }
        ids
    }

    fn included_ids(&self, metric_name: &str, matchers: &[&TagMatcher]) -> RoaringBitmap {
        let mut ids = self.ids_for(metric_name, KeyRole::Name);
        for m in matchers {
            if ids.is_empty() {
                break;
            }
            self.intersect(&mut ids, m.key(), KeyRole::TagKey);
            match m {
                TagMatcher::Exact { key, value } => {
                    self.intersect(&mut ids, &format!("{}={}", key, value), KeyRole::Tag)
                }
                TagMatcher::Wildcard { pattern, .. } if pattern == "*" => {}
                TagMatcher::LiteralOr {
                    key,
                    pattern,
                    case_insensitive: false,
                } => ids &= self.union_of(key, pattern),
                TagMatcher::NotLiteralOr { .. } => {}
                TagMatcher::Wildcard { .. }
                | TagMatcher::LiteralOr { .. }
                | TagMatcher::Regexp { .. } => ids = self.filter_by_value(&ids, m),
            }
        }
        ids
    }

    fn excluded_ids(&self, metric_name: &str, matchers: &[&TagMatcher]) -> RoaringBitmap {
        let mut ids = self.ids_for(metric_name, KeyRole::Name);
        for m in matchers {
            if ids.is_empty() {
                break;
            }
            self.intersect(&mut ids, m.key(), KeyRole::TagKey);
            match m {
                TagMatcher::NotLiteralOr {
                    key,
                    pattern,
                    case_insensitive: false,
                } => ids &= self.union_of(key, pattern),
                TagMatcher::NotLiteralOr { .. } => ids = self.filter_by_value(&ids, m),
                _ => {}
            }
        }
        ids
    }

    #[cfg(test)]
    fn bitmap(&self, key: &str) -> RoaringBitmap {
        self.index
            .get(key)
            .map(|bm| bm.value().clone())
            .unwrap_or_default()
    }

    fn intersect(&self, ids: &mut RoaringBitmap, key: &str, role: KeyRole) {
        if self.is_shared(key, role) {
            *ids &= self.ids_for(key, role);
            return;
        }
        match self.index.get(key) {
            Some(bm) => *ids &= bm.value(),
            None => ids.clear(),
        }
    }

    fn union_of(&self, key: &str, pattern: &str) -> RoaringBitmap {
        let mut out = RoaringBitmap::new();
        for alt in alternatives(pattern) {
            out |= self.ids_for(&format!("{}={}", key, alt), KeyRole::Tag);
        }
        out
    }

    /// Slow path: keep ids whose value for the matcher's key satisfies it.
    fn filter_by_value(&self, ids: &RoaringBitmap, m: &TagMatcher) -> RoaringBitmap {
        ids.iter()
            .filter(|id| {
                self.forward.get(id).is_some_and(|name| {
                    tag_value(&name, m.key()).is_some_and(|v| m.matches_value(v))
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn stats(&self) -> TagStoreStats {
        TagStoreStats {
            metrics: self.forward.len(),
            index_keys: self.index.len(),
            index_bytes: self
                .index
                .iter()
                .map(|e| e.value().serialized_size() as u64)
                .sum(),
        }
    }

    /// Drops every entry. Afterwards lookups are empty and creation fails.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.forward.clear();
        self.index.clear();
        self.roles.clear();
    }
}

/// Value of the first `key=` tag in a stored full name.
fn tag_value<'a>(full_name: &'a str, key: &str) -> Option<&'a str> {
    full_name
        .split(' ')
        .skip(1)
        .find_map(|raw| raw.strip_prefix(key)?.strip_prefix('='))
}
