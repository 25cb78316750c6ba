//! TagKV Index - per-metric catalog of tag keys and their observed values
//!
//! Maps tag key → (tag value → last seen unix seconds) for one metric.
//!
//! # Example
//! ```ignore
//! // cpu.idle reported with core=0 and core=1
//! let values = tagkv.get_tag_values("core");
//! // values = ["0", "1"]
//! ```
//!
//! # Design Notes
//! - Guarded by its own lock so writers on a hot metric do not contend
//!   with metric-name enumeration on the same endpoint
//! - A value timestamp only ever moves forward
//! - Empty inner maps are never left behind by a sweep

use parking_lot::RwLock;
use std::collections::HashMap;

/// Tag key → tag value → last seen (unix seconds)
pub type TagkvMap = HashMap<String, HashMap<String, i64>>;

/// Catalog of tag keys and values observed for one metric
#[derive(Debug, Default)]
pub struct TagkvIndex {
    tags: RwLock<TagkvMap>,
}

impl TagkvIndex {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a catalog from its persisted form
    pub fn from_map(tags: TagkvMap) -> Self {
        let tags = tags
            .into_iter()
            .filter(|(_, values)| !values.is_empty())
            .collect();

        Self {
            tags: RwLock::new(tags),
        }
    }

    /// Record one observation of `key=value` at `ts`
    pub fn set(&self, key: &str, value: &str, ts: i64) {
        let mut tags = self.tags.write();
        Self::upsert(&mut tags, key, value, ts);
    }

    /// Record every pair of a tag map under a single write lock
    pub fn set_tags(&self, pairs: &HashMap<String, String>, ts: i64) {
        if pairs.is_empty() {
            return;
        }

        let mut tags = self.tags.write();
        for (key, value) in pairs {
            Self::upsert(&mut tags, key, value, ts);
        }
    }

    fn upsert(tags: &mut TagkvMap, key: &str, value: &str, ts: i64) {
        let values = match tags.get_mut(key) {
            Some(values) => values,
            None => tags.entry(key.to_string()).or_default(),
        };

        match values.get_mut(value) {
            Some(seen) => {
                if ts > *seen {
                    *seen = ts;
                }
            }
            None => {
                values.insert(value.to_string(), ts);
            }
        }
    }

    /// Fold another catalog in, keeping the newest timestamp per value
    pub fn merge_map(&self, other: TagkvMap) {
        let mut tags = self.tags.write();
        for (key, values) in other {
            for (value, ts) in values {
                Self::upsert(&mut tags, &key, &value, ts);
            }
        }
    }

    /// Snapshot: tag key → observed values (value order is unspecified)
    pub fn get_tagkv_map(&self) -> HashMap<String, Vec<String>> {
        self.tags
            .read()
            .iter()
            .map(|(key, values)| (key.clone(), values.keys().cloned().collect()))
            .collect()
    }

    /// All observed values for one tag key
    pub fn get_tag_values(&self, key: &str) -> Vec<String> {
        self.tags
            .read()
            .get(key)
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// All known tag keys
    pub fn get_keys(&self) -> Vec<String> {
        self.tags.read().keys().cloned().collect()
    }

    /// Last seen timestamp of `key=value`
    pub fn last_seen(&self, key: &str, value: &str) -> Option<i64> {
        self.tags
            .read()
            .get(key)
            .and_then(|values| values.get(value))
            .copied()
    }

    /// Remove a single tag value; drops the key when it has no values left
    pub fn del_tag(&self, key: &str, value: &str) -> bool {
        let mut tags = self.tags.write();

        let Some(values) = tags.get_mut(key) else {
            return false;
        };

        let removed = values.remove(value).is_some();
        if values.is_empty() {
            tags.remove(key);
        }

        removed
    }

    /// Drop every value not seen within `max_age` seconds of `now`
    ///
    /// Returns the number of values removed.
    pub fn clean(&self, now: i64, max_age: i64) -> usize {
        let mut tags = self.tags.write();
        let mut removed = 0;

        for values in tags.values_mut() {
            let before = values.len();
            values.retain(|_, seen| now - *seen <= max_age);
            removed += before - values.len();
        }

        tags.retain(|_, values| !values.is_empty());
        removed
    }

    /// Number of tag keys
    pub fn key_count(&self) -> usize {
        self.tags.read().len()
    }

    /// Number of distinct key/value pairs
    pub fn value_count(&self) -> usize {
        self.tags.read().values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.read().is_empty()
    }

    /// Copy of the full catalog including timestamps, for persistence
    pub fn to_map(&self) -> TagkvMap {
        self.tags.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_set_and_get() {
        let index = TagkvIndex::new();

        index.set("core", "0", 1000);
        index.set("core", "1", 1000);
        index.set("host", "h1", 1000);

        let map = index.get_tagkv_map();
        assert_eq!(map.len(), 2);

        let mut cores = index.get_tag_values("core");
        cores.sort();
        assert_eq!(cores, vec!["0", "1"]);

        assert_eq!(index.get_tag_values("host"), vec!["h1"]);
        assert!(index.get_tag_values("missing").is_empty());
        assert_eq!(index.value_count(), 3);
    }

    #[test]
    fn test_timestamp_never_decreases() {
        let index = TagkvIndex::new();

        index.set("core", "0", 2000);
        index.set("core", "0", 1500);
        assert_eq!(index.last_seen("core", "0"), Some(2000));

        index.set("core", "0", 2500);
        assert_eq!(index.last_seen("core", "0"), Some(2500));
    }

    #[test]
    fn test_set_tags() {
        let index = TagkvIndex::new();
        index.set_tags(&tags(&[("core", "0"), ("host", "h1")]), 1000);

        assert_eq!(index.key_count(), 2);
        assert_eq!(index.last_seen("host", "h1"), Some(1000));
    }

    #[test]
    fn test_clean_removes_stale_values_and_empty_keys() {
        let index = TagkvIndex::new();

        index.set("core", "0", 1000);
        index.set("core", "1", 1900);
        index.set("disk", "sda", 1000);

        let removed = index.clean(2000, 500);
        assert_eq!(removed, 2);

        assert_eq!(index.get_tag_values("core"), vec!["1"]);
        assert!(index.get_keys().iter().all(|k| k != "disk"));
        assert_eq!(index.key_count(), 1);
    }

    #[test]
    fn test_clean_keeps_boundary() {
        let index = TagkvIndex::new();
        index.set("core", "0", 1000);

        // now - ts == max_age survives
        assert_eq!(index.clean(1500, 500), 0);
        assert_eq!(index.clean(1501, 500), 1);
        assert!(index.is_empty());
    }

    #[test]
    fn test_del_tag() {
        let index = TagkvIndex::new();
        index.set("core", "0", 1000);
        index.set("core", "1", 1000);

        assert!(index.del_tag("core", "0"));
        assert!(!index.del_tag("core", "0"));
        assert!(index.del_tag("core", "1"));
        assert!(index.is_empty());
        assert!(!index.del_tag("missing", "x"));
    }

    #[test]
    fn test_merge_map_keeps_newest() {
        let index = TagkvIndex::new();
        index.set("core", "0", 2000);

        let other = TagkvIndex::new();
        other.set("core", "0", 1000);
        other.set("core", "1", 1500);

        index.merge_map(other.to_map());
        assert_eq!(index.last_seen("core", "0"), Some(2000));
        assert_eq!(index.last_seen("core", "1"), Some(1500));
    }

    #[test]
    fn test_map_round_trip_drops_empty_keys() {
        let index = TagkvIndex::new();
        index.set("core", "0", 1000);

        let mut map = index.to_map();
        map.insert("empty".to_string(), HashMap::new());

        let restored = TagkvIndex::from_map(map);
        assert_eq!(restored.key_count(), 1);
        assert_eq!(restored.last_seen("core", "0"), Some(1000));
    }
}
