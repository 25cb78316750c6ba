//! Counter Index - full tag combinations reported for one metric
//!
//! A counter is the canonical form of a tag map: keys sorted ascending,
//! joined as `k1=v1,k2=v2`. One counter identifies one series.

use parking_lot::RwLock;
use std::collections::HashMap;

/// Canonical counter string for a tag map
///
/// Two maps holding the same key/value pairs always produce byte-identical
/// strings. An empty map yields the empty string.
pub fn counter_key(tags: &HashMap<String, String>) -> String {
    let mut pairs: Vec<(&String, &String)> = tags.iter().collect();
    pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));

    let mut counter = String::with_capacity(pairs.iter().map(|(k, v)| k.len() + v.len() + 2).sum());
    for (i, (key, value)) in pairs.into_iter().enumerate() {
        if i > 0 {
            counter.push(',');
        }
        counter.push_str(key);
        counter.push('=');
        counter.push_str(value);
    }
    counter
}

/// Counter → last seen (unix seconds)
pub type CounterMap = HashMap<String, i64>;

/// Set of counters observed for one metric
#[derive(Debug, Default)]
pub struct CounterIndex {
    counters: RwLock<CounterMap>,
}

impl CounterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the persisted form
    pub fn from_map(counters: CounterMap) -> Self {
        Self {
            counters: RwLock::new(counters),
        }
    }

    /// Record one observation of `counter` at `ts`
    pub fn set(&self, counter: &str, ts: i64) {
        let mut counters = self.counters.write();
        match counters.get_mut(counter) {
            Some(seen) => {
                if ts > *seen {
                    *seen = ts;
                }
            }
            None => {
                counters.insert(counter.to_string(), ts);
            }
        }
    }

    /// Fold another counter map in, keeping the newest timestamp
    pub fn merge_map(&self, other: CounterMap) {
        let mut counters = self.counters.write();
        for (counter, ts) in other {
            let seen = counters.entry(counter).or_insert(ts);
            if ts > *seen {
                *seen = ts;
            }
        }
    }

    /// Membership test
    pub fn contains(&self, counter: &str) -> bool {
        self.counters.read().contains_key(counter)
    }

    /// Snapshot of all counters (order unspecified)
    pub fn get_counters(&self) -> Vec<String> {
        self.counters.read().keys().cloned().collect()
    }

    /// Keep only the candidates that exist in this index
    pub fn filter_existing<'a, I>(&self, candidates: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let counters = self.counters.read();
        candidates
            .into_iter()
            .filter(|c| counters.contains_key(c.as_str()))
            .cloned()
            .collect()
    }

    pub fn last_seen(&self, counter: &str) -> Option<i64> {
        self.counters.read().get(counter).copied()
    }

    pub fn remove(&self, counter: &str) -> bool {
        self.counters.write().remove(counter).is_some()
    }

    /// Remove every counter carrying the exact pair `key=value`
    pub fn remove_with_tag(&self, key: &str, value: &str) -> usize {
        let pair = format!("{}={}", key, value);
        let mut counters = self.counters.write();
        let before = counters.len();
        counters.retain(|counter, _| !counter.split(',').any(|p| p == pair));
        before - counters.len()
    }

    /// Drop every counter not seen within `max_age` seconds of `now`
    pub fn clean(&self, now: i64, max_age: i64) -> usize {
        let mut counters = self.counters.write();
        let before = counters.len();
        counters.retain(|_, seen| now - *seen <= max_age);
        before - counters.len()
    }

    pub fn len(&self) -> usize {
        self.counters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.read().is_empty()
    }

    pub fn to_map(&self) -> CounterMap {
        self.counters.read().clone()
    }
}
