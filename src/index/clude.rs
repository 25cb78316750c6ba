//! Include / exclude tag filtering and counter expansion
//!
//! ```text
//! tagkv    core=[0,1,2]  host=[h1]
//! include  core=[1,2]
//! exclude  core=[2]
//!   ↓ filter
//! core=[1]  host=[h1]
//!   ↓ expand (keys ascending)
//! ["core=1,host=h1"]
//! ```

use crate::index::TagPair;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Surviving values per tag key, keys sorted ascending
pub type SortedTags = Vec<(String, Vec<String>)>;

/// Apply include/exclude lists to a tag catalog
///
/// Returns `None` when the filter cannot match anything: an include key
/// unknown to the catalog, or a catalog key left without values.
/// Exclude wins over include for the same value.
pub fn filter_tagkv(
    tagkv: &HashMap<String, Vec<String>>,
    include: &[TagPair],
    exclude: &[TagPair],
) -> Option<SortedTags> {
    let mut inc: HashMap<&str, HashSet<&str>> = HashMap::new();
    for pair in include {
        if !tagkv.contains_key(&pair.key) {
            return None;
        }
        inc.entry(pair.key.as_str())
            .or_default()
            .extend(pair.values.iter().map(String::as_str));
    }

    let mut exc: HashMap<&str, HashSet<&str>> = HashMap::new();
    for pair in exclude {
        if tagkv.contains_key(&pair.key) {
            exc.entry(pair.key.as_str())
                .or_default()
                .extend(pair.values.iter().map(String::as_str));
        }
    }

    let mut surviving: SortedTags = Vec::with_capacity(tagkv.len());
    for (key, values) in tagkv {
        let excluded = exc.get(key.as_str());
        let included = inc.get(key.as_str());

        let kept: Vec<String> = values
            .iter()
            .filter(|v| !excluded.map(|set| set.contains(v.as_str())).unwrap_or(false))
            .filter(|v| included.map(|set| set.contains(v.as_str())).unwrap_or(true))
            .cloned()
            .collect();

        if kept.is_empty() {
            return None;
        }
        surviving.push((key.clone(), kept));
    }

    surviving.sort_by(|a, b| a.0.cmp(&b.0));
    Some(surviving)
}

/// Number of counters [`expand`] would produce
///
/// Saturates instead of overflowing on absurd fan-outs.
pub fn product_size(tags: &SortedTags) -> u128 {
    if tags.is_empty() {
        return 0;
    }
    tags.iter()
        .fold(1u128, |acc, (_, values)| acc.saturating_mul(values.len() as u128))
}

/// Cartesian product of sorted tag values as counter strings
pub fn expand(tags: &SortedTags) -> Vec<String> {
    if tags.is_empty() {
        return Vec::new();
    }

    let mut counters = vec![String::new()];
    for (i, (key, values)) in tags.iter().enumerate() {
        let mut next = Vec::with_capacity(counters.len() * values.len());
        for prefix in &counters {
            for value in values {
                let mut counter = String::with_capacity(prefix.len() + key.len() + value.len() + 2);
                counter.push_str(prefix);
                if i > 0 {
                    counter.push(',');
                }
                counter.push_str(key);
                counter.push('=');
                counter.push_str(value);
                next.push(counter);
            }
        }
        counters = next;
    }

    counters
}

/// Merge client-supplied tag pairs into sorted, de-duplicated form
pub fn sort_tag_pairs(pairs: &[TagPair]) -> SortedTags {
    let mut merged: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for pair in pairs {
        let values = merged.entry(pair.key.as_str()).or_default();
        for value in &pair.values {
            if !values.contains(value) {
                values.push(value.clone());
            }
        }
    }

    merged
        .into_iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(key, values)| (key.to_string(), values))
        .collect()
}
