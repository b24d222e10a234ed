use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How many confusable entries an entity keeps
pub const DEFAULT_CONFUSION_LIMIT: usize = 3;

/// Another headword a learner is likely to mix up with this one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionEntry {
    pub key: String,
    #[serde(default)]
    pub pronunciation: Option<String>,
    #[serde(default)]
    pub reason: String,
}

impl ConfusionEntry {
    pub fn new(key: &str, reason: &str) -> Self {
        Self {
            key: key.to_string(),
            pronunciation: None,
            reason: reason.to_string(),
        }
    }
}

/// Clean up analyzer output for `key`.
///
/// Drops blank entries, the key itself, and, when the key has more than one
/// character, any single character taken from it. Duplicates keep their first
/// occurrence; at most `limit` entries survive.
pub fn filter_confusions(
    key: &str,
    candidates: Vec<ConfusionEntry>,
    limit: usize,
) -> Vec<ConfusionEntry> {
    let key = key.trim();
    let own_chars: HashSet<char> = if key.chars().count() > 1 {
        key.chars().collect()
    } else {
        HashSet::new()
    };

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter_map(|mut entry| {
            entry.key = entry.key.trim().to_string();
            if entry.key.is_empty() || entry.key == key {
                return None;
            }

            let mut chars = entry.key.chars();
            if let (Some(only), None) = (chars.next(), chars.next()) {
                if own_chars.contains(&only) {
                    return None;
                }
            }

            seen.insert(entry.key.clone()).then_some(entry)
        })
        .take(limit)
        .collect()
}
