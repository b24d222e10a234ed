use serde::{Deserialize, Serialize};

/// Sense prefixes that only point at another entry
const CROSS_REFERENCE_PREFIXES: &[&str] = &["variant of", "old variant of", "see ", "surname "];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryEntry {
    pub traditional: String,
    #[serde(default)]
    pub simplified: Option<String>,
    #[serde(default)]
    pub pronunciation: Option<String>,
    #[serde(default)]
    pub senses: Vec<String>,
}

impl DictionaryEntry {
    pub fn new(traditional: &str, pronunciation: &str, senses: &[&str]) -> Self {
        Self {
            traditional: traditional.to_string(),
            simplified: None,
            pronunciation: Some(pronunciation.to_string()).filter(|p| !p.trim().is_empty()),
            senses: senses.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// True when every sense just refers elsewhere
    pub fn is_cross_reference(&self) -> bool {
        !self.senses.is_empty()
            && self.senses.iter().all(|sense| {
                let sense = sense.trim_start().to_lowercase();
                CROSS_REFERENCE_PREFIXES
                    .iter()
                    .any(|prefix| sense.starts_with(prefix))
            })
    }

    pub fn has_pronunciation(&self) -> bool {
        self.pronunciation
            .as_deref()
            .map_or(false, |p| !p.trim().is_empty())
    }

    pub fn meaningful_senses(&self) -> impl Iterator<Item = &str> {
        self.senses
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    /// Senses joined into one display gloss
    pub fn gloss(&self) -> Option<String> {
        let joined = self.meaningful_senses().collect::<Vec<_>>().join("; ");
        (!joined.is_empty()).then_some(joined)
    }
}

/// Pick the entry to fill an entity from.
///
/// Cross-reference entries are ignored unless nothing else exists. Among the
/// rest: a pronunciation beats none, more senses beat fewer, and earlier
/// entries win ties.
pub fn choose_entry(entries: &[DictionaryEntry]) -> Option<&DictionaryEntry> {
    let best = entries
        .iter()
        .enumerate()
        .filter(|(_, entry)| !entry.is_cross_reference())
        .max_by(|(ia, a), (ib, b)| {
            a.has_pronunciation()
                .cmp(&b.has_pronunciation())
                .then(a.meaningful_senses().count().cmp(&b.meaningful_senses().count()))
                .then(ib.cmp(ia))
        })
        .map(|(_, entry)| entry);

    best.or_else(|| entries.first())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_reference_detection() {
        let variant = DictionaryEntry::new("氵", "shui3", &["variant of 水"]);
        assert!(variant.is_cross_reference());

        let mixed = DictionaryEntry::new("房", "fang2", &["see 房子", "house"]);
        assert!(!mixed.is_cross_reference());

        let empty = DictionaryEntry::new("房", "fang2", &[]);
        assert!(!empty.is_cross_reference());
    }

    #[test]
    fn test_prefers_pronunciation_then_senses_then_order() {
        let entries = vec![
            DictionaryEntry::new("水", "", &["water", "river", "liquid"]),
            DictionaryEntry::new("水", "shui3", &["surname Shui"]),
            DictionaryEntry::new("水", "shui3", &["water"]),
            DictionaryEntry::new("水", "shui3", &["water", "river"]),
            DictionaryEntry::new("水", "shui3", &["liquid", "lotion"]),
        ];

        let chosen = choose_entry(&entries).unwrap();
        assert_eq!(chosen.senses, vec!["water", "river"]);
    }

    #[test]
    fn test_falls_back_to_first_when_all_cross_references() {
        let entries = vec![
            DictionaryEntry::new("亾", "wang2", &["old variant of 亡"]),
            DictionaryEntry::new("亾", "wang2", &["variant of 亡"]),
        ];
        let chosen = choose_entry(&entries).unwrap();
        assert_eq!(chosen.senses, vec!["old variant of 亡"]);
    }

    #[test]
    fn test_no_entries() {
        assert!(choose_entry(&[]).is_none());
    }

    #[test]
    fn test_gloss_joins_senses() {
        let entry = DictionaryEntry::new("房間", "fang2 jian1", &["room", " ", "CL:間"]);
        assert_eq!(entry.gloss().as_deref(), Some("room; CL:間"));
        assert!(DictionaryEntry::new("x", "", &[]).gloss().is_none());
    }
}
