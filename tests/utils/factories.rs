/// Test data builders with sensible defaults
use chrono::Utc;
use hanzi_enrichment::modules::enrichment::domain::{
    ConfusionEntry, DictionaryEntry, EnrichableEntity, Etymology, LearningTips, Mnemonics,
    RichInsights,
};

/// Insights that pass validation
pub fn valid_insights(key: &str) -> RichInsights {
    RichInsights {
        etymology: Etymology {
            origin: format!("Pictograph behind {}", key),
            ..Default::default()
        },
        mnemonics: Mnemonics {
            visual: format!("Picture {} as a drawing", key),
            story: None,
        },
        learning_tips: LearningTips {
            for_beginners: vec![format!("Write {} ten times", key)],
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Insights with a blank etymology origin
pub fn insights_without_origin(key: &str) -> RichInsights {
    let mut insights = valid_insights(key);
    insights.etymology.origin = "   ".to_string();
    insights
}

pub fn dictionary_entry(key: &str, pronunciation: &str, senses: &[&str]) -> DictionaryEntry {
    DictionaryEntry::new(key, pronunciation, senses)
}

pub fn confusions(pairs: &[(&str, &str)]) -> Vec<ConfusionEntry> {
    pairs
        .iter()
        .map(|(key, reason)| ConfusionEntry::new(key, reason))
        .collect()
}

pub fn entity(key: &str) -> EnrichableEntity {
    EnrichableEntity::new(key, Utc::now())
}
