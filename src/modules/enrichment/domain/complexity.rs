//! Local complexity scoring: no external calls, deterministic for a given
//! key, pronunciation and gloss.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;

/// Used for characters missing from the stroke table
pub const FALLBACK_STROKES: u32 = 10;

/// Average strokes per character that maps to a visual complexity of 1.0
const VISUAL_SATURATION: f32 = 20.0;

const NEUTRAL_TONE: u8 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityMetrics {
    pub component_count: u32,
    pub stroke_count: u32,
    /// 1-4 for the four tones, 5 for neutral
    pub tone_pattern: Vec<u8>,
    pub visual_complexity: f32,
    pub difficulty: f32,
}

pub fn analyze(key: &str, pronunciation: Option<&str>, gloss: Option<&str>) -> ComplexityMetrics {
    let characters: Vec<char> = key.chars().filter(|c| !c.is_whitespace()).collect();
    let strokes: Vec<u32> = characters.iter().map(|c| estimate_strokes(*c)).collect();

    let stroke_count: u32 = strokes.iter().sum();
    let component_count: u32 = strokes.iter().map(|s| estimate_components(*s)).sum();

    let visual_complexity = if strokes.is_empty() {
        0.0
    } else {
        let average = stroke_count as f32 / strokes.len() as f32;
        (average / VISUAL_SATURATION).clamp(0.0, 1.0)
    };

    let tone_pattern = pronunciation.map(parse_tone_pattern).unwrap_or_default();

    let length = (characters.len().saturating_sub(1).min(3)) as f32 / 3.0;
    let tone_variety = {
        let distinct: HashSet<u8> = tone_pattern
            .iter()
            .copied()
            .filter(|t| *t != NEUTRAL_TONE)
            .collect();
        distinct.len() as f32 / 4.0
    };
    let ambiguity = gloss.map(gloss_ambiguity).unwrap_or(0.0);

    let difficulty = (0.45 * visual_complexity + 0.2 * length + 0.15 * tone_variety + 0.2 * ambiguity)
        .clamp(0.0, 1.0);

    ComplexityMetrics {
        component_count,
        stroke_count,
        tone_pattern,
        visual_complexity,
        difficulty,
    }
}

pub fn estimate_strokes(c: char) -> u32 {
    STROKE_TABLE
        .iter()
        .find(|(known, _)| *known == c)
        .map_or(FALLBACK_STROKES, |(_, strokes)| *strokes)
}

fn estimate_components(strokes: u32) -> u32 {
    match strokes {
        0..=4 => 1,
        5..=10 => 2,
        _ => 3,
    }
}

/// Senses beyond the first push the score up, saturating at five
fn gloss_ambiguity(gloss: &str) -> f32 {
    let senses = gloss
        .split(|c| c == ';' || c == '/')
        .filter(|s| !s.trim().is_empty())
        .count();
    (senses.saturating_sub(1).min(4)) as f32 / 4.0
}

fn numbered_syllable() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)[a-zü:v]+([1-5])").ok())
        .as_ref()
}

/// Tones from numbered ("shui3") or diacritic ("shuǐ", "fángjiān") pinyin.
/// Unmarked syllables count as neutral.
pub fn parse_tone_pattern(pronunciation: &str) -> Vec<u8> {
    if let Some(pattern) = numbered_syllable() {
        let numbered: Vec<u8> = pattern
            .captures_iter(pronunciation)
            .filter_map(|caps| caps.get(1))
            .filter_map(|tone| tone.as_str().parse::<u8>().ok())
            .collect();
        if !numbered.is_empty() {
            return numbered;
        }
    }

    pronunciation
        .split(|c: char| c.is_whitespace() || c == '-' || c == '\'' || c == '’')
        .filter(|chunk| chunk.chars().any(|c| c.is_alphabetic()))
        .flat_map(|chunk| {
            let marked: Vec<u8> = chunk.chars().filter_map(diacritic_tone).collect();
            if marked.is_empty() {
                vec![NEUTRAL_TONE]
            } else {
                marked
            }
        })
        .collect()
}

fn diacritic_tone(c: char) -> Option<u8> {
    match c {
        'ā' | 'ē' | 'ī' | 'ō' | 'ū' | 'ǖ' | 'Ā' | 'Ē' | 'Ī' | 'Ō' | 'Ū' | '\u{0304}' => Some(1),
        'á' | 'é' | 'í' | 'ó' | 'ú' | 'ǘ' | 'Á' | 'É' | 'Í' | 'Ó' | 'Ú' | '\u{0301}' => Some(2),
        'ǎ' | 'ě' | 'ǐ' | 'ǒ' | 'ǔ' | 'ǚ' | 'Ǎ' | 'Ě' | 'Ǐ' | 'Ǒ' | 'Ǔ' | '\u{030C}' => Some(3),
        'à' | 'è' | 'ì' | 'ò' | 'ù' | 'ǜ' | 'À' | 'È' | 'Ì' | 'Ò' | 'Ù' | '\u{0300}' => Some(4),
        _ => None,
    }
}

// Traditional forms
const STROKE_TABLE: &[(char, u32)] = &[
    ('一', 1), ('二', 2), ('十', 2), ('人', 2), ('入', 2), ('八', 2), ('力', 2),
    ('三', 3), ('口', 3), ('土', 3), ('大', 3), ('女', 3), ('子', 3), ('山', 3),
    ('小', 3), ('上', 3), ('下', 3), ('工', 3), ('千', 3), ('川', 3), ('弓', 3),
    ('中', 4), ('水', 4), ('火', 4), ('木', 4), ('日', 4), ('月', 4), ('天', 4),
    ('心', 4), ('手', 4), ('文', 4), ('不', 4), ('王', 4), ('犬', 4), ('牛', 4),
    ('毛', 4), ('方', 4), ('五', 4), ('六', 4), ('分', 4), ('今', 4), ('太', 4),
    ('少', 4), ('生', 5), ('白', 5), ('目', 5), ('田', 5), ('石', 5), ('立', 5),
    ('出', 5), ('北', 5), ('半', 5), ('四', 5), ('用', 5), ('母', 5), ('本', 5),
    ('他', 5), ('永', 5), ('年', 6), ('字', 6), ('好', 6), ('多', 6), ('米', 6),
    ('西', 6), ('百', 6), ('同', 6), ('有', 6), ('在', 6), ('自', 6), ('羊', 6),
    ('耳', 6), ('衣', 6), ('老', 6), ('肉', 6), ('冰', 6), ('你', 7), ('我', 7),
    ('言', 7), ('見', 7), ('車', 7), ('足', 7), ('走', 7), ('身', 7), ('男', 7),
    ('求', 7), ('花', 8), ('房', 8), ('長', 8), ('東', 8), ('雨', 8), ('金', 8),
    ('明', 8), ('的', 8), ('門', 8), ('林', 8), ('青', 8), ('來', 8), ('夜', 8),
    ('朋', 8), ('泳', 8), ('是', 9), ('紅', 9), ('春', 9), ('看', 9), ('南', 9),
    ('音', 9), ('星', 9), ('食', 9), ('風', 9), ('飛', 9), ('時', 10), ('書', 10),
    ('個', 10), ('們', 10), ('家', 10), ('馬', 10), ('高', 10), ('海', 10),
    ('病', 10), ('氣', 10), ('茶', 10), ('魚', 11), ('鳥', 11), ('國', 11),
    ('問', 11), ('這', 11), ('習', 11), ('雪', 11), ('眼', 11), ('間', 12),
    ('開', 12), ('買', 12), ('黑', 12), ('電', 13), ('話', 13), ('愛', 13),
    ('會', 13), ('新', 13), ('想', 13), ('說', 14), ('語', 14), ('聞', 14),
    ('對', 14), ('熱', 15), ('學', 16), ('貓', 16), ('龍', 16), ('頭', 16),
    ('錢', 16), ('關', 19), ('難', 19), ('麗', 19), ('聽', 22), ('讀', 22),
    ('體', 23), ('灣', 25),
];
