//! Source language detection and Arabic text clean-up.

use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::error::ServiceError;

const ARABIC_BLOCK: std::ops::RangeInclusive<char> = '\u{0600}'..='\u{06FF}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    English,
    Arabic,
}

impl Language {
    /// The language a translation of `self` is written in.
    pub fn counterpart(self) -> Language {
        match self {
            Language::English => Language::Arabic,
            Language::Arabic => Language::English,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Language::English => "English",
            Language::Arabic => "Arabic",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How many Arabic-block characters it takes to call a text Arabic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "threshold", rename_all = "snake_case")]
pub enum DetectionPolicy {
    /// A single character from the block is enough.
    AnyMatch,
    /// The share of block characters must exceed the given fraction.
    Ratio(f64),
}

impl Default for DetectionPolicy {
    fn default() -> Self {
        DetectionPolicy::Ratio(0.1)
    }
}

impl FromStr for DetectionPolicy {
    type Err = ServiceError;

    /// Accepts `any`, `ratio` or `ratio:<fraction>`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let lower = raw.trim().to_lowercase();
        match lower.as_str() {
            "any" => Ok(DetectionPolicy::AnyMatch),
            "ratio" => Ok(DetectionPolicy::default()),
            other => {
                let fraction = other
                    .strip_prefix("ratio:")
                    .and_then(|v| v.parse::<f64>().ok())
                    .filter(|v| (0.0..1.0).contains(v))
                    .ok_or_else(|| {
                        ServiceError::Config(format!("unknown detection policy `{raw}`"))
                    })?;
                Ok(DetectionPolicy::Ratio(fraction))
            }
        }
    }
}

/// Classifies `text` as Arabic or English. Empty text is English.
pub fn detect(text: &str, policy: DetectionPolicy) -> Language {
    let mut total = 0usize;
    let mut arabic = 0usize;
    for ch in text.chars() {
        total += 1;
        if ARABIC_BLOCK.contains(&ch) {
            arabic += 1;
        }
    }
    if total == 0 {
        return Language::English;
    }

    let is_arabic = match policy {
        DetectionPolicy::AnyMatch => arabic > 0,
        DetectionPolicy::Ratio(threshold) => arabic as f64 / total as f64 > threshold,
    };
    if is_arabic {
        Language::Arabic
    } else {
        Language::English
    }
}

/// Arabic harakat, superscript alef and the generic combining marks.
fn is_diacritic(ch: char) -> bool {
    matches!(ch,
        '\u{0300}'..='\u{036F}'
        | '\u{0610}'..='\u{061A}'
        | '\u{064B}'..='\u{065F}'
        | '\u{0670}'
        | '\u{06D6}'..='\u{06DC}'
        | '\u{06DF}'..='\u{06E4}'
        | '\u{06E7}'
        | '\u{06E8}'
        | '\u{06EA}'..='\u{06ED}')
}

pub fn remove_diacritics(text: &str) -> String {
    text.chars().filter(|ch| !is_diacritic(*ch)).collect()
}
