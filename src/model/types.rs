use std::fmt;

use serde::{Deserialize, Serialize};

use crate::language::Language;

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default = "default_task")]
    pub task: String,
}

fn default_task() -> String {
    "translate".to_string()
}

impl GenerationRequest {
    pub fn new(text: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            task: task.into(),
        }
    }
}

/// One item of a generation's outbound event sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Token(String),
    EndOfStream,
    Error,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Token(_))
    }
}

/// Registry slot a loaded model is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKey {
    TranslateEnAr,
    TranslateArEn,
    RephraseEn,
    Instruct,
}

impl ModelKey {
    /// The translation model that reads `source`.
    pub fn translation_from(source: Language) -> ModelKey {
        match source {
            Language::English => ModelKey::TranslateEnAr,
            Language::Arabic => ModelKey::TranslateArEn,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelKey::TranslateEnAr => "translate_en_ar",
            ModelKey::TranslateArEn => "translate_ar_en",
            ModelKey::RephraseEn => "rephrase_en",
            ModelKey::Instruct => "instruct",
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sampling {
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DecodeParams {
    pub max_new_tokens: usize,
    pub num_beams: usize,
    pub sampling: Option<Sampling>,
}

impl DecodeParams {
    pub fn beam(max_new_tokens: usize, num_beams: usize) -> Self {
        Self {
            max_new_tokens,
            num_beams,
            sampling: None,
        }
    }

    pub fn sampled(max_new_tokens: usize, sampling: Sampling) -> Self {
        Self {
            max_new_tokens,
            num_beams: 1,
            sampling: Some(sampling),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub backend: &'static str,
    pub source: String,
}
