//! Instruction prompts for the generative pipelines.

use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::{error::ServiceError, language::Language};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    Translate,
    Rephrase,
}

impl Task {
    pub fn as_str(self) -> &'static str {
        match self {
            Task::Translate => "translate",
            Task::Rephrase => "rephrase",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Task {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "translate" => Ok(Task::Translate),
            "rephrase" => Ok(Task::Rephrase),
            other => Err(ServiceError::UnsupportedTask(other.to_string())),
        }
    }
}

/// JSON key holding the extracted keywords for text written in `language`.
pub fn tags_key(language: Language) -> &'static str {
    match language {
        Language::English => "english_tags",
        Language::Arabic => "arabic_tags",
    }
}

/// The empty JSON object the model is asked to fill, e.g. `{"english_tags":[]}`.
pub fn tags_template(language: Language) -> String {
    let mut object = serde_json::Map::new();
    object.insert(tags_key(language).to_string(), serde_json::Value::Array(Vec::new()));
    serde_json::Value::Object(object).to_string()
}

pub fn build_prompt(text: &str, task: Task, source: Language) -> String {
    match task {
        Task::Translate => translate_prompt(text, source),
        Task::Rephrase => rephrase_prompt(text, source),
    }
}

fn translate_prompt(text: &str, source: Language) -> String {
    let target = source.counterpart();
    let mut rules = vec![
        format!("Respond with the {target} translation only."),
        "Do not add explanations, notes, transliterations or any other text.".to_string(),
        format!("Do not leave any {source} words or characters untranslated."),
    ];
    if target == Language::Arabic {
        rules.push("Do not use diacritics (tashkeel) in the Arabic output.".to_string());
        rules.push("Do not add punctuation that is not present in the original text.".to_string());
    }

    format!(
        "Translate the following {source} text to {target}.\n{}\n\nText: \"{text}\"",
        rules.join("\n")
    )
}

fn rephrase_prompt(text: &str, source: Language) -> String {
    let template = tags_template(source);
    let key = tags_key(source);
    format!(
        "Extract the keywords from the following {source} text.\n\
         Correct any spelling mistakes and normalize every keyword.\n\
         Remove duplicates and stop words.\n\
         Respond with a single JSON object shaped exactly like {template}, \
         with the keywords as strings in the \"{key}\" array.\n\
         Do not wrap the JSON in markdown code fences and do not add any other text.\n\n\
         Text: \"{text}\""
    )
}

/// Wraps a prompt in the Gemma chat turn markup expected by the fine-tuned model.
pub fn chat_turn(prompt: &str) -> String {
    format!("<start_of_turn>user\n{prompt}<end_of_turn>\n<start_of_turn>model\n")
}
