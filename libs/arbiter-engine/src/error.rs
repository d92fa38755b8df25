// Errors surfaced at the engine boundary.
//
// Only a request naming a language the engine cannot judge is rejected with
// an error. Every other failure is folded into the JudgingResult verdict.

use arbiter_common::types::{Language, UnknownLanguage};

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("invalid engine configuration: {0}")]
    Config(#[from] anyhow::Error),
}

impl From<UnknownLanguage> for JudgeError {
    fn from(e: UnknownLanguage) -> Self {
        JudgeError::UnsupportedLanguage(e.0)
    }
}

impl JudgeError {
    pub fn not_configured(language: Language) -> Self {
        JudgeError::UnsupportedLanguage(language.to_string())
    }
}

pub type JudgeResult<T> = std::result::Result<T, JudgeError>;
