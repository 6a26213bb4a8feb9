use std::path::{Path, PathBuf};

use thiserror::Error;

use super::types::{ChatMessage, CompletionRequest};
use crate::config::ModelConfig;
use crate::labels::NONE_SENTINEL;

/// Line separating the system instruction from the user template in a template file.
pub const TEMPLATE_MARKER: &str = "PROMPT_TEMPLATE";

const DEFAULT_SYSTEM: &str = "You sort email into folders. You answer with exactly one \
category name copied from the list you are given, or with NONE when the email is \
unreadable or fits none of them. Never add punctuation or explanation.";

const DEFAULT_TEMPLATE: &str = "Categories: {categories}

Pick the single best category for this email. Answer NONE if none applies.

{email_content}";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("failed to read prompt template {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("prompt template {} has no PROMPT_TEMPLATE line", .0.display())]
    MissingMarker(PathBuf),
}

/// System instruction plus a user template with `{categories}` and
/// `{email_content}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationPrompt {
    system: String,
    template: String,
}

impl Default for ClassificationPrompt {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM.to_string(),
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl ClassificationPrompt {
    pub fn from_template_text(text: &str) -> Option<Self> {
        let (system, template) = text.split_once(TEMPLATE_MARKER)?;
        Some(Self {
            system: system.trim().to_string(),
            template: template.trim().to_string(),
        })
    }

    pub async fn load(path: &Path) -> Result<Self, PromptError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| PromptError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_template_text(&text).ok_or_else(|| PromptError::MissingMarker(path.to_path_buf()))
    }

    /// The configured template file, or the built-in prompt when none is set.
    pub async fn from_config(config: &ModelConfig) -> Result<Self, PromptError> {
        match &config.prompt_template {
            Some(path) => Self::load(path).await,
            None => Ok(Self::default()),
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn render(&self, categories: &[String], email_content: &str) -> String {
        let categories =
            serde_json::to_string(categories).unwrap_or_else(|_| categories.join(", "));
        self.template
            .replace("{categories}", &categories)
            .replace("{email_content}", email_content)
    }

    pub fn request(
        &self,
        categories: &[String],
        email_content: &str,
        config: &ModelConfig,
    ) -> CompletionRequest {
        CompletionRequest {
            messages: vec![
                ChatMessage::system(&self.system),
                ChatMessage::user(self.render(categories, email_content)),
            ],
            temperature: config.temperature,
            max_tokens: config.max_output_tokens,
            json_mode: false,
        }
    }
}

/// How a classifier answer maps onto the category set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Category(String),
    /// The classifier declined to pick a category.
    None,
    /// Anything that is neither a known category nor the sentinel.
    Invalid(String),
}

impl Classification {
    /// Only surrounding whitespace and quotes are forgiven; the name must match exactly.
    pub fn parse(answer: &str, categories: &[String]) -> Self {
        let cleaned = answer.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        if cleaned == NONE_SENTINEL {
            Classification::None
        } else if categories.iter().any(|category| category == cleaned) {
            Classification::Category(cleaned.to_string())
        } else {
            Classification::Invalid(answer.to_string())
        }
    }
}
