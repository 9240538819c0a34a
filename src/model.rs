// src/model.rs
//! Core value types passed between stages.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Identity of a logical article. One publication record exists per id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArticleId(pub Uuid);

impl ArticleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ValidationError::invalid("article_id", e.to_string()))
    }
}

impl Default for ArticleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ArticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A normalized article as produced by the ingest layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: ArticleId,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub source_name: String,
    pub published_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    /// ISO-639-1 code of the original text.
    pub language: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

impl Article {
    /// Minimal constructor; ingest fills the rest.
    pub fn new(
        title: impl Into<String>,
        body: impl Into<String>,
        source_name: impl Into<String>,
        published_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ArticleId::new(),
            title: title.into(),
            body: body.into(),
            link: None,
            source_name: source_name.into(),
            published_at,
            fetched_at: Utc::now(),
            language: "en".to_string(),
            image_urls: Vec::new(),
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        validate_language_code(&self.language)?;
        Ok(())
    }
}

/// Source and target language for a translation request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LanguagePair {
    pub source: String,
    pub target: String,
}

impl LanguagePair {
    /// Both codes must be two ASCII letters; they are lower-cased.
    pub fn new(source: &str, target: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            source: validate_language_code(source)?,
            target: validate_language_code(target)?,
        })
    }

    /// Translating into the same language is a no-op.
    pub fn is_identity(&self) -> bool {
        self.source == self.target
    }
}

impl fmt::Display for LanguagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.source, self.target)
    }
}

pub(crate) fn validate_language_code(code: &str) -> Result<String, ValidationError> {
    let c = code.trim();
    if c.len() == 2 && c.chars().all(|ch| ch.is_ascii_alphabetic()) {
        Ok(c.to_ascii_lowercase())
    } else {
        Err(ValidationError::InvalidLanguageCode(code.to_string()))
    }
}

/// Article text after translation. Only produced once every entity was restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslatedArticle {
    pub title: String,
    pub body: String,
    pub language: String,
}
