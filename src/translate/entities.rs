// src/translate/entities.rs
//! Proper-noun protection around a translation call.
//!
//! Candidate entities are Title Case runs ("Elden Ring") and ALL-CAPS runs of
//! at least two characters, digits allowed ("GTA VI", "PS5"). Each distinct
//! entity has its first occurrence swapped for `__ENT{idx}__`; later repeats
//! stay as plain text and go through translation like any other word.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::TranslationError;

static ENTITY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b\p{Lu}\p{Ll}+(?:[ \t]+\p{Lu}\p{Ll}+)*\b|\b\p{Lu}[\p{Lu}\d]+(?:[ \t]+\p{Lu}[\p{Lu}\d]+)*\b",
    )
    .unwrap()
});

// Backends like to add spaces or change case inside markers.
static MARKER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)__\s*ENT\s*(\d+)\s*__").unwrap());

pub fn placeholder(idx: usize) -> String {
    format!("__ENT{idx}__")
}

/// Text prepared for translation. Lives only for the duration of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatableText {
    original: String,
    protected: String,
    entities: Vec<String>,
    translated: Option<String>,
}

impl TranslatableText {
    pub fn protect(text: &str) -> Self {
        // Input that already looks like our markers cannot be round-tripped safely.
        if MARKER_RE.is_match(text) {
            return Self::unprotected(text);
        }

        let mut entities: Vec<String> = Vec::new();
        let mut protected = String::with_capacity(text.len());
        let mut last = 0;
        for m in ENTITY_RE.find_iter(text) {
            if entities.iter().any(|e| e == m.as_str()) {
                continue;
            }
            protected.push_str(&text[last..m.start()]);
            protected.push_str(&placeholder(entities.len()));
            entities.push(m.as_str().to_string());
            last = m.end();
        }
        protected.push_str(&text[last..]);

        Self {
            original: text.to_string(),
            protected,
            entities,
            translated: None,
        }
    }

    fn unprotected(text: &str) -> Self {
        Self {
            original: text.to_string(),
            protected: text.to_string(),
            entities: Vec::new(),
            translated: None,
        }
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    /// What gets sent to the backend.
    pub fn protected(&self) -> &str {
        &self.protected
    }

    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    pub fn translated(&self) -> Option<&str> {
        self.translated.as_deref()
    }

    /// Put the entities back into `backend_output`. Every placeholder must come
    /// back exactly once; a missing, repeated or unknown one fails the whole
    /// restore.
    pub fn restore(&mut self, backend_output: &str) -> Result<&str, TranslationError> {
        if self.entities.is_empty() {
            self.translated = Some(backend_output.to_string());
            return Ok(self.translated.as_deref().unwrap_or_default());
        }

        let mut seen = vec![false; self.entities.len()];
        let mut out = String::with_capacity(backend_output.len());
        let mut last = 0;
        for caps in MARKER_RE.captures_iter(backend_output) {
            let whole = caps.get(0).map(|m| (m.start(), m.end(), m.as_str()));
            let (start, end, raw) = match whole {
                Some(w) => w,
                None => continue,
            };
            let idx = caps
                .get(1)
                .and_then(|d| d.as_str().parse::<usize>().ok())
                .filter(|i| *i < self.entities.len())
                .ok_or_else(|| TranslationError::PlaceholderLost(raw.to_string()))?;
            if std::mem::replace(&mut seen[idx], true) {
                return Err(TranslationError::PlaceholderLost(raw.to_string()));
            }
            out.push_str(&backend_output[last..start]);
            out.push_str(&self.entities[idx]);
            last = end;
        }
        out.push_str(&backend_output[last..]);

        if let Some(missing) = seen.iter().position(|s| !s) {
            return Err(TranslationError::PlaceholderLost(placeholder(missing)));
        }

        self.translated = Some(out);
        Ok(self.translated.as_deref().unwrap_or_default())
    }
}
