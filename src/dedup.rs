// src/dedup.rs
//! Fingerprint-based novelty check.
//!
//! The store's unique index on the fingerprint is the only serialization point:
//! two workers registering the same content race on the insert, the loser sees
//! `UniqueViolation` and re-reads the winner's id.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{StoreError, ValidationError};
use crate::ingest::{anon_hash, normalize_text};
use crate::model::{Article, ArticleId};
use crate::store::ArticleStore;

pub const DEFAULT_PREFIX_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FingerprintAlgorithm {
    /// SHA-256 truncated to 128 bits.
    #[default]
    #[serde(rename = "sha256-128")]
    Sha256Truncated,
    #[serde(rename = "sha256")]
    Sha256,
}

impl FingerprintAlgorithm {
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256-128" => Ok(Self::Sha256Truncated),
            "sha256" => Ok(Self::Sha256),
            other => Err(ValidationError::invalid(
                "dedup.algorithm",
                format!("unknown algorithm `{other}`"),
            )),
        }
    }

    fn digest_len(self) -> usize {
        match self {
            Self::Sha256Truncated => 16,
            Self::Sha256 => 32,
        }
    }
}

/// Hex-encoded content digest. Immutable once computed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap a previously stored value.
    pub fn from_hex(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_for_fingerprint(s: &str) -> String {
    normalize_text(s).to_lowercase()
}

/// Digest of the normalized title and the first `prefix_len` characters of the
/// normalized body.
pub fn fingerprint(
    article: &Article,
    prefix_len: usize,
    algorithm: FingerprintAlgorithm,
) -> ContentFingerprint {
    let title = normalize_for_fingerprint(&article.title);
    let body = normalize_for_fingerprint(&article.body);
    let prefix: String = body.chars().take(prefix_len).collect();

    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(b"\n");
    hasher.update(prefix.as_bytes());
    let digest = hasher.finalize();
    ContentFingerprint(hex::encode(&digest[..algorithm.digest_len()]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First time this content is seen; the article was stored under this id.
    Unique(ArticleId),
    /// Same content already stored under the given id. Nothing was written.
    DuplicateOf(ArticleId),
}

impl DedupOutcome {
    pub fn is_unique(&self) -> bool {
        matches!(self, Self::Unique(_))
    }
}

pub struct DedupEngine {
    store: Arc<dyn ArticleStore>,
    prefix_len: usize,
    algorithm: FingerprintAlgorithm,
}

impl DedupEngine {
    pub fn new(store: Arc<dyn ArticleStore>) -> Self {
        Self {
            store,
            prefix_len: DEFAULT_PREFIX_LEN,
            algorithm: FingerprintAlgorithm::default(),
        }
    }

    pub fn with_prefix_len(mut self, prefix_len: usize) -> Self {
        self.prefix_len = prefix_len;
        self
    }

    pub fn with_algorithm(mut self, algorithm: FingerprintAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn fingerprint(&self, article: &Article) -> ContentFingerprint {
        fingerprint(article, self.prefix_len, self.algorithm)
    }

    /// Register `article` unless its content is already known.
    ///
    /// Store failures are returned as-is; an unknown answer is never treated
    /// as unique.
    pub async fn check_and_register(&self, article: &Article) -> Result<DedupOutcome, StoreError> {
        let fp = self.fingerprint(article);

        if let Some(existing) = self.store.find_by_fingerprint(&fp).await? {
            return Ok(self.duplicate(article, &fp, existing));
        }

        match self.store.insert_article(article, &fp).await {
            Ok(()) => {
                counter!("dedup_unique_total").increment(1);
                tracing::debug!(
                    target: "dedup",
                    article_id = %article.id,
                    fingerprint = %fp,
                    title = %anon_hash(&article.title),
                    "registered new content"
                );
                Ok(DedupOutcome::Unique(article.id))
            }
            Err(StoreError::UniqueViolation(_)) => {
                // Lost the race: somebody inserted the same fingerprint in between.
                match self.store.find_by_fingerprint(&fp).await? {
                    Some(existing) => Ok(self.duplicate(article, &fp, existing)),
                    None => Err(StoreError::backend(
                        "check_and_register",
                        format!("fingerprint {fp} rejected as duplicate but not found"),
                    )),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn duplicate(&self, article: &Article, fp: &ContentFingerprint, existing: ArticleId) -> DedupOutcome {
        counter!("dedup_duplicate_total").increment(1);
        tracing::debug!(
            target: "dedup",
            article_id = %article.id,
            duplicate_of = %existing,
            fingerprint = %fp,
            "duplicate content"
        );
        DedupOutcome::DuplicateOf(existing)
    }

    /// Drop articles fetched more than `age` ago. Returns how many were deleted.
    pub async fn purge_older_than(&self, age: Duration) -> Result<u64, StoreError> {
        let age = chrono::Duration::from_std(age)
            .map_err(|e| StoreError::backend("purge_older_than", e))?;
        let cutoff = Utc::now() - age;
        let n = self.store.purge_older_than(cutoff).await?;
        counter!("dedup_purged_total").increment(n);
        tracing::info!(target: "dedup", purged = n, cutoff = %cutoff, "retention purge");
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn art(title: &str, body: &str) -> Article {
        Article::new(title, body, "IGN", Utc::now())
    }

    #[test]
    fn fingerprint_ignores_markup_case_and_spacing() {
        let a = art("Elden Ring DLC", "<p>FromSoftware  confirmed it.</p>");
        let b = art("elden ring   dlc", "FromSoftware confirmed it.");
        let alg = FingerprintAlgorithm::default();
        assert_eq!(fingerprint(&a, 500, alg), fingerprint(&b, 500, alg));
    }

    #[test]
    fn single_char_title_change_changes_fingerprint() {
        let alg = FingerprintAlgorithm::default();
        let a = fingerprint(&art("Patch 1.2 notes", "body"), 500, alg);
        let b = fingerprint(&art("Patch 1.3 notes", "body"), 500, alg);
        assert_ne!(a, b);
    }

    #[test]
    fn body_beyond_prefix_is_ignored() {
        let alg = FingerprintAlgorithm::default();
        let base = "x".repeat(120);
        let a = fingerprint(&art("t", &format!("{base} tail one")), 100, alg);
        let b = fingerprint(&art("t", &format!("{base} tail two")), 100, alg);
        assert_eq!(a, b);
    }

    #[test]
    fn algorithm_controls_length() {
        let a = art("t", "b");
        assert_eq!(fingerprint(&a, 500, FingerprintAlgorithm::Sha256Truncated).as_str().len(), 32);
        assert_eq!(fingerprint(&a, 500, FingerprintAlgorithm::Sha256).as_str().len(), 64);
        assert!(FingerprintAlgorithm::parse("md5").is_err());
        assert_eq!(FingerprintAlgorithm::parse("SHA256").unwrap(), FingerprintAlgorithm::Sha256);
    }

    #[tokio::test]
    async fn second_registration_is_duplicate_of_first() {
        let engine = DedupEngine::new(Arc::new(MemoryStore::new()));
        let first = art("New trailer", "It is here.");
        let second = art("New trailer", "It is here.");

        assert_eq!(
            engine.check_and_register(&first).await.unwrap(),
            DedupOutcome::Unique(first.id)
        );
        assert_eq!(
            engine.check_and_register(&second).await.unwrap(),
            DedupOutcome::DuplicateOf(first.id)
        );
    }

    #[tokio::test]
    async fn purge_removes_old_articles() {
        let store = Arc::new(MemoryStore::new());
        let engine = DedupEngine::new(store.clone());
        let mut old = art("Old news", "b");
        old.fetched_at = Utc::now() - chrono::Duration::days(10);
        let fresh = art("Fresh news", "b");
        engine.check_and_register(&old).await.unwrap();
        engine.check_and_register(&fresh).await.unwrap();

        let n = engine
            .purge_older_than(Duration::from_secs(7 * 24 * 3600))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert!(store.get_article(old.id).await.unwrap().is_none());
        assert!(store.get_article(fresh.id).await.unwrap().is_some());
    }
}
