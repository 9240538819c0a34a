// src/translate/mod.rs
//! Entity-preserving translation.
//!
//! Flow for one text: identity pair short-circuit → protect entities → cache
//! lookup → backend call through the `translator` breaker → restore → cache
//! store. Only fully restored text ever leaves this module.

pub mod entities;
pub mod yandex;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use sha2::{Digest, Sha256};

use crate::breaker::CircuitBreaker;
use crate::cache::Cache;
use crate::error::TranslationError;
use crate::ingest::anon_hash;
use crate::model::{Article, LanguagePair, TranslatedArticle};

pub use entities::TranslatableText;
pub use yandex::{NoopTranslator, YandexTranslator};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Raw machine translation. Implementations classify their own failures.
#[async_trait]
pub trait TranslationBackend: Send + Sync {
    async fn translate(&self, text: &str, pair: &LanguagePair) -> Result<String, TranslationError>;

    fn name(&self) -> &str {
        "backend"
    }
}

/// `translation:{src}-{tgt}:{first 16 hex chars of sha256(text)}`
pub fn cache_key(text: &str, pair: &LanguagePair) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let hex = hex::encode(digest);
    format!("translation:{}-{}:{}", pair.source, pair.target, &hex[..16])
}

pub struct EntityPreservingTranslator {
    backend: Arc<dyn TranslationBackend>,
    cache: Arc<dyn Cache>,
    breaker: Arc<CircuitBreaker>,
    cache_ttl: Duration,
}

impl EntityPreservingTranslator {
    pub fn new(
        backend: Arc<dyn TranslationBackend>,
        cache: Arc<dyn Cache>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            backend,
            cache,
            breaker,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub async fn translate(&self, text: &str, pair: &LanguagePair) -> Result<String, TranslationError> {
        if pair.is_identity() {
            return Ok(text.to_string());
        }
        if text.trim().is_empty() {
            return Ok(String::new());
        }

        let key = cache_key(text, pair);
        match self.cache.get(&key).await {
            Ok(Some(hit)) => {
                counter!("translate_cache_hits_total").increment(1);
                tracing::debug!(target: "translate", key = %key, "cache hit");
                return Ok(hit);
            }
            Ok(None) => {
                counter!("translate_cache_misses_total").increment(1);
            }
            Err(e) => {
                counter!("translate_cache_misses_total").increment(1);
                tracing::warn!(target: "translate", error = %e, "cache read failed; treating as miss");
            }
        }

        let mut tt = TranslatableText::protect(text);
        let backend = self.backend.clone();
        let protected = tt.protected().to_string();
        let raw = self
            .breaker
            .call(|| async move { backend.translate(&protected, pair).await })
            .await
            .map_err(|e| {
                counter!("translate_backend_errors_total").increment(1);
                tracing::warn!(
                    target: "translate",
                    dependency = self.breaker.name(),
                    backend = self.backend.name(),
                    pair = %pair,
                    text = %anon_hash(text),
                    error = %e,
                    "backend translation failed"
                );
                e
            })?;

        let restored = match tt.restore(&raw) {
            Ok(s) => s.to_string(),
            Err(e) => {
                tracing::warn!(
                    target: "translate",
                    pair = %pair,
                    text = %anon_hash(text),
                    entities = tt.entities().len(),
                    error = %e,
                    "backend mangled entity placeholders"
                );
                return Err(e);
            }
        };

        if let Err(e) = self.cache.set(&key, &restored, self.cache_ttl).await {
            tracing::warn!(target: "translate", error = %e, "cache write failed");
        }
        Ok(restored)
    }

    /// Title and body together. Either both translate or the call fails.
    pub async fn translate_article(
        &self,
        article: &Article,
        target: &str,
    ) -> Result<TranslatedArticle, TranslationError> {
        let pair = LanguagePair::new(&article.language, target)
            .map_err(|e| TranslationError::Permanent(e.to_string()))?;
        let title = self.translate(&article.title, &pair).await?;
        let body = self.translate(&article.body, &pair).await?;
        Ok(TranslatedArticle {
            title,
            body,
            language: pair.target,
        })
    }
}
