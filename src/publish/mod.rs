// src/publish/mod.rs
//! Publication state machine.
//!
//! One durable [`PublicationRecord`] per article drives every decision:
//! a `Published` record is never sent again, a `Failed` record is parked
//! until an operator requeues it, and a `Retrying` record is only attempted
//! once its deadline has passed. Nothing here sleeps; due records are
//! re-driven by the caller through [`PublicationMachine::find_retryable`].
//!
//! A record still `Pending` after the pending lease belongs to an attempt
//! that never settled (cancelled at shutdown, or the outcome failed to
//! persist). `find_retryable` hands those back too.

pub mod format;
pub mod record;
pub mod telegram;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;

use crate::breaker::CircuitBreaker;
use crate::error::{Classify, FailureKind, PipelineError, PublishError, StoreError, ValidationError};
use crate::hashtags;
use crate::ingest::anon_hash;
use crate::model::{Article, ArticleId, TranslatedArticle};
use crate::store::PublicationStore;
use crate::translate::EntityPreservingTranslator;

pub use format::OutboundMessage;
pub use record::{PublicationRecord, PublicationState};
pub use telegram::{DryRunPublisher, TelegramPublisher};

/// Outbound channel. Returns the id the channel assigned to the message.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<String, PublishError>;

    fn name(&self) -> &str {
        "publisher"
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Transient failures allowed before the record is dead-lettered.
    pub max_retries: u32,
    /// Delay before retry `n` is `backoff_base^(n-1)` seconds.
    pub backoff_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2.0,
        }
    }
}

impl RetryPolicy {
    const MAX_DELAY_SECS: f64 = 24.0 * 3600.0;

    pub fn delay_for(&self, attempt: u32) -> chrono::Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.backoff_base.powi(exp).min(Self::MAX_DELAY_SECS);
        chrono::Duration::milliseconds((secs * 1000.0) as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { message_id: String },
    /// Dead-lettered. Stays queryable through `list_failed`.
    Failed { reason: String },
    Scheduled { next_retry_at: DateTime<Utc> },
    /// Another task in this process is publishing the same article right now.
    InProgress,
}

struct TranslationStep {
    translator: Arc<EntityPreservingTranslator>,
    target: String,
}

/// Removes the article from the in-flight set when the attempt ends.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<ArticleId>>,
    id: ArticleId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

pub struct PublicationMachine {
    store: Arc<dyn PublicationStore>,
    publisher: Arc<dyn Publisher>,
    breaker: Arc<CircuitBreaker>,
    translation: Option<TranslationStep>,
    policy: RetryPolicy,
    max_hashtags: usize,
    pending_lease: chrono::Duration,
    in_flight: Mutex<HashSet<ArticleId>>,
}

/// Longer than any single attempt is allowed to take.
pub const DEFAULT_PENDING_LEASE: std::time::Duration = std::time::Duration::from_secs(300);

impl PublicationMachine {
    pub fn new(
        store: Arc<dyn PublicationStore>,
        publisher: Arc<dyn Publisher>,
        breaker: Arc<CircuitBreaker>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            publisher,
            breaker,
            translation: None,
            policy,
            max_hashtags: hashtags::DEFAULT_MAX_HASHTAGS,
            pending_lease: lease(DEFAULT_PENDING_LEASE),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Translate each article into `target` right before sending. Retries
    /// translate again; the translation cache makes that cheap.
    pub fn with_translation(mut self, translator: Arc<EntityPreservingTranslator>, target: impl Into<String>) -> Self {
        self.translation = Some(TranslationStep {
            translator,
            target: target.into(),
        });
        self
    }

    pub fn with_max_hashtags(mut self, max: usize) -> Self {
        self.max_hashtags = max;
        self
    }

    /// How long a `Pending` record may sit before it counts as abandoned.
    pub fn with_pending_lease(mut self, lease_for: std::time::Duration) -> Self {
        self.pending_lease = lease(lease_for);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn publish(&self, article: &Article) -> Result<PublishOutcome, PipelineError> {
        self.publish_at(article, Utc::now()).await
    }

    /// Same as [`publish`](Self::publish) with an explicit clock.
    pub async fn publish_at(&self, article: &Article, now: DateTime<Utc>) -> Result<PublishOutcome, PipelineError> {
        let _guard = match self.enter(article.id) {
            Some(g) => g,
            None => {
                tracing::debug!(target: "publish", article_id = %article.id, "publish already in flight");
                return Ok(PublishOutcome::InProgress);
            }
        };

        let record = self.load_or_create(article.id, now).await?;
        match &record.state {
            PublicationState::Published { message_id, .. } => {
                tracing::debug!(target: "publish", article_id = %article.id, message_id = %message_id, "already published");
                return Ok(PublishOutcome::Published {
                    message_id: message_id.clone(),
                });
            }
            PublicationState::Failed { .. } => {
                return Ok(PublishOutcome::Failed {
                    reason: record
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "dead-lettered".to_string()),
                });
            }
            PublicationState::Retrying { next_retry_at } if *next_retry_at > now => {
                return Ok(PublishOutcome::Scheduled {
                    next_retry_at: *next_retry_at,
                });
            }
            _ => {}
        }

        let result = self.attempt(article).await;
        self.settle(record, result, now).await
    }

    fn enter(&self, id: ArticleId) -> Option<InFlight<'_>> {
        if self.in_flight.lock().insert(id) {
            Some(InFlight {
                set: &self.in_flight,
                id,
            })
        } else {
            None
        }
    }

    async fn load_or_create(&self, id: ArticleId, now: DateTime<Utc>) -> Result<PublicationRecord, PipelineError> {
        if let Some(r) = self.store.get_publication(id).await? {
            return Ok(r);
        }
        let fresh = PublicationRecord::new(id, now);
        match self.store.create_publication(&fresh).await {
            Ok(()) => Ok(fresh),
            Err(StoreError::UniqueViolation(_)) => self
                .store
                .get_publication(id)
                .await?
                .ok_or_else(|| StoreError::backend("load_or_create", format!("publication {id} vanished")).into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn attempt(&self, article: &Article) -> Result<String, PublishError> {
        let translated: Option<TranslatedArticle> = match &self.translation {
            Some(step) => Some(step.translator.translate_article(article, &step.target).await?),
            None => None,
        };

        let tags = hashtags::generate(&article.title, &article.body, self.max_hashtags);
        let message = format::render(article, translated.as_ref(), &tags);

        let publisher = self.publisher.clone();
        self.breaker
            .call(|| async move { publisher.send(&message).await })
            .await
    }

    async fn settle(
        &self,
        mut record: PublicationRecord,
        result: Result<String, PublishError>,
        now: DateTime<Utc>,
    ) -> Result<PublishOutcome, PipelineError> {
        let id = record.article_id;
        match result {
            Ok(message_id) => {
                record.transition(
                    PublicationState::Published {
                        message_id: message_id.clone(),
                        published_at: now,
                    },
                    now,
                )?;
                record.last_error = None;
                if let Err(e) = self.persist(&mut record).await {
                    // The message is out but the record is not; a later run may send it twice.
                    tracing::error!(target: "publish", article_id = %id, message_id = %message_id, error = %e, "sent but failed to record publication");
                    return Err(e);
                }
                counter!("publish_published_total").increment(1);
                tracing::info!(target: "publish", article_id = %id, message_id = %message_id, attempts = record.attempt_count + 1, "published");
                Ok(PublishOutcome::Published { message_id })
            }
            Err(e) => {
                let reason = e.to_string();
                record.last_error = Some(reason.clone());
                let next = match (&e, e.kind()) {
                    (_, FailureKind::Permanent) => None,
                    (PublishError::CircuitOpen(open), _) => {
                        let wait = chrono::Duration::from_std(open.retry_after)
                            .unwrap_or_else(|_| chrono::Duration::seconds(1))
                            .max(chrono::Duration::seconds(1));
                        Some(now + wait)
                    }
                    _ => {
                        record.attempt_count += 1;
                        if record.attempt_count < self.policy.max_retries {
                            Some(now + self.policy.delay_for(record.attempt_count))
                        } else {
                            None
                        }
                    }
                };

                match next {
                    Some(next_retry_at) => {
                        record.transition(PublicationState::Retrying { next_retry_at }, now)?;
                        self.persist(&mut record).await?;
                        counter!("publish_retry_scheduled_total").increment(1);
                        tracing::warn!(
                            target: "publish",
                            article_id = %id,
                            attempt = record.attempt_count,
                            next_retry_at = %next_retry_at,
                            error = %reason,
                            "publish failed, retry scheduled"
                        );
                        Ok(PublishOutcome::Scheduled { next_retry_at })
                    }
                    None => {
                        record.transition(PublicationState::Failed { failed_at: now }, now)?;
                        self.persist(&mut record).await?;
                        counter!("publish_failed_total").increment(1);
                        tracing::error!(
                            target: "publish",
                            article_id = %id,
                            attempt = record.attempt_count,
                            error = %reason,
                            "publish failed permanently"
                        );
                        Ok(PublishOutcome::Failed { reason })
                    }
                }
            }
        }
    }

    async fn persist(&self, record: &mut PublicationRecord) -> Result<(), PipelineError> {
        record.version += 1;
        self.store.update_publication(record).await?;
        Ok(())
    }

    pub async fn find_retryable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PublicationRecord>, PipelineError> {
        Ok(self
            .store
            .find_retryable(now, now - self.pending_lease, limit)
            .await?)
    }

    pub async fn list_failed(&self, limit: usize) -> Result<Vec<PublicationRecord>, PipelineError> {
        Ok(self.store.list_failed(limit).await?)
    }

    pub async fn get(&self, article_id: ArticleId) -> Result<Option<PublicationRecord>, PipelineError> {
        Ok(self.store.get_publication(article_id).await?)
    }

    /// Operator action: give a dead-lettered record a fresh retry budget, due now.
    pub async fn requeue_failed(&self, article_id: ArticleId) -> Result<PublicationRecord, PipelineError> {
        let now = Utc::now();
        let mut record = self
            .store
            .get_publication(article_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("publication {article_id}")))?;
        if !matches!(record.state, PublicationState::Failed { .. }) {
            return Err(ValidationError::IllegalTransition {
                from: record.state.label(),
                to: "retrying",
            }
            .into());
        }
        record.transition(PublicationState::Retrying { next_retry_at: now }, now)?;
        record.attempt_count = 0;
        self.persist(&mut record).await?;
        tracing::info!(target: "publish", article_id = %article_id, "requeued from dead letter");
        Ok(record)
    }

    /// Dead-letter a record without attempting it (e.g. its article is gone).
    pub async fn fail_permanently(&self, article_id: ArticleId, reason: &str) -> Result<PublishOutcome, PipelineError> {
        let now = Utc::now();
        let mut record = self.load_or_create(article_id, now).await?;
        if let PublicationState::Published { message_id, .. } = &record.state {
            return Ok(PublishOutcome::Published {
                message_id: message_id.clone(),
            });
        }
        if matches!(record.state, PublicationState::Failed { .. }) {
            return Ok(PublishOutcome::Failed {
                reason: record.last_error.unwrap_or_else(|| reason.to_string()),
            });
        }
        record.last_error = Some(reason.to_string());
        record.transition(PublicationState::Failed { failed_at: now }, now)?;
        self.persist(&mut record).await?;
        counter!("publish_failed_total").increment(1);
        tracing::error!(target: "publish", article_id = %article_id, reason, "dead-lettered without attempt");
        Ok(PublishOutcome::Failed {
            reason: reason.to_string(),
        })
    }
}

fn lease(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(300))
}

/// Short, log-safe description of an article.
pub(crate) fn describe(article: &Article) -> String {
    format!("{}:{}", article.source_name, anon_hash(&article.title))
}
