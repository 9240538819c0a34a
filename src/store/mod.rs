// src/store/mod.rs
//! Persistence ports. The pipeline depends only on these traits; the concrete
//! adapters are an in-memory store and a SQLite store.
//!
//! Both adapters enforce the two uniqueness rules the pipeline relies on:
//! one article per fingerprint, one publication record per article. Those
//! constraints are the only serialization point between concurrent workers.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::dedup::ContentFingerprint;
use crate::error::StoreError;
use crate::model::{Article, ArticleId};
use crate::publish::record::PublicationRecord;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait ArticleStore: Send + Sync {
    async fn find_by_fingerprint(
        &self,
        fingerprint: &ContentFingerprint,
    ) -> Result<Option<ArticleId>, StoreError>;

    /// Must fail with [`StoreError::UniqueViolation`] if the fingerprint is taken.
    async fn insert_article(
        &self,
        article: &Article,
        fingerprint: &ContentFingerprint,
    ) -> Result<(), StoreError>;

    async fn get_article(&self, id: ArticleId) -> Result<Option<Article>, StoreError>;

    /// Drop a single registration and free its fingerprint. Returns false if
    /// there was nothing to delete.
    async fn delete_article(&self, id: ArticleId) -> Result<bool, StoreError>;

    /// Delete articles fetched before `cutoff`. Articles whose publication is
    /// still `pending` or `retrying` are kept so the retry driver can finish them.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait PublicationStore: Send + Sync {
    async fn get_publication(
        &self,
        article_id: ArticleId,
    ) -> Result<Option<PublicationRecord>, StoreError>;

    /// Must fail with [`StoreError::UniqueViolation`] if a record already exists.
    async fn create_publication(&self, record: &PublicationRecord) -> Result<(), StoreError>;

    /// Persist `record` if the stored version equals `record.version - 1`,
    /// else fail with [`StoreError::Conflict`].
    async fn update_publication(&self, record: &PublicationRecord) -> Result<(), StoreError>;

    /// Records to re-drive, earliest first: `Retrying` records due at `now`,
    /// and `Pending` records last touched before `stale_before` (an attempt
    /// that never settled).
    async fn find_retryable(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PublicationRecord>, StoreError>;

    /// Dead-lettered records, most recently failed first.
    async fn list_failed(&self, limit: usize) -> Result<Vec<PublicationRecord>, StoreError>;
}
