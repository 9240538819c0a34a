// src/store/memory.rs
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::dedup::ContentFingerprint;
use crate::error::StoreError;
use crate::model::{Article, ArticleId};
use crate::publish::record::{PublicationRecord, PublicationState};
use crate::store::{ArticleStore, PublicationStore};

#[derive(Default)]
struct Inner {
    articles: HashMap<ArticleId, Article>,
    by_fingerprint: HashMap<ContentFingerprint, ArticleId>,
    fingerprints: HashMap<ArticleId, ContentFingerprint>,
    publications: HashMap<ArticleId, PublicationRecord>,
}

/// In-process store for tests and dry runs. A single lock makes every
/// operation atomic, which is what the unique constraints need.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn article_count(&self) -> usize {
        self.inner.lock().articles.len()
    }

    pub fn publication_count(&self) -> usize {
        self.inner.lock().publications.len()
    }
}

#[async_trait]
impl ArticleStore for MemoryStore {
    async fn find_by_fingerprint(
        &self,
        fingerprint: &ContentFingerprint,
    ) -> Result<Option<ArticleId>, StoreError> {
        Ok(self.inner.lock().by_fingerprint.get(fingerprint).copied())
    }

    async fn insert_article(
        &self,
        article: &Article,
        fingerprint: &ContentFingerprint,
    ) -> Result<(), StoreError> {
        let mut g = self.inner.lock();
        if g.by_fingerprint.contains_key(fingerprint) {
            return Err(StoreError::UniqueViolation("articles.fingerprint"));
        }
        if g.articles.contains_key(&article.id) {
            return Err(StoreError::UniqueViolation("articles.id"));
        }
        g.by_fingerprint.insert(fingerprint.clone(), article.id);
        g.fingerprints.insert(article.id, fingerprint.clone());
        g.articles.insert(article.id, article.clone());
        Ok(())
    }

    async fn get_article(&self, id: ArticleId) -> Result<Option<Article>, StoreError> {
        Ok(self.inner.lock().articles.get(&id).cloned())
    }

    async fn delete_article(&self, id: ArticleId) -> Result<bool, StoreError> {
        let mut g = self.inner.lock();
        if g.articles.remove(&id).is_none() {
            return Ok(false);
        }
        if let Some(fp) = g.fingerprints.remove(&id) {
            g.by_fingerprint.remove(&fp);
        }
        Ok(true)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut g = self.inner.lock();
        let doomed: Vec<ArticleId> = g
            .articles
            .values()
            .filter(|a| a.fetched_at < cutoff)
            .filter(|a| {
                !matches!(
                    g.publications.get(&a.id).map(|r| &r.state),
                    Some(PublicationState::Pending) | Some(PublicationState::Retrying { .. })
                )
            })
            .map(|a| a.id)
            .collect();

        for id in &doomed {
            g.articles.remove(id);
            if let Some(fp) = g.fingerprints.remove(id) {
                g.by_fingerprint.remove(&fp);
            }
        }
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl PublicationStore for MemoryStore {
    async fn get_publication(
        &self,
        article_id: ArticleId,
    ) -> Result<Option<PublicationRecord>, StoreError> {
        Ok(self.inner.lock().publications.get(&article_id).cloned())
    }

    async fn create_publication(&self, record: &PublicationRecord) -> Result<(), StoreError> {
        let mut g = self.inner.lock();
        if g.publications.contains_key(&record.article_id) {
            return Err(StoreError::UniqueViolation("publications.article_id"));
        }
        g.publications.insert(record.article_id, record.clone());
        Ok(())
    }

    async fn update_publication(&self, record: &PublicationRecord) -> Result<(), StoreError> {
        let mut g = self.inner.lock();
        let expected = record.version.saturating_sub(1);
        match g.publications.get_mut(&record.article_id) {
            None => Err(StoreError::NotFound(format!("publication {}", record.article_id))),
            Some(current) if current.version != expected || record.version == 0 => {
                Err(StoreError::Conflict {
                    entity: "publication",
                    expected,
                })
            }
            Some(current) => {
                *current = record.clone();
                Ok(())
            }
        }
    }

    async fn find_retryable(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PublicationRecord>, StoreError> {
        let g = self.inner.lock();
        let mut due: Vec<PublicationRecord> = g
            .publications
            .values()
            .filter(|r| match r.state {
                PublicationState::Retrying { next_retry_at } => next_retry_at <= now,
                PublicationState::Pending => r.updated_at <= stale_before,
                _ => false,
            })
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_retry_at().unwrap_or(r.updated_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<PublicationRecord>, StoreError> {
        let g = self.inner.lock();
        let mut failed: Vec<(DateTime<Utc>, PublicationRecord)> = g
            .publications
            .values()
            .filter_map(|r| match r.state {
                PublicationState::Failed { failed_at } => Some((failed_at, r.clone())),
                _ => None,
            })
            .collect();
        failed.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(failed.into_iter().take(limit).map(|(_, r)| r).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fingerprint_is_unique() {
        let s = MemoryStore::new();
        let fp = ContentFingerprint::from_hex("abc");
        let a = Article::new("a", "", "IGN", Utc::now());
        let b = Article::new("b", "", "IGN", Utc::now());
        s.insert_article(&a, &fp).await.unwrap();
        assert!(matches!(
            s.insert_article(&b, &fp).await,
            Err(StoreError::UniqueViolation(_))
        ));
        assert_eq!(s.find_by_fingerprint(&fp).await.unwrap(), Some(a.id));
    }

    #[tokio::test]
    async fn stale_update_is_rejected() {
        let s = MemoryStore::new();
        let now = Utc::now();
        let rec = PublicationRecord::new(ArticleId::new(), now);
        s.create_publication(&rec).await.unwrap();

        let mut first = rec.clone();
        first.version = 1;
        first.attempt_count = 1;
        s.update_publication(&first).await.unwrap();

        let mut stale = rec.clone();
        stale.version = 1;
        assert!(matches!(
            s.update_publication(&stale).await,
            Err(StoreError::Conflict { expected: 0, .. })
        ));
    }

    #[tokio::test]
    async fn retryable_is_due_and_ordered() {
        let s = MemoryStore::new();
        let now = Utc::now();
        for (i, offset) in [30i64, -10, -20].into_iter().enumerate() {
            let mut r = PublicationRecord::new(ArticleId::new(), now);
            r.transition(
                PublicationState::Retrying {
                    next_retry_at: now + chrono::Duration::seconds(offset),
                },
                now,
            )
            .unwrap();
            r.attempt_count = i as u32;
            s.create_publication(&r).await.unwrap();
        }
        let due = s.find_retryable(now, now - chrono::Duration::minutes(5), 10).await.unwrap();
        assert_eq!(due.len(), 2);
        assert!(due[0].next_retry_at() < due[1].next_retry_at());
    }

    #[tokio::test]
    async fn pending_past_the_lease_is_due_again() {
        let s = MemoryStore::new();
        let now = Utc::now();
        let stuck = PublicationRecord::new(ArticleId::new(), now - chrono::Duration::minutes(10));
        let fresh = PublicationRecord::new(ArticleId::new(), now);
        s.create_publication(&stuck).await.unwrap();
        s.create_publication(&fresh).await.unwrap();

        let due = s.find_retryable(now, now - chrono::Duration::minutes(5), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].article_id, stuck.article_id);
    }

    #[tokio::test]
    async fn delete_article_frees_the_fingerprint() {
        let s = MemoryStore::new();
        let a = Article::new("Title", "", "IGN", Utc::now());
        let fp = ContentFingerprint::from_hex("ab");
        s.insert_article(&a, &fp).await.unwrap();
        assert!(s.delete_article(a.id).await.unwrap());
        assert!(!s.delete_article(a.id).await.unwrap());
        assert_eq!(s.find_by_fingerprint(&fp).await.unwrap(), None);
    }
}
