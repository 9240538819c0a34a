// src/testing.rs
//! Scripted port fakes for unit and integration tests.
//!
//! Each fake pops queued errors first and otherwise succeeds, counting every
//! call so tests can assert that a downstream port was (or was not) touched.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::dedup::ContentFingerprint;
use crate::error::{PublishError, StoreError, TranslationError};
use crate::model::{Article, ArticleId, LanguagePair};
use crate::publish::{OutboundMessage, PublicationRecord, Publisher};
use crate::store::{ArticleStore, PublicationStore};
use crate::translate::TranslationBackend;

pub use crate::store::MemoryStore;

enum Reply {
    Echo,
    Fixed(String),
}

pub struct ScriptedTranslator {
    reply: Reply,
    errors: Mutex<VecDeque<TranslationError>>,
    fail_always: Mutex<Option<TranslationError>>,
    calls: AtomicUsize,
}

impl ScriptedTranslator {
    /// Returns its input, placeholders included, so every entity survives.
    pub fn echo() -> Self {
        Self::with_reply(Reply::Echo)
    }

    /// Always answers `text`, whatever was asked.
    pub fn fixed(text: impl Into<String>) -> Self {
        Self::with_reply(Reply::Fixed(text.into()))
    }

    fn with_reply(reply: Reply) -> Self {
        Self {
            reply,
            errors: Mutex::new(VecDeque::new()),
            fail_always: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_error(&self, e: TranslationError) {
        self.errors.lock().push_back(e);
    }

    pub fn fail_always(&self, e: Option<TranslationError>) {
        *self.fail_always.lock() = e;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranslationBackend for ScriptedTranslator {
    async fn translate(&self, text: &str, _pair: &LanguagePair) -> Result<String, TranslationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.errors.lock().pop_front() {
            return Err(e);
        }
        if let Some(e) = self.fail_always.lock().clone() {
            return Err(e);
        }
        Ok(match &self.reply {
            Reply::Echo => text.to_string(),
            Reply::Fixed(s) => s.clone(),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub struct ScriptedPublisher {
    errors: Mutex<VecDeque<PublishError>>,
    fail_always: Mutex<Option<PublishError>>,
    sent: Mutex<Vec<OutboundMessage>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl Default for ScriptedPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedPublisher {
    pub fn new() -> Self {
        Self {
            errors: Mutex::new(VecDeque::new()),
            fail_always: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_error(&self, e: PublishError) {
        self.errors.lock().push_back(e);
    }

    pub fn fail_always(&self, e: Option<PublishError>) {
        *self.fail_always.lock() = e;
    }

    /// Make every send take `d` (tokio time) before answering.
    pub fn set_delay(&self, d: Option<Duration>) {
        *self.delay.lock() = d;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages that were accepted, in order.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Publisher for ScriptedPublisher {
    async fn send(&self, message: &OutboundMessage) -> Result<String, PublishError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.delay.lock();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if let Some(e) = self.errors.lock().pop_front() {
            return Err(e);
        }
        if let Some(e) = self.fail_always.lock().clone() {
            return Err(e);
        }
        self.sent.lock().push(message.clone());
        Ok(format!("msg-{n}"))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// A [`MemoryStore`] whose individual operations can be switched to fail
/// with [`StoreError::Backend`].
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    lookups: AtomicBool,
    inserts: AtomicBool,
    creates: AtomicBool,
    updates: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// `find_by_fingerprint`
    pub fn fail_lookups(&self, on: bool) {
        self.lookups.store(on, Ordering::SeqCst);
    }

    /// `insert_article`
    pub fn fail_inserts(&self, on: bool) {
        self.inserts.store(on, Ordering::SeqCst);
    }

    /// `create_publication`
    pub fn fail_creates(&self, on: bool) {
        self.creates.store(on, Ordering::SeqCst);
    }

    /// `update_publication`
    pub fn fail_updates(&self, on: bool) {
        self.updates.store(on, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, op: &'static str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::backend(op, "database is locked"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ArticleStore for FailingStore {
    async fn find_by_fingerprint(
        &self,
        fingerprint: &ContentFingerprint,
    ) -> Result<Option<ArticleId>, StoreError> {
        Self::check(&self.lookups, "find_by_fingerprint")?;
        self.inner.find_by_fingerprint(fingerprint).await
    }

    async fn insert_article(
        &self,
        article: &Article,
        fingerprint: &ContentFingerprint,
    ) -> Result<(), StoreError> {
        Self::check(&self.inserts, "insert_article")?;
        self.inner.insert_article(article, fingerprint).await
    }

    async fn get_article(&self, id: ArticleId) -> Result<Option<Article>, StoreError> {
        self.inner.get_article(id).await
    }

    async fn delete_article(&self, id: ArticleId) -> Result<bool, StoreError> {
        self.inner.delete_article(id).await
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.purge_older_than(cutoff).await
    }
}

#[async_trait]
impl PublicationStore for FailingStore {
    async fn get_publication(
        &self,
        article_id: ArticleId,
    ) -> Result<Option<PublicationRecord>, StoreError> {
        self.inner.get_publication(article_id).await
    }

    async fn create_publication(&self, record: &PublicationRecord) -> Result<(), StoreError> {
        Self::check(&self.creates, "create_publication")?;
        self.inner.create_publication(record).await
    }

    async fn update_publication(&self, record: &PublicationRecord) -> Result<(), StoreError> {
        Self::check(&self.updates, "update_publication")?;
        self.inner.update_publication(record).await
    }

    async fn find_retryable(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PublicationRecord>, StoreError> {
        self.inner.find_retryable(now, stale_before, limit).await
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<PublicationRecord>, StoreError> {
        self.inner.list_failed(limit).await
    }
}
