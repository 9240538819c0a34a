// src/pipeline.rs
//! Fixed pipeline: dedup → score → (threshold) → translate + publish.
//!
//! Work fans out over a bounded worker pool (a semaphore sized to
//! `workers`, one permit per article). Shutdown flips a watch channel:
//! `Draining` rejects new work, `Aborted` cancels whatever is still running
//! once the grace period is over. `Retrying` records are never touched by
//! shutdown; they are durable and the next process picks them up. A publish
//! cancelled mid-send leaves its record `Pending`, and the retry driver
//! takes it back once the pending lease has run out.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::breaker::BreakerRegistry;
use crate::cache::MemoryCache;
use crate::config::AppConfig;
use crate::dedup::{DedupEngine, DedupOutcome};
use crate::error::PipelineError;
use crate::model::{Article, ArticleId, TranslatedArticle};
use crate::publish::{self, PublicationMachine, PublicationRecord, PublishOutcome, Publisher};
use crate::scoring::{meets_threshold, ScoredArticle, ScoringHandle};
use crate::store::{ArticleStore, PublicationStore};
use crate::translate::{EntityPreservingTranslator, TranslationBackend};

pub const TRANSLATOR: &str = "translator";
pub const PUBLISHER: &str = "publisher";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Draining,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Duplicate {
        article_id: ArticleId,
        duplicate_of: ArticleId,
    },
    BelowThreshold {
        article_id: ArticleId,
        total: u32,
        threshold: u32,
    },
    Published {
        article_id: ArticleId,
        message_id: String,
    },
    Scheduled {
        article_id: ArticleId,
        next_retry_at: chrono::DateTime<Utc>,
    },
    Failed {
        article_id: ArticleId,
        reason: String,
    },
    InProgress {
        article_id: ArticleId,
    },
    /// Shutdown had begun; nothing was done.
    Rejected {
        article_id: ArticleId,
    },
}

impl PipelineOutcome {
    fn from_publish(article_id: ArticleId, out: PublishOutcome) -> Self {
        match out {
            PublishOutcome::Published { message_id } => Self::Published {
                article_id,
                message_id,
            },
            PublishOutcome::Failed { reason } => Self::Failed { article_id, reason },
            PublishOutcome::Scheduled { next_retry_at } => Self::Scheduled {
                article_id,
                next_retry_at,
            },
            PublishOutcome::InProgress => Self::InProgress { article_id },
        }
    }
}

/// Tally of one batch. `outcomes` is in completion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub published: usize,
    pub scheduled: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub filtered: usize,
    pub in_progress: usize,
    pub rejected: usize,
    pub errors: Vec<String>,
    pub outcomes: Vec<PipelineOutcome>,
}

impl BatchReport {
    fn record(&mut self, res: Result<PipelineOutcome, PipelineError>) {
        match res {
            Ok(out) => {
                match &out {
                    PipelineOutcome::Published { .. } => self.published += 1,
                    PipelineOutcome::Scheduled { .. } => self.scheduled += 1,
                    PipelineOutcome::Failed { .. } => self.failed += 1,
                    PipelineOutcome::Duplicate { .. } => self.duplicates += 1,
                    PipelineOutcome::BelowThreshold { .. } => self.filtered += 1,
                    PipelineOutcome::InProgress { .. } => self.in_progress += 1,
                    PipelineOutcome::Rejected { .. } => self.rejected += 1,
                }
                self.outcomes.push(out);
            }
            Err(e) => self.errors.push(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    pub threshold: u32,
    pub workers: usize,
    pub retry_batch: usize,
    pub retention: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            threshold: 8,
            workers: 5,
            retry_batch: 50,
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

enum Job {
    Fresh(Article),
    Retry(PublicationRecord),
}

pub struct Pipeline {
    dedup: DedupEngine,
    scoring: ScoringHandle,
    publisher: PublicationMachine,
    articles: Arc<dyn ArticleStore>,
    translator: Option<(Arc<EntityPreservingTranslator>, String)>,
    settings: PipelineSettings,
    slots: Arc<Semaphore>,
    state: watch::Sender<RunState>,
}

impl Pipeline {
    pub fn new(
        dedup: DedupEngine,
        scoring: ScoringHandle,
        publisher: PublicationMachine,
        articles: Arc<dyn ArticleStore>,
        settings: PipelineSettings,
    ) -> Self {
        let workers = settings.workers.max(1);
        let (state, _) = watch::channel(RunState::Running);
        Self {
            dedup,
            scoring,
            publisher,
            articles,
            translator: None,
            settings: PipelineSettings { workers, ..settings },
            slots: Arc::new(Semaphore::new(workers)),
            state,
        }
    }

    /// Translator used by the standalone [`translate`](Self::translate) stage.
    pub fn with_translator(mut self, translator: Arc<EntityPreservingTranslator>, target: impl Into<String>) -> Self {
        self.translator = Some((translator, target.into()));
        self
    }

    /// Wire every component from configuration over one store.
    pub fn from_config<S>(
        cfg: &AppConfig,
        store: Arc<S>,
        publisher: Arc<dyn Publisher>,
        backend: Arc<dyn TranslationBackend>,
        scoring: ScoringHandle,
        breakers: &BreakerRegistry,
    ) -> Self
    where
        S: ArticleStore + PublicationStore + 'static,
    {
        let dedup = DedupEngine::new(store.clone())
            .with_prefix_len(cfg.dedup.prefix_len)
            .with_algorithm(cfg.dedup.algorithm);

        let translator = Arc::new(
            EntityPreservingTranslator::new(
                backend,
                Arc::new(MemoryCache::new(cfg.translation.cache_capacity)),
                breakers.get(TRANSLATOR),
            )
            .with_cache_ttl(Duration::from_secs(cfg.translation.cache_ttl_secs)),
        );

        let mut machine = PublicationMachine::new(
            store.clone(),
            publisher,
            breakers.get(PUBLISHER),
            cfg.retry_policy(),
        )
        .with_max_hashtags(cfg.publish.max_hashtags)
        .with_pending_lease(Duration::from_secs(cfg.publish.pending_lease_secs));
        if cfg.translation.enabled {
            machine = machine.with_translation(translator.clone(), cfg.translation.target.clone());
        }

        let settings = PipelineSettings {
            threshold: cfg.scoring.threshold,
            workers: cfg.pipeline.workers,
            retry_batch: cfg.pipeline.retry_batch,
            retention: cfg.retention(),
        };

        Self::new(dedup, scoring, machine, store, settings)
            .with_translator(translator, cfg.translation.target.clone())
    }

    pub fn settings(&self) -> PipelineSettings {
        self.settings
    }

    pub fn machine(&self) -> &PublicationMachine {
        &self.publisher
    }

    pub fn run_state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.run_state() != RunState::Running
    }

    /* ---------- stage entry points ---------- */

    pub async fn dedup_check(&self, article: &Article) -> Result<DedupOutcome, PipelineError> {
        Ok(self.dedup.check_and_register(article).await?)
    }

    pub fn score(&self, article: &Article) -> ScoredArticle {
        self.scoring.score(article, Utc::now())
    }

    /// Without a configured translator the article comes back unchanged.
    pub async fn translate(&self, article: &Article) -> Result<TranslatedArticle, PipelineError> {
        match &self.translator {
            Some((t, target)) => Ok(t.translate_article(article, target).await?),
            None => Ok(TranslatedArticle {
                title: article.title.clone(),
                body: article.body.clone(),
                language: article.language.clone(),
            }),
        }
    }

    pub async fn publish(&self, article: &Article) -> Result<PublishOutcome, PipelineError> {
        self.publisher.publish(article).await
    }

    /* ---------- per-article flow ---------- */

    pub async fn process(&self, article: &Article) -> Result<PipelineOutcome, PipelineError> {
        if self.is_shutting_down() {
            return Ok(self.reject(article.id));
        }
        article.validate()?;

        if let DedupOutcome::DuplicateOf(existing) = self.dedup_check(article).await? {
            return Ok(PipelineOutcome::Duplicate {
                article_id: article.id,
                duplicate_of: existing,
            });
        }

        let scored = self.score(article);
        let threshold = self.settings.threshold;
        if !meets_threshold(scored.total, threshold) {
            counter!("pipeline_filtered_total").increment(1);
            tracing::debug!(
                target: "pipeline",
                article_id = %article.id,
                article = %publish::describe(article),
                total = scored.total,
                threshold,
                "below threshold"
            );
            return Ok(PipelineOutcome::BelowThreshold {
                article_id: article.id,
                total: scored.total,
                threshold,
            });
        }

        tracing::info!(
            target: "pipeline",
            article_id = %article.id,
            article = %publish::describe(article),
            total = scored.total,
            matched = ?scored.matched,
            "accepted for publication"
        );
        let out = match self.publish(article).await {
            Ok(out) => out,
            Err(e) => {
                self.release_unrecorded(article.id).await;
                return Err(e);
            }
        };
        Ok(PipelineOutcome::from_publish(article.id, out))
    }

    /// A failed publish that never got a record would be invisible to the
    /// retry driver, and every refetch would dedup against it. Free the
    /// registration so the next fetch starts over.
    async fn release_unrecorded(&self, id: ArticleId) {
        match self.publisher.get(id).await {
            Ok(Some(_)) => {}
            Ok(None) => match self.articles.delete_article(id).await {
                Ok(_) => {
                    tracing::warn!(target: "pipeline", article_id = %id, "no publication record, registration released")
                }
                Err(e) => {
                    tracing::error!(target: "pipeline", article_id = %id, error = %e, "failed to release unrecorded article")
                }
            },
            Err(e) => {
                tracing::error!(target: "pipeline", article_id = %id, error = %e, "could not check publication record")
            }
        }
    }

    async fn retry_one(&self, record: PublicationRecord) -> Result<PipelineOutcome, PipelineError> {
        let id = record.article_id;
        if self.is_shutting_down() {
            return Ok(self.reject(id));
        }
        let out = match self.articles.get_article(id).await? {
            Some(article) => self.publisher.publish(&article).await?,
            None => {
                tracing::warn!(target: "pipeline", article_id = %id, "retry target has no stored article");
                self.publisher.fail_permanently(id, "article no longer stored").await?
            }
        };
        Ok(PipelineOutcome::from_publish(id, out))
    }

    fn reject(&self, article_id: ArticleId) -> PipelineOutcome {
        counter!("pipeline_rejected_total").increment(1);
        PipelineOutcome::Rejected { article_id }
    }

    async fn run_job(&self, job: Job) -> Result<PipelineOutcome, PipelineError> {
        match job {
            Job::Fresh(a) => self.process(&a).await,
            Job::Retry(r) => self.retry_one(r).await,
        }
    }

    /* ---------- batch execution ---------- */

    /// Process `articles` with at most `workers` in flight.
    pub async fn run_batch(self: &Arc<Self>, articles: Vec<Article>) -> BatchReport {
        let jobs = articles.into_iter().map(Job::Fresh).collect();
        let report = self.run_jobs(jobs).await;
        tracing::info!(
            target: "pipeline",
            published = report.published,
            scheduled = report.scheduled,
            failed = report.failed,
            duplicates = report.duplicates,
            filtered = report.filtered,
            rejected = report.rejected,
            errors = report.errors.len(),
            "batch done"
        );
        report
    }

    /// One pass of the retry driver over records due now.
    pub async fn drive_retries(self: &Arc<Self>) -> Result<BatchReport, PipelineError> {
        if self.is_shutting_down() {
            return Ok(BatchReport::default());
        }
        let due = self
            .publisher
            .find_retryable(Utc::now(), self.settings.retry_batch)
            .await?;
        if due.is_empty() {
            return Ok(BatchReport::default());
        }
        tracing::info!(target: "pipeline", due = due.len(), "driving retries");
        let jobs = due.into_iter().map(Job::Retry).collect();
        Ok(self.run_jobs(jobs).await)
    }

    /// Retention purge. Returns the number of deleted articles.
    pub async fn purge(&self) -> Result<u64, PipelineError> {
        Ok(self.dedup.purge_older_than(self.settings.retention).await?)
    }

    async fn run_jobs(self: &Arc<Self>, jobs: Vec<Job>) -> BatchReport {
        let mut report = BatchReport::default();
        let mut set = JoinSet::new();

        for job in jobs {
            if self.is_shutting_down() {
                report.record(Ok(self.reject(job_id(&job))));
                continue;
            }
            let permit = match self.slots.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    report.record(Ok(self.reject(job_id(&job))));
                    continue;
                }
            };
            let this = Arc::clone(self);
            let abort = self.state.subscribe();
            set.spawn(async move {
                let _permit = permit;
                tokio::select! {
                    res = this.run_job(job) => res,
                    _ = aborted(abort) => Err(PipelineError::TransientInfrastructure(
                        "cancelled by shutdown".into(),
                    )),
                }
            });

            // Collect whatever already finished so the set stays small.
            while let Some(done) = set.try_join_next() {
                report.record(flatten(done));
            }
        }

        while let Some(done) = set.join_next().await {
            report.record(flatten(done));
        }
        report
    }

    /* ---------- shutdown ---------- */

    /// Stop accepting work. In-flight tasks keep running.
    pub fn begin_shutdown(&self) {
        if self.state.send_replace(RunState::Draining) == RunState::Running {
            tracing::info!(target: "pipeline", "shutdown started, rejecting new work");
        }
    }

    /// Reject new work and wait up to `grace` for in-flight tasks. Whatever is
    /// still running afterwards is cancelled. Returns true on a clean drain.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.begin_shutdown();
        let all = self.settings.workers as u32;
        match tokio::time::timeout(grace, self.slots.acquire_many(all)).await {
            Ok(Ok(_permits)) => {
                tracing::info!(target: "pipeline", "drained cleanly");
                true
            }
            Ok(Err(_)) => true,
            Err(_) => {
                self.state.send_replace(RunState::Aborted);
                tracing::warn!(
                    target: "pipeline",
                    grace_ms = grace.as_millis() as u64,
                    "grace period elapsed, cancelling in-flight work"
                );
                false
            }
        }
    }
}

fn job_id(job: &Job) -> ArticleId {
    match job {
        Job::Fresh(a) => a.id,
        Job::Retry(r) => r.article_id,
    }
}

fn flatten(
    joined: Result<Result<PipelineOutcome, PipelineError>, tokio::task::JoinError>,
) -> Result<PipelineOutcome, PipelineError> {
    match joined {
        Ok(res) => {
            match &res {
                Err(PipelineError::Validation(e)) => {
                    tracing::debug!(target: "pipeline", error = %e, "article rejected by validation");
                }
                Err(e) => tracing::warn!(target: "pipeline", error = %e, "pipeline task failed"),
                Ok(_) => {}
            }
            res
        }
        Err(e) => Err(PipelineError::TransientInfrastructure(format!("worker task failed: {e}"))),
    }
}

/// Resolves once the pipeline is aborted. Never resolves if the sender is gone.
async fn aborted(mut rx: watch::Receiver<RunState>) {
    loop {
        if *rx.borrow_and_update() == RunState::Aborted {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
