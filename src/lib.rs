// src/lib.rs
// Public library surface for the binary and the integration tests.

pub mod breaker;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod error;
pub mod hashtags;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod publish;
pub mod scoring;
pub mod store;
pub mod translate;

// Scripted fakes of the outbound ports, shared by unit and integration tests.
pub mod testing;

// ---- Re-exports for stable public API ----
pub use crate::breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use crate::config::AppConfig;
pub use crate::dedup::{DedupEngine, DedupOutcome};
pub use crate::error::{FailureKind, PipelineError};
pub use crate::model::{Article, ArticleId, LanguagePair, TranslatedArticle};
pub use crate::pipeline::{BatchReport, Pipeline, PipelineOutcome};
pub use crate::publish::{PublicationMachine, PublishOutcome, RetryPolicy};
pub use crate::scoring::{ScoringEngine, ScoringHandle};
pub use crate::translate::EntityPreservingTranslator;
