// src/publish/record.rs
//! Durable publication state, one record per article.
//!
//! The state is a closed sum type: the downstream message id only exists in
//! `Published`, the retry deadline only in `Retrying`. Transitions go through
//! [`PublicationRecord::transition`], which rejects anything outside
//!
//! ```text
//! Pending  -> Published | Failed | Retrying
//! Retrying -> Published | Failed | Retrying
//! Failed   -> Retrying            (operator requeue)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::model::ArticleId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublicationState {
    Pending,
    Published {
        message_id: String,
        published_at: DateTime<Utc>,
    },
    Retrying {
        next_retry_at: DateTime<Utc>,
    },
    Failed {
        failed_at: DateTime<Utc>,
    },
}

impl PublicationState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published { .. } => "published",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Published { .. } | Self::Failed { .. })
    }

    fn may_become(&self, next: &PublicationState) -> bool {
        use PublicationState::*;
        matches!(
            (self, next),
            (Pending, Published { .. })
                | (Pending, Failed { .. })
                | (Pending, Retrying { .. })
                | (Retrying { .. }, Published { .. })
                | (Retrying { .. }, Failed { .. })
                | (Retrying { .. }, Retrying { .. })
                | (Failed { .. }, Retrying { .. })
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationRecord {
    pub article_id: ArticleId,
    pub state: PublicationState,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every persisted update; stores reject stale writes.
    pub version: u64,
}

impl PublicationRecord {
    /// Fresh record. Always starts in `Pending`.
    pub fn new(article_id: ArticleId, now: DateTime<Utc>) -> Self {
        Self {
            article_id,
            state: PublicationState::Pending,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match &self.state {
            PublicationState::Published { message_id, .. } => Some(message_id),
            _ => None,
        }
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            PublicationState::Retrying { next_retry_at } => Some(next_retry_at),
            _ => None,
        }
    }

    pub fn transition(
        &mut self,
        next: PublicationState,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        if !self.state.may_become(&next) {
            return Err(ValidationError::IllegalTransition {
                from: self.state.label(),
                to: next.label(),
            });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }
}
