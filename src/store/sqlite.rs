// src/store/sqlite.rs
//! SQLite adapter. The connection sits behind a mutex and every call runs on
//! the blocking pool, so the async workers never stall on disk I/O.
//!
//! Timestamps are stored as unix milliseconds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::dedup::ContentFingerprint;
use crate::error::StoreError;
use crate::model::{Article, ArticleId};
use crate::publish::record::{PublicationRecord, PublicationState};
use crate::store::{ArticleStore, PublicationStore};

pub const SCHEMA_VERSION: i32 = 1;

#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
        tracing::info!(target: "store", path = %path.display(), "opening sqlite store");
        let conn = Connection::open(&path)
            .with_context(|| format!("opening database {}", path.display()))?;
        Self::from_connection(conn, path)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        Self::from_connection(conn, PathBuf::from(":memory:"))
    }

    fn from_connection(conn: Connection, path: PathBuf) -> anyhow::Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        initialize_schema(&conn)?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn execute_async<F, T>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::backend(operation, format!("database task failed: {e}")))?
    }
}

fn initialize_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;

    let has_version_table: bool = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    )?;
    let current: i32 = if has_version_table {
        conn.query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| row.get(0))
            .optional()?
            .unwrap_or(0)
    } else {
        0
    };

    if current >= SCHEMA_VERSION {
        tracing::debug!(target: "store", version = current, "schema up to date");
        return Ok(());
    }

    tracing::info!(target: "store", version = SCHEMA_VERSION, "initializing schema");
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id          INTEGER PRIMARY KEY CHECK (id = 1),
            version     INTEGER NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS articles (
            id            TEXT PRIMARY KEY,
            fingerprint   TEXT NOT NULL UNIQUE,
            title         TEXT NOT NULL,
            body          TEXT NOT NULL,
            link          TEXT,
            source_name   TEXT NOT NULL,
            published_at  INTEGER NOT NULL,
            fetched_at    INTEGER NOT NULL,
            language      TEXT NOT NULL,
            image_urls    TEXT NOT NULL DEFAULT '[]'
        );
        CREATE INDEX IF NOT EXISTS idx_articles_fetched_at ON articles(fetched_at);

        CREATE TABLE IF NOT EXISTS publications (
            article_id     TEXT PRIMARY KEY,
            status         TEXT NOT NULL,
            message_id     TEXT,
            published_at   INTEGER,
            next_retry_at  INTEGER,
            failed_at      INTEGER,
            attempt_count  INTEGER NOT NULL DEFAULT 0,
            last_error     TEXT,
            created_at     INTEGER NOT NULL,
            updated_at     INTEGER NOT NULL,
            version        INTEGER NOT NULL DEFAULT 0,
            CHECK ((status = 'published') = (message_id IS NOT NULL))
        );
        CREATE INDEX IF NOT EXISTS idx_publications_due
            ON publications(status, next_retry_at);
        "#,
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version, updated_at) VALUES (1, ?1, datetime('now'))",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(err, _) => {
            err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        }
        _ => false,
    }
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ts(ms: i64, operation: &'static str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::backend(operation, format!("timestamp {ms} out of range")))
}

fn parse_id(s: &str, operation: &'static str) -> Result<ArticleId, StoreError> {
    ArticleId::parse(s).map_err(|e| StoreError::backend(operation, e))
}

struct ArticleRow {
    id: String,
    title: String,
    body: String,
    link: Option<String>,
    source_name: String,
    published_at: i64,
    fetched_at: i64,
    language: String,
    image_urls: String,
}

impl ArticleRow {
    fn into_article(self) -> Result<Article, StoreError> {
        const OP: &str = "get_article";
        Ok(Article {
            id: parse_id(&self.id, OP)?,
            title: self.title,
            body: self.body,
            link: self.link,
            source_name: self.source_name,
            published_at: from_ts(self.published_at, OP)?,
            fetched_at: from_ts(self.fetched_at, OP)?,
            language: self.language,
            image_urls: serde_json::from_str(&self.image_urls)
                .map_err(|e| StoreError::backend(OP, e))?,
        })
    }
}

struct PublicationRow {
    article_id: String,
    status: String,
    message_id: Option<String>,
    published_at: Option<i64>,
    next_retry_at: Option<i64>,
    failed_at: Option<i64>,
    attempt_count: u32,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
    version: i64,
}

const PUBLICATION_COLUMNS: &str = "article_id, status, message_id, published_at, next_retry_at, \
     failed_at, attempt_count, last_error, created_at, updated_at, version";

impl PublicationRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            article_id: row.get(0)?,
            status: row.get(1)?,
            message_id: row.get(2)?,
            published_at: row.get(3)?,
            next_retry_at: row.get(4)?,
            failed_at: row.get(5)?,
            attempt_count: row.get(6)?,
            last_error: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            version: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<PublicationRecord, StoreError> {
        const OP: &str = "decode_publication";
        let missing = |col: &str| StoreError::backend(OP, format!("{} row without {col}", self.status));
        let state = match self.status.as_str() {
            "pending" => PublicationState::Pending,
            "published" => PublicationState::Published {
                message_id: self.message_id.clone().ok_or_else(|| missing("message_id"))?,
                published_at: from_ts(self.published_at.ok_or_else(|| missing("published_at"))?, OP)?,
            },
            "retrying" => PublicationState::Retrying {
                next_retry_at: from_ts(self.next_retry_at.ok_or_else(|| missing("next_retry_at"))?, OP)?,
            },
            "failed" => PublicationState::Failed {
                failed_at: from_ts(self.failed_at.ok_or_else(|| missing("failed_at"))?, OP)?,
            },
            other => return Err(StoreError::backend(OP, format!("unknown status `{other}`"))),
        };
        Ok(PublicationRecord {
            article_id: parse_id(&self.article_id, OP)?,
            state,
            attempt_count: self.attempt_count,
            last_error: self.last_error,
            created_at: from_ts(self.created_at, OP)?,
            updated_at: from_ts(self.updated_at, OP)?,
            version: self.version as u64,
        })
    }
}

/// Flattened state columns: (status, message_id, published_at, next_retry_at, failed_at).
type StateColumns = (&'static str, Option<String>, Option<i64>, Option<i64>, Option<i64>);

fn state_columns(state: &PublicationState) -> StateColumns {
    match state {
        PublicationState::Pending => ("pending", None, None, None, None),
        PublicationState::Published {
            message_id,
            published_at,
        } => ("published", Some(message_id.clone()), Some(ts(*published_at)), None, None),
        PublicationState::Retrying { next_retry_at } => {
            ("retrying", None, None, Some(ts(*next_retry_at)), None)
        }
        PublicationState::Failed { failed_at } => ("failed", None, None, None, Some(ts(*failed_at))),
    }
}

fn collect_records(
    rows: Vec<PublicationRow>,
) -> Result<Vec<PublicationRecord>, StoreError> {
    rows.into_iter().map(PublicationRow::into_record).collect()
}

#[async_trait]
impl ArticleStore for SqliteStore {
    async fn find_by_fingerprint(
        &self,
        fingerprint: &ContentFingerprint,
    ) -> Result<Option<ArticleId>, StoreError> {
        const OP: &str = "find_by_fingerprint";
        let fp = fingerprint.as_str().to_string();
        let id: Option<String> = self
            .execute_async(OP, move |conn| {
                conn.query_row(
                    "SELECT id FROM articles WHERE fingerprint = ?1",
                    [fp],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::backend(OP, e))
            })
            .await?;
        id.map(|s| parse_id(&s, OP)).transpose()
    }

    async fn insert_article(
        &self,
        article: &Article,
        fingerprint: &ContentFingerprint,
    ) -> Result<(), StoreError> {
        const OP: &str = "insert_article";
        let a = article.clone();
        let fp = fingerprint.as_str().to_string();
        let images =
            serde_json::to_string(&a.image_urls).map_err(|e| StoreError::backend(OP, e))?;
        self.execute_async(OP, move |conn| {
            conn.execute(
                "INSERT INTO articles (id, fingerprint, title, body, link, source_name, \
                 published_at, fetched_at, language, image_urls) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    a.id.to_string(),
                    fp,
                    a.title,
                    a.body,
                    a.link,
                    a.source_name,
                    ts(a.published_at),
                    ts(a.fetched_at),
                    a.language,
                    images,
                ],
            )
            .map(|_| ())
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::UniqueViolation("articles.fingerprint")
                } else {
                    StoreError::backend(OP, e)
                }
            })
        })
        .await
    }

    async fn get_article(&self, id: ArticleId) -> Result<Option<Article>, StoreError> {
        const OP: &str = "get_article";
        let row = self
            .execute_async(OP, move |conn| {
                conn.query_row(
                    "SELECT id, title, body, link, source_name, published_at, fetched_at, \
                     language, image_urls FROM articles WHERE id = ?1",
                    [id.to_string()],
                    |row| {
                        Ok(ArticleRow {
                            id: row.get(0)?,
                            title: row.get(1)?,
                            body: row.get(2)?,
                            link: row.get(3)?,
                            source_name: row.get(4)?,
                            published_at: row.get(5)?,
                            fetched_at: row.get(6)?,
                            language: row.get(7)?,
                            image_urls: row.get(8)?,
                        })
                    },
                )
                .optional()
                .map_err(|e| StoreError::backend(OP, e))
            })
            .await?;
        row.map(ArticleRow::into_article).transpose()
    }

    async fn delete_article(&self, id: ArticleId) -> Result<bool, StoreError> {
        const OP: &str = "delete_article";
        self.execute_async(OP, move |conn| {
            conn.execute("DELETE FROM articles WHERE id = ?1", [id.to_string()])
                .map(|n| n > 0)
                .map_err(|e| StoreError::backend(OP, e))
        })
        .await
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        const OP: &str = "purge_older_than";
        let cutoff = ts(cutoff);
        self.execute_async(OP, move |conn| {
            conn.execute(
                "DELETE FROM articles WHERE fetched_at < ?1 AND id NOT IN \
                 (SELECT article_id FROM publications WHERE status IN ('pending', 'retrying'))",
                [cutoff],
            )
            .map(|n| n as u64)
            .map_err(|e| StoreError::backend(OP, e))
        })
        .await
    }
}

#[async_trait]
impl PublicationStore for SqliteStore {
    async fn get_publication(
        &self,
        article_id: ArticleId,
    ) -> Result<Option<PublicationRecord>, StoreError> {
        const OP: &str = "get_publication";
        let row = self
            .execute_async(OP, move |conn| {
                conn.query_row(
                    &format!("SELECT {PUBLICATION_COLUMNS} FROM publications WHERE article_id = ?1"),
                    [article_id.to_string()],
                    PublicationRow::read,
                )
                .optional()
                .map_err(|e| StoreError::backend(OP, e))
            })
            .await?;
        row.map(PublicationRow::into_record).transpose()
    }

    async fn create_publication(&self, record: &PublicationRecord) -> Result<(), StoreError> {
        const OP: &str = "create_publication";
        let r = record.clone();
        self.execute_async(OP, move |conn| {
            let (status, message_id, published_at, next_retry_at, failed_at) = state_columns(&r.state);
            conn.execute(
                &format!(
                    "INSERT INTO publications ({PUBLICATION_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    r.article_id.to_string(),
                    status,
                    message_id,
                    published_at,
                    next_retry_at,
                    failed_at,
                    r.attempt_count,
                    r.last_error,
                    ts(r.created_at),
                    ts(r.updated_at),
                    r.version as i64,
                ],
            )
            .map(|_| ())
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::UniqueViolation("publications.article_id")
                } else {
                    StoreError::backend(OP, e)
                }
            })
        })
        .await
    }

    async fn update_publication(&self, record: &PublicationRecord) -> Result<(), StoreError> {
        const OP: &str = "update_publication";
        let r = record.clone();
        let expected = r.version.saturating_sub(1);
        if r.version == 0 {
            return Err(StoreError::Conflict {
                entity: "publication",
                expected,
            });
        }
        self.execute_async(OP, move |conn| {
            let (status, message_id, published_at, next_retry_at, failed_at) = state_columns(&r.state);
            let id = r.article_id.to_string();
            let changed = conn
                .execute(
                    "UPDATE publications SET status = ?2, message_id = ?3, published_at = ?4, \
                     next_retry_at = ?5, failed_at = ?6, attempt_count = ?7, last_error = ?8, \
                     updated_at = ?9, version = ?10 \
                     WHERE article_id = ?1 AND version = ?11",
                    params![
                        id,
                        status,
                        message_id,
                        published_at,
                        next_retry_at,
                        failed_at,
                        r.attempt_count,
                        r.last_error,
                        ts(r.updated_at),
                        r.version as i64,
                        expected as i64,
                    ],
                )
                .map_err(|e| StoreError::backend(OP, e))?;
            if changed == 1 {
                return Ok(());
            }
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) FROM publications WHERE article_id = ?1",
                    [&id],
                    |row| row.get(0),
                )
                .map_err(|e| StoreError::backend(OP, e))?;
            if exists {
                Err(StoreError::Conflict {
                    entity: "publication",
                    expected,
                })
            } else {
                Err(StoreError::NotFound(format!("publication {id}")))
            }
        })
        .await
    }

    async fn find_retryable(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PublicationRecord>, StoreError> {
        const OP: &str = "find_retryable";
        let now = ts(now);
        let stale_before = ts(stale_before);
        let rows = self
            .execute_async(OP, move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {PUBLICATION_COLUMNS} FROM publications \
                         WHERE (status = 'retrying' AND next_retry_at <= ?1) \
                            OR (status = 'pending' AND updated_at <= ?2) \
                         ORDER BY COALESCE(next_retry_at, updated_at) ASC LIMIT ?3"
                    ))
                    .map_err(|e| StoreError::backend(OP, e))?;
                let rows = stmt
                    .query_map(params![now, stale_before, limit as i64], PublicationRow::read)
                    .map_err(|e| StoreError::backend(OP, e))?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|e| StoreError::backend(OP, e))?;
                Ok(rows)
            })
            .await?;
        collect_records(rows)
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<PublicationRecord>, StoreError> {
        const OP: &str = "list_failed";
        let rows = self
            .execute_async(OP, move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {PUBLICATION_COLUMNS} FROM publications \
                         WHERE status = 'failed' ORDER BY failed_at DESC LIMIT ?1"
                    ))
                    .map_err(|e| StoreError::backend(OP, e))?;
                let rows = stmt
                    .query_map([limit as i64], PublicationRow::read)
                    .map_err(|e| StoreError::backend(OP, e))?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|e| StoreError::backend(OP, e))?;
                Ok(rows)
            })
            .await?;
        collect_records(rows)
    }
}
