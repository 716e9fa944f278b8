//! Persistence collaborator, raw-listing archive, and HTTP fetch utilities.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info_span;
use uuid::Uuid;
use yardscout_core::{CompletionKey, IdentityKey, InventoryRecord, WatchListDraft, WatchListEntry};

pub const CRATE_NAME: &str = "yardscout-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Lookup matched zero records. A caller-visible outcome, not a crash.
    #[error("no matching record")]
    NotFound,
    /// The atomic commit failed; prior state is untouched.
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

fn lock_err(context: &'static str) -> StoreError {
    StoreError::Backend(format!("poisoned lock: {context}"))
}

/// Minimal interface the pipeline and web layer use to reach persisted state.
///
/// `commit` must be atomic: either the whole delete+insert delta lands or
/// none of it does, and concurrent readers see pre- or post-state only.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<InventoryRecord>, StoreError>;

    async fn commit(
        &self,
        delete: &[IdentityKey],
        insert: &[InventoryRecord],
    ) -> Result<(), StoreError>;

    async fn load_watch_list(&self) -> Result<Vec<WatchListEntry>, StoreError>;

    async fn save_watch_entry(&self, draft: WatchListDraft) -> Result<WatchListEntry, StoreError>;

    async fn update_watch_entry(
        &self,
        id: i64,
        draft: WatchListDraft,
    ) -> Result<WatchListEntry, StoreError>;

    async fn delete_watch_entry(&self, id: i64) -> Result<(), StoreError>;

    /// Sets `completed` on every record matching the key. Returns how many
    /// records changed; zero matches is `NotFound`.
    async fn set_completed(&self, key: &CompletionKey, completed: bool)
        -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<InventoryRecord>,
    watch_list: Vec<WatchListEntry>,
    next_watch_id: i64,
}

/// In-memory store backed by a single `RwLock`. Commits apply under the write
/// lock, so readers observe pre- or post-commit state and nothing in between.
/// Primary test double; also usable for ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                next_watch_id: 1,
                ..MemoryState::default()
            }),
        }
    }

    /// Seeds records directly, bypassing reconciliation. Test helper.
    pub fn with_records(records: Vec<InventoryRecord>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.write().expect("fresh lock");
            state.records = records;
        }
        store
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<InventoryRecord>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("load_all"))?;
        Ok(state.records.clone())
    }

    async fn commit(
        &self,
        delete: &[IdentityKey],
        insert: &[InventoryRecord],
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("commit"))?;
        state
            .records
            .retain(|record| !delete.contains(&record.identity_key()));
        state.records.extend_from_slice(insert);
        Ok(())
    }

    async fn load_watch_list(&self) -> Result<Vec<WatchListEntry>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("load_watch_list"))?;
        Ok(state.watch_list.clone())
    }

    async fn save_watch_entry(&self, draft: WatchListDraft) -> Result<WatchListEntry, StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("save_watch_entry"))?;
        let entry = WatchListEntry {
            id: state.next_watch_id,
            make: draft.make,
            model: draft.model,
            min_year: draft.min_year,
            max_year: draft.max_year,
            part: draft.part,
        };
        state.next_watch_id += 1;
        state.watch_list.push(entry.clone());
        Ok(entry)
    }

    async fn update_watch_entry(
        &self,
        id: i64,
        draft: WatchListDraft,
    ) -> Result<WatchListEntry, StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("update_watch_entry"))?;
        let entry = state
            .watch_list
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or(StoreError::NotFound)?;
        entry.make = draft.make;
        entry.model = draft.model;
        entry.min_year = draft.min_year;
        entry.max_year = draft.max_year;
        entry.part = draft.part;
        Ok(entry.clone())
    }

    async fn delete_watch_entry(&self, id: i64) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("delete_watch_entry"))?;
        let before = state.watch_list.len();
        state.watch_list.retain(|entry| entry.id != id);
        if state.watch_list.len() == before {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_completed(
        &self,
        key: &CompletionKey,
        completed: bool,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("set_completed"))?;
        let mut updated = 0;
        for record in state.records.iter_mut().filter(|r| key.matches(r)) {
            record.completed = completed;
            updated += 1;
        }
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(updated)
    }
}

/// SQLite-backed store. Queries are bound at runtime; the delete+insert delta
/// of `commit` runs inside a single transaction.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (and if needed creates) the database and its schema.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        // One connection: SQLite is single-writer, and an in-memory database
        // is private to its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .with_context(|| format!("opening {database_url}"))?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cars (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                year INTEGER NOT NULL,
                make TEXT NOT NULL,
                model TEXT NOT NULL,
                "row" TEXT NOT NULL,
                arrival_date TEXT NOT NULL,
                yard TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("creating cars table")?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watch_list (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                make TEXT NOT NULL,
                model TEXT NOT NULL,
                min_year INTEGER,
                max_year INTEGER,
                part TEXT
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("creating watch_list table")?;
        Ok(Self { pool })
    }

    fn backend(err: sqlx::Error) -> StoreError {
        StoreError::Backend(err.to_string())
    }
}

fn decode_record(row: &sqlx::sqlite::SqliteRow) -> Result<InventoryRecord, StoreError> {
    let year: i64 = row.try_get("year").map_err(SqliteStore::backend)?;
    let arrival: String = row.try_get("arrival_date").map_err(SqliteStore::backend)?;
    let arrival_date = NaiveDate::parse_from_str(&arrival, "%Y-%m-%d")
        .map_err(|e| StoreError::Backend(format!("bad arrival_date {arrival:?}: {e}")))?;
    Ok(InventoryRecord {
        year: u16::try_from(year)
            .map_err(|_| StoreError::Backend(format!("year out of range: {year}")))?,
        make: row.try_get("make").map_err(SqliteStore::backend)?,
        model: row.try_get("model").map_err(SqliteStore::backend)?,
        row: row.try_get("row").map_err(SqliteStore::backend)?,
        arrival_date,
        yard: row.try_get("yard").map_err(SqliteStore::backend)?,
        completed: row.try_get("completed").map_err(SqliteStore::backend)?,
    })
}

fn decode_watch_entry(row: &sqlx::sqlite::SqliteRow) -> Result<WatchListEntry, StoreError> {
    let min_year: Option<i64> = row.try_get("min_year").map_err(SqliteStore::backend)?;
    let max_year: Option<i64> = row.try_get("max_year").map_err(SqliteStore::backend)?;
    Ok(WatchListEntry {
        id: row.try_get("id").map_err(SqliteStore::backend)?,
        make: row.try_get("make").map_err(SqliteStore::backend)?,
        model: row.try_get("model").map_err(SqliteStore::backend)?,
        min_year: min_year.and_then(|y| u16::try_from(y).ok()),
        max_year: max_year.and_then(|y| u16::try_from(y).ok()),
        part: row.try_get("part").map_err(SqliteStore::backend)?,
    })
}

#[async_trait]
impl InventoryStore for SqliteStore {
    async fn load_all(&self) -> Result<Vec<InventoryRecord>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT year, make, model, "row", arrival_date, yard, completed FROM cars"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Self::backend)?;
        rows.iter().map(decode_record).collect()
    }

    async fn commit(
        &self,
        delete: &[IdentityKey],
        insert: &[InventoryRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Commit(e.to_string()))?;
        for key in delete {
            sqlx::query(
                r#"
                DELETE FROM cars
                 WHERE year = ?
                   AND lower(make) = ?
                   AND lower(model) = ?
                   AND "row" = ?
                   AND yard = ?
                   AND arrival_date = ?
                "#,
            )
            .bind(i64::from(key.year))
            .bind(&key.make)
            .bind(&key.model)
            .bind(&key.row)
            .bind(&key.yard)
            .bind(key.arrival_date.format("%Y-%m-%d").to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Commit(e.to_string()))?;
        }
        for record in insert {
            sqlx::query(
                r#"
                INSERT INTO cars (year, make, model, "row", arrival_date, yard, completed)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(i64::from(record.year))
            .bind(&record.make)
            .bind(&record.model)
            .bind(&record.row)
            .bind(record.arrival_date.format("%Y-%m-%d").to_string())
            .bind(&record.yard)
            .bind(record.completed)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Commit(e.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::Commit(e.to_string()))
    }

    async fn load_watch_list(&self) -> Result<Vec<WatchListEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, make, model, min_year, max_year, part FROM watch_list ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Self::backend)?;
        rows.iter().map(decode_watch_entry).collect()
    }

    async fn save_watch_entry(&self, draft: WatchListDraft) -> Result<WatchListEntry, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO watch_list (make, model, min_year, max_year, part)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&draft.make)
        .bind(&draft.model)
        .bind(draft.min_year.map(i64::from))
        .bind(draft.max_year.map(i64::from))
        .bind(&draft.part)
        .execute(&self.pool)
        .await
        .map_err(Self::backend)?;
        Ok(WatchListEntry {
            id: result.last_insert_rowid(),
            make: draft.make,
            model: draft.model,
            min_year: draft.min_year,
            max_year: draft.max_year,
            part: draft.part,
        })
    }

    async fn update_watch_entry(
        &self,
        id: i64,
        draft: WatchListDraft,
    ) -> Result<WatchListEntry, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE watch_list
               SET make = ?, model = ?, min_year = ?, max_year = ?, part = ?
             WHERE id = ?
            "#,
        )
        .bind(&draft.make)
        .bind(&draft.model)
        .bind(draft.min_year.map(i64::from))
        .bind(draft.max_year.map(i64::from))
        .bind(&draft.part)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Self::backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(WatchListEntry {
            id,
            make: draft.make,
            model: draft.model,
            min_year: draft.min_year,
            max_year: draft.max_year,
            part: draft.part,
        })
    }

    async fn delete_watch_entry(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM watch_list WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Self::backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_completed(
        &self,
        key: &CompletionKey,
        completed: bool,
    ) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cars
               SET completed = ?
             WHERE lower(yard) = lower(?)
               AND "row" = ?
               AND lower(make) = lower(?)
               AND lower(model) = lower(?)
               AND year = ?
            "#,
        )
        .bind(completed)
        .bind(&key.yard)
        .bind(&key.row)
        .bind(&key.make)
        .bind(&key.model)
        .bind(i64::from(key.year))
        .execute(&self.pool)
        .await
        .map_err(Self::backend)?;
        let updated = result.rows_affected() as usize;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(updated)
    }
}

#[derive(Debug, Clone)]
pub struct StoredListing {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable archive of raw listing bodies, hash-addressed per fetch.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn listing_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        yard_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(yard_id)
            .join(format!("{content_hash}.html"))
    }

    /// Stores bytes immutably via a temp-file write and atomic rename.
    /// Identical bytes land on the same path and are deduplicated.
    pub async fn store_listing(
        &self,
        fetched_at: DateTime<Utc>,
        yard_id: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredListing> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.listing_relative_path(fetched_at, yard_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating artifact directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(StoredListing {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("artifact path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredListing {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredListing {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Bounded-timeout HTTP client shared by all source fetches. An unresponsive
/// source surfaces as a `FetchError` after the retry budget is spent; it must
/// never stall a refresh indefinitely.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(
        &self,
        run_id: Uuid,
        yard_id: &str,
        url: &str,
    ) -> Result<String, FetchError> {
        let span = info_span!("listing_fetch", %run_id, yard_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(yard: &str, row: &str, make: &str, year: u16, day: u32) -> InventoryRecord {
        InventoryRecord {
            year,
            make: make.to_string(),
            model: "Civic".to_string(),
            row: row.to_string(),
            arrival_date: NaiveDate::from_ymd_opt(2024, 5, day).unwrap(),
            yard: yard.to_string(),
            completed: false,
        }
    }

    #[tokio::test]
    async fn memory_commit_applies_delete_and_insert_together() {
        let old = record("PNP", "14", "Honda", 2012, 1);
        let store = MemoryStore::with_records(vec![old.clone()]);

        let incoming = record("PNP", "22", "Ford", 2008, 9);
        store
            .commit(&[old.identity_key()], std::slice::from_ref(&incoming))
            .await
            .unwrap();

        let records = store.load_all().await.unwrap();
        assert_eq!(records, vec![incoming]);
    }

    #[tokio::test]
    async fn memory_set_completed_is_case_insensitive_and_counts_matches() {
        let store = MemoryStore::with_records(vec![
            record("PNP", "14", "Honda", 2012, 1),
            record("PNP", "14", "HONDA", 2012, 3),
            record("PNP", "15", "Honda", 2012, 1),
        ]);
        let key = CompletionKey {
            yard: "pnp".to_string(),
            row: "14".to_string(),
            make: "honda".to_string(),
            model: "CIVIC".to_string(),
            year: 2012,
        };
        assert_eq!(store.set_completed(&key, true).await.unwrap(), 2);

        let completed_rows: Vec<_> = store
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.completed)
            .map(|r| r.row)
            .collect();
        assert_eq!(completed_rows, vec!["14".to_string(), "14".to_string()]);
    }

    #[tokio::test]
    async fn memory_set_completed_without_match_is_not_found() {
        let store = MemoryStore::new();
        let key = CompletionKey {
            yard: "PNP".to_string(),
            row: "1".to_string(),
            make: "Honda".to_string(),
            model: "Civic".to_string(),
            year: 2012,
        };
        assert!(matches!(
            store.set_completed(&key, true).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn memory_watch_list_crud_round_trip() {
        let store = MemoryStore::new();
        let saved = store
            .save_watch_entry(WatchListDraft {
                make: "Honda".to_string(),
                model: "Civic".to_string(),
                min_year: Some(2005),
                max_year: Some(2010),
                part: Some("alternator".to_string()),
            })
            .await
            .unwrap();

        let updated = store
            .update_watch_entry(
                saved.id,
                WatchListDraft {
                    make: "Honda".to_string(),
                    model: "Accord".to_string(),
                    min_year: None,
                    max_year: None,
                    part: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.model, "Accord");
        assert_eq!(updated.min_year, None);

        store.delete_watch_entry(saved.id).await.unwrap();
        assert!(store.load_watch_list().await.unwrap().is_empty());
        assert!(matches!(
            store.delete_watch_entry(saved.id).await,
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn listing_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_listing_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_listing(fetched_at, "PNP", b"<html>same</html>")
            .await
            .expect("first store");
        let second = store
            .store_listing(fetched_at, "PNP", b"<html>same</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn sqlite_store_commits_and_toggles_completion() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        let a = record("PNP", "14", "Honda", 2012, 1);
        let b = record("OG PAP", "3", "Ford", 2008, 2);
        store.commit(&[], &[a.clone(), b.clone()]).await.unwrap();

        let mut loaded = store.load_all().await.unwrap();
        loaded.sort_by(|x, y| x.yard.cmp(&y.yard));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].identity_key(), a.identity_key());

        let key = CompletionKey {
            yard: "pnp".to_string(),
            row: "14".to_string(),
            make: "HONDA".to_string(),
            model: "civic".to_string(),
            year: 2012,
        };
        assert_eq!(store.set_completed(&key, true).await.unwrap(), 1);

        store.commit(&[a.identity_key()], &[]).await.unwrap();
        let remaining = store.load_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].yard, "OG PAP");
    }

    #[tokio::test]
    async fn sqlite_watch_list_round_trip() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        let saved = store
            .save_watch_entry(WatchListDraft {
                make: "Honda".to_string(),
                model: "Civic".to_string(),
                min_year: Some(2005),
                max_year: Some(2010),
                part: None,
            })
            .await
            .unwrap();
        let listed = store.load_watch_list().await.unwrap();
        assert_eq!(listed, vec![saved.clone()]);

        store.delete_watch_entry(saved.id).await.unwrap();
        assert!(matches!(
            store.update_watch_entry(saved.id, WatchListDraft {
                make: "x".into(),
                model: "y".into(),
                min_year: None,
                max_year: None,
                part: None,
            })
            .await,
            Err(StoreError::NotFound)
        ));
    }
}
