use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::traits::{DedupStore, StoreResult, StoredEvent, TransformCache};
use crate::constants::{SQLITE_BUSY_TIMEOUT, STATE_DB_FILE};
use crate::domain::Record;
use crate::idempotency::record_fingerprint;

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    CREATE TABLE IF NOT EXISTS events (
        fingerprint    TEXT PRIMARY KEY,
        url            TEXT NOT NULL UNIQUE,
        title          TEXT,
        text           TEXT,
        excerpt        TEXT,
        gpt_text       TEXT,
        summary        TEXT,
        error          TEXT,
        status         TEXT NOT NULL DEFAULT 'pending',
        template_name  TEXT NOT NULL,
        created_at     TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS transform_cache (
        template_name   TEXT NOT NULL,
        transform_name  TEXT NOT NULL,
        input           TEXT NOT NULL,
        output          TEXT NOT NULL,
        updated_at      REAL NOT NULL,
        PRIMARY KEY (template_name, transform_name, input)
    );
"#;

fn connect_at(db_path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(SQLITE_BUSY_TIMEOUT)?;
    Ok(conn)
}

/// SQLite-backed dedup store and transform cache sharing one database file.
///
/// Holds only the path: every operation opens its own connection on tokio's
/// blocking pool and drops it before returning.
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    db_path: PathBuf,
}

impl SqliteStateStore {
    pub fn open_at_root<P: AsRef<Path>>(state_dir: P) -> StoreResult<Self> {
        Self::open(state_dir.as_ref().join(STATE_DB_FILE))
    }

    pub fn open<P: AsRef<Path>>(db_path: P) -> StoreResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self { db_path };
        store.connect()?.execute_batch(SCHEMA)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> StoreResult<Connection> {
        connect_at(&self.db_path)
    }

    /// Run `op` against a fresh connection on the blocking pool.
    async fn with_connection<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = connect_at(&db_path)?;
            op(&conn)
        })
        .await?
    }

    pub fn event(&self, fingerprint: &str) -> StoreResult<Option<StoredEvent>> {
        let conn = self.connect()?;
        let event = conn
            .query_row(
                "SELECT fingerprint, url, title, text, excerpt, gpt_text, summary, error, status,
                        template_name, created_at
                 FROM events WHERE fingerprint = ?1",
                params![fingerprint],
                |row| {
                    let created: String = row.get(10)?;
                    let created_at = DateTime::parse_from_rfc3339(&created)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now());
                    Ok(StoredEvent {
                        fingerprint: row.get(0)?,
                        url: row.get(1)?,
                        title: row.get(2)?,
                        text: row.get(3)?,
                        excerpt: row.get(4)?,
                        gpt_text: row.get(5)?,
                        summary: row.get(6)?,
                        error: row.get(7)?,
                        status: row.get(8)?,
                        template_name: row.get(9)?,
                        created_at,
                    })
                },
            )
            .optional()?;
        Ok(event)
    }
}

#[async_trait]
impl DedupStore for SqliteStateStore {
    async fn exists_by_url(&self, url: &str) -> StoreResult<bool> {
        let url = url.to_string();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare("SELECT 1 FROM events WHERE url = ?1 LIMIT 1")?;
            let mut rows = stmt.query(params![url])?;
            Ok(rows.next()?.is_some())
        })
        .await
    }

    async fn exists_by_fingerprint(&self, record: &Record) -> StoreResult<bool> {
        let fingerprint = record_fingerprint(record);
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare("SELECT 1 FROM events WHERE fingerprint = ?1 LIMIT 1")?;
            let mut rows = stmt.query(params![fingerprint])?;
            Ok(rows.next()?.is_some())
        })
        .await
    }

    async fn save(&self, record: &Record, template_name: &str) -> StoreResult<bool> {
        let event = StoredEvent::from_record(record, template_name)?;
        let inserted = self
            .with_connection(move |conn| {
                // Both UNIQUE constraints are enforced by the single statement.
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO events
                        (fingerprint, url, title, text, excerpt, gpt_text, summary, error, status,
                         template_name, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        event.fingerprint,
                        event.url,
                        event.title,
                        event.text,
                        event.excerpt,
                        event.gpt_text,
                        event.summary,
                        event.error,
                        event.status,
                        event.template_name,
                        event.created_at.to_rfc3339(),
                    ],
                )?;
                debug!(url = %event.url, inserted = inserted == 1, "event save");
                Ok(inserted == 1)
            })
            .await?;
        Ok(inserted)
    }

    async fn count(&self) -> StoreResult<usize> {
        self.with_connection(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
            Ok(n as usize)
        })
        .await
    }
}

#[async_trait]
impl TransformCache for SqliteStateStore {
    async fn get(&self, template: &str, transform: &str, input: &str) -> StoreResult<Option<String>> {
        let key = (template.to_string(), transform.to_string(), input.to_string());
        self.with_connection(move |conn| {
            let output = conn
                .query_row(
                    "SELECT output FROM transform_cache
                     WHERE template_name = ?1 AND transform_name = ?2 AND input = ?3",
                    params![key.0, key.1, key.2],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(output)
        })
        .await
    }

    async fn put(&self, template: &str, transform: &str, input: &str, output: &str) -> StoreResult<()> {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let row = (
            template.to_string(),
            transform.to_string(),
            input.to_string(),
            output.to_string(),
        );
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO transform_cache (template_name, transform_name, input, output, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(template_name, transform_name, input)
                 DO UPDATE SET output=excluded.output, updated_at=excluded.updated_at",
                params![row.0, row.1, row.2, row.3, now],
            )?;
            Ok(())
        })
        .await
    }
}
