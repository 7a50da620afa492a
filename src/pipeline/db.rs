//! SQLite-backed trend store
//!
//! Persisted layout (see `/sql/`):
//! - `tag_counts` - scalar cumulative counter per tag
//! - `tag_buckets` - sparse (tag, bucket_key) -> count
//! - `ingested_items` - the ingestion ledger
//! - `questions` / `question_tags` - carried-through item payload
//!
//! Every item is applied inside one transaction: ledger row, counter and
//! bucket increments (`count + 1`, never an absolute write) and the question
//! row commit together or not at all.

use super::bucket::bucket_key;
use super::error::StoreError;
use super::store::{IngestionLedger, TrendStore};
use super::types::{ApplyOutcome, Item, ItemMetrics, TimePoint};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Schema files, applied in order. All use `IF NOT EXISTS`.
const MIGRATIONS: &[(&str, &str)] = &[
    ("01_tag_counts.sql", include_str!("../../sql/01_tag_counts.sql")),
    ("02_tag_buckets.sql", include_str!("../../sql/02_tag_buckets.sql")),
    ("03_ingested_items.sql", include_str!("../../sql/03_ingested_items.sql")),
    ("04_questions.sql", include_str!("../../sql/04_questions.sql")),
];

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Run schema migrations (idempotent)
pub fn run_schema_migrations(conn: &Connection) -> Result<(), StoreError> {
    log::info!("🔧 Running schema migrations");

    for (filename, sql) in MIGRATIONS {
        log::debug!("   ├─ Executing: {}", filename);
        conn.execute_batch(sql)?;
    }

    log::info!("✅ All schema migrations completed successfully");
    Ok(())
}

/// SQLite implementation of `TrendStore`
///
/// One connection behind a mutex; writers serialize on it, which also
/// serializes same-tag read-modify-write.
pub struct SqliteTrendStore {
    conn: Mutex<Connection>,
}

impl SqliteTrendStore {
    /// Open (or create) the database at `db_path` and apply the schema
    ///
    /// Missing parent directories are created. `":memory:"` opens a private
    /// in-memory database.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = db_path.as_ref();
        let in_memory = path.as_os_str() == ":memory:";

        if !in_memory {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!(
                        "failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = if in_memory {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };

        conn.busy_timeout(BUSY_TIMEOUT)?;
        if !in_memory {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            log::info!("📊 Enabled WAL mode for {}", path.display());
        }

        run_schema_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }
}

fn increment_tag(conn: &Connection, tag: &str, timestamp: i64, now: i64) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO tag_counts (tag, cumulative_count, updated_at)
        VALUES (?1, 1, ?2)
        ON CONFLICT(tag) DO UPDATE SET
            cumulative_count = cumulative_count + 1,
            updated_at = excluded.updated_at
        "#,
        params![tag, now],
    )?;

    conn.execute(
        r#"
        INSERT INTO tag_buckets (tag, bucket_key, count)
        VALUES (?1, ?2, 1)
        ON CONFLICT(tag, bucket_key) DO UPDATE SET count = count + 1
        "#,
        params![tag, bucket_key(timestamp)],
    )?;

    Ok(())
}

fn upsert_question(conn: &Connection, item: &Item) -> Result<(), StoreError> {
    let tags_json = serde_json::to_string(&item.tags)
        .map_err(|e| StoreError::Unavailable(format!("failed to encode tags: {}", e)))?;

    conn.execute(
        r#"
        INSERT INTO questions (
            question_id, title, creation_date, tags, view_count, answer_count, score
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(question_id) DO UPDATE SET
            title = excluded.title,
            tags = excluded.tags,
            view_count = excluded.view_count,
            answer_count = excluded.answer_count,
            score = excluded.score
        "#,
        params![
            item.id,
            item.title,
            item.creation_date,
            tags_json,
            item.metrics.view_count,
            item.metrics.answer_count,
            item.metrics.score,
        ],
    )?;

    for tag in &item.tags {
        conn.execute(
            "INSERT OR IGNORE INTO question_tags (question_id, tag) VALUES (?1, ?2)",
            params![item.id, tag],
        )?;
    }

    Ok(())
}

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// `questions` row before the tags column is decoded
struct QuestionRow {
    id: String,
    title: String,
    creation_date: i64,
    tags_json: String,
    metrics: ItemMetrics,
}

impl QuestionRow {
    fn into_item(self) -> Result<Item, StoreError> {
        let tags: BTreeSet<String> = serde_json::from_str(&self.tags_json).map_err(|e| {
            StoreError::Unavailable(format!("corrupt tags for question {}: {}", self.id, e))
        })?;
        Ok(Item {
            id: self.id,
            title: self.title,
            creation_date: self.creation_date,
            tags,
            metrics: self.metrics,
        })
    }
}

/// Columns: question_id, title, creation_date, tags, view_count, answer_count, score
fn question_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuestionRow> {
    Ok(QuestionRow {
        id: row.get(0)?,
        title: row.get(1)?,
        creation_date: row.get(2)?,
        tags_json: row.get(3)?,
        metrics: ItemMetrics {
            view_count: row.get(4)?,
            answer_count: row.get(5)?,
            score: row.get(6)?,
        },
    })
}

impl IngestionLedger for SqliteTrendStore {
    fn ledger_len(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM ingested_items", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    fn contains_identifier(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT 1 FROM ingested_items WHERE item_id = ?1")?;
        Ok(stmt.exists([id])?)
    }

    fn retire_identifiers(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut removed = 0;
        for id in ids {
            removed += tx.execute("DELETE FROM ingested_items WHERE item_id = ?1", [id])?;
        }
        tx.commit()?;
        Ok(removed)
    }

    fn retire_applied_before(&self, cutoff: i64) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM ingested_items WHERE creation_date < ?1", [cutoff])?)
    }
}

impl TrendStore for SqliteTrendStore {
    fn record_occurrence(&self, tag: &str, timestamp: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        increment_tag(&tx, tag, timestamp, chrono::Utc::now().timestamp())?;
        tx.commit()?;
        Ok(())
    }

    fn apply_item(&self, item: &Item) -> Result<ApplyOutcome, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO ingested_items (item_id, creation_date, ingested_at) VALUES (?1, ?2, ?3)",
            params![item.id, item.creation_date, now],
        )?;
        if inserted == 0 {
            return Ok(ApplyOutcome::Duplicate);
        }

        for tag in &item.tags {
            increment_tag(&tx, tag, item.creation_date, now)?;
        }
        upsert_question(&tx, item)?;

        tx.commit()?;
        Ok(ApplyOutcome::Applied)
    }

    fn cumulative_count(&self, tag: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: Option<i64> = conn
            .query_row(
                "SELECT cumulative_count FROM tag_counts WHERE tag = ?1",
                [tag],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.map(to_count).unwrap_or(0))
    }

    fn buckets_in_range(&self, tag: &str, start: i64, end: i64) -> Result<Vec<TimePoint>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT bucket_key, count FROM tag_buckets
             WHERE tag = ?1 AND bucket_key >= ?2 AND bucket_key <= ?3
             ORDER BY bucket_key ASC",
        )?;

        let points = stmt
            .query_map(params![tag, start, end], |row| {
                Ok(TimePoint {
                    timestamp: row.get(0)?,
                    count: to_count(row.get(1)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(points)
    }

    fn tags_by_count_desc(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT tag, cumulative_count FROM tag_counts
             ORDER BY cumulative_count DESC, tag ASC",
        )?;

        let entries = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, to_count(row.get(1)?))))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    fn questions_by_tag(&self, tag: &str, limit: usize) -> Result<Vec<Item>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT q.question_id, q.title, q.creation_date, q.tags,
                    q.view_count, q.answer_count, q.score
             FROM questions q
             JOIN question_tags t ON t.question_id = q.question_id
             WHERE t.tag = ?1
             ORDER BY q.creation_date DESC, q.question_id ASC
             LIMIT ?2",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![tag, limit], question_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(QuestionRow::into_item).collect()
    }

    fn question(&self, id: &str) -> Result<Option<Item>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT question_id, title, creation_date, tags, view_count, answer_count, score
                 FROM questions WHERE question_id = ?1",
                [id],
                question_row,
            )
            .optional()?;

        row.map(QuestionRow::into_item).transpose()
    }
}
