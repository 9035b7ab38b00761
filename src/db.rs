use crate::error::AppResult;
use crate::model::{
    HistoryAction, StoreEntry, StoreStatus, Suggestion, SuggestionHistoryEntry, SuggestionStatus,
};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS suggestions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id TEXT NOT NULL,
        language TEXT NOT NULL,
        filename TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        user_id TEXT NOT NULL,
        status TEXT NOT NULL,
        source_hash TEXT NOT NULL,
        is_valid INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_suggestions_group
        ON suggestions (project_id, language, key)",
    "CREATE INDEX IF NOT EXISTS idx_suggestions_file
        ON suggestions (project_id, language, filename)",
    // Backstop for the single-approval invariant.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_suggestions_one_approved
        ON suggestions (project_id, language, key) WHERE status = 'approved'",
    "CREATE TABLE IF NOT EXISTS suggestion_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        translation_id INTEGER NOT NULL,
        project_id TEXT NOT NULL,
        language TEXT NOT NULL,
        filename TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        user_id TEXT NOT NULL,
        action TEXT NOT NULL,
        source_hash TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_history_translation
        ON suggestion_history (translation_id)",
    "CREATE TABLE IF NOT EXISTS store_entries (
        project_id TEXT NOT NULL,
        language TEXT NOT NULL,
        filepath TEXT NOT NULL,
        key TEXT NOT NULL,
        src_hash TEXT NOT NULL,
        tgt_hash TEXT,
        status TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (project_id, language, filepath, key)
    )",
];

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `database_url` and apply the schema.
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        info!("Database ready at {}", database_url);
        Ok(db)
    }

    /// Private in-memory database. A single connection that never expires,
    /// since every SQLite connection would otherwise get its own database.
    pub async fn in_memory() -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> AppResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn acquire(&self) -> AppResult<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    /// Write transaction. Takes the write lock up front so that concurrent
    /// writers queue on the busy timeout instead of failing on lock upgrade.
    pub async fn begin(&self) -> AppResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ==================== Row helpers ====================

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn parse_enum<T: FromStr<Err = String>>(value: &str) -> Result<T, sqlx::Error> {
    value.parse::<T>().map_err(|e| sqlx::Error::Decode(e.into()))
}

fn suggestion_from_row(row: &SqliteRow) -> Result<Suggestion, sqlx::Error> {
    Ok(Suggestion {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        language: row.try_get("language")?,
        filename: row.try_get("filename")?,
        key: row.try_get("key")?,
        value: row.try_get("value")?,
        user_id: row.try_get("user_id")?,
        status: parse_enum(row.try_get::<&str, _>("status")?)?,
        source_hash: row.try_get("source_hash")?,
        is_valid: row.try_get::<i64, _>("is_valid")? != 0,
        created_at: parse_ts(row.try_get::<&str, _>("created_at")?)?,
        updated_at: parse_ts(row.try_get::<&str, _>("updated_at")?)?,
    })
}

fn history_from_row(row: &SqliteRow) -> Result<SuggestionHistoryEntry, sqlx::Error> {
    Ok(SuggestionHistoryEntry {
        id: row.try_get("id")?,
        translation_id: row.try_get("translation_id")?,
        project_id: row.try_get("project_id")?,
        language: row.try_get("language")?,
        filename: row.try_get("filename")?,
        key: row.try_get("key")?,
        value: row.try_get("value")?,
        user_id: row.try_get("user_id")?,
        action: parse_enum::<HistoryAction>(row.try_get::<&str, _>("action")?)?,
        source_hash: row.try_get("source_hash")?,
        created_at: parse_ts(row.try_get::<&str, _>("created_at")?)?,
    })
}

fn store_entry_from_row(row: &SqliteRow) -> Result<StoreEntry, sqlx::Error> {
    Ok(StoreEntry {
        key: row.try_get("key")?,
        src_hash: row.try_get("src_hash")?,
        tgt_hash: row.try_get("tgt_hash")?,
        updated_at: parse_ts(row.try_get::<&str, _>("updated_at")?)?,
        status: parse_enum::<StoreStatus>(row.try_get::<&str, _>("status")?)?,
    })
}

// ==================== Suggestions ====================

/// Fields of a suggestion supplied by the submitter.
#[derive(Debug, Clone)]
pub struct NewSuggestion {
    pub project_id: String,
    pub language: String,
    pub filename: String,
    pub key: String,
    pub value: String,
    pub user_id: String,
    pub source_hash: String,
}

/// Optional narrowing of suggestion and history listings. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct SuggestionFilter {
    pub project_id: String,
    pub language: Option<String>,
    pub filename: Option<String>,
    pub key: Option<String>,
    pub statuses: Option<Vec<SuggestionStatus>>,
}

impl SuggestionFilter {
    pub fn project(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            ..Default::default()
        }
    }

    fn push_conditions(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(" WHERE project_id = ").push_bind(self.project_id.clone());
        if let Some(language) = &self.language {
            qb.push(" AND language = ").push_bind(language.clone());
        }
        if let Some(filename) = &self.filename {
            qb.push(" AND filename = ").push_bind(filename.clone());
        }
        if let Some(key) = &self.key {
            qb.push(" AND key = ").push_bind(key.clone());
        }
    }
}

pub async fn insert_suggestion(
    conn: &mut SqliteConnection,
    new: &NewSuggestion,
    now: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    let ts = format_ts(now);
    let result = sqlx::query(
        "INSERT INTO suggestions
            (project_id, language, filename, key, value, user_id, status, source_hash, is_valid, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, 1, ?8, ?8)",
    )
    .bind(&new.project_id)
    .bind(&new.language)
    .bind(&new.filename)
    .bind(&new.key)
    .bind(&new.value)
    .bind(&new.user_id)
    .bind(&new.source_hash)
    .bind(&ts)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn get_suggestion(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Suggestion>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM suggestions WHERE id = ?1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(suggestion_from_row).transpose()
}

pub async fn list_suggestions(
    conn: &mut SqliteConnection,
    filter: &SuggestionFilter,
) -> Result<Vec<Suggestion>, sqlx::Error> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM suggestions");
    filter.push_conditions(&mut qb);
    if let Some(statuses) = &filter.statuses {
        qb.push(" AND status IN (");
        let mut separated = qb.separated(", ");
        for status in statuses {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");
    }
    qb.push(" ORDER BY created_at DESC, id DESC");

    let rows = qb.build().fetch_all(&mut *conn).await?;
    rows.iter().map(suggestion_from_row).collect()
}

/// Pending or approved suggestions for the same `(project, language, key)`,
/// excluding `exclude_id`.
pub async fn active_siblings(
    conn: &mut SqliteConnection,
    target: &Suggestion,
) -> Result<Vec<Suggestion>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT * FROM suggestions
         WHERE project_id = ?1 AND language = ?2 AND key = ?3 AND id != ?4
           AND status IN ('pending', 'approved')
         ORDER BY id",
    )
    .bind(&target.project_id)
    .bind(&target.language)
    .bind(&target.key)
    .bind(target.id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(suggestion_from_row).collect()
}

/// Move `id` to `to`, but only if its current status is one of `from`.
/// Returns whether a row changed.
pub async fn transition_status(
    conn: &mut SqliteConnection,
    id: i64,
    from: &[SuggestionStatus],
    to: SuggestionStatus,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE suggestions SET status = ");
    qb.push_bind(to.as_str())
        .push(", updated_at = ")
        .push_bind(format_ts(now))
        .push(" WHERE id = ")
        .push_bind(id)
        .push(" AND status IN (");
    let mut separated = qb.separated(", ");
    for status in from {
        separated.push_bind(status.as_str());
    }
    separated.push_unseparated(")");

    let result = qb.build().execute(&mut *conn).await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_validity(
    conn: &mut SqliteConnection,
    id: i64,
    is_valid: bool,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE suggestions SET is_valid = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(is_valid as i64)
        .bind(format_ts(now))
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ==================== History ====================

pub async fn append_history(
    conn: &mut SqliteConnection,
    suggestion: &Suggestion,
    actor_id: &str,
    action: HistoryAction,
    now: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO suggestion_history
            (translation_id, project_id, language, filename, key, value, user_id, action, source_hash, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )
    .bind(suggestion.id)
    .bind(&suggestion.project_id)
    .bind(&suggestion.language)
    .bind(&suggestion.filename)
    .bind(&suggestion.key)
    .bind(&suggestion.value)
    .bind(actor_id)
    .bind(action.as_str())
    .bind(&suggestion.source_hash)
    .bind(format_ts(now))
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn list_history(
    conn: &mut SqliteConnection,
    filter: &SuggestionFilter,
    translation_id: Option<i64>,
) -> Result<Vec<SuggestionHistoryEntry>, sqlx::Error> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM suggestion_history");
    filter.push_conditions(&mut qb);
    if let Some(id) = translation_id {
        qb.push(" AND translation_id = ").push_bind(id);
    }
    qb.push(" ORDER BY created_at DESC, id DESC");

    let rows = qb.build().fetch_all(&mut *conn).await?;
    rows.iter().map(history_from_row).collect()
}

// ==================== Store entries ====================

pub async fn load_store_entries(
    conn: &mut SqliteConnection,
    project_id: &str,
    language: &str,
    filepath: &str,
) -> Result<Vec<StoreEntry>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT key, src_hash, tgt_hash, status, updated_at FROM store_entries
         WHERE project_id = ?1 AND language = ?2 AND filepath = ?3
         ORDER BY key",
    )
    .bind(project_id)
    .bind(language)
    .bind(filepath)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(store_entry_from_row).collect()
}

pub async fn upsert_store_entry(
    conn: &mut SqliteConnection,
    project_id: &str,
    language: &str,
    filepath: &str,
    entry: &StoreEntry,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO store_entries (project_id, language, filepath, key, src_hash, tgt_hash, status, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (project_id, language, filepath, key) DO UPDATE SET
            src_hash = excluded.src_hash,
            tgt_hash = excluded.tgt_hash,
            status = excluded.status,
            updated_at = excluded.updated_at",
    )
    .bind(project_id)
    .bind(language)
    .bind(filepath)
    .bind(&entry.key)
    .bind(&entry.src_hash)
    .bind(&entry.tgt_hash)
    .bind(entry.status.as_str())
    .bind(format_ts(entry.updated_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn delete_store_entry(
    conn: &mut SqliteConnection,
    project_id: &str,
    language: &str,
    filepath: &str,
    key: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "DELETE FROM store_entries
         WHERE project_id = ?1 AND language = ?2 AND filepath = ?3 AND key = ?4",
    )
    .bind(project_id)
    .bind(language)
    .bind(filepath)
    .bind(key)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Tracked files of a language with their key counts, ordered by path.
pub async fn store_files(
    conn: &mut SqliteConnection,
    project_id: &str,
    language: &str,
) -> Result<Vec<(String, usize)>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT filepath, COUNT(*) AS total FROM store_entries
         WHERE project_id = ?1 AND language = ?2
         GROUP BY filepath ORDER BY filepath",
    )
    .bind(project_id)
    .bind(language)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            let filepath: String = row.try_get("filepath")?;
            let total: i64 = row.try_get("total")?;
            Ok((filepath, total.max(0) as usize))
        })
        .collect()
}
