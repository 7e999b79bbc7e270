// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed store.
//!
//! # Layout
//!
//! | Table | Key | Notes |
//! |-------|-----|-------|
//! | `change_records` | `id` | indexed on `(client_id, status)`, `(entity_type, entity_id)`, `(created_at, id)`, `(status, modified_at)` |
//! | `conflicts` | `id` | unresolved iff `resolved_at IS NULL` |
//! | `clients` | `client_id` | checkpoints as JSON text |
//! | `sync_configurations` | `user_id` | whole configuration as JSON text |
//! | `subscriptions` | `client_id` | entity types as JSON text |
//! | `notifications` | `id` | undelivered iff `delivered_at IS NULL` |
//!
//! Timestamps are epoch milliseconds, payloads are BLOBs.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Every statement goes through [`execute_with_retry`], which
//! backs off exponentially (10ms doubling, capped at 500ms, 5 attempts).
//! A busy error that survives the retries surfaces as
//! [`SyncError::StoreUnavailable`] so callers treat it as transient.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{BoxFuture, ClientChangeSummary, DeltaQuery, SyncStore};
use crate::clock::from_millis;
use crate::error::{Result, SyncError};
use crate::model::{
    ChangeNotification, ChangeRecord, ChangeStatus, ClientRegistration, Conflict,
    ConflictResolution, Subscription, SyncConfiguration,
};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const CHANGE_COLUMNS: &str = "id, entity_type, entity_id, operation, data, content_hash, \
    client_id, user_id, changed_at, created_at, modified_at, status, retry_count, \
    last_retry_at, next_retry_at, error_message";

const CONFLICT_COLUMNS: &str = "id, client_id, user_id, entity_type, entity_id, \
    client_operation, client_data, server_operation, server_data, client_timestamp, \
    server_timestamp, server_change_id, recommended_strategy, reason, created_at, \
    resolution_strategy, resolved_data, resolved_by, resolved_at";

const CLIENT_COLUMNS: &str = "client_id, user_id, descriptor, registered_at, last_sync_at, \
    last_seen_at, is_active, entity_checkpoints";

const NOTIFICATION_COLUMNS: &str = "id, client_id, user_id, change_id, entity_type, entity_id, \
    operation, created_at, delivered_at";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS change_records (
        id TEXT PRIMARY KEY,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        operation TEXT NOT NULL,
        data BLOB NOT NULL,
        content_hash TEXT NOT NULL,
        client_id TEXT,
        user_id TEXT NOT NULL,
        changed_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        modified_at INTEGER NOT NULL,
        status TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_retry_at INTEGER,
        next_retry_at INTEGER,
        error_message TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_changes_client_status ON change_records (client_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_changes_entity ON change_records (entity_type, entity_id)",
    "CREATE INDEX IF NOT EXISTS idx_changes_created ON change_records (created_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_changes_status_modified ON change_records (status, modified_at)",
    r#"
    CREATE TABLE IF NOT EXISTS conflicts (
        id TEXT PRIMARY KEY,
        client_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        client_operation TEXT NOT NULL,
        client_data BLOB NOT NULL,
        server_operation TEXT NOT NULL,
        server_data BLOB NOT NULL,
        client_timestamp INTEGER NOT NULL,
        server_timestamp INTEGER NOT NULL,
        server_change_id TEXT NOT NULL,
        recommended_strategy TEXT NOT NULL,
        reason TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        resolution_strategy TEXT,
        resolved_data BLOB,
        resolved_by TEXT,
        resolved_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_conflicts_client ON conflicts (client_id, resolved_at)",
    "CREATE INDEX IF NOT EXISTS idx_conflicts_entity ON conflicts (entity_type, entity_id)",
    "CREATE INDEX IF NOT EXISTS idx_conflicts_user ON conflicts (user_id, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS clients (
        client_id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        descriptor TEXT NOT NULL,
        registered_at INTEGER NOT NULL,
        last_sync_at INTEGER,
        last_seen_at INTEGER NOT NULL,
        is_active INTEGER NOT NULL,
        entity_checkpoints TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_clients_user ON clients (user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS sync_configurations (
        user_id TEXT PRIMARY KEY,
        body TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS subscriptions (
        client_id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        entity_types TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_subscriptions_user ON subscriptions (user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id TEXT PRIMARY KEY,
        client_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        change_id TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        operation TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        delivered_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_notifications_client ON notifications (client_id, delivered_at)",
];

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Busy and pool exhaustion are transient; everything else needs attention.
fn store_error(operation: &str, e: sqlx::Error) -> SyncError {
    if is_sqlite_busy_error(&e) || matches!(e, sqlx::Error::PoolTimedOut) {
        SyncError::store_unavailable(operation, e.to_string())
    } else {
        SyncError::Store(e)
    }
}

fn millis(v: i64) -> Result<DateTime<Utc>> {
    from_millis(v).ok_or_else(|| SyncError::Internal(format!("timestamp out of range: {v}")))
}

fn opt_millis(v: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    v.map(millis).transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| SyncError::Internal(format!("encode json: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| SyncError::Internal(format!("decode json: {e}")))
}

fn change_from_row(row: &SqliteRow) -> Result<ChangeRecord> {
    let retry_count: i64 = row.try_get("retry_count")?;
    Ok(ChangeRecord {
        id: row.try_get("id")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        operation: row.try_get::<String, _>("operation")?.parse()?,
        data: row.try_get("data")?,
        content_hash: row.try_get("content_hash")?,
        client_id: row.try_get("client_id")?,
        user_id: row.try_get("user_id")?,
        changed_at: millis(row.try_get("changed_at")?)?,
        created_at: millis(row.try_get("created_at")?)?,
        modified_at: millis(row.try_get("modified_at")?)?,
        status: row.try_get::<String, _>("status")?.parse()?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        last_retry_at: opt_millis(row.try_get("last_retry_at")?)?,
        next_retry_at: opt_millis(row.try_get("next_retry_at")?)?,
        error_message: row.try_get("error_message")?,
    })
}

fn conflict_from_row(row: &SqliteRow) -> Result<Conflict> {
    let resolved_at: Option<i64> = row.try_get("resolved_at")?;
    let resolution = match resolved_at {
        Some(at) => Some(ConflictResolution {
            strategy: row.try_get::<String, _>("resolution_strategy")?.parse()?,
            resolved_data: row
                .try_get::<Option<Vec<u8>>, _>("resolved_data")?
                .unwrap_or_default(),
            resolved_by: row
                .try_get::<Option<String>, _>("resolved_by")?
                .unwrap_or_default(),
            resolved_at: millis(at)?,
        }),
        None => None,
    };
    Ok(Conflict {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        user_id: row.try_get("user_id")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        client_operation: row.try_get::<String, _>("client_operation")?.parse()?,
        client_data: row.try_get("client_data")?,
        server_operation: row.try_get::<String, _>("server_operation")?.parse()?,
        server_data: row.try_get("server_data")?,
        client_timestamp: millis(row.try_get("client_timestamp")?)?,
        server_timestamp: millis(row.try_get("server_timestamp")?)?,
        server_change_id: row.try_get("server_change_id")?,
        recommended_strategy: row.try_get::<String, _>("recommended_strategy")?.parse()?,
        reason: row.try_get("reason")?,
        created_at: millis(row.try_get("created_at")?)?,
        resolution,
    })
}

fn client_from_row(row: &SqliteRow) -> Result<ClientRegistration> {
    let checkpoints: BTreeMap<String, i64> =
        from_json(&row.try_get::<String, _>("entity_checkpoints")?)?;
    let entity_checkpoints = checkpoints
        .into_iter()
        .map(|(k, v)| millis(v).map(|t| (k, t)))
        .collect::<Result<BTreeMap<_, _>>>()?;
    Ok(ClientRegistration {
        client_id: row.try_get("client_id")?,
        user_id: row.try_get("user_id")?,
        descriptor: row.try_get("descriptor")?,
        registered_at: millis(row.try_get("registered_at")?)?,
        last_sync_at: opt_millis(row.try_get("last_sync_at")?)?,
        last_seen_at: millis(row.try_get("last_seen_at")?)?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        entity_checkpoints,
    })
}

fn subscription_from_row(row: &SqliteRow) -> Result<Subscription> {
    let entity_types: BTreeSet<String> = from_json(&row.try_get::<String, _>("entity_types")?)?;
    Ok(Subscription {
        client_id: row.try_get("client_id")?,
        user_id: row.try_get("user_id")?,
        entity_types,
        created_at: millis(row.try_get("created_at")?)?,
        updated_at: millis(row.try_get("updated_at")?)?,
    })
}

fn notification_from_row(row: &SqliteRow) -> Result<ChangeNotification> {
    Ok(ChangeNotification {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        user_id: row.try_get("user_id")?,
        change_id: row.try_get("change_id")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        operation: row.try_get::<String, _>("operation")?.parse()?,
        created_at: millis(row.try_get("created_at")?)?,
        delivered_at: opt_millis(row.try_get("delivered_at")?)?,
    })
}

/// `SyncStore` backed by a SQLite database file.
pub struct SqliteStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    ///
    /// `":memory:"` opens a private in-memory database on a single connection.
    pub async fn open(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing sync store");

        let in_memory = path_str == ":memory:";
        let (options, max_connections) = if in_memory {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| SyncError::Config(format!("Invalid SQLite path: {}", e)))?;
            (options, 1)
        } else {
            let mut options =
                SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
                    .map_err(|e| SyncError::Config(format!("Invalid SQLite path: {}", e)))?
                    .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                    .create_if_missing(true);
            if wal_mode {
                options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
            }
            (options, 4)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            path: path_str,
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("wal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await
        .map_err(|e| store_error("wal_checkpoint", e))?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Sync store closed");
    }

    async fn fetch_changes(
        &self,
        operation: &'static str,
        sql: &str,
        binds: &[Bind<'_>],
    ) -> Result<Vec<ChangeRecord>> {
        let pool = &self.pool;
        let rows = execute_with_retry(operation, || async {
            let mut q = sqlx::query(sql);
            for b in binds {
                q = b.apply(q);
            }
            q.fetch_all(pool).await
        })
        .await
        .map_err(|e| store_error(operation, e))?;
        rows.iter().map(change_from_row).collect()
    }

    async fn execute(
        &self,
        operation: &'static str,
        sql: &str,
        binds: &[Bind<'_>],
    ) -> Result<u64> {
        let pool = &self.pool;
        let result = execute_with_retry(operation, || async {
            let mut q = sqlx::query(sql);
            for b in binds {
                q = b.apply(q);
            }
            q.execute(pool).await
        })
        .await
        .map_err(|e| store_error(operation, e))?;
        Ok(result.rows_affected())
    }

    async fn fetch_optional(
        &self,
        operation: &'static str,
        sql: &str,
        binds: &[Bind<'_>],
    ) -> Result<Option<SqliteRow>> {
        let pool = &self.pool;
        execute_with_retry(operation, || async {
            let mut q = sqlx::query(sql);
            for b in binds {
                q = b.apply(q);
            }
            q.fetch_optional(pool).await
        })
        .await
        .map_err(|e| store_error(operation, e))
    }

    async fn fetch_all(
        &self,
        operation: &'static str,
        sql: &str,
        binds: &[Bind<'_>],
    ) -> Result<Vec<SqliteRow>> {
        let pool = &self.pool;
        execute_with_retry(operation, || async {
            let mut q = sqlx::query(sql);
            for b in binds {
                q = b.apply(q);
            }
            q.fetch_all(pool).await
        })
        .await
        .map_err(|e| store_error(operation, e))
    }
}

/// A positional bind value, so statements can be rebuilt on each retry.
#[derive(Debug, Clone, Copy)]
enum Bind<'a> {
    Text(&'a str),
    OptText(Option<&'a str>),
    Blob(&'a [u8]),
    OptBlob(Option<&'a [u8]>),
    Int(i64),
    OptInt(Option<i64>),
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

impl<'a> Bind<'a> {
    fn apply<'q>(self, q: SqliteQuery<'q>) -> SqliteQuery<'q>
    where
        'a: 'q,
    {
        match self {
            Bind::Text(v) => q.bind(v),
            Bind::OptText(v) => q.bind(v),
            Bind::Blob(v) => q.bind(v),
            Bind::OptBlob(v) => q.bind(v),
            Bind::Int(v) => q.bind(v),
            Bind::OptInt(v) => q.bind(v),
        }
    }
}

fn ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn opt_ms(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(|t| t.timestamp_millis())
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl SyncStore for SqliteStore {
    fn insert_change<'a>(&'a self, change: &'a ChangeRecord) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let sql = format!(
                "INSERT INTO change_records ({CHANGE_COLUMNS}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            );
            self.execute(
                "insert_change",
                &sql,
                &[
                    Bind::Text(&change.id),
                    Bind::Text(&change.entity_type),
                    Bind::Text(&change.entity_id),
                    Bind::Text(change.operation.as_str()),
                    Bind::Blob(&change.data),
                    Bind::Text(&change.content_hash),
                    Bind::OptText(change.client_id.as_deref()),
                    Bind::Text(&change.user_id),
                    Bind::Int(ms(change.changed_at)),
                    Bind::Int(ms(change.created_at)),
                    Bind::Int(ms(change.modified_at)),
                    Bind::Text(change.status.as_str()),
                    Bind::Int(i64::from(change.retry_count)),
                    Bind::OptInt(opt_ms(change.last_retry_at)),
                    Bind::OptInt(opt_ms(change.next_retry_at)),
                    Bind::OptText(change.error_message.as_deref()),
                ],
            )
            .await?;
            Ok(())
        })
    }

    fn update_change<'a>(&'a self, change: &'a ChangeRecord) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let updated = self
                .execute(
                    "update_change",
                    r#"
                    UPDATE change_records SET
                        operation = ?, data = ?, content_hash = ?, created_at = ?,
                        modified_at = ?, status = ?, retry_count = ?, last_retry_at = ?,
                        next_retry_at = ?, error_message = ?
                    WHERE id = ?
                    "#,
                    &[
                        Bind::Text(change.operation.as_str()),
                        Bind::Blob(&change.data),
                        Bind::Text(&change.content_hash),
                        Bind::Int(ms(change.created_at)),
                        Bind::Int(ms(change.modified_at)),
                        Bind::Text(change.status.as_str()),
                        Bind::Int(i64::from(change.retry_count)),
                        Bind::OptInt(opt_ms(change.last_retry_at)),
                        Bind::OptInt(opt_ms(change.next_retry_at)),
                        Bind::OptText(change.error_message.as_deref()),
                        Bind::Text(&change.id),
                    ],
                )
                .await?;
            if updated == 0 {
                return Err(SyncError::not_found("change record", &change.id));
            }
            Ok(())
        })
    }

    fn get_change<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<ChangeRecord>> {
        Box::pin(async move {
            let sql = format!("SELECT {CHANGE_COLUMNS} FROM change_records WHERE id = ?");
            self.fetch_optional("get_change", &sql, &[Bind::Text(id)])
                .await?
                .map(|row| change_from_row(&row))
                .transpose()
        })
    }

    fn latest_committed_change<'a>(
        &'a self,
        entity_type: &'a str,
        entity_id: &'a str,
    ) -> BoxFuture<'a, Option<ChangeRecord>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {CHANGE_COLUMNS} FROM change_records \
                 WHERE entity_type = ? AND entity_id = ? AND status = ? AND error_message IS NULL \
                 ORDER BY created_at DESC, id DESC LIMIT 1"
            );
            self.fetch_optional(
                "latest_committed_change",
                &sql,
                &[
                    Bind::Text(entity_type),
                    Bind::Text(entity_id),
                    Bind::Text(ChangeStatus::Completed.as_str()),
                ],
            )
            .await?
            .map(|row| change_from_row(&row))
            .transpose()
        })
    }

    fn completed_changes_since<'a>(
        &'a self,
        user_id: &'a str,
        exclude_client: &'a str,
        since: Option<DateTime<Utc>>,
        limit_n: usize,
    ) -> BoxFuture<'a, Vec<ChangeRecord>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {CHANGE_COLUMNS} FROM change_records \
                 WHERE user_id = ? AND status = ? AND error_message IS NULL \
                   AND (client_id IS NULL OR client_id != ?) \
                   AND (? IS NULL OR created_at >= ?) \
                 ORDER BY created_at ASC, id ASC LIMIT ?"
            );
            let since = opt_ms(since);
            self.fetch_changes(
                "completed_changes_since",
                &sql,
                &[
                    Bind::Text(user_id),
                    Bind::Text(ChangeStatus::Completed.as_str()),
                    Bind::Text(exclude_client),
                    Bind::OptInt(since),
                    Bind::OptInt(since),
                    Bind::Int(limit(limit_n)),
                ],
            )
            .await
        })
    }

    fn delta_changes<'a>(&'a self, query: &'a DeltaQuery) -> BoxFuture<'a, Vec<ChangeRecord>> {
        Box::pin(async move {
            let pool = &self.pool;
            let rows = execute_with_retry("delta_changes", || async {
                let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
                    "SELECT {CHANGE_COLUMNS} FROM change_records WHERE error_message IS NULL AND status = "
                ));
                qb.push_bind(ChangeStatus::Completed.as_str());
                qb.push(" AND entity_type = ");
                qb.push_bind(query.entity_type.as_str());
                if let Some(user_id) = &query.user_id {
                    qb.push(" AND user_id = ");
                    qb.push_bind(user_id.as_str());
                }
                if let Some(since) = query.since {
                    qb.push(" AND created_at >= ");
                    qb.push_bind(ms(since));
                }
                if let Some((at, id)) = &query.after {
                    qb.push(" AND (created_at > ");
                    qb.push_bind(ms(*at));
                    qb.push(" OR (created_at = ");
                    qb.push_bind(ms(*at));
                    qb.push(" AND id > ");
                    qb.push_bind(id.as_str());
                    qb.push("))");
                }
                if !query.entity_ids.is_empty() {
                    qb.push(" AND entity_id IN (");
                    let mut ids = qb.separated(", ");
                    for id in &query.entity_ids {
                        ids.push_bind(id.as_str());
                    }
                    ids.push_unseparated(")");
                }
                qb.push(" ORDER BY created_at ASC, id ASC LIMIT ");
                qb.push_bind(limit(query.limit));
                qb.build().fetch_all(pool).await
            })
            .await
            .map_err(|e| store_error("delta_changes", e))?;
            rows.iter().map(change_from_row).collect()
        })
    }

    fn due_changes<'a>(
        &'a self,
        now: DateTime<Utc>,
        limit_n: usize,
    ) -> BoxFuture<'a, Vec<ChangeRecord>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {CHANGE_COLUMNS} FROM change_records \
                 WHERE status = ? AND (next_retry_at IS NULL OR next_retry_at <= ?) \
                 ORDER BY created_at ASC, id ASC LIMIT ?"
            );
            self.fetch_changes(
                "due_changes",
                &sql,
                &[
                    Bind::Text(ChangeStatus::Pending.as_str()),
                    Bind::Int(ms(now)),
                    Bind::Int(limit(limit_n)),
                ],
            )
            .await
        })
    }

    fn failed_changes<'a>(
        &'a self,
        cooldown_cutoff: DateTime<Utc>,
        limit_n: usize,
    ) -> BoxFuture<'a, Vec<ChangeRecord>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {CHANGE_COLUMNS} FROM change_records \
                 WHERE status = ? AND modified_at <= ? \
                 ORDER BY created_at ASC, id ASC LIMIT ?"
            );
            self.fetch_changes(
                "failed_changes",
                &sql,
                &[
                    Bind::Text(ChangeStatus::Failed.as_str()),
                    Bind::Int(ms(cooldown_cutoff)),
                    Bind::Int(limit(limit_n)),
                ],
            )
            .await
        })
    }

    fn stale_in_progress<'a>(
        &'a self,
        cutoff: DateTime<Utc>,
        limit_n: usize,
    ) -> BoxFuture<'a, Vec<ChangeRecord>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {CHANGE_COLUMNS} FROM change_records \
                 WHERE status = ? AND modified_at <= ? \
                 ORDER BY created_at ASC, id ASC LIMIT ?"
            );
            self.fetch_changes(
                "stale_in_progress",
                &sql,
                &[
                    Bind::Text(ChangeStatus::InProgress.as_str()),
                    Bind::Int(ms(cutoff)),
                    Bind::Int(limit(limit_n)),
                ],
            )
            .await
        })
    }

    fn client_change_summary<'a>(
        &'a self,
        client_id: &'a str,
    ) -> BoxFuture<'a, ClientChangeSummary> {
        Box::pin(async move {
            let row = self
                .fetch_optional(
                    "client_change_summary",
                    r#"
                    SELECT
                        COALESCE(SUM(CASE WHEN status != 'completed' THEN 1 ELSE 0 END), 0) AS pending,
                        COALESCE(SUM(CASE WHEN status != 'completed' AND retry_count > 0 THEN 1 ELSE 0 END), 0) AS failed,
                        COALESCE(SUM(CASE WHEN status = 'completed' AND error_message IS NOT NULL THEN 1 ELSE 0 END), 0) AS dead_lettered,
                        MAX(CASE WHEN status = 'completed' AND error_message IS NULL THEN modified_at END) AS last_completed_at
                    FROM change_records
                    WHERE client_id = ?
                    "#,
                    &[Bind::Text(client_id)],
                )
                .await?;
            let Some(row) = row else {
                return Ok(ClientChangeSummary::default());
            };
            let count = |name: &str| -> Result<u64> {
                Ok(u64::try_from(row.try_get::<i64, _>(name)?).unwrap_or(0))
            };
            Ok(ClientChangeSummary {
                pending: count("pending")?,
                failed: count("failed")?,
                dead_lettered: count("dead_lettered")?,
                last_completed_at: opt_millis(row.try_get("last_completed_at")?)?,
            })
        })
    }

    fn purge_completed_before<'a>(
        &'a self,
        cutoff: DateTime<Utc>,
        limit_n: usize,
    ) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.execute(
                "purge_completed_before",
                r#"
                DELETE FROM change_records WHERE id IN (
                    SELECT id FROM change_records
                    WHERE status = ? AND modified_at < ?
                    ORDER BY modified_at ASC, id ASC LIMIT ?
                )
                "#,
                &[
                    Bind::Text(ChangeStatus::Completed.as_str()),
                    Bind::Int(ms(cutoff)),
                    Bind::Int(limit(limit_n)),
                ],
            )
            .await
        })
    }

    fn insert_conflict<'a>(&'a self, conflict: &'a Conflict) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let sql = format!(
                "INSERT INTO conflicts ({CONFLICT_COLUMNS}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            );
            let r = conflict.resolution.as_ref();
            self.execute(
                "insert_conflict",
                &sql,
                &[
                    Bind::Text(&conflict.id),
                    Bind::Text(&conflict.client_id),
                    Bind::Text(&conflict.user_id),
                    Bind::Text(&conflict.entity_type),
                    Bind::Text(&conflict.entity_id),
                    Bind::Text(conflict.client_operation.as_str()),
                    Bind::Blob(&conflict.client_data),
                    Bind::Text(conflict.server_operation.as_str()),
                    Bind::Blob(&conflict.server_data),
                    Bind::Int(ms(conflict.client_timestamp)),
                    Bind::Int(ms(conflict.server_timestamp)),
                    Bind::Text(&conflict.server_change_id),
                    Bind::Text(conflict.recommended_strategy.as_str()),
                    Bind::Text(&conflict.reason),
                    Bind::Int(ms(conflict.created_at)),
                    Bind::OptText(r.map(|r| r.strategy.as_str())),
                    Bind::OptBlob(r.map(|r| r.resolved_data.as_slice())),
                    Bind::OptText(r.map(|r| r.resolved_by.as_str())),
                    Bind::OptInt(r.map(|r| ms(r.resolved_at))),
                ],
            )
            .await?;
            Ok(())
        })
    }

    fn update_conflict<'a>(&'a self, conflict: &'a Conflict) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let r = conflict.resolution.as_ref();
            let updated = self
                .execute(
                    "update_conflict",
                    r#"
                    UPDATE conflicts SET
                        client_operation = ?, client_data = ?, server_operation = ?, server_data = ?,
                        client_timestamp = ?, server_timestamp = ?, server_change_id = ?,
                        recommended_strategy = ?, reason = ?,
                        resolution_strategy = ?, resolved_data = ?, resolved_by = ?, resolved_at = ?
                    WHERE id = ?
                    "#,
                    &[
                        Bind::Text(conflict.client_operation.as_str()),
                        Bind::Blob(&conflict.client_data),
                        Bind::Text(conflict.server_operation.as_str()),
                        Bind::Blob(&conflict.server_data),
                        Bind::Int(ms(conflict.client_timestamp)),
                        Bind::Int(ms(conflict.server_timestamp)),
                        Bind::Text(&conflict.server_change_id),
                        Bind::Text(conflict.recommended_strategy.as_str()),
                        Bind::Text(&conflict.reason),
                        Bind::OptText(r.map(|r| r.strategy.as_str())),
                        Bind::OptBlob(r.map(|r| r.resolved_data.as_slice())),
                        Bind::OptText(r.map(|r| r.resolved_by.as_str())),
                        Bind::OptInt(r.map(|r| ms(r.resolved_at))),
                        Bind::Text(&conflict.id),
                    ],
                )
                .await?;
            if updated == 0 {
                return Err(SyncError::not_found("conflict", &conflict.id));
            }
            Ok(())
        })
    }

    fn get_conflict<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<Conflict>> {
        Box::pin(async move {
            let sql = format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?");
            self.fetch_optional("get_conflict", &sql, &[Bind::Text(id)])
                .await?
                .map(|row| conflict_from_row(&row))
                .transpose()
        })
    }

    fn unresolved_conflicts<'a>(
        &'a self,
        user_id: &'a str,
        client_id: Option<&'a str>,
    ) -> BoxFuture<'a, Vec<Conflict>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {CONFLICT_COLUMNS} FROM conflicts \
                 WHERE user_id = ? AND resolved_at IS NULL AND (? IS NULL OR client_id = ?) \
                 ORDER BY created_at ASC, id ASC"
            );
            let rows = self
                .fetch_all(
                    "unresolved_conflicts",
                    &sql,
                    &[
                        Bind::Text(user_id),
                        Bind::OptText(client_id),
                        Bind::OptText(client_id),
                    ],
                )
                .await?;
            rows.iter().map(conflict_from_row).collect()
        })
    }

    fn unresolved_conflict_for<'a>(
        &'a self,
        client_id: &'a str,
        entity_type: &'a str,
        entity_id: &'a str,
    ) -> BoxFuture<'a, Option<Conflict>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {CONFLICT_COLUMNS} FROM conflicts \
                 WHERE client_id = ? AND entity_type = ? AND entity_id = ? AND resolved_at IS NULL \
                 ORDER BY created_at ASC LIMIT 1"
            );
            self.fetch_optional(
                "unresolved_conflict_for",
                &sql,
                &[
                    Bind::Text(client_id),
                    Bind::Text(entity_type),
                    Bind::Text(entity_id),
                ],
            )
            .await?
            .map(|row| conflict_from_row(&row))
            .transpose()
        })
    }

    fn purge_resolved_conflicts_before<'a>(
        &'a self,
        cutoff: DateTime<Utc>,
        limit_n: usize,
    ) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.execute(
                "purge_resolved_conflicts_before",
                r#"
                DELETE FROM conflicts WHERE id IN (
                    SELECT id FROM conflicts
                    WHERE resolved_at IS NOT NULL AND resolved_at < ?
                    ORDER BY resolved_at ASC, id ASC LIMIT ?
                )
                "#,
                &[Bind::Int(ms(cutoff)), Bind::Int(limit(limit_n))],
            )
            .await
        })
    }

    fn get_client<'a>(&'a self, client_id: &'a str) -> BoxFuture<'a, Option<ClientRegistration>> {
        Box::pin(async move {
            let sql = format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE client_id = ?");
            self.fetch_optional("get_client", &sql, &[Bind::Text(client_id)])
                .await?
                .map(|row| client_from_row(&row))
                .transpose()
        })
    }

    fn upsert_client<'a>(&'a self, client: &'a ClientRegistration) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let checkpoints: BTreeMap<&str, i64> = client
                .entity_checkpoints
                .iter()
                .map(|(k, v)| (k.as_str(), ms(*v)))
                .collect();
            let checkpoints = to_json(&checkpoints)?;
            let sql = format!(
                "INSERT INTO clients ({CLIENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(client_id) DO UPDATE SET \
                    user_id = excluded.user_id, \
                    descriptor = excluded.descriptor, \
                    last_sync_at = excluded.last_sync_at, \
                    last_seen_at = excluded.last_seen_at, \
                    is_active = excluded.is_active, \
                    entity_checkpoints = excluded.entity_checkpoints"
            );
            self.execute(
                "upsert_client",
                &sql,
                &[
                    Bind::Text(&client.client_id),
                    Bind::Text(&client.user_id),
                    Bind::Text(&client.descriptor),
                    Bind::Int(ms(client.registered_at)),
                    Bind::OptInt(opt_ms(client.last_sync_at)),
                    Bind::Int(ms(client.last_seen_at)),
                    Bind::Int(i64::from(client.is_active)),
                    Bind::Text(&checkpoints),
                ],
            )
            .await?;
            Ok(())
        })
    }

    fn clients_for_user<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Vec<ClientRegistration>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {CLIENT_COLUMNS} FROM clients WHERE user_id = ? ORDER BY client_id ASC"
            );
            let rows = self
                .fetch_all("clients_for_user", &sql, &[Bind::Text(user_id)])
                .await?;
            rows.iter().map(client_from_row).collect()
        })
    }

    fn get_configuration<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, Option<SyncConfiguration>> {
        Box::pin(async move {
            let row = self
                .fetch_optional(
                    "get_configuration",
                    "SELECT body FROM sync_configurations WHERE user_id = ?",
                    &[Bind::Text(user_id)],
                )
                .await?;
            match row {
                Some(row) => Ok(Some(from_json(&row.try_get::<String, _>("body")?)?)),
                None => Ok(None),
            }
        })
    }

    fn put_configuration<'a>(&'a self, config: &'a SyncConfiguration) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let body = to_json(config)?;
            self.execute(
                "put_configuration",
                r#"
                INSERT INTO sync_configurations (user_id, body, updated_at) VALUES (?, ?, ?)
                ON CONFLICT(user_id) DO UPDATE SET
                    body = excluded.body,
                    updated_at = excluded.updated_at
                "#,
                &[
                    Bind::Text(&config.user_id),
                    Bind::Text(&body),
                    Bind::Int(ms(config.updated_at)),
                ],
            )
            .await?;
            Ok(())
        })
    }

    fn get_subscription<'a>(&'a self, client_id: &'a str) -> BoxFuture<'a, Option<Subscription>> {
        Box::pin(async move {
            self.fetch_optional(
                "get_subscription",
                "SELECT client_id, user_id, entity_types, created_at, updated_at \
                 FROM subscriptions WHERE client_id = ?",
                &[Bind::Text(client_id)],
            )
            .await?
            .map(|row| subscription_from_row(&row))
            .transpose()
        })
    }

    fn put_subscription<'a>(&'a self, subscription: &'a Subscription) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let entity_types = to_json(&subscription.entity_types)?;
            self.execute(
                "put_subscription",
                r#"
                INSERT INTO subscriptions (client_id, user_id, entity_types, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(client_id) DO UPDATE SET
                    user_id = excluded.user_id,
                    entity_types = excluded.entity_types,
                    updated_at = excluded.updated_at
                "#,
                &[
                    Bind::Text(&subscription.client_id),
                    Bind::Text(&subscription.user_id),
                    Bind::Text(&entity_types),
                    Bind::Int(ms(subscription.created_at)),
                    Bind::Int(ms(subscription.updated_at)),
                ],
            )
            .await?;
            Ok(())
        })
    }

    fn delete_subscription<'a>(&'a self, client_id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let deleted = self
                .execute(
                    "delete_subscription",
                    "DELETE FROM subscriptions WHERE client_id = ?",
                    &[Bind::Text(client_id)],
                )
                .await?;
            Ok(deleted > 0)
        })
    }

    fn subscriptions_for_user<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Vec<Subscription>> {
        Box::pin(async move {
            let rows = self
                .fetch_all(
                    "subscriptions_for_user",
                    "SELECT client_id, user_id, entity_types, created_at, updated_at \
                     FROM subscriptions WHERE user_id = ? ORDER BY client_id ASC",
                    &[Bind::Text(user_id)],
                )
                .await?;
            rows.iter().map(subscription_from_row).collect()
        })
    }

    fn insert_notifications<'a>(
        &'a self,
        notifications: &'a [ChangeNotification],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if notifications.is_empty() {
                return Ok(());
            }
            let pool = &self.pool;
            let sql = format!(
                "INSERT INTO notifications ({NOTIFICATION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
            );
            let sql = sql.as_str();
            execute_with_retry("insert_notifications", || async {
                let mut tx = pool.begin().await?;
                for n in notifications {
                    sqlx::query(sql)
                        .bind(n.id.as_str())
                        .bind(n.client_id.as_str())
                        .bind(n.user_id.as_str())
                        .bind(n.change_id.as_str())
                        .bind(n.entity_type.as_str())
                        .bind(n.entity_id.as_str())
                        .bind(n.operation.as_str())
                        .bind(ms(n.created_at))
                        .bind(opt_ms(n.delivered_at))
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await
            })
            .await
            .map_err(|e| store_error("insert_notifications", e))
        })
    }

    fn undelivered_notifications<'a>(
        &'a self,
        client_id: &'a str,
        limit_n: usize,
    ) -> BoxFuture<'a, Vec<ChangeNotification>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
                 WHERE client_id = ? AND delivered_at IS NULL \
                 ORDER BY created_at ASC, id ASC LIMIT ?"
            );
            let rows = self
                .fetch_all(
                    "undelivered_notifications",
                    &sql,
                    &[Bind::Text(client_id), Bind::Int(limit(limit_n))],
                )
                .await?;
            rows.iter().map(notification_from_row).collect()
        })
    }

    fn mark_notifications_delivered<'a>(
        &'a self,
        client_id: &'a str,
        ids: &'a [String],
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(0);
            }
            let pool = &self.pool;
            let result = execute_with_retry("mark_notifications_delivered", || async {
                let mut qb: QueryBuilder<'_, Sqlite> =
                    QueryBuilder::new("UPDATE notifications SET delivered_at = ");
                qb.push_bind(ms(at));
                qb.push(" WHERE delivered_at IS NULL AND client_id = ");
                qb.push_bind(client_id);
                qb.push(" AND id IN (");
                let mut sep = qb.separated(", ");
                for id in ids {
                    sep.push_bind(id.as_str());
                }
                sep.push_unseparated(")");
                qb.build().execute(pool).await
            })
            .await
            .map_err(|e| store_error("mark_notifications_delivered", e))?;
            Ok(result.rows_affected())
        })
    }

    fn purge_delivered_notifications_before<'a>(
        &'a self,
        cutoff: DateTime<Utc>,
        limit_n: usize,
    ) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.execute(
                "purge_delivered_notifications_before",
                r#"
                DELETE FROM notifications WHERE id IN (
                    SELECT id FROM notifications
                    WHERE delivered_at IS NOT NULL AND delivered_at < ?
                    ORDER BY delivered_at ASC, id ASC LIMIT ?
                )
                "#,
                &[Bind::Int(ms(cutoff)), Bind::Int(limit(limit_n))],
            )
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Operation, ResolutionStrategy};
    use tempfile::tempdir;

    fn ts(ms: i64) -> DateTime<Utc> {
        from_millis(ms).unwrap()
    }

    fn change(entity_id: &str, client: Option<&str>, at_ms: i64) -> ChangeRecord {
        ChangeRecord::new(
            "task",
            entity_id,
            Operation::Update,
            entity_id.as_bytes().to_vec(),
            client.map(str::to_string),
            "user-1",
            ts(at_ms),
            ts(at_ms),
            ChangeStatus::Completed,
        )
    }

    #[tokio::test]
    async fn test_change_roundtrip_preserves_fields() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("changes.db"), true).await.unwrap();

        let mut c = change("t-1", None, 1_700_000_000_123);
        c.status = ChangeStatus::Failed;
        c.retry_count = 3;
        c.next_retry_at = Some(ts(1_700_000_060_000));
        c.error_message = Some("timeout".into());
        store.insert_change(&c).await.unwrap();

        let got = store.get_change(&c.id).await.unwrap().unwrap();
        assert_eq!(got, c);

        store.close().await;
    }

    #[tokio::test]
    async fn test_update_missing_change_is_not_found() {
        let store = SqliteStore::open(":memory:", false).await.unwrap();
        let err = store.update_change(&change("t-1", None, 1)).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delta_keyset_and_entity_filter() {
        let store = SqliteStore::open(":memory:", false).await.unwrap();
        let a = change("t-1", Some("a"), 100);
        let b = change("t-2", Some("a"), 100);
        let c = change("t-3", Some("b"), 200);
        for r in [&a, &b, &c] {
            store.insert_change(r).await.unwrap();
        }

        let mut q = DeltaQuery {
            entity_type: "task".into(),
            user_id: Some("user-1".into()),
            entity_ids: vec![],
            since: None,
            after: None,
            limit: 2,
        };
        let page1 = store.delta_changes(&q).await.unwrap();
        assert_eq!(page1.len(), 2);

        let last = page1.last().unwrap();
        q.after = Some((last.created_at, last.id.clone()));
        let page2 = store.delta_changes(&q).await.unwrap();
        assert_eq!(page2.len(), 1);
        assert_eq!(page2[0].id, c.id);

        q.after = None;
        q.entity_ids = vec!["t-2".into(), "t-3".into()];
        q.limit = 10;
        let filtered = store.delta_changes(&q).await.unwrap();
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|r| r.entity_id != "t-1"));
    }

    #[tokio::test]
    async fn test_completed_changes_since_excludes_client() {
        let store = SqliteStore::open(":memory:", false).await.unwrap();
        store.insert_change(&change("t-1", Some("a"), 10)).await.unwrap();
        store.insert_change(&change("t-2", Some("b"), 20)).await.unwrap();
        store.insert_change(&change("t-3", None, 30)).await.unwrap();

        let got = store.completed_changes_since("user-1", "a", None, 100).await.unwrap();
        let ids: Vec<_> = got.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["t-2", "t-3"]);

        let got = store
            .completed_changes_since("user-1", "a", Some(ts(21)), 100)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_roundtrip_and_resolution() {
        let store = SqliteStore::open(":memory:", false).await.unwrap();
        let mut conflict = Conflict {
            id: "cf-1".into(),
            client_id: "a".into(),
            user_id: "user-1".into(),
            entity_type: "task".into(),
            entity_id: "t-1".into(),
            client_operation: Operation::Update,
            client_data: b"mine".to_vec(),
            server_operation: Operation::Delete,
            server_data: b"theirs".to_vec(),
            client_timestamp: ts(10),
            server_timestamp: ts(20),
            server_change_id: "ch-1".into(),
            recommended_strategy: ResolutionStrategy::LastWriterWins,
            reason: "concurrent write".into(),
            created_at: ts(30),
            resolution: None,
        };
        store.insert_conflict(&conflict).await.unwrap();
        assert_eq!(store.unresolved_conflicts("user-1", Some("a")).await.unwrap().len(), 1);
        assert!(store
            .unresolved_conflict_for("a", "task", "t-1")
            .await
            .unwrap()
            .is_some());

        conflict.resolution = Some(ConflictResolution {
            strategy: ResolutionStrategy::ServerWins,
            resolved_data: b"theirs".to_vec(),
            resolved_by: "user-1".into(),
            resolved_at: ts(40),
        });
        store.update_conflict(&conflict).await.unwrap();

        assert_eq!(store.get_conflict("cf-1").await.unwrap().unwrap(), conflict);
        assert!(store.unresolved_conflicts("user-1", None).await.unwrap().is_empty());
        assert_eq!(store.purge_resolved_conflicts_before(ts(41), 10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_client_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("clients.db");

        let mut client = ClientRegistration::new("c-1", "user-1", "pixel", ts(5));
        client.last_sync_at = Some(ts(10));
        client.entity_checkpoints.insert("task".into(), ts(9));
        {
            let store = SqliteStore::open(&db_path, true).await.unwrap();
            store.upsert_client(&client).await.unwrap();
            store.close().await;
        }
        {
            let store = SqliteStore::open(&db_path, true).await.unwrap();
            assert_eq!(store.get_client("c-1").await.unwrap().unwrap(), client);
            assert_eq!(store.clients_for_user("user-1").await.unwrap().len(), 1);
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_summary_on_empty_client() {
        let store = SqliteStore::open(":memory:", false).await.unwrap();
        let s = store.client_change_summary("nobody").await.unwrap();
        assert_eq!(s, ClientChangeSummary::default());
    }

    #[tokio::test]
    async fn test_notifications_mark_and_purge() {
        let store = SqliteStore::open(":memory:", false).await.unwrap();
        let c = change("t-1", Some("a"), 10);
        let n1 = ChangeNotification::for_change("b", &c, ts(10));
        let n2 = ChangeNotification::for_change("b", &c, ts(11));
        store.insert_notifications(&[n1.clone(), n2.clone()]).await.unwrap();

        let marked = store
            .mark_notifications_delivered("b", &[n1.id.clone()], ts(20))
            .await
            .unwrap();
        assert_eq!(marked, 1);
        let left = store.undelivered_notifications("b", 10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, n2.id);

        assert_eq!(store.purge_delivered_notifications_before(ts(21), 10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_store_error_classification() {
        assert!(store_error("op", sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!store_error("op", sqlx::Error::RowNotFound).is_retryable());
    }
}
