// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL storage backend (SQLite or MySQL through the sqlx `Any` driver).
//!
//! Schema:
//! ```sql
//! CREATE TABLE crm_records (
//!   call_id VARCHAR(255) PRIMARY KEY,
//!   ...CRM fields...,
//!   call_datetime BIGINT NOT NULL,      -- epoch ms
//!   transcript_status VARCHAR(16),      -- missing|processing|available|error
//!   transcript_word_count BIGINT,       -- only when available
//!   transcript_preview TEXT,            -- only when available
//!   sync_status VARCHAR(16),            -- pending|synced|error (never stale)
//!   last_synced_at BIGINT,              -- epoch ms
//!   metadata LONGTEXT,                  -- JSON as text
//!   version BIGINT NOT NULL             -- optimistic concurrency
//! )
//! CREATE TABLE crm_sync_logs (id PRIMARY KEY, call_id, action, status, timestamp, ...)
//! CREATE TABLE agent_mappings (PRIMARY KEY (crm_agent_id, app_user_id), ...)
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! - Timestamps are stored as epoch milliseconds; `DateTime` round-trips
//!   lose sub-millisecond precision.
//! - MySQL TEXT columns come back as bytes, so text is read as `String`
//!   first and `Vec<u8>` second.
//! - JSON is stored as TEXT; the `Any` driver has no JSON type mapping.
//!
//! ## Commit
//!
//! `commit` runs in one transaction: a guarded `UPDATE ... WHERE version = ?`
//! (or an `INSERT` for new records) followed by the log `INSERT`. A zero
//! row count on the guarded update is a version conflict, and nothing is
//! written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyConnection, AnyPool, Row};
use std::sync::Once;
use std::time::Duration;

use super::traits::{MappingStore, RecordStore, StorageError};
use crate::mapping::AgentMapping;
use crate::query::sql_translator::{translate, SqlParam};
use crate::query::{PageRequest, RecordQuery};
use crate::record::{CrmRecord, SyncLogEntry, SyncStatus, TranscriptState};
use crate::resilience::retry::{retry, retry_if, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const RECORD_COLUMNS: [&str; 28] = [
    "call_id",
    "crm_user_id",
    "agent_id",
    "agent_name",
    "campaign_id",
    "campaign_name",
    "queue_name",
    "call_datetime",
    "call_duration_seconds",
    "recording_url",
    "recording_ref",
    "recording_duration_seconds",
    "transcript_status",
    "transcript_word_count",
    "transcript_preview",
    "transcript_url",
    "transcript_last_updated",
    "sync_status",
    "sync_error",
    "last_synced_at",
    "app_user_id",
    "team_id",
    "audit_id",
    "audit_status",
    "metadata",
    "version",
    "created_at",
    "updated_at",
];

const LOG_COLUMNS: &str = "id, call_id, action, status, timestamp, duration_ms, result, error_message";
const MAPPING_COLUMNS: &str = "crm_agent_id, app_user_id, agent_name, team_id, is_active, updated_at";

/// A nullable bind value.
enum Bind {
    Text(Option<String>),
    Int(Option<i64>),
}

type AnyQuery<'q> = sqlx::query::Query<'q, Any, sqlx::any::AnyArguments<'q>>;

fn bind_all<'q>(mut query: AnyQuery<'q>, values: Vec<Bind>) -> AnyQuery<'q> {
    for value in values {
        query = match value {
            Bind::Text(v) => query.bind(v),
            Bind::Int(v) => query.bind(v),
        };
    }
    query
}

fn bind_params<'q>(mut query: AnyQuery<'q>, params: &[SqlParam]) -> AnyQuery<'q> {
    for param in params {
        query = match param {
            SqlParam::Text(s) => query.bind(s.clone()),
            SqlParam::Int(i) => query.bind(*i),
        };
    }
    query
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn is_transient(e: &StorageError) -> bool {
    matches!(e, StorageError::Backend(_))
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Connect and create the schema, with startup-mode retry (fails fast if
    /// the config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");
        // Every connection to an in-memory SQLite database gets its own
        // database, so the pool must hold exactly one.
        let in_memory = is_sqlite && connection_string.contains(":memory:");
        let max_connections = if in_memory { 1 } else { 20 };

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(if in_memory { None } else { Some(Duration::from_secs(300)) })
                .max_lifetime(if in_memory { None } else { Some(Duration::from_secs(1800)) })
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self { pool, is_sqlite };
        if is_sqlite && !in_memory {
            store.enable_wal_mode().await?;
        }
        store.init_schema().await?;
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS crm_records (
                    call_id TEXT PRIMARY KEY,
                    crm_user_id TEXT NOT NULL,
                    agent_id TEXT NOT NULL,
                    agent_name TEXT,
                    campaign_id TEXT,
                    campaign_name TEXT,
                    queue_name TEXT,
                    call_datetime INTEGER NOT NULL,
                    call_duration_seconds INTEGER NOT NULL DEFAULT 0,
                    recording_url TEXT,
                    recording_ref TEXT,
                    recording_duration_seconds INTEGER,
                    transcript_status TEXT NOT NULL DEFAULT 'missing',
                    transcript_word_count INTEGER,
                    transcript_preview TEXT,
                    transcript_url TEXT,
                    transcript_last_updated INTEGER,
                    sync_status TEXT NOT NULL DEFAULT 'pending',
                    sync_error TEXT,
                    last_synced_at INTEGER,
                    app_user_id TEXT,
                    team_id TEXT,
                    audit_id TEXT,
                    audit_status TEXT,
                    metadata TEXT,
                    version INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_records_datetime ON crm_records (call_datetime)",
                "CREATE INDEX IF NOT EXISTS idx_records_status ON crm_records (sync_status)",
                "CREATE INDEX IF NOT EXISTS idx_records_agent ON crm_records (agent_id)",
                r#"
                CREATE TABLE IF NOT EXISTS crm_sync_logs (
                    id TEXT PRIMARY KEY,
                    call_id TEXT NOT NULL,
                    action TEXT NOT NULL,
                    status TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    duration_ms INTEGER NOT NULL,
                    result TEXT,
                    error_message TEXT
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_logs_call ON crm_sync_logs (call_id, timestamp)",
                "CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON crm_sync_logs (timestamp)",
                r#"
                CREATE TABLE IF NOT EXISTS agent_mappings (
                    crm_agent_id TEXT NOT NULL,
                    app_user_id TEXT NOT NULL,
                    agent_name TEXT,
                    team_id TEXT,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (crm_agent_id, app_user_id)
                )
                "#,
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS crm_records (
                    call_id VARCHAR(255) PRIMARY KEY,
                    crm_user_id VARCHAR(255) NOT NULL,
                    agent_id VARCHAR(255) NOT NULL,
                    agent_name VARCHAR(255),
                    campaign_id VARCHAR(255),
                    campaign_name VARCHAR(255),
                    queue_name VARCHAR(255),
                    call_datetime BIGINT NOT NULL,
                    call_duration_seconds BIGINT NOT NULL DEFAULT 0,
                    recording_url TEXT,
                    recording_ref TEXT,
                    recording_duration_seconds BIGINT,
                    transcript_status VARCHAR(16) NOT NULL DEFAULT 'missing',
                    transcript_word_count BIGINT,
                    transcript_preview TEXT,
                    transcript_url TEXT,
                    transcript_last_updated BIGINT,
                    sync_status VARCHAR(16) NOT NULL DEFAULT 'pending',
                    sync_error TEXT,
                    last_synced_at BIGINT,
                    app_user_id VARCHAR(255),
                    team_id VARCHAR(255),
                    audit_id VARCHAR(255),
                    audit_status VARCHAR(32),
                    metadata LONGTEXT,
                    version BIGINT NOT NULL DEFAULT 0,
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    INDEX idx_records_datetime (call_datetime),
                    INDEX idx_records_status (sync_status),
                    INDEX idx_records_agent (agent_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS crm_sync_logs (
                    id VARCHAR(64) PRIMARY KEY,
                    call_id VARCHAR(255) NOT NULL,
                    action VARCHAR(16) NOT NULL,
                    status VARCHAR(16) NOT NULL,
                    timestamp BIGINT NOT NULL,
                    duration_ms BIGINT NOT NULL,
                    result TEXT,
                    error_message TEXT,
                    INDEX idx_logs_call (call_id, timestamp),
                    INDEX idx_logs_timestamp (timestamp)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS agent_mappings (
                    crm_agent_id VARCHAR(255) NOT NULL,
                    app_user_id VARCHAR(255) NOT NULL,
                    agent_name VARCHAR(255),
                    team_id VARCHAR(255),
                    is_active BIGINT NOT NULL DEFAULT 1,
                    updated_at BIGINT NOT NULL,
                    PRIMARY KEY (crm_agent_id, app_user_id),
                    INDEX idx_mappings_team (team_id, is_active)
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }

    fn upsert_sql(&self) -> String {
        let columns = RECORD_COLUMNS.join(", ");
        let placeholders = vec!["?"; RECORD_COLUMNS.len()].join(", ");
        let updates: Vec<String> = RECORD_COLUMNS[1..]
            .iter()
            .map(|c| {
                if self.is_sqlite {
                    format!("{c} = excluded.{c}")
                } else {
                    format!("{c} = VALUES({c})")
                }
            })
            .collect();
        if self.is_sqlite {
            format!(
                "INSERT INTO crm_records ({columns}) VALUES ({placeholders}) ON CONFLICT(call_id) DO UPDATE SET {}",
                updates.join(", ")
            )
        } else {
            format!(
                "INSERT INTO crm_records ({columns}) VALUES ({placeholders}) ON DUPLICATE KEY UPDATE {}",
                updates.join(", ")
            )
        }
    }

    fn insert_sql() -> String {
        format!(
            "INSERT INTO crm_records ({}) VALUES ({})",
            RECORD_COLUMNS.join(", "),
            vec!["?"; RECORD_COLUMNS.len()].join(", ")
        )
    }

    fn guarded_update_sql() -> String {
        let sets: Vec<String> = RECORD_COLUMNS[1..].iter().map(|c| format!("{c} = ?")).collect();
        format!("UPDATE crm_records SET {} WHERE call_id = ? AND version = ?", sets.join(", "))
    }

    fn select_records_sql(clause: &str) -> String {
        format!("SELECT {} FROM crm_records WHERE {}", RECORD_COLUMNS.join(", "), clause)
    }

    async fn current_version(conn: &mut AnyConnection, call_id: &str) -> Result<Option<u64>, StorageError> {
        let row = sqlx::query("SELECT version FROM crm_records WHERE call_id = ?")
            .bind(call_id.to_string())
            .fetch_optional(conn)
            .await
            .map_err(backend)?;
        row.and_then(|r| int(&r, "version"))
            .map(|v| unsigned(v, "version"))
            .transpose()
    }
}

fn record_values(r: &CrmRecord) -> Result<Vec<Bind>, StorageError> {
    let metadata = match r.metadata {
        Some(ref value) => Some(
            serde_json::to_string(value).map_err(|e| StorageError::Backend(format!("metadata: {e}")))?,
        ),
        None => None,
    };
    Ok(vec![
        Bind::Text(Some(r.call_id.clone())),
        Bind::Text(Some(r.crm_user_id.clone())),
        Bind::Text(Some(r.agent_id.clone())),
        Bind::Text(r.agent_name.clone()),
        Bind::Text(r.campaign_id.clone()),
        Bind::Text(r.campaign_name.clone()),
        Bind::Text(r.queue_name.clone()),
        Bind::Int(Some(r.call_datetime.timestamp_millis())),
        Bind::Int(Some(i64::from(r.call_duration_seconds))),
        Bind::Text(r.recording_url.clone()),
        Bind::Text(r.recording_ref.clone()),
        Bind::Int(r.recording_duration_seconds.map(i64::from)),
        Bind::Text(Some(r.transcript.status().as_str().to_string())),
        Bind::Int(r.transcript.word_count().map(i64::from)),
        Bind::Text(r.transcript.preview().map(String::from)),
        Bind::Text(r.transcript_url.clone()),
        Bind::Int(r.transcript_last_updated.map(|t| t.timestamp_millis())),
        Bind::Text(Some(r.sync_status.as_str().to_string())),
        Bind::Text(r.sync_error.clone()),
        Bind::Int(r.last_synced_at.map(|t| t.timestamp_millis())),
        Bind::Text(r.app_user_id.clone()),
        Bind::Text(r.team_id.clone()),
        Bind::Text(r.audit_id.clone()),
        Bind::Text(r.audit_status.clone()),
        Bind::Text(metadata),
        Bind::Int(Some(r.version as i64)),
        Bind::Int(Some(r.created_at.timestamp_millis())),
        Bind::Int(Some(r.updated_at.timestamp_millis())),
    ])
}

fn log_values(e: &SyncLogEntry) -> Vec<Bind> {
    vec![
        Bind::Text(Some(e.id.clone())),
        Bind::Text(Some(e.call_id.clone())),
        Bind::Text(Some(e.action.as_str().to_string())),
        Bind::Text(Some(e.status.as_str().to_string())),
        Bind::Int(Some(e.timestamp.timestamp_millis())),
        Bind::Int(Some(e.duration_ms as i64)),
        Bind::Text(e.result.clone()),
        Bind::Text(e.error_message.clone()),
    ]
}

// Try reading as String first (SQLite TEXT), then as bytes (MySQL TEXT)
fn text(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn required_text(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    text(row, column).ok_or_else(|| StorageError::Backend(format!("column {column} is null or unreadable")))
}

fn int(row: &AnyRow, column: &str) -> Option<i64> {
    row.try_get::<i64, _>(column)
        .ok()
        .or_else(|| row.try_get::<i32, _>(column).ok().map(i64::from))
}

/// Narrow a stored integer, rejecting values the column type cannot hold.
fn unsigned<T: TryFrom<i64>>(value: i64, column: &str) -> Result<T, StorageError> {
    T::try_from(value).map_err(|_| StorageError::Integrity(format!("column {column} holds out-of-range value {value}")))
}

fn millis(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StorageError::Backend(format!("timestamp {ms} out of range")))
}

fn parsed<T: std::str::FromStr>(row: &AnyRow, column: &str) -> Result<T, StorageError>
where
    T::Err: std::fmt::Display,
{
    required_text(row, column)?
        .parse()
        .map_err(|e: T::Err| StorageError::Integrity(e.to_string()))
}

fn row_to_record(row: &AnyRow) -> Result<CrmRecord, StorageError> {
    let transcript = TranscriptState::from_parts(
        parsed(row, "transcript_status")?,
        int(row, "transcript_word_count")
            .map(|w| unsigned(w, "transcript_word_count"))
            .transpose()?,
        text(row, "transcript_preview"),
    )
    .map_err(|e| StorageError::Integrity(e.to_string()))?;

    let metadata = match text(row, "metadata") {
        Some(raw) => Some(
            serde_json::from_str(&raw).map_err(|e| StorageError::Integrity(format!("metadata: {e}")))?,
        ),
        None => None,
    };

    Ok(CrmRecord {
        call_id: required_text(row, "call_id")?,
        crm_user_id: required_text(row, "crm_user_id")?,
        agent_id: required_text(row, "agent_id")?,
        agent_name: text(row, "agent_name"),
        campaign_id: text(row, "campaign_id"),
        campaign_name: text(row, "campaign_name"),
        queue_name: text(row, "queue_name"),
        call_datetime: millis(int(row, "call_datetime").unwrap_or(0))?,
        call_duration_seconds: unsigned(int(row, "call_duration_seconds").unwrap_or(0), "call_duration_seconds")?,
        recording_url: text(row, "recording_url"),
        recording_ref: text(row, "recording_ref"),
        recording_duration_seconds: int(row, "recording_duration_seconds")
            .map(|d| unsigned(d, "recording_duration_seconds"))
            .transpose()?,
        transcript,
        transcript_url: text(row, "transcript_url"),
        transcript_last_updated: int(row, "transcript_last_updated").map(millis).transpose()?,
        sync_status: parsed(row, "sync_status")?,
        sync_error: text(row, "sync_error"),
        last_synced_at: int(row, "last_synced_at").map(millis).transpose()?,
        app_user_id: text(row, "app_user_id"),
        team_id: text(row, "team_id"),
        audit_id: text(row, "audit_id"),
        audit_status: text(row, "audit_status"),
        metadata,
        version: unsigned(int(row, "version").unwrap_or(0), "version")?,
        created_at: millis(int(row, "created_at").unwrap_or(0))?,
        updated_at: millis(int(row, "updated_at").unwrap_or(0))?,
    })
}

fn row_to_log(row: &AnyRow) -> Result<SyncLogEntry, StorageError> {
    Ok(SyncLogEntry {
        id: required_text(row, "id")?,
        call_id: required_text(row, "call_id")?,
        action: parsed(row, "action")?,
        status: parsed(row, "status")?,
        timestamp: millis(int(row, "timestamp").unwrap_or(0))?,
        duration_ms: unsigned(int(row, "duration_ms").unwrap_or(0), "duration_ms")?,
        result: text(row, "result"),
        error_message: text(row, "error_message"),
    })
}

fn row_to_mapping(row: &AnyRow) -> Result<AgentMapping, StorageError> {
    Ok(AgentMapping {
        crm_agent_id: required_text(row, "crm_agent_id")?,
        app_user_id: required_text(row, "app_user_id")?,
        agent_name: text(row, "agent_name"),
        team_id: text(row, "team_id"),
        is_active: int(row, "is_active").unwrap_or(0) != 0,
        updated_at: millis(int(row, "updated_at").unwrap_or(0))?,
    })
}

#[async_trait]
impl RecordStore for SqlStore {
    async fn get(&self, call_id: &str) -> Result<Option<CrmRecord>, StorageError> {
        let sql = Self::select_records_sql("call_id = ?");
        let row = retry("sql_get", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(call_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn query(
        &self,
        query: &RecordQuery,
        page: PageRequest,
    ) -> Result<(Vec<CrmRecord>, u64), StorageError> {
        let filter = translate(query);
        let count_sql = format!("SELECT COUNT(*) AS cnt FROM crm_records WHERE {}", filter.clause);
        let page_sql = format!(
            "{} ORDER BY call_datetime DESC, call_id ASC LIMIT ? OFFSET ?",
            Self::select_records_sql(&filter.clause)
        );

        let total = retry("sql_count", &RetryConfig::query(), || async {
            let row = bind_params(sqlx::query(&count_sql), &filter.params)
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;
            Ok::<_, StorageError>(int(&row, "cnt").unwrap_or(0).max(0) as u64)
        })
        .await?;

        let rows = retry("sql_query", &RetryConfig::query(), || async {
            bind_params(sqlx::query(&page_sql), &filter.params)
                .bind(i64::from(page.page_size))
                .bind(page.offset() as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        let records = rows.iter().map(row_to_record).collect::<Result<Vec<_>, _>>()?;
        Ok((records, total))
    }

    async fn upsert(&self, record: &CrmRecord) -> Result<(), StorageError> {
        record
            .check_integrity()
            .map_err(|e| StorageError::Integrity(e.to_string()))?;
        let sql = self.upsert_sql();
        retry("sql_upsert", &RetryConfig::query(), || async {
            bind_all(sqlx::query(&sql), record_values(record)?)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn append_log(&self, entry: &SyncLogEntry) -> Result<(), StorageError> {
        let sql = format!("INSERT INTO crm_sync_logs ({LOG_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)");
        retry_if(
            "sql_append_log",
            &RetryConfig::query(),
            || async {
                let mut tx = self.pool.begin().await.map_err(backend)?;
                if Self::current_version(&mut *tx, &entry.call_id).await?.is_none() {
                    return Err(StorageError::NotFound(entry.call_id.clone()));
                }
                bind_all(sqlx::query(&sql), log_values(entry))
                    .execute(&mut *tx)
                    .await
                    .map_err(backend)?;
                tx.commit().await.map_err(backend)
            },
            is_transient,
        )
        .await
    }

    async fn commit(
        &self,
        record: &CrmRecord,
        entry: &SyncLogEntry,
        expected_version: Option<u64>,
    ) -> Result<(), StorageError> {
        record
            .check_integrity()
            .map_err(|e| StorageError::Integrity(e.to_string()))?;
        if entry.call_id != record.call_id {
            return Err(StorageError::Integrity(format!(
                "log entry for '{}' committed with record '{}'",
                entry.call_id, record.call_id
            )));
        }

        let log_sql = format!("INSERT INTO crm_sync_logs ({LOG_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)");
        let insert_sql = Self::insert_sql();
        let update_sql = Self::guarded_update_sql();

        retry_if(
            "sql_commit",
            &RetryConfig::query(),
            || async {
                let mut tx = self.pool.begin().await.map_err(backend)?;
                let current = Self::current_version(&mut *tx, &record.call_id).await?;

                match (current, expected_version) {
                    (None, None) => {
                        bind_all(sqlx::query(&insert_sql), record_values(record)?)
                            .execute(&mut *tx)
                            .await
                            .map_err(backend)?;
                    }
                    (None, Some(_)) => return Err(StorageError::NotFound(record.call_id.clone())),
                    (Some(actual), None) => {
                        return Err(StorageError::VersionConflict {
                            call_id: record.call_id.clone(),
                            expected: 0,
                            actual,
                        })
                    }
                    (Some(_), Some(expected)) => {
                        let mut values = record_values(record)?;
                        values.remove(0);
                        values.push(Bind::Text(Some(record.call_id.clone())));
                        values.push(Bind::Int(Some(expected as i64)));
                        let result = bind_all(sqlx::query(&update_sql), values)
                            .execute(&mut *tx)
                            .await
                            .map_err(backend)?;
                        if result.rows_affected() == 0 {
                            let actual = Self::current_version(&mut *tx, &record.call_id)
                                .await?
                                .unwrap_or_default();
                            return Err(StorageError::VersionConflict {
                                call_id: record.call_id.clone(),
                                expected,
                                actual,
                            });
                        }
                    }
                }

                bind_all(sqlx::query(&log_sql), log_values(entry))
                    .execute(&mut *tx)
                    .await
                    .map_err(backend)?;
                tx.commit().await.map_err(backend)
            },
            is_transient,
        )
        .await
    }

    async fn recent_logs(&self, call_id: &str, limit: usize) -> Result<Vec<SyncLogEntry>, StorageError> {
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM crm_sync_logs WHERE call_id = ? ORDER BY timestamp DESC, id DESC LIMIT ?"
        );
        let rows = retry("sql_recent_logs", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(call_id.to_string())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;
        rows.iter().map(row_to_log).collect()
    }

    async fn scan(&self, query: &RecordQuery) -> Result<Vec<CrmRecord>, StorageError> {
        let filter = translate(query);
        let sql = Self::select_records_sql(&filter.clause);
        let rows = retry("sql_scan", &RetryConfig::query(), || async {
            bind_params(sqlx::query(&sql), &filter.params)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn ids_with_status(&self, status: SyncStatus) -> Result<Vec<String>, StorageError> {
        let rows = retry("sql_ids_with_status", &RetryConfig::query(), || async {
            sqlx::query("SELECT call_id FROM crm_records WHERE sync_status = ? ORDER BY call_id")
                .bind(status.as_str().to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;
        rows.iter().map(|row| required_text(row, "call_id")).collect()
    }

    async fn logs_since(&self, since: DateTime<Utc>) -> Result<Vec<SyncLogEntry>, StorageError> {
        let sql = format!("SELECT {LOG_COLUMNS} FROM crm_sync_logs WHERE timestamp >= ?");
        let rows = retry("sql_logs_since", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(since.timestamp_millis())
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;
        rows.iter().map(row_to_log).collect()
    }

    async fn latest_successes(&self) -> Result<Vec<SyncLogEntry>, StorageError> {
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM crm_sync_logs WHERE status = 'success' AND action IN ('pull', 'resync', 'retry') ORDER BY call_id, timestamp DESC, id DESC"
        );
        let rows = retry("sql_latest_successes", &RetryConfig::query(), || async {
            sqlx::query(&sql).fetch_all(&self.pool).await.map_err(backend)
        })
        .await?;

        let mut latest: Vec<SyncLogEntry> = Vec::new();
        for row in &rows {
            let entry = row_to_log(row)?;
            if latest.last().map_or(true, |prev| prev.call_id != entry.call_id) {
                latest.push(entry);
            }
        }
        Ok(latest)
    }
}

#[async_trait]
impl MappingStore for SqlStore {
    async fn active_for(&self, crm_agent_id: &str) -> Result<Option<AgentMapping>, StorageError> {
        let sql = format!("SELECT {MAPPING_COLUMNS} FROM agent_mappings WHERE crm_agent_id = ? AND is_active = 1 LIMIT 1");
        let row = retry("sql_mapping_active", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(crm_agent_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;
        row.as_ref().map(row_to_mapping).transpose()
    }

    async fn put(&self, mapping: &AgentMapping) -> Result<(), StorageError> {
        if mapping.crm_agent_id.trim().is_empty() || mapping.app_user_id.trim().is_empty() {
            return Err(StorageError::Integrity("mapping needs crm_agent_id and app_user_id".into()));
        }
        let insert_sql = format!("INSERT INTO agent_mappings ({MAPPING_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)");
        retry_if(
            "sql_mapping_put",
            &RetryConfig::query(),
            || async {
                let mut tx = self.pool.begin().await.map_err(backend)?;
                if mapping.is_active {
                    sqlx::query("UPDATE agent_mappings SET is_active = 0 WHERE crm_agent_id = ?")
                        .bind(mapping.crm_agent_id.clone())
                        .execute(&mut *tx)
                        .await
                        .map_err(backend)?;
                }
                sqlx::query("DELETE FROM agent_mappings WHERE crm_agent_id = ? AND app_user_id = ?")
                    .bind(mapping.crm_agent_id.clone())
                    .bind(mapping.app_user_id.clone())
                    .execute(&mut *tx)
                    .await
                    .map_err(backend)?;
                bind_all(
                    sqlx::query(&insert_sql),
                    vec![
                        Bind::Text(Some(mapping.crm_agent_id.clone())),
                        Bind::Text(Some(mapping.app_user_id.clone())),
                        Bind::Text(mapping.agent_name.clone()),
                        Bind::Text(mapping.team_id.clone()),
                        Bind::Int(Some(i64::from(mapping.is_active))),
                        Bind::Int(Some(mapping.updated_at.timestamp_millis())),
                    ],
                )
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
                tx.commit().await.map_err(backend)
            },
            is_transient,
        )
        .await
    }

    async fn active_agents_in_team(&self, team_id: &str) -> Result<Vec<String>, StorageError> {
        let rows = retry("sql_mapping_team", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT DISTINCT crm_agent_id FROM agent_mappings WHERE team_id = ? AND is_active = 1 ORDER BY crm_agent_id",
            )
            .bind(team_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)
        })
        .await?;
        rows.iter().map(|row| required_text(row, "crm_agent_id")).collect()
    }

    async fn history(&self, crm_agent_id: &str) -> Result<Vec<AgentMapping>, StorageError> {
        let sql = format!("SELECT {MAPPING_COLUMNS} FROM agent_mappings WHERE crm_agent_id = ? ORDER BY updated_at");
        let rows = retry("sql_mapping_history", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(crm_agent_id.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;
        rows.iter().map(row_to_mapping).collect()
    }
}
