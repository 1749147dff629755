// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::mapping::AgentMapping;
use crate::query::{PageRequest, RecordQuery};
use crate::record::{CrmRecord, SyncLogEntry, SyncStatus};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("no record for call_id '{0}'")]
    NotFound(String),
    #[error("version conflict on '{call_id}': expected {expected}, found {actual}")]
    VersionConflict {
        call_id: String,
        expected: u64,
        actual: u64,
    },
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Durable home of call records and their sync logs.
///
/// The store owns every [`CrmRecord`] and [`SyncLogEntry`]. Implementations
/// must hand out whole records: a reader racing a writer sees either the old
/// or the new version of a record, never a mixture of fields.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, call_id: &str) -> Result<Option<CrmRecord>, StorageError>;

    /// Filter, order by `call_datetime` descending, then paginate.
    ///
    /// The query (visibility included) is applied before pagination, so the
    /// returned total counts every matching record.
    async fn query(
        &self,
        query: &RecordQuery,
        page: PageRequest,
    ) -> Result<(Vec<CrmRecord>, u64), StorageError>;

    /// Insert or overwrite a record as-is. Bumps nothing; used for seeding
    /// and migrations. Sync paths go through [`RecordStore::commit`].
    async fn upsert(&self, record: &CrmRecord) -> Result<(), StorageError>;

    /// Append to an existing record's log. Fails `NotFound` for unknown ids.
    async fn append_log(&self, entry: &SyncLogEntry) -> Result<(), StorageError>;

    /// Write `record` and append `entry` as one unit.
    ///
    /// `expected_version` is the version the writer read; `None` means the
    /// record must not exist yet. On success the stored version is
    /// `record.version` (callers bump it).
    async fn commit(
        &self,
        record: &CrmRecord,
        entry: &SyncLogEntry,
        expected_version: Option<u64>,
    ) -> Result<(), StorageError>;

    /// Most recent entries first.
    async fn recent_logs(&self, call_id: &str, limit: usize) -> Result<Vec<SyncLogEntry>, StorageError>;

    /// Point-in-time copy of every record matching `query`, unordered.
    async fn scan(&self, query: &RecordQuery) -> Result<Vec<CrmRecord>, StorageError>;

    /// Ids of records with the given stored status.
    async fn ids_with_status(&self, status: SyncStatus) -> Result<Vec<String>, StorageError>;

    /// Every log entry stamped at or after `since`.
    async fn logs_since(&self, since: DateTime<Utc>) -> Result<Vec<SyncLogEntry>, StorageError>;

    /// The most recent successful sync attempt (pull, resync or retry) of
    /// each record that has one. Save entries are not attempts.
    async fn latest_successes(&self) -> Result<Vec<SyncLogEntry>, StorageError>;
}

/// Storage of CRM agent → internal user mappings.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// The single active mapping for a CRM agent, if any.
    async fn active_for(&self, crm_agent_id: &str) -> Result<Option<AgentMapping>, StorageError>;

    /// Store a mapping. An active mapping deactivates every other mapping of
    /// the same `crm_agent_id`; a mapping with the same
    /// `(crm_agent_id, app_user_id)` pair is replaced.
    async fn put(&self, mapping: &AgentMapping) -> Result<(), StorageError>;

    /// CRM agent ids with an active mapping into `team_id`.
    async fn active_agents_in_team(&self, team_id: &str) -> Result<Vec<String>, StorageError>;

    /// All mappings (active or not) of a CRM agent, oldest first.
    async fn history(&self, crm_agent_id: &str) -> Result<Vec<AgentMapping>, StorageError>;
}
