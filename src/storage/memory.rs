// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process stores backed by `DashMap`.
//!
//! Records and their logs share one shard lock per call id: `commit` holds
//! the record's entry while appending the log, so readers never observe a
//! record without the log entry that produced it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::traits::{MappingStore, RecordStore, StorageError};
use crate::mapping::AgentMapping;
use crate::query::{recent_first, PageRequest, RecordQuery};
use crate::record::{newest_first, CrmRecord, SyncLogEntry, SyncStatus};

struct Slot {
    record: CrmRecord,
    logs: Vec<SyncLogEntry>,
}

pub struct InMemoryRecordStore {
    data: DashMap<String, Slot>,
}

impl InMemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self { data: DashMap::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, call_id: &str) -> Result<Option<CrmRecord>, StorageError> {
        Ok(self.data.get(call_id).map(|slot| slot.record.clone()))
    }

    async fn query(
        &self,
        query: &RecordQuery,
        page: PageRequest,
    ) -> Result<(Vec<CrmRecord>, u64), StorageError> {
        let mut matching = self.scan(query).await?;
        matching.sort_by(recent_first);
        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
            .take(page.page_size as usize)
            .collect();
        Ok((items, total))
    }

    async fn upsert(&self, record: &CrmRecord) -> Result<(), StorageError> {
        record
            .check_integrity()
            .map_err(|e| StorageError::Integrity(e.to_string()))?;
        self.data
            .entry(record.call_id.clone())
            .and_modify(|slot| slot.record = record.clone())
            .or_insert_with(|| Slot { record: record.clone(), logs: Vec::new() });
        Ok(())
    }

    async fn append_log(&self, entry: &SyncLogEntry) -> Result<(), StorageError> {
        let mut slot = self
            .data
            .get_mut(&entry.call_id)
            .ok_or_else(|| StorageError::NotFound(entry.call_id.clone()))?;
        slot.logs.push(entry.clone());
        Ok(())
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

        match (self.data.entry(record.call_id.clone()), expected_version) {
            (dashmap::mapref::entry::Entry::Occupied(mut occupied), Some(expected)) => {
                let slot = occupied.get_mut();
                if slot.record.version != expected {
                    return Err(StorageError::VersionConflict {
                        call_id: record.call_id.clone(),
                        expected,
                        actual: slot.record.version,
                    });
                }
                slot.record = record.clone();
                slot.logs.push(entry.clone());
                Ok(())
            }
            (dashmap::mapref::entry::Entry::Occupied(occupied), None) => Err(StorageError::VersionConflict {
                call_id: record.call_id.clone(),
                expected: 0,
                actual: occupied.get().record.version,
            }),
            (dashmap::mapref::entry::Entry::Vacant(_), Some(_)) => {
                Err(StorageError::NotFound(record.call_id.clone()))
            }
            (dashmap::mapref::entry::Entry::Vacant(vacant), None) => {
                vacant.insert(Slot { record: record.clone(), logs: vec![entry.clone()] });
                Ok(())
            }
        }
    }

    async fn recent_logs(&self, call_id: &str, limit: usize) -> Result<Vec<SyncLogEntry>, StorageError> {
        let Some(slot) = self.data.get(call_id) else {
            return Ok(Vec::new());
        };
        let mut logs = slot.logs.clone();
        drop(slot);
        logs.sort_by(newest_first);
        logs.truncate(limit);
        Ok(logs)
    }

    async fn scan(&self, query: &RecordQuery) -> Result<Vec<CrmRecord>, StorageError> {
        Ok(self
            .data
            .iter()
            .filter(|slot| query.matches(&slot.record))
            .map(|slot| slot.record.clone())
            .collect())
    }

    async fn ids_with_status(&self, status: SyncStatus) -> Result<Vec<String>, StorageError> {
        Ok(self
            .data
            .iter()
            .filter(|slot| slot.record.sync_status == status)
            .map(|slot| slot.key().clone())
            .collect())
    }

    async fn logs_since(&self, since: DateTime<Utc>) -> Result<Vec<SyncLogEntry>, StorageError> {
        Ok(self
            .data
            .iter()
            .flat_map(|slot| {
                slot.logs
                    .iter()
                    .filter(|e| e.timestamp >= since)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    async fn latest_successes(&self) -> Result<Vec<SyncLogEntry>, StorageError> {
        Ok(self
            .data
            .iter()
            .filter_map(|slot| {
                slot.logs
                    .iter()
                    .filter(|e| e.is_success() && e.action.is_sync_attempt())
                    .min_by(|a, b| newest_first(a, b))
                    .cloned()
            })
            .collect())
    }
}

/// Mappings keyed by CRM agent id, holding the agent's whole history.
#[derive(Default)]
pub struct InMemoryMappingStore {
    by_agent: DashMap<String, Vec<AgentMapping>>,
}

impl InMemoryMappingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MappingStore for InMemoryMappingStore {
    async fn active_for(&self, crm_agent_id: &str) -> Result<Option<AgentMapping>, StorageError> {
        Ok(self
            .by_agent
            .get(crm_agent_id)
            .and_then(|history| history.iter().find(|m| m.is_active).cloned()))
    }

    async fn put(&self, mapping: &AgentMapping) -> Result<(), StorageError> {
        if mapping.crm_agent_id.trim().is_empty() || mapping.app_user_id.trim().is_empty() {
            return Err(StorageError::Integrity("mapping needs crm_agent_id and app_user_id".into()));
        }
        let mut history = self.by_agent.entry(mapping.crm_agent_id.clone()).or_default();
        if mapping.is_active {
            for existing in history.iter_mut() {
                existing.is_active = false;
            }
        }
        history.retain(|m| m.app_user_id != mapping.app_user_id);
        history.push(mapping.clone());
        Ok(())
    }

    async fn active_agents_in_team(&self, team_id: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .by_agent
            .iter()
            .filter(|history| {
                history
                    .iter()
                    .any(|m| m.is_active && m.team_id.as_deref() == Some(team_id))
            })
            .map(|history| history.key().clone())
            .collect())
    }

    async fn history(&self, crm_agent_id: &str) -> Result<Vec<AgentMapping>, StorageError> {
        Ok(self
            .by_agent
            .get(crm_agent_id)
            .map(|h| h.value().clone())
            .unwrap_or_default())
    }
}
