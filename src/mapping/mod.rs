// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Agent mapping: external CRM agent id → internal user and team.
//!
//! [`MappingResolver`] answers "who is this CRM agent?" through an injected
//! [`MappingCache`]. Validation compares a record's stored mapping reference
//! (`app_user_id`, `team_id`) with the currently active mapping and yields a
//! [`MappingVerdict`].

pub mod cache;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub use cache::{MappingCache, MappingCacheStats};

use crate::record::{CrmRecord, SyncLogEntry};
use crate::storage::traits::{MappingStore, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMapping {
    pub crm_agent_id: String,
    pub app_user_id: String,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

impl AgentMapping {
    /// An active mapping stamped now.
    pub fn new(
        crm_agent_id: impl Into<String>,
        app_user_id: impl Into<String>,
        team_id: Option<String>,
    ) -> Self {
        Self {
            crm_agent_id: crm_agent_id.into(),
            app_user_id: app_user_id.into(),
            agent_name: None,
            team_id,
            is_active: true,
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Copy the mapping reference onto a record.
    pub fn apply_to(&self, record: &mut CrmRecord) {
        record.app_user_id = Some(self.app_user_id.clone());
        record.team_id = self.team_id.clone();
        if self.agent_name.is_some() {
            record.agent_name = self.agent_name.clone();
        }
    }

    fn reference(&self) -> String {
        match self.team_id {
            Some(ref team) => format!("{}@{}", self.app_user_id, team),
            None => self.app_user_id.clone(),
        }
    }
}

/// Outcome of comparing a record with the active mapping of its agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum MappingVerdict {
    /// Record already points at the active mapping
    Confirmed,
    /// Record pointed elsewhere (or nowhere) and was re-pointed
    Changed { from: Option<String>, to: String },
    /// Agent has no active mapping
    Unmapped,
}

impl MappingVerdict {
    /// Compare the record's stored reference with `active`.
    #[must_use]
    pub fn assess(record: &CrmRecord, active: Option<&AgentMapping>) -> Self {
        let Some(mapping) = active else {
            return Self::Unmapped;
        };
        let same_user = record.app_user_id.as_deref() == Some(mapping.app_user_id.as_str());
        if same_user && record.team_id == mapping.team_id {
            return Self::Confirmed;
        }
        let from = record.app_user_id.as_ref().map(|user| match record.team_id {
            Some(ref team) => format!("{user}@{team}"),
            None => user.clone(),
        });
        Self::Changed { from, to: mapping.reference() }
    }

    /// Text for the `map` log entry.
    #[must_use]
    pub fn describe(&self, agent_id: &str) -> String {
        match self {
            Self::Confirmed => format!("mapping confirmed for agent {agent_id}"),
            Self::Changed { from: Some(from), to } => format!("mapping changed from {from} to {to}"),
            Self::Changed { from: None, to } => format!("mapping set to {to}"),
            Self::Unmapped => format!("no active mapping for agent {agent_id}"),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Unmapped)
    }
}

/// Result of `validate_mapping`.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub call_id: String,
    pub verdict: MappingVerdict,
    pub mapping: Option<AgentMapping>,
    /// The `map` entry appended for this validation, absent when the
    /// attempt lost a version race and was discarded
    pub log_entry: Option<SyncLogEntry>,
}

impl ValidationResult {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.verdict.is_success()
    }
}

/// Resolve CRM agents to their active mapping.
#[derive(Clone)]
pub struct MappingResolver {
    store: Arc<dyn MappingStore>,
    cache: Arc<MappingCache>,
}

impl MappingResolver {
    pub fn new(store: Arc<dyn MappingStore>, cache: Arc<MappingCache>) -> Self {
        Self { store, cache }
    }

    /// Active mapping for `crm_agent_id`, served from the cycle cache.
    pub async fn resolve(&self, crm_agent_id: &str) -> Result<Option<AgentMapping>, StorageError> {
        if let Some(cached) = self.cache.get(crm_agent_id) {
            debug!(agent_id = crm_agent_id, "mapping cache hit");
            return Ok(cached);
        }
        self.resolve_fresh(crm_agent_id).await
    }

    /// Bypass the cache, then refresh it with the store's answer unless the
    /// agent was invalidated while the store was being read.
    pub async fn resolve_fresh(&self, crm_agent_id: &str) -> Result<Option<AgentMapping>, StorageError> {
        let generation = self.cache.generation();
        let mapping = self.store.active_for(crm_agent_id).await?;
        if !self.cache.insert_if_current(crm_agent_id, mapping.clone(), generation) {
            debug!(agent_id = crm_agent_id, "mapping changed during lookup, not cached");
        }
        Ok(mapping)
    }

    /// Store a mapping and drop its cached answer.
    pub async fn put_mapping(&self, mapping: &AgentMapping) -> Result<(), StorageError> {
        self.store.put(mapping).await?;
        self.cache.invalidate(&mapping.crm_agent_id);
        debug!(agent_id = %mapping.crm_agent_id, active = mapping.is_active, "mapping stored");
        Ok(())
    }

    /// Every mapping ever stored for the agent, active or not.
    pub async fn history(&self, crm_agent_id: &str) -> Result<Vec<AgentMapping>, StorageError> {
        self.store.history(crm_agent_id).await
    }

    pub async fn active_agents_in_team(&self, team_id: &str) -> Result<Vec<String>, StorageError> {
        self.store.active_agents_in_team(team_id).await
    }

    pub fn begin_cycle(&self) {
        self.cache.begin_cycle();
    }

    #[must_use]
    pub fn cache_stats(&self) -> MappingCacheStats {
        self.cache.stats()
    }
}
