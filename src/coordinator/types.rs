// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public response types for the sync engine.

use serde::Serialize;

use crate::mapping::AgentMapping;
use crate::record::{CrmRecord, SyncLogEntry};
use crate::source::AuditInfo;

/// Result of [`super::SyncEngine::retry_failed()`].
///
/// Per-record failures are tallied here, never raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    /// Records that were in `error` when the batch started
    pub total_attempted: usize,
    /// Records that came out `synced`
    pub success_count: usize,
    /// Records still in `error` (or that could not be committed)
    pub failure_count: usize,
}

impl RetrySummary {
    /// Whether every attempted record recovered.
    #[must_use]
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.failure_count == 0
    }
}

impl std::fmt::Display for RetrySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} attempted, {} recovered, {} failed",
            self.total_attempted, self.success_count, self.failure_count
        )
    }
}

/// Result of [`super::SyncEngine::sync_updates()`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullSummary {
    /// Raw records delivered by the CRM
    pub fetched: usize,
    /// Records seen for the first time
    pub created: usize,
    /// Records committed as `synced`
    pub synced: usize,
    /// Records committed as `error`
    pub failed: usize,
    /// Redelivered records already synced with identical content; not
    /// written again
    pub unchanged: usize,
    /// Records that could not be committed at all
    pub skipped: usize,
}

/// One record with its recent history, as returned by
/// [`super::SyncEngine::detail()`].
#[derive(Debug, Clone, Serialize)]
pub struct RecordDetail {
    pub record: CrmRecord,
    /// Newest first, bounded by `sync_log_limit`
    pub sync_logs: Vec<SyncLogEntry>,
    pub agent_mapping: Option<AgentMapping>,
    pub audit_info: Option<AuditInfo>,
}
