// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! External collaborators.
//!
//! The engine never talks to the CRM, the transcription pipeline or the
//! audit service directly; hosts plug them in through these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::record::{CrmRecord, TranscriptSignal};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Transient failure; another attempt may succeed
    #[error("{0}")]
    Unavailable(String),
    /// Source rejected the request; retrying will not help
    #[error("rejected: {0}")]
    Rejected(String),
}

impl SourceError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Call metadata as delivered by the CRM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCallRecord {
    pub call_id: String,
    pub crm_user_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub campaign_name: Option<String>,
    #[serde(default)]
    pub queue_name: Option<String>,
    pub call_datetime: DateTime<Utc>,
    #[serde(default)]
    pub call_duration_seconds: u32,
    #[serde(default)]
    pub recording_url: Option<String>,
    #[serde(default)]
    pub recording_ref: Option<String>,
    #[serde(default)]
    pub recording_duration_seconds: Option<u32>,
    #[serde(default)]
    pub transcript_url: Option<String>,
    /// Transcript state known to the CRM at pull time
    #[serde(default)]
    pub transcript: Option<TranscriptSignal>,
    /// CRM-side modification time, drives the incremental pull watermark
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl RawCallRecord {
    /// Overwrite the CRM-owned fields of `record`. Transcript, sync state,
    /// mapping reference and audit link are left alone.
    pub fn apply_to(&self, record: &mut CrmRecord) {
        record.crm_user_id.clone_from(&self.crm_user_id);
        record.agent_id.clone_from(&self.agent_id);
        if self.agent_name.is_some() {
            record.agent_name.clone_from(&self.agent_name);
        }
        record.campaign_id.clone_from(&self.campaign_id);
        record.campaign_name.clone_from(&self.campaign_name);
        record.queue_name.clone_from(&self.queue_name);
        record.call_datetime = self.call_datetime;
        record.call_duration_seconds = self.call_duration_seconds;
        record.recording_url.clone_from(&self.recording_url);
        record.recording_ref.clone_from(&self.recording_ref);
        record.recording_duration_seconds = self.recording_duration_seconds;
        record.transcript_url.clone_from(&self.transcript_url);
        if self.metadata.is_some() {
            record.metadata.clone_from(&self.metadata);
        }
    }

    /// A new pending record holding this call's CRM fields.
    #[must_use]
    pub fn to_record(&self) -> CrmRecord {
        let mut record = CrmRecord::new(
            self.call_id.clone(),
            self.crm_user_id.clone(),
            self.agent_id.clone(),
            self.call_datetime,
        );
        self.apply_to(&mut record);
        record
    }
}

/// The CRM / recording data source.
#[async_trait]
pub trait CrmSource: Send + Sync {
    /// Calls created or modified at or after `since` (everything when `None`).
    async fn fetch_updates(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RawCallRecord>, SourceError>;

    /// Current CRM view of one call; `None` when the CRM no longer has it.
    async fn fetch_call(&self, call_id: &str) -> Result<Option<RawCallRecord>, SourceError>;
}

/// Transcript-availability signals from the transcription pipeline.
#[async_trait]
pub trait TranscriptFeed: Send + Sync {
    /// Latest signal for a call, `None` when the pipeline has nothing yet.
    async fn signal(&self, call_id: &str) -> Result<Option<TranscriptSignal>, SourceError>;
}

/// Audit linked to a call, as reported by the audit service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    pub audit_id: String,
    pub status: String,
    #[serde(default)]
    pub auditor_id: Option<String>,
    #[serde(default)]
    pub score: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditDirectory: Send + Sync {
    async fn audit_info(&self, audit_id: &str) -> Result<Option<AuditInfo>, SourceError>;
}
