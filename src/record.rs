// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! CRM call records and their sync logs.
//!
//! A [`CrmRecord`] is the internal view of one externally sourced call. It
//! carries the call metadata pulled from the CRM, the transcript state
//! reported by the transcription pipeline, and the record's own sync state.
//! Every sync attempt leaves exactly one [`SyncLogEntry`] behind.
//!
//! # Example
//!
//! ```
//! use crm_sync_engine::{CrmRecord, SyncStatus, TranscriptState};
//! use chrono::{Duration, Utc};
//!
//! let now = Utc::now();
//! let mut record = CrmRecord::new("C-1001", "cust-9", "agent-7", now);
//! assert_eq!(record.sync_status, SyncStatus::Pending);
//! assert_eq!(record.transcript, TranscriptState::Missing);
//!
//! record.sync_status = SyncStatus::Synced;
//! record.last_synced_at = Some(now - Duration::hours(30));
//! assert_eq!(
//!     record.effective_sync_status(now, Duration::hours(24)),
//!     SyncStatus::Stale
//! );
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Sync state of a record.
///
/// `Stale` is never stored: it is derived at read time from `Synced` and the
/// age of `last_synced_at`. See [`CrmRecord::effective_sync_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Stale,
    Error,
}

/// Transcript availability as reported by the transcription pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptStatus {
    Missing,
    Processing,
    Available,
    Error,
}

/// What a sync log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    /// Record pulled by an incremental CRM update cycle
    Pull,
    /// Agent mapping validated
    Map,
    /// Out-of-band transcript signal merged
    Save,
    /// Operator-triggered resync
    Resync,
    /// Resync driven by `retry_failed`
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Failure,
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            #[must_use]
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: stringify!($ty),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

str_enum!(SyncStatus { Pending => "pending", Synced => "synced", Stale => "stale", Error => "error" });
str_enum!(TranscriptStatus {
    Missing => "missing",
    Processing => "processing",
    Available => "available",
    Error => "error",
});
str_enum!(SyncAction { Pull => "pull", Map => "map", Save => "save", Resync => "resync", Retry => "retry" });
str_enum!(LogStatus { Success => "success", Failure => "failure" });

impl SyncAction {
    /// Whether the action runs the whole pull → map → save sequence.
    #[must_use]
    pub fn is_sync_attempt(&self) -> bool {
        matches!(self, Self::Pull | Self::Resync | Self::Retry)
    }
}

/// A stored enum column held a value this build does not know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Transcript state of a record.
///
/// Word count and preview only exist for available transcripts, so an
/// "available but empty" transcript cannot be represented.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "transcript_status", rename_all = "lowercase")]
pub enum TranscriptState {
    #[default]
    Missing,
    Processing,
    Available {
        transcript_word_count: u32,
        transcript_preview: String,
    },
    Error,
}

impl TranscriptState {
    #[must_use]
    pub fn status(&self) -> TranscriptStatus {
        match self {
            Self::Missing => TranscriptStatus::Missing,
            Self::Processing => TranscriptStatus::Processing,
            Self::Available { .. } => TranscriptStatus::Available,
            Self::Error => TranscriptStatus::Error,
        }
    }

    #[must_use]
    pub fn word_count(&self) -> Option<u32> {
        match self {
            Self::Available { transcript_word_count, .. } => Some(*transcript_word_count),
            _ => None,
        }
    }

    #[must_use]
    pub fn preview(&self) -> Option<&str> {
        match self {
            Self::Available { transcript_preview, .. } => Some(transcript_preview),
            _ => None,
        }
    }

    /// Rebuild the state from its flat column form.
    pub fn from_parts(
        status: TranscriptStatus,
        word_count: Option<u32>,
        preview: Option<String>,
    ) -> Result<Self, IntegrityViolation> {
        match status {
            TranscriptStatus::Missing => Ok(Self::Missing),
            TranscriptStatus::Processing => Ok(Self::Processing),
            TranscriptStatus::Error => Ok(Self::Error),
            TranscriptStatus::Available => match (word_count, preview) {
                (Some(words), Some(preview)) if words > 0 && !preview.trim().is_empty() => {
                    Ok(Self::Available {
                        transcript_word_count: words,
                        transcript_preview: preview,
                    })
                }
                (words, preview) => Err(IntegrityViolation(format!(
                    "available transcript requires word count > 0 and a preview (got words={:?}, preview={})",
                    words,
                    if preview.map_or(true, |p| p.trim().is_empty()) { "empty" } else { "present" }
                ))),
            },
        }
    }
}

/// Transcript availability signal from the external transcription pipeline.
///
/// Signals arrive in flat form and are only accepted once they pass
/// [`TranscriptSignal::into_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptSignal {
    pub status: TranscriptStatus,
    #[serde(default)]
    pub word_count: Option<u32>,
    #[serde(default)]
    pub preview: Option<String>,
}

impl TranscriptSignal {
    #[must_use]
    pub fn available(word_count: u32, preview: impl Into<String>) -> Self {
        Self {
            status: TranscriptStatus::Available,
            word_count: Some(word_count),
            preview: Some(preview.into()),
        }
    }

    #[must_use]
    pub fn status(status: TranscriptStatus) -> Self {
        Self { status, word_count: None, preview: None }
    }

    /// Validate the signal and bound its preview to `preview_chars` characters.
    pub fn into_state(self, preview_chars: usize) -> Result<TranscriptState, IntegrityViolation> {
        let preview = self.preview.map(|p| truncate_chars(p.trim(), preview_chars));
        TranscriptState::from_parts(self.status, self.word_count, preview)
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// A record or signal breaks one of the data model's invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct IntegrityViolation(pub String);

/// One externally sourced call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmRecord {
    /// External CRM call id, immutable key
    pub call_id: String,
    pub crm_user_id: String,
    /// External CRM agent id
    pub agent_id: String,
    /// Agent display name, resolved from the agent mapping
    pub agent_name: Option<String>,
    pub campaign_id: Option<String>,
    pub campaign_name: Option<String>,
    pub queue_name: Option<String>,

    pub call_datetime: DateTime<Utc>,
    pub call_duration_seconds: u32,

    pub recording_url: Option<String>,
    /// Key into external recording storage
    pub recording_ref: Option<String>,
    #[serde(default)]
    pub recording_duration_seconds: Option<u32>,

    #[serde(flatten)]
    pub transcript: TranscriptState,
    /// Where the CRM keeps the full transcript
    #[serde(default)]
    pub transcript_url: Option<String>,
    /// When the transcript state last changed
    #[serde(default)]
    pub transcript_last_updated: Option<DateTime<Utc>>,

    /// Stored sync status (never `Stale`)
    pub sync_status: SyncStatus,
    /// Message of the most recent failed attempt, cleared on success
    pub sync_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,

    /// Internal user the agent mapped to at the last successful map step
    pub app_user_id: Option<String>,
    /// Team of that mapping
    pub team_id: Option<String>,

    /// Linked audit, set by the audit collaborator
    pub audit_id: Option<String>,
    /// Audit status as known when the audit was linked
    #[serde(default)]
    pub audit_status: Option<String>,

    /// Extra CRM payload fields, carried opaquely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,

    /// Bumped on every committed write; used for optimistic concurrency
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CrmRecord {
    /// A freshly discovered record awaiting its first sync.
    pub fn new(
        call_id: impl Into<String>,
        crm_user_id: impl Into<String>,
        agent_id: impl Into<String>,
        call_datetime: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            call_id: call_id.into(),
            crm_user_id: crm_user_id.into(),
            agent_id: agent_id.into(),
            agent_name: None,
            campaign_id: None,
            campaign_name: None,
            queue_name: None,
            call_datetime,
            call_duration_seconds: 0,
            recording_url: None,
            recording_ref: None,
            recording_duration_seconds: None,
            transcript: TranscriptState::Missing,
            transcript_url: None,
            transcript_last_updated: None,
            sync_status: SyncStatus::Pending,
            sync_error: None,
            last_synced_at: None,
            app_user_id: None,
            team_id: None,
            audit_id: None,
            audit_status: None,
            metadata: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Status as callers should see it at `now`.
    ///
    /// A synced record whose last successful sync is older than `freshness`
    /// reads as `Stale`. Nothing is written; the next successful sync makes
    /// it read as `Synced` again.
    #[must_use]
    pub fn effective_sync_status(&self, now: DateTime<Utc>, freshness: Duration) -> SyncStatus {
        match (self.sync_status, self.last_synced_at) {
            (SyncStatus::Synced, Some(at)) if now - at <= freshness => SyncStatus::Synced,
            (SyncStatus::Synced, _) => SyncStatus::Stale,
            (status, _) => status,
        }
    }

    /// Copy of the record with its status replaced by the effective one.
    #[must_use]
    pub fn as_seen_at(&self, now: DateTime<Utc>, freshness: Duration) -> Self {
        let mut view = self.clone();
        view.sync_status = self.effective_sync_status(now, freshness);
        view
    }

    /// Replace the transcript state, stamping `transcript_last_updated`
    /// only when the state actually changes.
    pub fn set_transcript(&mut self, state: TranscriptState, at: DateTime<Utc>) {
        if self.transcript != state {
            self.transcript = state;
            self.transcript_last_updated = Some(at);
        }
    }

    /// Check the record-level invariants before a write.
    pub fn check_integrity(&self) -> Result<(), IntegrityViolation> {
        if self.call_id.trim().is_empty() {
            return Err(IntegrityViolation("call_id must not be empty".into()));
        }
        match self.sync_status {
            SyncStatus::Stale => {
                return Err(IntegrityViolation("stale is a derived status and cannot be stored".into()))
            }
            SyncStatus::Synced if self.last_synced_at.is_none() => {
                return Err(IntegrityViolation("synced record must carry last_synced_at".into()))
            }
            _ => {}
        }
        if let TranscriptState::Available { transcript_word_count, transcript_preview } = &self.transcript {
            if *transcript_word_count == 0 || transcript_preview.trim().is_empty() {
                return Err(IntegrityViolation(
                    "available transcript requires word count > 0 and a preview".into(),
                ));
            }
        }
        Ok(())
    }
}

/// One sync attempt against one record. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    /// Time-ordered id (UUIDv7), also the tiebreaker for equal timestamps
    pub id: String,
    /// Owning record
    pub call_id: String,
    pub action: SyncAction,
    pub status: LogStatus,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SyncLogEntry {
    pub fn success(
        call_id: impl Into<String>,
        action: SyncAction,
        duration_ms: u64,
        result: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            call_id: call_id.into(),
            action,
            status: LogStatus::Success,
            timestamp: Utc::now(),
            duration_ms,
            result: Some(result.into()),
            error_message: None,
        }
    }

    pub fn failure(
        call_id: impl Into<String>,
        action: SyncAction,
        duration_ms: u64,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            call_id: call_id.into(),
            action,
            status: LogStatus::Failure,
            timestamp: Utc::now(),
            duration_ms,
            result: None,
            error_message: Some(error_message.into()),
        }
    }

    /// Same entry stamped at `timestamp`. Used when replaying history.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == LogStatus::Success
    }
}

/// Newest first, ties broken by the time-ordered id.
pub(crate) fn newest_first(a: &SyncLogEntry, b: &SyncLogEntry) -> std::cmp::Ordering {
    b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id))
}
