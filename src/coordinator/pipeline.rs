// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The pull → map → save sequence for one record.
//!
//! Every mutation runs under the record's key lock and ends in exactly one
//! [`RecordStore::commit`]: the updated record and its log entry land
//! together or not at all. Pull and map run under the attempt deadline;
//! the commit does not, so an attempt that ran out of time still records
//! its failure.
//!
//! On failure the record keeps its previous field values. Only
//! `sync_status`, `sync_error`, `updated_at` and `version` change.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::SyncEngineConfig;
use crate::error::{EngineError, SyncFailure};
use crate::mapping::{MappingResolver, MappingVerdict, ValidationResult};
use crate::metrics::{self, LatencyTimer};
use crate::record::{CrmRecord, SyncAction, SyncLogEntry, SyncStatus, TranscriptSignal};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::resilience::retry::{retry_if, RetryConfig};
use crate::source::{CrmSource, RawCallRecord, SourceError, TranscriptFeed};
use crate::storage::traits::{RecordStore, StorageError};

use super::locks::KeyedLocks;

/// Attempt tuning, fixed at engine construction.
#[derive(Debug, Clone)]
pub(crate) struct PipelineSettings {
    pub(crate) deadline: Duration,
    pub(crate) pull_retry: RetryConfig,
    pub(crate) preview_chars: usize,
}

impl PipelineSettings {
    pub(crate) fn from_config(config: &SyncEngineConfig) -> Self {
        Self {
            deadline: config.attempt_deadline(),
            pull_retry: RetryConfig::pull(config.pull_max_attempts, config.pull_retry_initial()),
            preview_chars: config.transcript_preview_chars,
        }
    }
}

/// What a single commit ended as.
#[derive(Debug)]
pub(crate) enum Committed {
    /// The attempt's record and log entry were written
    Written(CrmRecord),
    /// Another writer got there first; this is the record it left
    Superseded(CrmRecord),
    /// A redelivered update matched the synced record; nothing was written
    Unchanged(CrmRecord),
}

impl Committed {
    pub(crate) fn into_record(self) -> CrmRecord {
        match self {
            Self::Written(record) | Self::Superseded(record) | Self::Unchanged(record) => record,
        }
    }
}

#[derive(Clone)]
pub(crate) struct SyncPipeline {
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) resolver: MappingResolver,
    pub(crate) source: Arc<dyn CrmSource>,
    pub(crate) transcripts: Option<Arc<dyn TranscriptFeed>>,
    pub(crate) breaker: Option<Arc<CircuitBreaker>>,
    pub(crate) locks: KeyedLocks,
    pub(crate) settings: Arc<PipelineSettings>,
}

impl SyncPipeline {
    /// Re-run pull/map/save for an existing record.
    pub(crate) async fn resync(&self, call_id: &str, action: SyncAction) -> Result<CrmRecord, EngineError> {
        let _guard = self.locks.lock(call_id).await;
        let current = self.load(call_id).await?;

        let timer = LatencyTimer::new(action);
        let outcome = self.within_deadline(action, self.prepare(&current)).await;
        let committed = self
            .finish(&current, Some(current.version), outcome, action, timer.elapsed_ms())
            .await?;
        Ok(committed.into_record())
    }

    /// Map and save one record delivered by an incremental pull, creating
    /// it when it is new. A synced record that the update would leave
    /// exactly as it is gets no new version and no log entry.
    pub(crate) async fn ingest(&self, raw: &RawCallRecord) -> Result<(Committed, bool), EngineError> {
        let _guard = self.locks.lock(&raw.call_id).await;
        let existing = self.store.get(&raw.call_id).await?;
        let created = existing.is_none();
        let expected = existing.as_ref().map(|r| r.version);
        let base = existing.unwrap_or_else(|| raw.to_record());

        let timer = LatencyTimer::new(SyncAction::Pull);
        let outcome = self.within_deadline(SyncAction::Pull, self.reconcile(&base, raw)).await;
        if let Ok(reconciled) = &outcome {
            if !created && base.sync_status == SyncStatus::Synced && *reconciled == base {
                debug!(call_id = %raw.call_id, "update matches stored record, skipping write");
                metrics::record_attempt(SyncAction::Pull, "unchanged");
                return Ok((Committed::Unchanged(base), false));
            }
        }
        let committed = self.finish(&base, expected, outcome, SyncAction::Pull, timer.elapsed_ms()).await?;
        Ok((committed, created))
    }

    /// Re-resolve the record's agent mapping and record the verdict.
    pub(crate) async fn validate_mapping(&self, call_id: &str) -> Result<ValidationResult, EngineError> {
        let _guard = self.locks.lock(call_id).await;
        let current = self.load(call_id).await?;

        let timer = LatencyTimer::new(SyncAction::Map);
        let mapping = self.resolver.resolve_fresh(&current.agent_id).await?;
        let verdict = MappingVerdict::assess(&current, mapping.as_ref());
        let description = verdict.describe(&current.agent_id);

        let mut next = current.clone();
        let entry = match &mapping {
            Some(active) => {
                active.apply_to(&mut next);
                let entry = SyncLogEntry::success(call_id, SyncAction::Map, timer.elapsed_ms(), description);
                if next.sync_status == SyncStatus::Synced {
                    next.last_synced_at = Some(entry.timestamp);
                }
                entry
            }
            None => {
                let failure = SyncFailure::ValidationConflict(description);
                mark_failed(&mut next, &failure);
                metrics::record_failure(SyncAction::Map, failure.kind());
                SyncLogEntry::failure(call_id, SyncAction::Map, timer.elapsed_ms(), failure.to_string())
            }
        };
        next.updated_at = entry.timestamp;
        next.version = current.version + 1;

        let log_entry = match self.write(&next, &entry, Some(current.version), SyncAction::Map).await? {
            Committed::Written(_) => Some(entry),
            Committed::Superseded(_) | Committed::Unchanged(_) => None,
        };
        Ok(ValidationResult { call_id: call_id.to_string(), verdict, mapping, log_entry })
    }

    /// Merge an out-of-band transcript signal into the record.
    pub(crate) async fn apply_transcript_signal(
        &self,
        call_id: &str,
        signal: TranscriptSignal,
    ) -> Result<CrmRecord, EngineError> {
        let _guard = self.locks.lock(call_id).await;
        let current = self.load(call_id).await?;

        let timer = LatencyTimer::new(SyncAction::Save);
        let mut next = current.clone();
        let entry = match signal.into_state(self.settings.preview_chars) {
            Ok(state) => {
                let result = format!("transcript {}", state.status());
                let entry = SyncLogEntry::success(call_id, SyncAction::Save, timer.elapsed_ms(), result);
                next.set_transcript(state, entry.timestamp);
                entry
            }
            Err(violation) => {
                let failure = SyncFailure::Integrity(violation.0);
                warn!(call_id, error = %failure, "transcript signal rejected");
                mark_failed(&mut next, &failure);
                metrics::record_failure(SyncAction::Save, failure.kind());
                SyncLogEntry::failure(call_id, SyncAction::Save, timer.elapsed_ms(), failure.to_string())
            }
        };
        next.updated_at = entry.timestamp;
        next.version = current.version + 1;

        let committed = self.write(&next, &entry, Some(current.version), SyncAction::Save).await?;
        Ok(committed.into_record())
    }

    /// Point the record at an audit in the given workflow status.
    pub(crate) async fn link_audit(
        &self,
        call_id: &str,
        audit_id: &str,
        audit_status: &str,
    ) -> Result<CrmRecord, EngineError> {
        let _guard = self.locks.lock(call_id).await;
        let current = self.load(call_id).await?;

        let timer = LatencyTimer::new(SyncAction::Save);
        let mut next = current.clone();
        next.audit_id = Some(audit_id.to_string());
        next.audit_status = Some(audit_status.to_string());
        let entry = SyncLogEntry::success(
            call_id,
            SyncAction::Save,
            timer.elapsed_ms(),
            format!("linked audit {audit_id} ({audit_status})"),
        );
        next.updated_at = entry.timestamp;
        next.version = current.version + 1;

        let committed = self.write(&next, &entry, Some(current.version), SyncAction::Save).await?;
        Ok(committed.into_record())
    }

    async fn load(&self, call_id: &str) -> Result<CrmRecord, EngineError> {
        self.store
            .get(call_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(call_id.to_string()))
    }

    async fn within_deadline<F>(&self, action: SyncAction, step: F) -> Result<CrmRecord, SyncFailure>
    where
        F: std::future::Future<Output = Result<CrmRecord, SyncFailure>>,
    {
        match timeout(self.settings.deadline, step).await {
            Ok(outcome) => outcome,
            Err(_) => {
                metrics::record_timeout(action);
                Err(SyncFailure::DeadlineExceeded(self.settings.deadline))
            }
        }
    }

    /// Pull the CRM's current view and reconcile it with `current`.
    async fn prepare(&self, current: &CrmRecord) -> Result<CrmRecord, SyncFailure> {
        let raw = self.pull(&current.call_id).await?;
        self.reconcile(current, &raw).await
    }

    async fn pull(&self, call_id: &str) -> Result<RawCallRecord, SyncFailure> {
        let fetched = retry_if(
            "crm_fetch_call",
            &self.settings.pull_retry,
            || self.fetch_call(call_id),
            |err: &CircuitError<SourceError>| matches!(err, CircuitError::Inner(e) if e.is_transient()),
        )
        .await;

        match fetched {
            Ok(Some(raw)) => Ok(raw),
            Ok(None) => Err(SyncFailure::Vanished(call_id.to_string())),
            Err(CircuitError::Rejected) => Err(SyncFailure::CircuitOpen),
            Err(CircuitError::Inner(err)) => Err(SyncFailure::Upstream(err.to_string())),
        }
    }

    async fn fetch_call(&self, call_id: &str) -> Result<Option<RawCallRecord>, CircuitError<SourceError>> {
        match &self.breaker {
            Some(breaker) => breaker.call(|| self.source.fetch_call(call_id)).await,
            None => self.source.fetch_call(call_id).await.map_err(CircuitError::Inner),
        }
    }

    /// Changed calls since the watermark, through the same retry budget
    /// and breaker as single-record pulls. The whole fetch, retries
    /// included, runs under the attempt deadline.
    pub(crate) async fn fetch_updates(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RawCallRecord>, SyncFailure> {
        let fetch = retry_if(
            "crm_fetch_updates",
            &self.settings.pull_retry,
            || async {
                match &self.breaker {
                    Some(breaker) => breaker.call(|| self.source.fetch_updates(since)).await,
                    None => self.source.fetch_updates(since).await.map_err(CircuitError::Inner),
                }
            },
            |err: &CircuitError<SourceError>| matches!(err, CircuitError::Inner(e) if e.is_transient()),
        );
        let fetched = match timeout(self.settings.deadline, fetch).await {
            Ok(fetched) => fetched,
            Err(_) => {
                metrics::record_timeout(SyncAction::Pull);
                return Err(SyncFailure::DeadlineExceeded(self.settings.deadline));
            }
        };

        fetched.map_err(|err| match err {
            CircuitError::Rejected => SyncFailure::CircuitOpen,
            CircuitError::Inner(err) => SyncFailure::Upstream(err.to_string()),
        })
    }

    /// Overlay CRM fields and the transcript signal, then map the agent.
    /// Works on a copy; `base` is what a failure leaves in place.
    async fn reconcile(&self, base: &CrmRecord, raw: &RawCallRecord) -> Result<CrmRecord, SyncFailure> {
        let mut next = base.clone();
        raw.apply_to(&mut next);

        if let Some(signal) = self.transcript_signal(&base.call_id, raw).await? {
            let state = signal
                .into_state(self.settings.preview_chars)
                .map_err(|violation| SyncFailure::Integrity(violation.0))?;
            next.set_transcript(state, Utc::now());
        }

        let mapping = self
            .resolver
            .resolve(&next.agent_id)
            .await
            .map_err(|err| SyncFailure::Storage(err.to_string()))?
            .ok_or_else(|| {
                SyncFailure::ValidationConflict(MappingVerdict::Unmapped.describe(&next.agent_id))
            })?;
        mapping.apply_to(&mut next);
        Ok(next)
    }

    /// The transcription pipeline's signal wins over what the CRM carried.
    async fn transcript_signal(
        &self,
        call_id: &str,
        raw: &RawCallRecord,
    ) -> Result<Option<TranscriptSignal>, SyncFailure> {
        if let Some(feed) = &self.transcripts {
            match feed.signal(call_id).await {
                Ok(Some(signal)) => return Ok(Some(signal)),
                Ok(None) => {}
                Err(err) => return Err(SyncFailure::Upstream(format!("transcript feed: {err}"))),
            }
        }
        Ok(raw.transcript.clone())
    }

    /// Commit the attempt's outcome: the reconciled record on success,
    /// `base` marked as failed otherwise.
    async fn finish(
        &self,
        base: &CrmRecord,
        expected: Option<u64>,
        outcome: Result<CrmRecord, SyncFailure>,
        action: SyncAction,
        elapsed_ms: u64,
    ) -> Result<Committed, EngineError> {
        let mut next = match outcome {
            Ok(next) => next,
            Err(failure) => return self.commit_failure(base, expected, failure, action, elapsed_ms).await,
        };

        let reference = next.app_user_id.clone().unwrap_or_default();
        let entry = SyncLogEntry::success(
            &next.call_id,
            action,
            elapsed_ms,
            format!("pulled, mapped to {reference}, saved"),
        );
        next.sync_status = SyncStatus::Synced;
        next.sync_error = None;
        next.last_synced_at = Some(entry.timestamp);
        next.updated_at = entry.timestamp;
        next.version = base.version + 1;

        if let Err(violation) = next.check_integrity() {
            let failure = SyncFailure::Integrity(violation.0);
            return self.commit_failure(base, expected, failure, action, elapsed_ms).await;
        }

        match self.store.commit(&next, &entry, expected).await {
            Ok(()) => {
                metrics::record_attempt(action, "success");
                debug!(call_id = %next.call_id, action = %action, elapsed_ms, "record synced");
                Ok(Committed::Written(next))
            }
            Err(StorageError::VersionConflict { .. }) => self.superseded(&next.call_id, action).await,
            Err(StorageError::Integrity(msg)) => {
                self.commit_failure(base, expected, SyncFailure::Integrity(msg), action, elapsed_ms)
                    .await
            }
            Err(err) => {
                let failure = SyncFailure::Storage(err.to_string());
                self.commit_failure(base, expected, failure, action, elapsed_ms).await
            }
        }
    }

    async fn commit_failure(
        &self,
        base: &CrmRecord,
        expected: Option<u64>,
        failure: SyncFailure,
        action: SyncAction,
        elapsed_ms: u64,
    ) -> Result<Committed, EngineError> {
        warn!(call_id = %base.call_id, action = %action, error = %failure, "sync attempt failed");
        metrics::record_failure(action, failure.kind());

        let entry = SyncLogEntry::failure(&base.call_id, action, elapsed_ms, failure.to_string());
        let mut failed = base.clone();
        mark_failed(&mut failed, &failure);
        failed.updated_at = entry.timestamp;
        failed.version = base.version + 1;

        self.write(&failed, &entry, expected, action).await
    }

    /// Commit and classify the outcome. A lost version race is not an
    /// error: the attempt is dropped and the winner's record returned.
    async fn write(
        &self,
        record: &CrmRecord,
        entry: &SyncLogEntry,
        expected: Option<u64>,
        action: SyncAction,
    ) -> Result<Committed, EngineError> {
        match self.store.commit(record, entry, expected).await {
            Ok(()) => {
                let outcome = if entry.is_success() { "success" } else { "failure" };
                metrics::record_attempt(action, outcome);
                Ok(Committed::Written(record.clone()))
            }
            Err(StorageError::VersionConflict { .. }) => self.superseded(&record.call_id, action).await,
            Err(err) => Err(err.into()),
        }
    }

    async fn superseded(&self, call_id: &str, action: SyncAction) -> Result<Committed, EngineError> {
        warn!(call_id, action = %action, "record changed underneath the attempt, discarding it");
        metrics::record_version_conflict(action);
        metrics::record_attempt(action, "conflict");
        Ok(Committed::Superseded(self.load(call_id).await?))
    }
}

fn mark_failed(record: &mut CrmRecord, failure: &SyncFailure) {
    record.sync_status = SyncStatus::Error;
    record.sync_error = Some(failure.to_string());
}
