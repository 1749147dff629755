// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Caller-facing operations.
//!
//! Every operation takes the [`Caller`] and resolves its access scope once.
//! Mutations are gated on the mutate capability before any state is read.
//! Reads are narrowed at the store query, never after pagination.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::EngineError;
use crate::health::{HealthSnapshot, TrendPoint};
use crate::mapping::{AgentMapping, ValidationResult};
use crate::metrics;
use crate::query::{Freshness, Page, PageRequest, RecordFilter, RecordQuery};
use crate::rbac::Caller;
use crate::record::{CrmRecord, SyncAction, SyncStatus, TranscriptSignal};

use super::pipeline::Committed;
use super::{PullSummary, RecordDetail, RetrySummary, SyncEngine};

/// Workflow status recorded for an audit the directory cannot describe.
const DEFAULT_AUDIT_STATUS: &str = "pending";

impl SyncEngine {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Reads
    // ═══════════════════════════════════════════════════════════════════════════

    /// One page of records visible to `caller`, most recent call first.
    ///
    /// `page` is 1-based. `page_size` is clamped to `1..=max_page_size`
    /// (the configured default when `None`). `total` counts only records
    /// the caller may see.
    #[tracing::instrument(skip(self, filter, caller), fields(role = caller.role.as_str()))]
    pub async fn list(
        &self,
        filter: RecordFilter,
        page: u32,
        page_size: Option<u32>,
        caller: &Caller,
    ) -> Result<Page<CrmRecord>, EngineError> {
        let scope = self.rbac.scope(caller).await?;
        let request = PageRequest::new(page.max(1), self.config.effective_page_size(page_size));
        let freshness = self.freshness();

        let query = RecordQuery::new(filter, scope.visibility, freshness);
        let (records, total) = self.pipeline.store.query(&query, request).await?;
        Ok(Page::new(records, total, request).map(|r| r.as_seen_at(freshness.now, freshness.window)))
    }

    /// One record with its recent sync log, resolved mapping and audit.
    ///
    /// Fails `NotFound` for unknown ids, then `Forbidden` when the record
    /// is outside the caller's scope.
    #[tracing::instrument(skip(self, caller), fields(role = caller.role.as_str()))]
    pub async fn detail(&self, call_id: &str, caller: &Caller) -> Result<RecordDetail, EngineError> {
        let record = self
            .pipeline
            .store
            .get(call_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(call_id.to_string()))?;

        let scope = self.rbac.scope(caller).await?;
        if let Err(err) = scope.require_visible(&record) {
            metrics::record_forbidden("detail");
            return Err(err);
        }

        let sync_logs = self.pipeline.store.recent_logs(call_id, self.config.sync_log_limit).await?;
        let agent_mapping = self.pipeline.resolver.resolve_fresh(&record.agent_id).await?;

        let audit_info = match (&self.audits, record.audit_id.as_deref()) {
            (Some(directory), Some(audit_id)) => match directory.audit_info(audit_id).await {
                Ok(info) => info,
                Err(err) => {
                    warn!(call_id, audit_id, error = %err, "audit lookup failed");
                    None
                }
            },
            _ => None,
        };

        let freshness = self.freshness();
        Ok(RecordDetail {
            record: record.as_seen_at(freshness.now, freshness.window),
            sync_logs,
            agent_mapping,
            audit_info,
        })
    }

    /// Point-in-time statistics over the caller's scope.
    #[tracing::instrument(skip(self, caller), fields(role = caller.role.as_str()))]
    pub async fn health(&self, caller: &Caller) -> Result<HealthSnapshot, EngineError> {
        let scope = self.rbac.scope(caller).await?;
        let tz = caller.timezone.unwrap_or_else(|| self.config.reporting_tz());
        Ok(self.health.snapshot(&scope.visibility, tz, Utc::now()).await?)
    }

    /// Daily success/failure counts for the `days` calendar days ending
    /// today in the caller's timezone (the reporting timezone otherwise).
    #[tracing::instrument(skip(self, caller), fields(role = caller.role.as_str()))]
    pub async fn trends(&self, days: u32, caller: &Caller) -> Result<Vec<TrendPoint>, EngineError> {
        if days > self.config.max_trend_days {
            return Err(EngineError::InvalidRequest(format!(
                "trend window of {days} days exceeds the maximum of {}",
                self.config.max_trend_days
            )));
        }
        let scope = self.rbac.scope(caller).await?;
        let tz = caller.timezone.unwrap_or_else(|| self.config.reporting_tz());
        Ok(self.health.trends(days, &scope.visibility, tz, Utc::now()).await?)
    }

    /// Call ids in scope whose last successful sync has aged out of the
    /// freshness window, most recent call first.
    #[tracing::instrument(skip(self, caller), fields(role = caller.role.as_str()))]
    pub async fn stale_records(&self, caller: &Caller) -> Result<Vec<String>, EngineError> {
        let scope = self.rbac.scope(caller).await?;
        let query = RecordQuery::new(
            RecordFilter::default().sync_status(SyncStatus::Stale),
            scope.visibility,
            self.freshness(),
        );
        let mut records = self.pipeline.store.scan(&query).await?;
        records.sort_by(crate::query::recent_first);
        Ok(records.into_iter().map(|r| r.call_id).collect())
    }

    /// Every mapping stored for a CRM agent, oldest first.
    #[tracing::instrument(skip(self, caller), fields(role = caller.role.as_str()))]
    pub async fn mapping_history(&self, crm_agent_id: &str, caller: &Caller) -> Result<Vec<AgentMapping>, EngineError> {
        let scope = self.rbac.scope(caller).await?;
        if !scope.visibility.allows(crm_agent_id) {
            metrics::record_forbidden("mapping_history");
            return Err(EngineError::Forbidden(format!(
                "{} may not view agent {crm_agent_id}",
                caller.role.as_str()
            )));
        }
        Ok(self.pipeline.resolver.history(crm_agent_id).await?)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Sync operations
    // ═══════════════════════════════════════════════════════════════════════════

    /// Re-run pull → map → save for one record, whatever its status.
    ///
    /// A failed step is not an error: the returned record shows `error`
    /// and carries the failure in `sync_error`. Mapping lookups start from
    /// an empty cache.
    #[tracing::instrument(skip(self, caller), fields(role = caller.role.as_str()))]
    pub async fn resync(&self, call_id: &str, caller: &Caller) -> Result<CrmRecord, EngineError> {
        self.authorize(caller, "resync")?;
        self.pipeline.resolver.begin_cycle();
        let record = self.pipeline.resync(call_id, SyncAction::Resync).await?;
        info!(call_id, status = %record.sync_status, "resync finished");
        Ok(self.seen_now(record))
    }

    /// Re-resolve the record's agent mapping and log the verdict.
    #[tracing::instrument(skip(self, caller), fields(role = caller.role.as_str()))]
    pub async fn validate_mapping(&self, call_id: &str, caller: &Caller) -> Result<ValidationResult, EngineError> {
        self.authorize(caller, "validate mapping")?;
        let result = self.pipeline.validate_mapping(call_id).await?;
        info!(call_id, verdict = ?result.verdict, "mapping validated");
        Ok(result)
    }

    /// Resync every record currently in `error`.
    ///
    /// Records are retried concurrently (bounded by `retry_concurrency`),
    /// each under its own lock. One record's failure never aborts the
    /// others; it is tallied in the summary. The batch shares one mapping
    /// cache cycle.
    #[tracing::instrument(skip(self, caller), fields(role = caller.role.as_str()))]
    pub async fn retry_failed(&self, caller: &Caller) -> Result<RetrySummary, EngineError> {
        self.authorize(caller, "retry failed records")?;
        self.pipeline.resolver.begin_cycle();
        let ids = self.pipeline.store.ids_with_status(SyncStatus::Error).await?;
        let mut summary = RetrySummary { total_attempted: ids.len(), ..Default::default() };

        let permits = Arc::new(Semaphore::new(self.config.retry_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for call_id in ids {
            let pipeline = self.pipeline.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let outcome = pipeline.resync(&call_id, SyncAction::Retry).await;
                (call_id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(record))) if record.sync_status == SyncStatus::Synced => summary.success_count += 1,
                Ok((_, Ok(_))) => summary.failure_count += 1,
                Ok((call_id, Err(err))) => {
                    warn!(call_id = %call_id, error = %err, "retry could not be recorded");
                    summary.failure_count += 1;
                }
                Err(err) => {
                    error!(error = %err, "retry task aborted");
                    summary.failure_count += 1;
                }
            }
        }

        metrics::record_retry_batch(summary.total_attempted, summary.success_count);
        info!(
            attempted = summary.total_attempted,
            recovered = summary.success_count,
            failed = summary.failure_count,
            "retry batch finished"
        );
        Ok(summary)
    }

    /// Pull calls changed since the last cycle and map/save each one.
    ///
    /// Starts a new mapping cache cycle. New calls are created; known ones
    /// refreshed, unless the update leaves a synced record exactly as it
    /// is (counted `unchanged`, nothing written). The watermark advances to
    /// the newest CRM `updated_at` seen, even when some records failed
    /// (they are left in `error` for `retry_failed`). Fails `Upstream` only
    /// when the update list itself cannot be fetched within the attempt
    /// deadline; the watermark then stays put.
    #[tracing::instrument(skip(self, caller), fields(role = caller.role.as_str()))]
    pub async fn sync_updates(&self, caller: &Caller) -> Result<PullSummary, EngineError> {
        self.authorize(caller, "pull updates")?;
        let _cycle = self.pull_cycle.lock().await;
        self.pipeline.resolver.begin_cycle();

        let since = *self.watermark.lock();
        let raws = self
            .pipeline
            .fetch_updates(since)
            .await
            .map_err(|failure| EngineError::Upstream(failure.to_string()))?;

        let mut summary = PullSummary { fetched: raws.len(), ..Default::default() };
        let mut newest = since;
        for raw in &raws {
            newest = newest.max(Some(raw.updated_at));
            match self.pipeline.ingest(raw).await {
                Ok((Committed::Written(record), created)) => {
                    if created {
                        summary.created += 1;
                    }
                    if record.sync_status == SyncStatus::Synced {
                        summary.synced += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
                Ok((Committed::Unchanged(_), _)) => summary.unchanged += 1,
                Ok((Committed::Superseded(_), _)) => summary.skipped += 1,
                Err(err) => {
                    warn!(call_id = %raw.call_id, error = %err, "pulled record could not be saved");
                    summary.skipped += 1;
                }
            }
        }
        *self.watermark.lock() = newest;

        metrics::record_pull_cycle(summary.fetched, summary.failed + summary.skipped);
        info!(
            fetched = summary.fetched,
            created = summary.created,
            synced = summary.synced,
            failed = summary.failed,
            unchanged = summary.unchanged,
            skipped = summary.skipped,
            "pull cycle finished"
        );
        Ok(summary)
    }

    /// Merge a transcript-availability signal. A signal that breaks the
    /// availability rules is logged as a failed `save` and leaves the
    /// transcript as it was.
    #[tracing::instrument(skip(self, signal, caller), fields(role = caller.role.as_str()))]
    pub async fn apply_transcript_signal(
        &self,
        call_id: &str,
        signal: TranscriptSignal,
        caller: &Caller,
    ) -> Result<CrmRecord, EngineError> {
        self.authorize(caller, "update transcripts")?;
        let record = self.pipeline.apply_transcript_signal(call_id, signal).await?;
        Ok(self.seen_now(record))
    }

    /// Link a record to an audit. The audit's workflow status comes from
    /// the audit directory when one is attached and knows the audit, and
    /// is `pending` otherwise.
    #[tracing::instrument(skip(self, caller), fields(role = caller.role.as_str()))]
    pub async fn link_audit(&self, call_id: &str, audit_id: &str, caller: &Caller) -> Result<CrmRecord, EngineError> {
        self.authorize(caller, "link audits")?;
        if audit_id.trim().is_empty() {
            return Err(EngineError::InvalidRequest("audit_id must not be empty".into()));
        }
        let status = match &self.audits {
            Some(directory) => match directory.audit_info(audit_id).await {
                Ok(info) => info.map(|info| info.status),
                Err(err) => {
                    warn!(call_id, audit_id, error = %err, "audit lookup failed");
                    None
                }
            },
            None => None,
        };
        let status = status.unwrap_or_else(|| DEFAULT_AUDIT_STATUS.to_string());
        let record = self.pipeline.link_audit(call_id, audit_id, &status).await?;
        info!(call_id, audit_id, audit_status = %status, "audit linked");
        Ok(self.seen_now(record))
    }

    /// Store an agent mapping. An active mapping replaces the agent's
    /// previous active one.
    #[tracing::instrument(skip(self, mapping, caller), fields(role = caller.role.as_str(), agent_id = %mapping.crm_agent_id))]
    pub async fn put_mapping(&self, mapping: AgentMapping, caller: &Caller) -> Result<AgentMapping, EngineError> {
        self.authorize(caller, "change mappings")?;
        if mapping.crm_agent_id.trim().is_empty() || mapping.app_user_id.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "crm_agent_id and app_user_id must not be empty".into(),
            ));
        }
        self.pipeline.resolver.put_mapping(&mapping).await?;
        info!(app_user_id = %mapping.app_user_id, active = mapping.is_active, "mapping stored");
        Ok(mapping)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════════════════════

    fn authorize(&self, caller: &Caller, operation: &'static str) -> Result<(), EngineError> {
        self.rbac.require_mutate(caller, operation).inspect_err(|_| {
            warn!(role = caller.role.as_str(), operation, "mutation refused");
            metrics::record_forbidden(operation);
        })
    }

    fn freshness(&self) -> Freshness {
        Freshness::new(Utc::now(), self.config.freshness_window())
    }

    fn seen_now(&self, record: CrmRecord) -> CrmRecord {
        record.as_seen_at(Utc::now(), self.config.freshness_window())
    }
}
