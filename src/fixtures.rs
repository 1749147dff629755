// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deterministic test data and scripted collaborators.
//!
//! Compiled for unit tests and behind the `test-utils` feature for
//! integration tests. Nothing here is reachable from production paths.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::record::{CrmRecord, SyncStatus, TranscriptSignal, TranscriptState};
use crate::source::{AuditDirectory, AuditInfo, CrmSource, RawCallRecord, SourceError, TranscriptFeed};

/// Fixed reference instant so generated call times are reproducible.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).single().unwrap_or_else(Utc::now)
}

/// Builder for stored records in arbitrary states.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    record: CrmRecord,
}

impl RecordBuilder {
    pub fn new(call_id: &str) -> Self {
        let mut record = CrmRecord::new(call_id, format!("crm-{call_id}"), "A1", epoch());
        record.agent_name = Some("Agent A1".into());
        Self { record }
    }

    pub fn agent(mut self, agent_id: &str) -> Self {
        self.record.agent_id = agent_id.to_string();
        self.record.agent_name = Some(format!("Agent {agent_id}"));
        self
    }

    pub fn campaign(mut self, campaign_id: &str) -> Self {
        self.record.campaign_id = Some(campaign_id.to_string());
        self.record.campaign_name = Some(format!("Campaign {campaign_id}"));
        self
    }

    pub fn called_at(mut self, at: DateTime<Utc>) -> Self {
        self.record.call_datetime = at;
        self
    }

    pub fn status(mut self, status: SyncStatus) -> Self {
        self.record.sync_status = status;
        if status == SyncStatus::Error {
            self.record.sync_error = Some("pull: CRM API timeout".into());
        }
        self
    }

    /// Synced at `at`; the record reads as stale once `at` falls outside
    /// the freshness window.
    pub fn synced_at(mut self, at: DateTime<Utc>) -> Self {
        self.record.sync_status = SyncStatus::Synced;
        self.record.sync_error = None;
        self.record.last_synced_at = Some(at);
        self
    }

    pub fn mapped(mut self, app_user_id: &str, team_id: &str) -> Self {
        self.record.app_user_id = Some(app_user_id.to_string());
        self.record.team_id = Some(team_id.to_string());
        self
    }

    pub fn transcript(mut self, transcript: TranscriptState) -> Self {
        self.record.transcript = transcript;
        self
    }

    pub fn build(self) -> CrmRecord {
        self.record
    }
}

/// CRM view of a call handled by `agent_id`.
pub fn raw_call(call_id: &str, agent_id: &str) -> RawCallRecord {
    RawCallRecord {
        call_id: call_id.to_string(),
        crm_user_id: format!("crm-{call_id}"),
        agent_id: agent_id.to_string(),
        agent_name: Some(format!("Agent {agent_id}")),
        campaign_id: Some("camp-1".into()),
        campaign_name: Some("Spring Renewals".into()),
        queue_name: Some("inbound".into()),
        call_datetime: epoch(),
        call_duration_seconds: 185,
        recording_url: Some(format!("https://recordings.example.net/{call_id}.wav")),
        recording_ref: Some(format!("rec/{call_id}")),
        recording_duration_seconds: Some(183),
        transcript_url: None,
        transcript: None,
        updated_at: epoch(),
        metadata: None,
    }
}

/// `total` records spread over agents `A1..=A{agents}`, one call every ten
/// minutes. The first `errors` are in `error`, the rest synced at `synced_at`.
pub fn population(total: usize, errors: usize, agents: usize, synced_at: DateTime<Utc>) -> Vec<CrmRecord> {
    let agents = agents.max(1);
    (0..total)
        .map(|i| {
            let builder = RecordBuilder::new(&format!("C{i:04}"))
                .agent(&format!("A{}", i % agents + 1))
                .campaign(if i % 2 == 0 { "camp-1" } else { "camp-2" })
                .called_at(epoch() + Duration::minutes(10 * i as i64));
            if i < errors {
                builder.status(SyncStatus::Error).build()
            } else {
                builder.synced_at(synced_at).build()
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
enum Script {
    Respond(RawCallRecord),
    Reject(String),
    Hang,
}

/// A `CrmSource` whose answers are set per call id. Unknown ids are
/// reported as gone from the CRM.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: DashMap<String, Script>,
    transient_failures: DashMap<String, usize>,
    attempts: DashMap<String, usize>,
    updates: Mutex<Vec<RawCallRecord>>,
    retain_updates: AtomicBool,
    hang_updates: AtomicBool,
    update_calls: AtomicUsize,
    last_since: Mutex<Option<DateTime<Utc>>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, raw: RawCallRecord) {
        self.scripts.insert(raw.call_id.clone(), Script::Respond(raw));
    }

    pub fn reject(&self, call_id: &str, reason: &str) {
        self.scripts.insert(call_id.to_string(), Script::Reject(reason.to_string()));
    }

    /// Never answer for `call_id`.
    pub fn hang(&self, call_id: &str) {
        self.scripts.insert(call_id.to_string(), Script::Hang);
    }

    /// Fail the next `times` fetches of `call_id` with a transient error.
    pub fn fail_first(&self, call_id: &str, times: usize) {
        self.transient_failures.insert(call_id.to_string(), times);
    }

    /// Queue a record for the next `fetch_updates`.
    pub fn push_update(&self, raw: RawCallRecord) {
        self.updates.lock().push(raw);
    }

    /// Keep queued updates after they are fetched, so every later
    /// `fetch_updates` redelivers those at or after its watermark.
    pub fn retain_updates(&self) {
        self.retain_updates.store(true, Ordering::SeqCst);
    }

    /// Never answer `fetch_updates`.
    pub fn hang_updates(&self) {
        self.hang_updates.store(true, Ordering::SeqCst);
    }

    pub fn call_attempts(&self, call_id: &str) -> usize {
        self.attempts.get(call_id).map(|n| *n).unwrap_or(0)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Watermark passed to the latest `fetch_updates`.
    pub fn last_since(&self) -> Option<DateTime<Utc>> {
        *self.last_since.lock()
    }
}

#[async_trait]
impl CrmSource for ScriptedSource {
    async fn fetch_updates(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RawCallRecord>, SourceError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_since.lock() = since;
        if self.hang_updates.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            return Err(SourceError::Unavailable("no answer".into()));
        }
        let queued = if self.retain_updates.load(Ordering::SeqCst) {
            self.updates.lock().clone()
        } else {
            std::mem::take(&mut *self.updates.lock())
        };
        Ok(queued
            .into_iter()
            .filter(|raw| since.map_or(true, |since| raw.updated_at >= since))
            .collect())
    }

    async fn fetch_call(&self, call_id: &str) -> Result<Option<RawCallRecord>, SourceError> {
        *self.attempts.entry(call_id.to_string()).or_insert(0) += 1;

        if let Some(mut remaining) = self.transient_failures.get_mut(call_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SourceError::Unavailable("CRM API timeout".into()));
            }
        }

        let script = self.scripts.get(call_id).map(|s| s.value().clone());
        match script {
            Some(Script::Respond(raw)) => Ok(Some(raw)),
            Some(Script::Reject(reason)) => Err(SourceError::Rejected(reason)),
            Some(Script::Hang) => {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Err(SourceError::Unavailable("no answer".into()))
            }
            None => Ok(None),
        }
    }
}

/// Transcript signals keyed by call id.
#[derive(Default)]
pub struct StaticTranscriptFeed {
    signals: DashMap<String, TranscriptSignal>,
}

impl StaticTranscriptFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, call_id: &str, signal: TranscriptSignal) {
        self.signals.insert(call_id.to_string(), signal);
    }
}

#[async_trait]
impl TranscriptFeed for StaticTranscriptFeed {
    async fn signal(&self, call_id: &str) -> Result<Option<TranscriptSignal>, SourceError> {
        Ok(self.signals.get(call_id).map(|s| s.value().clone()))
    }
}

/// Audits keyed by audit id.
#[derive(Default)]
pub struct StaticAuditDirectory {
    audits: DashMap<String, AuditInfo>,
}

impl StaticAuditDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: AuditInfo) {
        self.audits.insert(info.audit_id.clone(), info);
    }
}

#[async_trait]
impl AuditDirectory for StaticAuditDirectory {
    async fn audit_info(&self, audit_id: &str) -> Result<Option<AuditInfo>, SourceError> {
        Ok(self.audits.get(audit_id).map(|a| a.value().clone()))
    }
}
