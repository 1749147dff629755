//! End-to-end scenarios for the sync engine over in-memory stores.
//!
//! Every collaborator is scripted (see `crm_sync_engine::fixtures`), so
//! these run without any external service.
//!
//! Run with: `cargo test --test engine_scenarios`
//!
//! # Test Organization
//! - `happy_*` - normal operation: retry batches, pulls, validation
//! - `rbac_*` - role and team scoping
//! - `failure_*` - deadlines, breaker, rejected signals
//! - `concurrency_*` - same-record serialization

use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crm_sync_engine::fixtures::{
    population, raw_call, RecordBuilder, ScriptedSource, StaticAuditDirectory, StaticTranscriptFeed,
};
use crm_sync_engine::storage::memory::{InMemoryMappingStore, InMemoryRecordStore};
use crm_sync_engine::storage::traits::RecordStore;
use crm_sync_engine::storage::Stores;
use crm_sync_engine::{
    AgentMapping, AuditInfo, Caller, CircuitState, CrmRecord, EngineError, LogStatus, MappingVerdict, RecordFilter,
    SyncAction, SyncEngine, SyncEngineConfig, SyncStatus, TranscriptSignal, TranscriptStatus,
};

// =============================================================================
// Helpers
// =============================================================================

struct Setup {
    engine: SyncEngine,
    records: Arc<InMemoryRecordStore>,
    mappings: Arc<InMemoryMappingStore>,
    source: Arc<ScriptedSource>,
}

async fn setup(config: SyncEngineConfig) -> Setup {
    let records = Arc::new(InMemoryRecordStore::new());
    let mappings = Arc::new(InMemoryMappingStore::new());
    let source = Arc::new(ScriptedSource::new());
    let stores = Stores { records: records.clone(), mappings: mappings.clone() };
    let engine = SyncEngine::new(config, stores, source.clone());

    let admin = Caller::admin();
    for (agent, user, team) in [("A1", "u-1", "T1"), ("A2", "u-2", "T1"), ("A3", "u-3", "T2")] {
        engine
            .put_mapping(AgentMapping::new(agent, user, Some(team.into())).with_name(format!("Agent {agent}")), &admin)
            .await
            .unwrap();
    }
    Setup { engine, records, mappings, source }
}

async fn seed(records: &InMemoryRecordStore, batch: Vec<CrmRecord>) {
    for record in batch {
        records.upsert(&record).await.unwrap();
    }
}

/// Fields that must not change when nothing changed upstream.
fn without_timestamps(mut record: CrmRecord) -> CrmRecord {
    record.last_synced_at = None;
    record.updated_at = record.created_at;
    record.version = 0;
    record
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn happy_retry_failed_reports_every_error_record() {
    let s = setup(SyncEngineConfig::default()).await;
    seed(&s.records, population(50, 5, 3, Utc::now())).await;

    // C0000..C0002 recover, C0003 is rejected by the CRM, C0004 is gone.
    for (call_id, agent) in [("C0000", "A1"), ("C0001", "A2"), ("C0002", "A3")] {
        s.source.respond(raw_call(call_id, agent));
    }
    s.source.reject("C0003", "account suspended");

    let manager = Caller::manager();
    let summary = s.engine.retry_failed(&manager).await.unwrap();
    assert_eq!(summary.total_attempted, 5);
    assert_eq!(summary.success_count, 3);
    assert_eq!(summary.failure_count, 2);

    let health = s.engine.health(&manager).await.unwrap();
    assert_eq!(health.total_records, 50);
    assert_eq!(health.error_count, summary.failure_count as u64);
    assert!((health.success_rate - 96.0).abs() < 1e-9);

    let logs = s.records.recent_logs("C0003", 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].action, SyncAction::Retry);
    assert_eq!(logs[0].error_message.as_deref(), Some("pull: rejected: account suspended"));
}

#[tokio::test]
async fn happy_retry_failed_on_clean_store_is_empty() {
    let s = setup(SyncEngineConfig::default()).await;
    seed(&s.records, population(10, 0, 3, Utc::now())).await;

    let summary = s.engine.retry_failed(&Caller::admin()).await.unwrap();
    assert_eq!(summary.total_attempted, 0);
    assert!(summary.is_clean());
}

#[tokio::test]
async fn happy_trends_on_empty_window() {
    let s = setup(SyncEngineConfig::default()).await;

    let points = s.engine.trends(7, &Caller::admin()).await.unwrap();
    assert_eq!(points.len(), 7);
    assert!(points.iter().all(|p| p.success_count == 0 && p.failure_count == 0 && p.total_records == 0));
    for pair in points.windows(2) {
        assert_eq!(pair[1].date, pair[0].date.succ_opt().unwrap());
    }
    assert_eq!(points.last().unwrap().date, Utc::now().date_naive());
}

#[tokio::test]
async fn happy_trends_count_todays_activity() {
    let s = setup(SyncEngineConfig::default()).await;
    seed(&s.records, vec![RecordBuilder::new("C1").agent("A1").build()]).await;
    s.source.respond(raw_call("C1", "A1"));

    let admin = Caller::admin();
    s.engine.resync("C1", &admin).await.unwrap();
    s.engine.resync("C1", &admin).await.unwrap();

    let today = s.engine.trends(1, &admin).await.unwrap();
    assert_eq!(today.len(), 1);
    assert_eq!(today[0].success_count, 2);
    assert_eq!(today[0].total_records, 1);
}

#[tokio::test]
async fn happy_validate_mapping_is_idempotent() {
    let s = setup(SyncEngineConfig::default()).await;
    seed(
        &s.records,
        vec![RecordBuilder::new("C1").agent("A1").mapped("u-1", "T1").synced_at(Utc::now()).build()],
    )
    .await;
    let before = s.records.get("C1").await.unwrap().unwrap();

    let manager = Caller::manager();
    let first = s.engine.validate_mapping("C1", &manager).await.unwrap();
    let second = s.engine.validate_mapping("C1", &manager).await.unwrap();
    assert_eq!(first.verdict, MappingVerdict::Confirmed);
    assert_eq!(second.verdict, MappingVerdict::Confirmed);

    let logs = s.records.recent_logs("C1", 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|e| e.action == SyncAction::Map && e.status == LogStatus::Success));

    let after = s.records.get("C1").await.unwrap().unwrap();
    assert_eq!(without_timestamps(after.clone()), without_timestamps(before));
    assert_eq!(after.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn happy_validate_mapping_follows_reassignment() {
    let s = setup(SyncEngineConfig::default()).await;
    seed(
        &s.records,
        vec![RecordBuilder::new("C1").agent("A1").mapped("u-1", "T1").synced_at(Utc::now()).build()],
    )
    .await;

    let admin = Caller::admin();
    s.engine
        .put_mapping(AgentMapping::new("A1", "u-9", Some("T2".into())), &admin)
        .await
        .unwrap();

    let result = s.engine.validate_mapping("C1", &admin).await.unwrap();
    assert_eq!(
        result.verdict,
        MappingVerdict::Changed { from: Some("u-1@T1".into()), to: "u-9@T2".into() }
    );
    assert_eq!(
        result.log_entry.unwrap().result.as_deref(),
        Some("mapping changed from u-1@T1 to u-9@T2")
    );

    let record = s.records.get("C1").await.unwrap().unwrap();
    assert_eq!(record.app_user_id.as_deref(), Some("u-9"));
    assert_eq!(record.team_id.as_deref(), Some("T2"));
}

#[tokio::test]
async fn happy_pull_cycle_creates_and_merges_transcripts() {
    let feed = Arc::new(StaticTranscriptFeed::new());
    feed.set("C2", TranscriptSignal::available(312, "Thanks for calling, how can I help?"));

    let s = setup(SyncEngineConfig::default()).await;
    let engine = s.engine.with_transcript_feed(feed);

    let mut processing = raw_call("C1", "A1");
    processing.transcript = Some(TranscriptSignal::status(TranscriptStatus::Processing));
    s.source.push_update(processing);
    s.source.push_update(raw_call("C2", "A3"));

    let summary = engine.sync_updates(&Caller::manager()).await.unwrap();
    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.created, 2);
    assert_eq!(summary.synced, 2);

    let c1 = s.records.get("C1").await.unwrap().unwrap();
    assert_eq!(c1.transcript.status(), TranscriptStatus::Processing);
    let c2 = s.records.get("C2").await.unwrap().unwrap();
    assert_eq!(c2.transcript.word_count(), Some(312));
    assert_eq!(c2.team_id.as_deref(), Some("T2"));
    assert_eq!(c2.recording_ref.as_deref(), Some("rec/C2"));

    let logs = s.records.recent_logs("C2", 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].action, SyncAction::Pull);
}

#[tokio::test]
async fn happy_redelivered_update_is_not_rewritten() {
    let s = setup(SyncEngineConfig::default()).await;
    s.source.retain_updates();
    s.source.push_update(raw_call("C1", "A1"));
    let manager = Caller::manager();

    let first = s.engine.sync_updates(&manager).await.unwrap();
    assert_eq!((first.created, first.synced), (1, 1));
    let stored = s.records.get("C1").await.unwrap().unwrap();

    // The inclusive watermark hands the same record back.
    let again = s.engine.sync_updates(&manager).await.unwrap();
    assert_eq!(again.fetched, 1);
    assert_eq!(again.unchanged, 1);
    assert_eq!((again.created, again.synced, again.failed, again.skipped), (0, 0, 0, 0));
    assert_eq!(s.records.get("C1").await.unwrap().unwrap(), stored);
    assert_eq!(s.records.recent_logs("C1", 10).await.unwrap().len(), 1);

    let mut changed = raw_call("C1", "A1");
    changed.campaign_id = Some("camp-2".into());
    changed.updated_at = stored.call_datetime + Duration::minutes(1);
    s.source.push_update(changed.clone());

    let third = s.engine.sync_updates(&manager).await.unwrap();
    assert_eq!(third.fetched, 2);
    assert_eq!((third.unchanged, third.synced), (1, 1));
    let updated = s.records.get("C1").await.unwrap().unwrap();
    assert_eq!(updated.campaign_id.as_deref(), Some("camp-2"));
    assert_eq!(updated.version, stored.version + 1);
    assert_eq!(s.records.recent_logs("C1", 10).await.unwrap().len(), 2);
    assert_eq!(s.engine.watermark(), Some(changed.updated_at));
}

#[tokio::test]
async fn happy_detail_resolves_audit_and_bounds_logs() {
    let audits = Arc::new(StaticAuditDirectory::new());
    audits.insert(AuditInfo {
        audit_id: "AUD-1".into(),
        status: "completed".into(),
        auditor_id: Some("u-77".into()),
        score: Some(87),
        updated_at: Utc::now(),
    });

    let s = setup(SyncEngineConfig::default()).await;
    let engine = s.engine.with_audit_directory(audits);
    seed(&s.records, vec![RecordBuilder::new("C1").agent("A1").build()]).await;
    s.source.respond(raw_call("C1", "A1"));

    let manager = Caller::manager();
    for _ in 0..12 {
        engine.resync("C1", &manager).await.unwrap();
    }
    engine.link_audit("C1", "AUD-1", &manager).await.unwrap();

    let detail = engine.detail("C1", &Caller::auditor("T1")).await.unwrap();
    assert_eq!(detail.sync_logs.len(), 10);
    assert_eq!(detail.sync_logs[0].result.as_deref(), Some("linked audit AUD-1 (completed)"));
    assert_eq!(detail.record.audit_status.as_deref(), Some("completed"));
    assert!(detail
        .sync_logs
        .windows(2)
        .all(|pair| pair[0].timestamp >= pair[1].timestamp));
    assert_eq!(detail.audit_info.unwrap().score, Some(87));
    assert_eq!(detail.agent_mapping.unwrap().app_user_id, "u-1");
}

// =============================================================================
// RBAC
// =============================================================================

#[tokio::test]
async fn rbac_auditor_never_sees_other_team() {
    let s = setup(SyncEngineConfig::default()).await;
    // A1, A2 -> T1; A3 -> T2. 30 records, 10 per agent.
    seed(&s.records, population(30, 3, 3, Utc::now())).await;

    let auditor = Caller::auditor("T1");
    let mut seen = HashSet::new();
    let mut page = 1;
    loop {
        let result = s.engine.list(RecordFilter::default(), page, Some(7), &auditor).await.unwrap();
        assert_eq!(result.total, 20);
        assert_eq!(result.total_pages, 3);
        for record in &result.items {
            assert_ne!(record.agent_id, "A3");
            seen.insert(record.call_id.clone());
        }
        if u64::from(page) >= result.total_pages {
            break;
        }
        page += 1;
    }
    assert_eq!(seen.len(), 20);

    let health = s.engine.health(&auditor).await.unwrap();
    assert_eq!(health.total_records, 20);
}

#[tokio::test]
async fn rbac_auditor_without_team_sees_nothing() {
    let s = setup(SyncEngineConfig::default()).await;
    seed(&s.records, population(5, 0, 3, Utc::now())).await;

    let orphan = Caller::new(crm_sync_engine::Role::Auditor, None);
    let page = s.engine.list(RecordFilter::default(), 1, None, &orphan).await.unwrap();
    assert_eq!(page.total, 0);
    assert!(page.items.is_empty());
    assert!((s.engine.health(&orphan).await.unwrap().success_rate - 0.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn rbac_auditor_mutations_are_forbidden() {
    let s = setup(SyncEngineConfig::default()).await;
    seed(&s.records, vec![RecordBuilder::new("C1").agent("A1").status(SyncStatus::Error).build()]).await;
    let auditor = Caller::auditor("T1");

    assert!(s.engine.resync("C1", &auditor).await.unwrap_err().is_forbidden());
    assert!(s.engine.validate_mapping("C1", &auditor).await.unwrap_err().is_forbidden());
    assert!(s.engine.retry_failed(&auditor).await.unwrap_err().is_forbidden());
    assert!(s.engine.link_audit("C1", "AUD-1", &auditor).await.unwrap_err().is_forbidden());
    assert!(s
        .engine
        .put_mapping(AgentMapping::new("A1", "u-evil", Some("T1".into())), &auditor)
        .await
        .unwrap_err()
        .is_forbidden());

    // Nothing was touched.
    assert!(s.records.recent_logs("C1", 10).await.unwrap().is_empty());
    assert_eq!(s.source.call_attempts("C1"), 0);
}

// =============================================================================
// Failure scenarios
// =============================================================================

#[tokio::test]
async fn failure_attempt_past_deadline_is_logged() {
    let config = SyncEngineConfig { attempt_deadline_ms: 50, circuit_window: 0, ..Default::default() };
    let s = setup(config).await;
    let before = RecordBuilder::new("C1").agent("A1").mapped("u-1", "T1").synced_at(Utc::now()).build();
    seed(&s.records, vec![before.clone()]).await;
    s.source.hang("C1");

    let record = s.engine.resync("C1", &Caller::admin()).await.unwrap();
    assert_eq!(record.sync_status, SyncStatus::Error);
    assert_eq!(record.sync_error.as_deref(), Some("deadline of 50ms exceeded"));
    assert_eq!(record.last_synced_at, before.last_synced_at);

    let logs = s.records.recent_logs("C1", 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Failure);
}

#[tokio::test]
async fn failure_update_pull_past_deadline_keeps_watermark() {
    let config = SyncEngineConfig { attempt_deadline_ms: 50, circuit_window: 0, ..Default::default() };
    let s = setup(config).await;
    s.source.hang_updates();
    let manager = Caller::manager();

    for _ in 0..2 {
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), s.engine.sync_updates(&manager))
            .await
            .expect("update pull must give up at the attempt deadline");
        let err = outcome.unwrap_err();
        assert!(matches!(err, EngineError::Upstream(ref msg) if msg == "deadline of 50ms exceeded"));
        assert_eq!(s.engine.watermark(), None);
    }
    assert_eq!(s.source.update_calls(), 2);
}

#[tokio::test]
async fn failure_open_circuit_stops_calling_the_crm() {
    let config = SyncEngineConfig {
        circuit_window: 2,
        circuit_recovery_secs: 60,
        pull_max_attempts: 1,
        ..Default::default()
    };
    let s = setup(config).await;
    let ids: Vec<String> = (0..6).map(|i| format!("C{i}")).collect();
    for id in &ids {
        seed(&s.records, vec![RecordBuilder::new(id).agent("A1").build()]).await;
        s.source.respond(raw_call(id, "A1"));
        s.source.fail_first(id, 10);
    }

    let admin = Caller::admin();
    let mut errors = Vec::new();
    for id in &ids {
        let record = s.engine.resync(id, &admin).await.unwrap();
        assert_eq!(record.sync_status, SyncStatus::Error);
        errors.push(record.sync_error.unwrap());
    }

    assert!(errors.iter().any(|e| e == "pull: CRM circuit open, call not attempted"));
    assert_eq!(s.engine.circuit_state(), Some(CircuitState::Open));
    let attempted: usize = ids.iter().map(|id| s.source.call_attempts(id)).sum();
    assert!(attempted < ids.len());
}

#[tokio::test]
async fn failure_rejected_transcript_signal_keeps_previous_transcript() {
    let s = setup(SyncEngineConfig::default()).await;
    seed(&s.records, vec![RecordBuilder::new("C1").agent("A1").synced_at(Utc::now()).build()]).await;
    let manager = Caller::manager();

    s.engine
        .apply_transcript_signal("C1", TranscriptSignal::available(40, "Good morning"), &manager)
        .await
        .unwrap();
    let broken = TranscriptSignal { status: TranscriptStatus::Available, word_count: None, preview: None };
    let record = s.engine.apply_transcript_signal("C1", broken, &manager).await.unwrap();

    assert_eq!(record.transcript.word_count(), Some(40));
    assert_eq!(record.transcript.preview(), Some("Good morning"));
    assert_eq!(record.sync_status, SyncStatus::Error);

    let logs = s.records.recent_logs("C1", 10).await.unwrap();
    assert_eq!(logs[0].status, LogStatus::Failure);
    assert_eq!(logs[0].action, SyncAction::Save);
}

#[tokio::test]
async fn failure_unknown_record_is_not_found() {
    let s = setup(SyncEngineConfig::default()).await;
    let admin = Caller::admin();
    assert!(s.engine.resync("ghost", &admin).await.unwrap_err().is_not_found());
    assert!(s.engine.validate_mapping("ghost", &admin).await.unwrap_err().is_not_found());
    assert!(s.engine.detail("ghost", &admin).await.unwrap_err().is_not_found());
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn concurrency_same_record_resyncs_are_serialized() {
    let s = setup(SyncEngineConfig::default()).await;
    seed(&s.records, vec![RecordBuilder::new("C1").agent("A1").status(SyncStatus::Error).build()]).await;
    s.source.respond(raw_call("C1", "A1"));

    let manager = Caller::manager();
    let admin = Caller::admin();
    let (a, b) = tokio::join!(s.engine.resync("C1", &manager), s.engine.resync("C1", &admin));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.sync_status, SyncStatus::Synced);
    assert_eq!(b.sync_status, SyncStatus::Synced);

    // One entry per physical execution, each describing its own outcome.
    let logs = s.records.recent_logs("C1", 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|e| e.status == LogStatus::Success));
    assert_ne!(logs[0].id, logs[1].id);

    let stored = s.records.get("C1").await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.last_synced_at, Some(logs[0].timestamp));
}

#[tokio::test]
async fn concurrency_mapping_change_from_another_instance_is_seen() {
    let s = setup(SyncEngineConfig::default()).await;
    let other = SyncEngine::new(
        SyncEngineConfig::default(),
        Stores { records: s.records.clone(), mappings: s.mappings.clone() },
        s.source.clone(),
    );
    seed(&s.records, vec![RecordBuilder::new("C1").agent("A1").build()]).await;
    s.source.respond(raw_call("C1", "A1"));
    let admin = Caller::admin();

    let first = s.engine.resync("C1", &admin).await.unwrap();
    assert_eq!(first.app_user_id.as_deref(), Some("u-1"));

    other
        .put_mapping(AgentMapping::new("A1", "u-9", Some("T2".into())), &admin)
        .await
        .unwrap();

    let second = s.engine.resync("C1", &admin).await.unwrap();
    assert_eq!(second.app_user_id.as_deref(), Some("u-9"));
    assert_eq!(second.team_id.as_deref(), Some("T2"));
    let detail = s.engine.detail("C1", &admin).await.unwrap();
    assert_eq!(detail.agent_mapping.unwrap().app_user_id, "u-9");
}

#[tokio::test]
async fn concurrency_stale_records_recover_after_resync() {
    let s = setup(SyncEngineConfig::default()).await;
    let old = Utc::now() - Duration::days(2);
    seed(&s.records, population(4, 0, 1, old)).await;
    for i in 0..4 {
        s.source.respond(raw_call(&format!("C{i:04}"), "A1"));
    }

    let admin = Caller::admin();
    let stale = s.engine.stale_records(&admin).await.unwrap();
    assert_eq!(stale.len(), 4);

    let results = resync_all(&s.engine, &stale, &admin).await;
    assert!(results.iter().all(|r| r.sync_status == SyncStatus::Synced));
    assert!(s.engine.stale_records(&admin).await.unwrap().is_empty());
    assert_eq!(s.engine.health(&admin).await.unwrap().stale_count, 0);
}

async fn resync_all(engine: &SyncEngine, ids: &[String], caller: &Caller) -> Vec<CrmRecord> {
    let mut out = Vec::new();
    for id in ids {
        out.push(engine.resync(id, caller).await.unwrap());
    }
    out
}
