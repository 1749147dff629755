//! SQL backend tests against in-memory SQLite.
//!
//! Run with: `cargo test --test sql_store`
//!
//! # Test Organization
//! - `happy_*` - round trips, commits, log ordering, mappings
//! - `query_*` - filtering, scoping and pagination in SQL
//! - `failure_*` - version conflicts and integrity rejections
//! - `engine_*` - the full engine over SQL stores

use chrono::{Duration, Utc};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

use crm_sync_engine::fixtures::{epoch, population, raw_call, RecordBuilder, ScriptedSource};
use crm_sync_engine::query::{Freshness, PageRequest, RecordFilter, RecordQuery, Visibility};
use crm_sync_engine::storage::sql::SqlStore;
use crm_sync_engine::storage::traits::{MappingStore, RecordStore, StorageError};
use crm_sync_engine::storage::Stores;
use crm_sync_engine::{
    AgentMapping, Caller, CrmRecord, SyncAction, SyncEngine, SyncEngineConfig, SyncLogEntry, SyncStatus,
    TranscriptState, TranscriptStatus,
};

// =============================================================================
// Helpers
// =============================================================================

async fn store() -> SqlStore {
    SqlStore::new("sqlite::memory:").await.expect("in-memory sqlite")
}

/// Stored timestamps are epoch milliseconds; pin ours to whole seconds so
/// round trips compare equal.
fn pinned(mut record: CrmRecord) -> CrmRecord {
    record.created_at = epoch();
    record.updated_at = epoch();
    record
}

fn query(filter: RecordFilter, visibility: Visibility) -> RecordQuery {
    RecordQuery::new(filter, visibility, Freshness::new(Utc::now(), Duration::hours(24)))
}

fn agents(ids: &[&str]) -> Visibility {
    Visibility::Agents(ids.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>())
}

async fn seed(store: &SqlStore, records: Vec<CrmRecord>) {
    for record in records {
        store.upsert(&pinned(record)).await.unwrap();
    }
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn happy_record_round_trip_keeps_every_field() {
    let store = store().await;
    let mut record = RecordBuilder::new("C1")
        .campaign("camp-1")
        .synced_at(epoch())
        .mapped("u-1", "T1")
        .transcript(TranscriptState::Available {
            transcript_word_count: 412,
            transcript_preview: "Hello, thanks for calling".into(),
        })
        .build();
    record.metadata = Some(json!({"disposition": "renewed", "tags": ["vip"]}));
    record.audit_id = Some("AUD-9".into());
    record.audit_status = Some("in_review".into());
    record.recording_duration_seconds = Some(183);
    record.transcript_url = Some("https://crm.example.net/transcripts/C1".into());
    record.transcript_last_updated = Some(epoch() + Duration::minutes(2));
    let record = pinned(record);

    store.upsert(&record).await.unwrap();
    assert_eq!(store.get("C1").await.unwrap(), Some(record));
    assert!(store.get("C404").await.unwrap().is_none());
}

#[tokio::test]
async fn happy_commit_inserts_then_updates_with_logs() {
    let store = store().await;
    let mut record = pinned(RecordBuilder::new("C1").build());
    record.version = 1;

    let first = SyncLogEntry::success("C1", SyncAction::Pull, 12, "pulled").at(epoch());
    store.commit(&record, &first, None).await.unwrap();

    record.version = 2;
    record.sync_status = SyncStatus::Error;
    record.sync_error = Some("pull: CRM API timeout".into());
    let second = SyncLogEntry::failure("C1", SyncAction::Resync, 30, "pull: CRM API timeout")
        .at(epoch() + Duration::seconds(5));
    store.commit(&record, &second, Some(1)).await.unwrap();

    let stored = store.get("C1").await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.sync_status, SyncStatus::Error);

    let logs = store.recent_logs("C1", 10).await.unwrap();
    assert_eq!(logs, vec![second, first]);
}

#[tokio::test]
async fn happy_recent_logs_are_newest_first_and_limited() {
    let store = store().await;
    seed(&store, vec![RecordBuilder::new("C1").build()]).await;

    for i in 0..15 {
        let entry = SyncLogEntry::success("C1", SyncAction::Resync, 5, format!("attempt {i}"))
            .at(epoch() + Duration::seconds(i));
        store.append_log(&entry).await.unwrap();
    }

    let logs = store.recent_logs("C1", 10).await.unwrap();
    assert_eq!(logs.len(), 10);
    assert_eq!(logs[0].result.as_deref(), Some("attempt 14"));
    assert_eq!(logs[9].result.as_deref(), Some("attempt 5"));
    assert!(logs.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
}

#[tokio::test]
async fn happy_latest_successes_one_per_record() {
    let store = store().await;
    seed(&store, vec![RecordBuilder::new("C1").build(), RecordBuilder::new("C2").build()]).await;

    let entries = [
        SyncLogEntry::success("C1", SyncAction::Pull, 1, "old").at(epoch()),
        SyncLogEntry::success("C1", SyncAction::Resync, 1, "new").at(epoch() + Duration::minutes(5)),
        SyncLogEntry::failure("C1", SyncAction::Resync, 1, "later failure").at(epoch() + Duration::minutes(9)),
        SyncLogEntry::failure("C2", SyncAction::Pull, 1, "never succeeded").at(epoch()),
        SyncLogEntry::success("C2", SyncAction::Save, 0, "transcript available").at(epoch() + Duration::minutes(10)),
    ];
    for entry in &entries {
        store.append_log(entry).await.unwrap();
    }

    let latest = store.latest_successes().await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].result.as_deref(), Some("new"));

    let since = store.logs_since(epoch() + Duration::minutes(1)).await.unwrap();
    assert_eq!(since.len(), 3);
}

#[tokio::test]
async fn happy_ids_with_status_reads_stored_status() {
    let store = store().await;
    seed(&store, population(8, 3, 2, Utc::now())).await;

    let errors = store.ids_with_status(SyncStatus::Error).await.unwrap();
    assert_eq!(errors, vec!["C0000", "C0001", "C0002"]);
    assert!(store.ids_with_status(SyncStatus::Stale).await.unwrap().is_empty());
}

#[tokio::test]
async fn happy_mappings_single_active_per_agent() {
    let store = store().await;
    let earlier = epoch();
    let later = epoch() + Duration::days(1);

    let mut first = AgentMapping::new("A1", "u-1", Some("T1".into()));
    first.updated_at = earlier;
    let mut second = AgentMapping::new("A1", "u-2", Some("T2".into())).with_name("Dana");
    second.updated_at = later;

    MappingStore::put(&store, &first).await.unwrap();
    MappingStore::put(&store, &second).await.unwrap();

    let active = store.active_for("A1").await.unwrap().unwrap();
    assert_eq!(active.app_user_id, "u-2");
    assert_eq!(active.agent_name.as_deref(), Some("Dana"));

    let history = store.history("A1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.iter().filter(|m| m.is_active).count(), 1);
    assert_eq!(history[0].app_user_id, "u-1");

    assert!(store.active_agents_in_team("T1").await.unwrap().is_empty());
    assert_eq!(store.active_agents_in_team("T2").await.unwrap(), vec!["A1"]);
}

#[tokio::test]
async fn happy_mapping_same_pair_is_replaced() {
    let store = store().await;
    MappingStore::put(&store, &AgentMapping::new("A1", "u-1", Some("T1".into()))).await.unwrap();
    MappingStore::put(&store, &AgentMapping::new("A1", "u-1", Some("T3".into()))).await.unwrap();

    let history = store.history("A1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].team_id.as_deref(), Some("T3"));
}

// =============================================================================
// Query
// =============================================================================

#[tokio::test]
async fn query_scope_applies_before_pagination() {
    let store = store().await;
    // 30 records over A1..A3, so 10 per agent
    seed(&store, population(30, 0, 3, Utc::now())).await;

    let q = query(RecordFilter::default(), agents(&["A1", "A2"]));
    let (page_one, total) = store.query(&q, PageRequest::new(1, 7)).await.unwrap();
    assert_eq!(total, 20);
    assert_eq!(page_one.len(), 7);

    let (page_three, _) = store.query(&q, PageRequest::new(3, 7)).await.unwrap();
    assert_eq!(page_three.len(), 6);
    assert!(page_one.iter().chain(&page_three).all(|r| r.agent_id != "A3"));

    let (beyond, total) = store.query(&q, PageRequest::new(9, 7)).await.unwrap();
    assert!(beyond.is_empty());
    assert_eq!(total, 20);
}

#[tokio::test]
async fn query_orders_most_recent_call_first() {
    let store = store().await;
    seed(&store, population(5, 0, 1, Utc::now())).await;

    let (records, _) = store
        .query(&query(RecordFilter::default(), Visibility::All), PageRequest::new(1, 10))
        .await
        .unwrap();
    let ids: Vec<_> = records.iter().map(|r| r.call_id.as_str()).collect();
    assert_eq!(ids, vec!["C0004", "C0003", "C0002", "C0001", "C0000"]);
}

#[tokio::test]
async fn query_empty_agent_set_sees_nothing() {
    let store = store().await;
    seed(&store, population(5, 0, 1, Utc::now())).await;

    let (records, total) = store
        .query(&query(RecordFilter::default(), Visibility::nothing()), PageRequest::new(1, 10))
        .await
        .unwrap();
    assert!(records.is_empty());
    assert_eq!(total, 0);
}

#[tokio::test]
async fn query_search_is_case_insensitive_and_escapes_wildcards() {
    let store = store().await;
    seed(
        &store,
        vec![
            RecordBuilder::new("CALL_100").build(),
            RecordBuilder::new("CALLX100").build(),
            RecordBuilder::new("other").agent("Agent%Smith").build(),
        ],
    )
    .await;

    let hits = |text: &str| {
        let q = query(RecordFilter::default().search(text), Visibility::All);
        let store = &store;
        async move {
            let (records, _) = store.query(&q, PageRequest::new(1, 10)).await.unwrap();
            records.into_iter().map(|r| r.call_id).collect::<Vec<_>>()
        }
    };

    assert_eq!(hits("call_1").await, vec!["CALL_100"]);
    assert_eq!(hits("%smith").await, vec!["other"]);
    assert_eq!(hits("   ").await.len(), 3);
}

#[tokio::test]
async fn query_stale_filter_uses_freshness_cutoff() {
    let store = store().await;
    let now = Utc::now();
    seed(
        &store,
        vec![
            RecordBuilder::new("fresh").synced_at(now - Duration::hours(1)).build(),
            RecordBuilder::new("aged").synced_at(now - Duration::hours(30)).build(),
            RecordBuilder::new("broken").status(SyncStatus::Error).build(),
        ],
    )
    .await;

    let ids = |status: SyncStatus| {
        let q = query(RecordFilter::default().sync_status(status), Visibility::All);
        let store = &store;
        async move {
            let (records, _) = store.query(&q, PageRequest::new(1, 10)).await.unwrap();
            records.into_iter().map(|r| r.call_id).collect::<Vec<_>>()
        }
    };

    assert_eq!(ids(SyncStatus::Stale).await, vec!["aged"]);
    assert_eq!(ids(SyncStatus::Synced).await, vec!["fresh"]);
    assert_eq!(ids(SyncStatus::Error).await, vec!["broken"]);
}

#[tokio::test]
async fn query_campaign_transcript_and_date_filters_combine() {
    let store = store().await;
    seed(&store, population(10, 0, 2, Utc::now())).await;
    store
        .upsert(&pinned(
            RecordBuilder::new("T1")
                .campaign("camp-1")
                .called_at(epoch() + Duration::minutes(15))
                .transcript(TranscriptState::Processing)
                .build(),
        ))
        .await
        .unwrap();

    let filter = RecordFilter::default()
        .campaign("camp-1")
        .between(Some(epoch()), Some(epoch() + Duration::minutes(40)));
    let (records, total) = store
        .query(&query(filter.clone(), Visibility::All), PageRequest::new(1, 20))
        .await
        .unwrap();
    // C0000, C0002, C0004 and T1
    assert_eq!(total, 4);
    assert!(records.iter().all(|r| r.campaign_id.as_deref() == Some("camp-1")));

    let processing = filter.transcript_status(TranscriptStatus::Processing);
    let (records, _) = store
        .query(&query(processing, Visibility::All), PageRequest::new(1, 20))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].call_id, "T1");
}

// =============================================================================
// Failure paths
// =============================================================================

#[tokio::test]
async fn failure_commit_with_stale_version_writes_nothing() {
    let store = store().await;
    let mut record = pinned(RecordBuilder::new("C1").build());
    record.version = 1;
    store
        .commit(&record, &SyncLogEntry::success("C1", SyncAction::Pull, 1, "pulled"), None)
        .await
        .unwrap();

    let mut loser = record.clone();
    loser.version = 2;
    loser.sync_error = Some("should not land".into());
    let err = store
        .commit(&loser, &SyncLogEntry::failure("C1", SyncAction::Resync, 1, "lost"), Some(0))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::VersionConflict { expected: 0, actual: 1, .. }));

    assert_eq!(store.get("C1").await.unwrap(), Some(record));
    assert_eq!(store.recent_logs("C1", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failure_commit_new_record_that_exists_conflicts() {
    let store = store().await;
    seed(&store, vec![RecordBuilder::new("C1").build()]).await;

    let err = store
        .commit(
            &pinned(RecordBuilder::new("C1").build()),
            &SyncLogEntry::success("C1", SyncAction::Pull, 1, "pulled"),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::VersionConflict { .. }));
}

#[tokio::test]
async fn failure_append_log_for_unknown_record() {
    let store = store().await;
    let err = store
        .append_log(&SyncLogEntry::success("ghost", SyncAction::Pull, 1, "pulled"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound(id) if id == "ghost"));
}

#[tokio::test]
async fn failure_integrity_violations_are_rejected() {
    let store = store().await;

    let mut stale = RecordBuilder::new("C1").build();
    stale.sync_status = SyncStatus::Stale;
    assert!(matches!(store.upsert(&stale).await, Err(StorageError::Integrity(_))));

    let mut synced_without_time = RecordBuilder::new("C2").build();
    synced_without_time.sync_status = SyncStatus::Synced;
    assert!(matches!(store.upsert(&synced_without_time).await, Err(StorageError::Integrity(_))));

    let record = RecordBuilder::new("C3").build();
    let wrong_owner = SyncLogEntry::success("C4", SyncAction::Pull, 1, "pulled");
    assert!(matches!(store.commit(&record, &wrong_owner, None).await, Err(StorageError::Integrity(_))));

    let blank = AgentMapping::new(" ", "u-1", None);
    assert!(matches!(MappingStore::put(&store, &blank).await, Err(StorageError::Integrity(_))));
}

#[tokio::test]
async fn failure_negative_stored_integers_are_integrity_errors() {
    let store = store().await;
    seed(&store, vec![RecordBuilder::new("C1").build()]).await;
    store
        .append_log(&SyncLogEntry::success("C1", SyncAction::Pull, 4, "pulled").at(epoch()))
        .await
        .unwrap();

    sqlx::query("UPDATE crm_records SET version = -1 WHERE call_id = 'C1'")
        .execute(&store.pool())
        .await
        .unwrap();
    sqlx::query("UPDATE crm_sync_logs SET duration_ms = -5 WHERE call_id = 'C1'")
        .execute(&store.pool())
        .await
        .unwrap();

    assert!(matches!(store.get("C1").await, Err(StorageError::Integrity(msg)) if msg.contains("version")));
    assert!(matches!(store.recent_logs("C1", 10).await, Err(StorageError::Integrity(msg)) if msg.contains("duration_ms")));
}

// =============================================================================
// Engine over SQL
// =============================================================================

#[tokio::test]
async fn engine_resync_and_detail_over_sqlite() {
    let sql = Arc::new(store().await);
    let source = Arc::new(ScriptedSource::new());
    let stores = Stores { records: sql.clone(), mappings: sql.clone() };
    let engine = SyncEngine::new(SyncEngineConfig::default(), stores, source.clone());

    let admin = Caller::admin();
    engine
        .put_mapping(AgentMapping::new("A1", "u-1", Some("T1".into())), &admin)
        .await
        .unwrap();
    seed(&sql, vec![RecordBuilder::new("C1").status(SyncStatus::Error).build()]).await;
    source.respond(raw_call("C1", "A1"));

    let record = engine.resync("C1", &admin).await.unwrap();
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.app_user_id.as_deref(), Some("u-1"));
    assert!(record.sync_error.is_none());

    let detail = engine.detail("C1", &Caller::auditor("T1")).await.unwrap();
    assert_eq!(detail.sync_logs.len(), 1);
    assert_eq!(detail.sync_logs[0].action, SyncAction::Resync);
    assert_eq!(detail.agent_mapping.map(|m| m.app_user_id).as_deref(), Some("u-1"));

    let health = engine.health(&admin).await.unwrap();
    assert_eq!(health.total_records, 1);
    assert_eq!(health.records_synced_today, 1);
    assert_eq!(health.error_count, 0);
}

#[tokio::test]
async fn engine_connect_with_sqlite_url() {
    let config = SyncEngineConfig { sql_url: Some("sqlite::memory:".into()), ..Default::default() };
    let engine = SyncEngine::connect(config, Arc::new(ScriptedSource::new())).await.unwrap();

    let page = engine.list(RecordFilter::default(), 1, None, &Caller::manager()).await.unwrap();
    assert_eq!(page.total, 0);
    assert_eq!(page.total_pages, 0);
}
