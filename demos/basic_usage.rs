// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic crm-sync-engine usage example.
//!
//! Demonstrates:
//! 1. Opening the engine on a local SQLite file
//! 2. Registering agent mappings
//! 3. Pulling CRM updates (one agent is unmapped)
//! 4. Listing records as a manager and as a team auditor
//! 5. Retrying failed records through a flaky CRM and reading health
//! 6. Displaying the captured metrics
//!
//! The CRM is scripted in-process, so no external service is needed.
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=crm_sync_engine=debug cargo run --example basic_usage
//! ```

use chrono::{Duration, Utc};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crm_sync_engine::fixtures::{raw_call, ScriptedSource, StaticTranscriptFeed};
use crm_sync_engine::{
    AgentMapping, Caller, RecordFilter, SyncEngine, SyncEngineConfig, SyncStatus, TranscriptSignal,
    TranscriptStatus,
};

const DB_PATH: &str = "./crm_sync_demo.db";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("crm_sync_engine=info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           crm-sync-engine: Basic Usage Example                ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and open the engine
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Opening engine on {DB_PATH}...");

    let config = SyncEngineConfig {
        sql_url: Some(format!("sqlite:{DB_PATH}?mode=rwc")),
        attempt_deadline_ms: 2_000,
        pull_max_attempts: 3,
        pull_retry_initial_ms: 20,
        reporting_timezone: "Europe/London".into(),
        ..Default::default()
    };

    let crm = Arc::new(ScriptedSource::new());
    let transcripts = Arc::new(StaticTranscriptFeed::new());
    let engine = SyncEngine::connect(config, crm.clone())
        .await?
        .with_transcript_feed(transcripts.clone());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Agent mappings
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n👤 Registering agent mappings...");
    let admin = Caller::admin();
    for (agent, user, team, name) in [
        ("agent-17", "u-42", "team-a", "Dana Whitfield"),
        ("agent-23", "u-51", "team-a", "Luis Ortega"),
        ("agent-31", "u-77", "team-b", "Priya Natarajan"),
    ] {
        let mapping = AgentMapping::new(agent, user, Some(team.into())).with_name(name);
        engine.put_mapping(mapping, &admin).await?;
        println!("   └─ {agent} → {user}@{team} ({name})");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Pull CRM updates
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⬇️  Pulling CRM updates...");
    let now = Utc::now();
    for (i, (call_id, agent)) in [
        ("CALL-1001", "agent-17"),
        ("CALL-1002", "agent-23"),
        ("CALL-1003", "agent-31"),
        ("CALL-1004", "agent-17"),
        ("CALL-1005", "agent-99"),
    ]
    .into_iter()
    .enumerate()
    {
        let mut raw = raw_call(call_id, agent);
        raw.call_datetime = now - Duration::minutes(10 * (5 - i as i64));
        raw.updated_at = raw.call_datetime;
        crm.respond(raw.clone());
        crm.push_update(raw);
    }
    transcripts.set("CALL-1001", TranscriptSignal::available(812, "Thanks for calling, how can I help?"));
    transcripts.set("CALL-1002", TranscriptSignal::status(TranscriptStatus::Processing));

    let summary = engine.sync_updates(&admin).await?;
    println!(
        "   └─ fetched {} (created {}, synced {}, failed {})",
        summary.fetched, summary.created, summary.synced, summary.failed
    );
    println!("   └─ watermark now {:?}", engine.watermark());

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Role-scoped reads
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔍 Manager view:");
    let page = engine.list(RecordFilter::default(), 1, Some(10), &Caller::manager()).await?;
    for record in &page.items {
        println!(
            "   └─ {} agent={} status={} transcript={} user={}",
            record.call_id,
            record.agent_id,
            record.sync_status,
            record.transcript.status(),
            record.app_user_id.as_deref().unwrap_or("-"),
        );
    }

    let auditor = Caller::auditor("team-a");
    let scoped = engine.list(RecordFilter::default(), 1, Some(10), &auditor).await?;
    println!("\n🔒 team-a auditor sees {} of {} records", scoped.total, page.total);

    match engine.resync("CALL-1001", &auditor).await {
        Ok(_) => println!("   └─ unexpected: auditor resync allowed"),
        Err(e) => println!("   └─ auditor resync refused: {e}"),
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Recover failures
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔁 Mapping agent-99 and retrying failed records (the CRM times out twice)...");
    crm.fail_first("CALL-1005", 2);
    engine
        .put_mapping(AgentMapping::new("agent-99", "u-90", Some("team-b".into())), &admin)
        .await?;
    let retried = engine.retry_failed(&admin).await?;
    println!("   └─ {retried}");

    let detail = engine.detail("CALL-1005", &admin).await?;
    for entry in &detail.sync_logs {
        println!(
            "   └─ {} {} {}",
            entry.action,
            entry.status,
            entry.result.as_deref().or(entry.error_message.as_deref()).unwrap_or("")
        );
    }

    let health = engine.health(&admin).await?;
    println!("\n❤️  Health:");
    println!("   └─ records: {}", health.total_records);
    println!("   └─ success rate: {:.1}%", health.success_rate);
    println!("   └─ errors: {}, stale: {}, pending: {}", health.error_count, health.stale_count, health.pending_syncs);
    println!("   └─ failures today: {}", health.failures_today);

    let errors = engine
        .list(RecordFilter::default().sync_status(SyncStatus::Error), 1, None, &admin)
        .await?;
    println!("   └─ still failing: {:?}", errors.items.iter().map(|r| &r.call_id).collect::<Vec<_>>());

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Dump raw metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    println!("\n🧹 Cleaning up {DB_PATH}...");
    for suffix in ["", "-shm", "-wal"] {
        let _ = std::fs::remove_file(format!("{DB_PATH}{suffix}"));
    }

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Print every captured metric, grouped by kind.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            match value {
                DebugValue::Counter(v) => format!("counter   {}{} = {}", key.name(), label_str, v),
                DebugValue::Gauge(v) => format!("gauge     {}{} = {:.2}", key.name(), label_str, v.into_inner()),
                DebugValue::Histogram(samples) => {
                    let count = samples.len();
                    let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                    format!("histogram {}{} count={} sum={:.4}", key.name(), label_str, count, sum)
                }
            }
        })
        .collect();
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {line}");
    }
}
