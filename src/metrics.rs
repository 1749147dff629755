// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the CRM sync engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `crm_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `action`: pull, map, save, resync, retry
//! - `outcome`: success, failure, conflict
//! - `kind`: failure class (upstream, deadline, validation_conflict, ...)

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::record::SyncAction;

/// Record the outcome of one sync attempt
pub fn record_attempt(action: SyncAction, outcome: &str) {
    counter!(
        "crm_sync_attempts_total",
        "action" => action.as_str(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a failed attempt by failure class
pub fn record_failure(action: SyncAction, kind: &'static str) {
    counter!(
        "crm_sync_failures_total",
        "action" => action.as_str(),
        "kind" => kind
    )
    .increment(1);
}

/// Record attempt latency
pub fn record_attempt_latency(action: SyncAction, duration: Duration) {
    histogram!(
        "crm_sync_attempt_seconds",
        "action" => action.as_str()
    )
    .record(duration.as_secs_f64());
}

/// Record an attempt cut off by its deadline
pub fn record_timeout(action: SyncAction) {
    counter!(
        "crm_sync_deadline_exceeded_total",
        "action" => action.as_str()
    )
    .increment(1);
}

/// Record an attempt discarded because another writer committed first
pub fn record_version_conflict(action: SyncAction) {
    counter!(
        "crm_sync_version_conflicts_total",
        "action" => action.as_str()
    )
    .increment(1);
}

/// Record circuit breaker state change
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "crm_sync_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "crm_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a `retry_failed` batch
pub fn record_retry_batch(attempted: usize, succeeded: usize) {
    histogram!("crm_sync_retry_batch_size").record(attempted as f64);
    counter!("crm_sync_retry_recovered_total").increment(succeeded as u64);
}

/// Record an incremental pull cycle
pub fn record_pull_cycle(pulled: usize, failed: usize) {
    counter!("crm_sync_pulled_records_total").increment(pulled as u64);
    counter!("crm_sync_pull_failures_total").increment(failed as u64);
}

/// Record a mapping cache lookup
pub fn record_mapping_cache(hit: bool) {
    counter!(
        "crm_sync_mapping_cache_total",
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Record an RBAC rejection
pub fn record_forbidden(operation: &'static str) {
    counter!(
        "crm_sync_forbidden_total",
        "operation" => operation
    )
    .increment(1);
}

/// Health gauges, refreshed on every snapshot
pub fn set_health(total: u64, pending: u64, errors: u64, stale: u64, success_rate: f64) {
    gauge!("crm_sync_records").set(total as f64);
    gauge!("crm_sync_records_pending").set(pending as f64);
    gauge!("crm_sync_records_error").set(errors as f64);
    gauge!("crm_sync_records_stale").set(stale as f64);
    gauge!("crm_sync_success_rate").set(success_rate);
}

/// A timing guard that records attempt latency on drop
pub struct LatencyTimer {
    action: SyncAction,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(action: SyncAction) -> Self {
        Self { action, start: Instant::now() }
    }

    /// Elapsed time so far, in whole milliseconds
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_attempt_latency(self.action, self.start.elapsed());
    }
}
