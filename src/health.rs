// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Health statistics over the record population.
//!
//! Both aggregations take one read-only pass over the store and never lock
//! it as a whole: a record written mid-scan shows up in its old or its new
//! state, never a mixture.
//!
//! Trend buckets are calendar days in the reporting timezone. A window of
//! `n` days ends with today and always yields `n` points, zero-filled.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::query::{Freshness, RecordFilter, RecordQuery, Visibility};
use crate::record::SyncStatus;
use crate::storage::traits::{RecordStore, StorageError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub total_records: u64,
    /// Records whose last successful sync happened today
    pub records_synced_today: u64,
    /// Failed attempts logged today
    pub failures_today: u64,
    /// Mean duration of each record's most recent successful sync attempt
    /// (pull, resync or retry)
    pub average_latency_ms: f64,
    /// Stored-synced records (fresh or stale) over all records, in percent
    pub success_rate: f64,
    pub pending_syncs: u64,
    pub error_count: u64,
    pub stale_count: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub success_count: u64,
    pub failure_count: u64,
    /// Distinct records touched that day
    pub total_records: u64,
}

impl TrendPoint {
    fn empty(date: NaiveDate) -> Self {
        Self { date, success_count: 0, failure_count: 0, total_records: 0 }
    }
}

/// `synced / total * 100`, or 0 for an empty population.
#[must_use]
pub fn success_rate(synced: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        synced as f64 / total as f64 * 100.0
    }
}

/// First instant of `date` in `tz`.
///
/// Midnight can fall in a DST gap (e.g. America/Santiago); the first valid
/// local time after it is used instead.
pub(crate) fn day_start(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_time(chrono::NaiveTime::MIN);
    for hour in 0..3 {
        if let Some(start) = tz.from_local_datetime(&(midnight + Duration::hours(hour))).earliest() {
            return start.with_timezone(&Utc);
        }
    }
    Utc.from_utc_datetime(&midnight)
}

pub struct HealthAggregator {
    store: Arc<dyn RecordStore>,
    freshness_window: Duration,
}

impl HealthAggregator {
    pub fn new(store: Arc<dyn RecordStore>, freshness_window: Duration) -> Self {
        Self { store, freshness_window }
    }

    /// Point-in-time statistics over the records `visibility` admits.
    pub async fn snapshot(
        &self,
        visibility: &Visibility,
        tz: Tz,
        now: DateTime<Utc>,
    ) -> Result<HealthSnapshot, StorageError> {
        let freshness = Freshness::new(now, self.freshness_window);
        let query = RecordQuery::new(RecordFilter::default(), visibility.clone(), freshness);
        let records = self.store.scan(&query).await?;

        let today_start = day_start(tz, now.with_timezone(&tz).date_naive());
        let mut snapshot = HealthSnapshot {
            total_records: records.len() as u64,
            records_synced_today: 0,
            failures_today: 0,
            average_latency_ms: 0.0,
            success_rate: 0.0,
            pending_syncs: 0,
            error_count: 0,
            stale_count: 0,
            last_sync_time: None,
        };
        let mut stored_synced = 0u64;
        let mut visible: HashSet<&str> = HashSet::with_capacity(records.len());

        for record in &records {
            visible.insert(record.call_id.as_str());
            match freshness.classify(record) {
                SyncStatus::Pending => snapshot.pending_syncs += 1,
                SyncStatus::Error => snapshot.error_count += 1,
                SyncStatus::Synced => stored_synced += 1,
                SyncStatus::Stale => {
                    stored_synced += 1;
                    snapshot.stale_count += 1;
                }
            }
            if let Some(at) = record.last_synced_at {
                if at >= today_start {
                    snapshot.records_synced_today += 1;
                }
                snapshot.last_sync_time = snapshot.last_sync_time.max(Some(at));
            }
        }
        snapshot.success_rate = success_rate(stored_synced, snapshot.total_records);

        snapshot.failures_today = self
            .store
            .logs_since(today_start)
            .await?
            .iter()
            .filter(|e| !e.is_success() && visible.contains(e.call_id.as_str()))
            .count() as u64;

        let latencies: Vec<u64> = self
            .store
            .latest_successes()
            .await?
            .into_iter()
            .filter(|e| visible.contains(e.call_id.as_str()))
            .map(|e| e.duration_ms)
            .collect();
        if !latencies.is_empty() {
            snapshot.average_latency_ms = latencies.iter().sum::<u64>() as f64 / latencies.len() as f64;
        }

        crate::metrics::set_health(
            snapshot.total_records,
            snapshot.pending_syncs,
            snapshot.error_count,
            snapshot.stale_count,
            snapshot.success_rate,
        );
        Ok(snapshot)
    }

    /// Daily success/failure counts for the `days` calendar days ending today.
    pub async fn trends(
        &self,
        days: u32,
        visibility: &Visibility,
        tz: Tz,
        now: DateTime<Utc>,
    ) -> Result<Vec<TrendPoint>, StorageError> {
        if days == 0 {
            return Ok(Vec::new());
        }
        let today = now.with_timezone(&tz).date_naive();
        let first = today - Duration::days(i64::from(days) - 1);

        let mut buckets: BTreeMap<NaiveDate, (TrendPoint, HashSet<String>)> = first
            .iter_days()
            .take(days as usize)
            .map(|d| (d, (TrendPoint::empty(d), HashSet::new())))
            .collect();

        let visible_ids = match visibility {
            Visibility::All => None,
            restricted => {
                let query = RecordQuery::new(
                    RecordFilter::default(),
                    restricted.clone(),
                    Freshness::new(now, self.freshness_window),
                );
                let ids: HashSet<String> = self.store.scan(&query).await?.into_iter().map(|r| r.call_id).collect();
                Some(ids)
            }
        };

        for entry in self.store.logs_since(day_start(tz, first)).await? {
            if let Some(ref ids) = visible_ids {
                if !ids.contains(&entry.call_id) {
                    continue;
                }
            }
            let date = entry.timestamp.with_timezone(&tz).date_naive();
            let Some((point, touched)) = buckets.get_mut(&date) else {
                continue;
            };
            if entry.is_success() {
                point.success_count += 1;
            } else {
                point.failure_count += 1;
            }
            touched.insert(entry.call_id);
        }

        Ok(buckets
            .into_values()
            .map(|(mut point, touched)| {
                point.total_records = touched.len() as u64;
                point
            })
            .collect())
    }
}
