// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record queries.
//!
//! A [`RecordQuery`] bundles three things every read needs:
//!
//! - the caller's [`RecordFilter`] (search text, exact-match fields, dates)
//! - the [`Visibility`] predicate computed by the RBAC filter
//! - the [`Freshness`] used to classify synced records as stale
//!
//! Stores evaluate the whole query *before* paginating, so `total` always
//! counts exactly the records the caller may see.
//!
//! ```text
//! RecordFilter ─┐
//! Visibility ───┼─→ RecordQuery ─┬─→ RecordQuery::matches   (memory store)
//! Freshness ────┘                └─→ sql_translator         (SQL store)
//! ```

pub(crate) mod sql_translator;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::record::{CrmRecord, SyncStatus, TranscriptStatus};

/// Caller-supplied filter. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Case-insensitive substring over `call_id`, `agent_id` and `crm_user_id`
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub transcript_status: Option<TranscriptStatus>,
    /// Effective status, so `Stale` is a valid filter value
    #[serde(default)]
    pub sync_status: Option<SyncStatus>,
    /// Inclusive lower bound on `call_datetime`
    #[serde(default)]
    pub date_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `call_datetime`
    #[serde(default)]
    pub date_to: Option<DateTime<Utc>>,
}

impl RecordFilter {
    #[must_use]
    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    #[must_use]
    pub fn campaign(mut self, campaign_id: impl Into<String>) -> Self {
        self.campaign_id = Some(campaign_id.into());
        self
    }

    #[must_use]
    pub fn transcript_status(mut self, status: TranscriptStatus) -> Self {
        self.transcript_status = Some(status);
        self
    }

    #[must_use]
    pub fn sync_status(mut self, status: SyncStatus) -> Self {
        self.sync_status = Some(status);
        self
    }

    #[must_use]
    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.date_from = from;
        self.date_to = to;
        self
    }

    /// Search text, trimmed and lowercased, or `None` when blank.
    pub(crate) fn normalized_search(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }
}

/// Which records a request may touch, keyed on the CRM agent id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    /// No restriction
    All,
    /// Only records whose `agent_id` is in the set. An empty set sees nothing.
    Agents(BTreeSet<String>),
}

impl Visibility {
    #[must_use]
    pub fn nothing() -> Self {
        Self::Agents(BTreeSet::new())
    }

    #[must_use]
    pub fn allows(&self, agent_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Agents(agents) => agents.contains(agent_id),
        }
    }

    #[must_use]
    pub fn allows_record(&self, record: &CrmRecord) -> bool {
        self.allows(&record.agent_id)
    }
}

/// Reference point for stale classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub now: DateTime<Utc>,
    pub window: Duration,
}

impl Freshness {
    #[must_use]
    pub fn new(now: DateTime<Utc>, window: Duration) -> Self {
        Self { now, window }
    }

    /// Oldest `last_synced_at` still considered fresh.
    #[must_use]
    pub fn cutoff(&self) -> DateTime<Utc> {
        self.now - self.window
    }

    #[must_use]
    pub fn classify(&self, record: &CrmRecord) -> SyncStatus {
        record.effective_sync_status(self.now, self.window)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordQuery {
    pub filter: RecordFilter,
    pub visibility: Visibility,
    pub freshness: Freshness,
}

impl RecordQuery {
    #[must_use]
    pub fn new(filter: RecordFilter, visibility: Visibility, freshness: Freshness) -> Self {
        Self { filter, visibility, freshness }
    }

    /// Evaluate the full query against one record.
    #[must_use]
    pub fn matches(&self, record: &CrmRecord) -> bool {
        if !self.visibility.allows_record(record) {
            return false;
        }
        let f = &self.filter;
        if let Some(needle) = f.normalized_search() {
            let hit = [&record.call_id, &record.agent_id, &record.crm_user_id]
                .iter()
                .any(|field| field.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
        if let Some(ref campaign) = f.campaign_id {
            if record.campaign_id.as_deref() != Some(campaign.as_str()) {
                return false;
            }
        }
        if let Some(status) = f.transcript_status {
            if record.transcript.status() != status {
                return false;
            }
        }
        if let Some(status) = f.sync_status {
            if self.freshness.classify(record) != status {
                return false;
            }
        }
        if let Some(from) = f.date_from {
            if record.call_datetime < from {
                return false;
            }
        }
        if let Some(to) = f.date_to {
            if record.call_datetime > to {
                return false;
            }
        }
        true
    }
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    #[must_use]
    pub fn new(page: u32, page_size: u32) -> Self {
        Self { page, page_size }
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

/// One page of results plus the RBAC-accurate total.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    #[serde(rename = "records")]
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

impl<T> Page<T> {
    #[must_use]
    pub fn new(items: Vec<T>, total: u64, request: PageRequest) -> Self {
        let size = u64::from(request.page_size.max(1));
        Self {
            items,
            total,
            page: request.page,
            page_size: request.page_size,
            total_pages: total.div_ceil(size),
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            page_size: self.page_size,
            total_pages: self.total_pages,
        }
    }
}

/// List order: most recent call first, `call_id` as a stable tiebreaker.
pub fn recent_first(a: &CrmRecord, b: &CrmRecord) -> std::cmp::Ordering {
    b.call_datetime
        .cmp(&a.call_datetime)
        .then_with(|| a.call_id.cmp(&b.call_id))
}
