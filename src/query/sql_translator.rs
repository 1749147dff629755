// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Translate a [`RecordQuery`] into a parameterized SQL `WHERE` clause.
//!
//! Generated SQL uses `?` placeholders (SQLite and MySQL both accept them
//! through the sqlx `Any` driver). Timestamps are epoch milliseconds.
//!
//! ```sql
//! agent_id IN (?, ?)                                        -- visibility
//! (LOWER(call_id) LIKE ? ESCAPE '!' OR ...)                 -- search
//! sync_status = 'synced' AND last_synced_at >= ?            -- fresh
//! sync_status = 'synced' AND (last_synced_at IS NULL OR last_synced_at < ?)  -- stale
//! ```

use super::{RecordQuery, Visibility};
use crate::record::SyncStatus;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlParam {
    Text(String),
    Int(i64),
}

#[derive(Debug, Clone)]
pub(crate) struct SqlWhere {
    /// Clause without the `WHERE` keyword; `1=1` when unrestricted
    pub clause: String,
    pub params: Vec<SqlParam>,
}

pub(crate) fn translate(query: &RecordQuery) -> SqlWhere {
    let mut parts: Vec<String> = Vec::new();
    let mut params = Vec::new();

    match &query.visibility {
        Visibility::All => {}
        Visibility::Agents(agents) if agents.is_empty() => parts.push("1=0".into()),
        Visibility::Agents(agents) => {
            let placeholders = vec!["?"; agents.len()].join(", ");
            parts.push(format!("agent_id IN ({placeholders})"));
            params.extend(agents.iter().cloned().map(SqlParam::Text));
        }
    }

    let f = &query.filter;
    if let Some(needle) = f.normalized_search() {
        let pattern = format!("%{}%", escape_like(&needle));
        parts.push(
            "(LOWER(call_id) LIKE ? ESCAPE '!' OR LOWER(agent_id) LIKE ? ESCAPE '!' OR LOWER(crm_user_id) LIKE ? ESCAPE '!')"
                .into(),
        );
        for _ in 0..3 {
            params.push(SqlParam::Text(pattern.clone()));
        }
    }
    if let Some(ref campaign) = f.campaign_id {
        parts.push("campaign_id = ?".into());
        params.push(SqlParam::Text(campaign.clone()));
    }
    if let Some(status) = f.transcript_status {
        parts.push("transcript_status = ?".into());
        params.push(SqlParam::Text(status.as_str().into()));
    }
    if let Some(status) = f.sync_status {
        let cutoff = query.freshness.cutoff().timestamp_millis();
        match status {
            SyncStatus::Synced => {
                parts.push("(sync_status = 'synced' AND last_synced_at >= ?)".into());
                params.push(SqlParam::Int(cutoff));
            }
            SyncStatus::Stale => {
                parts.push(
                    "(sync_status = 'synced' AND (last_synced_at IS NULL OR last_synced_at < ?))".into(),
                );
                params.push(SqlParam::Int(cutoff));
            }
            other => {
                parts.push("sync_status = ?".into());
                params.push(SqlParam::Text(other.as_str().into()));
            }
        }
    }
    if let Some(from) = f.date_from {
        parts.push("call_datetime >= ?".into());
        params.push(SqlParam::Int(from.timestamp_millis()));
    }
    if let Some(to) = f.date_to {
        parts.push("call_datetime <= ?".into());
        params.push(SqlParam::Int(to.timestamp_millis()));
    }

    let clause = if parts.is_empty() { "1=1".to_string() } else { parts.join(" AND ") };
    SqlWhere { clause, params }
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '!') {
            out.push('!');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Freshness, RecordFilter};
    use chrono::{Duration, Utc};

    fn query(filter: RecordFilter, visibility: Visibility) -> RecordQuery {
        RecordQuery::new(filter, visibility, Freshness::new(Utc::now(), Duration::hours(1)))
    }

    #[test]
    fn test_unrestricted_query() {
        let sql = translate(&query(RecordFilter::default(), Visibility::All));
        assert_eq!(sql.clause, "1=1");
        assert!(sql.params.is_empty());
    }

    #[test]
    fn test_empty_visibility_matches_nothing() {
        let sql = translate(&query(RecordFilter::default(), Visibility::nothing()));
        assert_eq!(sql.clause, "1=0");
    }

    #[test]
    fn test_visibility_comes_first_with_one_param_per_agent() {
        let agents = ["A1".to_string(), "A2".to_string()].into_iter().collect();
        let sql = translate(&query(RecordFilter::default().campaign("c"), Visibility::Agents(agents)));
        assert!(sql.clause.starts_with("agent_id IN (?, ?)"));
        assert_eq!(
            sql.params,
            vec![
                SqlParam::Text("A1".into()),
                SqlParam::Text("A2".into()),
                SqlParam::Text("c".into())
            ]
        );
    }

    #[test]
    fn test_search_escapes_like_wildcards() {
        let sql = translate(&query(RecordFilter::default().search("50%_off"), Visibility::All));
        assert_eq!(sql.params.len(), 3);
        assert_eq!(sql.params[0], SqlParam::Text("%50!%!_off%".into()));
    }

    #[test]
    fn test_stale_filter_uses_cutoff() {
        let q = query(RecordFilter::default().sync_status(SyncStatus::Stale), Visibility::All);
        let sql = translate(&q);
        assert!(sql.clause.contains("last_synced_at < ?"));
        assert_eq!(sql.params, vec![SqlParam::Int(q.freshness.cutoff().timestamp_millis())]);
    }

    #[test]
    fn test_stored_status_filter_is_plain_equality() {
        let sql = translate(&query(RecordFilter::default().sync_status(SyncStatus::Error), Visibility::All));
        assert_eq!(sql.clause, "sync_status = ?");
        assert_eq!(sql.params, vec![SqlParam::Text("error".into())]);
    }
}
