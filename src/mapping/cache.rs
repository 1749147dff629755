// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Agent mapping cache
//!
//! Caches resolver lookups (including "unmapped" answers) for the length of
//! one engine operation (an update pull, a resync or a bulk retry).
//!
//! # Invalidation contract
//!
//! - `put_mapping` for an agent → that agent's entry is dropped
//! - a new operation (`begin_cycle`) → every entry is dropped
//! - every invalidation bumps a generation; a store answer read before the
//!   bump is never cached after it (`insert_if_current`)
//!
//! ```text
//! resolve(agent)
//!       │
//!       ├─→ cached (Some or None) → return it        (hit)
//!       │
//!       └─→ not cached → MappingStore::active_for    (miss)
//!                           └─→ cache answer unless invalidated meanwhile
//! ```

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::AgentMapping;

pub struct MappingCache {
    /// crm_agent_id → active mapping, or `None` for a cached "unmapped"
    entries: DashMap<String, Option<AgentMapping>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    generation: AtomicU64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappingCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub entry_count: usize,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

impl MappingCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Outer `None` is a miss; `Some(None)` is a cached "unmapped".
    pub fn get(&self, crm_agent_id: &str) -> Option<Option<AgentMapping>> {
        match self.entries.get(crm_agent_id) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_mapping_cache(true);
                Some(entry.value().clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_mapping_cache(false);
                None
            }
        }
    }

    pub fn insert(&self, crm_agent_id: &str, mapping: Option<AgentMapping>) {
        self.entries.insert(crm_agent_id.to_string(), mapping);
    }

    /// Capture before reading the store; pass to `insert_if_current`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Cache a store answer read at `generation`. Returns `false` (and
    /// caches nothing) if an invalidation happened since.
    pub fn insert_if_current(&self, crm_agent_id: &str, mapping: Option<AgentMapping>, generation: u64) -> bool {
        // The shard lock held by `entry` orders this check against the
        // removal that follows every generation bump.
        let slot = self.entries.entry(crm_agent_id.to_string());
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        slot.insert(mapping);
        true
    }

    pub fn invalidate(&self, crm_agent_id: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.entries.remove(crm_agent_id).is_some() {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Start a new operation with an empty cache.
    pub fn begin_cycle(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
    }

    pub fn stats(&self) -> MappingCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        MappingCacheStats {
            hits,
            misses,
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entry_count: self.entries.len(),
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }
}

impl Default for MappingCache {
    fn default() -> Self {
        Self::new()
    }
}
