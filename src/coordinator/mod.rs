// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The [`SyncEngine`] ties the components together:
//! - record and mapping stores (in-memory or SQL)
//! - the mapping resolver with its cycle-scoped cache
//! - the RBAC filter that scopes every request
//! - the pull → map → save pipeline, guarded by per-record locks,
//!   a retry budget, a circuit breaker and a per-attempt deadline
//! - the health aggregator
//!
//! # Example
//!
//! ```rust,no_run
//! use crm_sync_engine::{Caller, RecordFilter, SyncEngine, SyncEngineConfig};
//! # use crm_sync_engine::source::CrmSource;
//! # use std::sync::Arc;
//!
//! # async fn example(crm: Arc<dyn CrmSource>) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = SyncEngine::connect(SyncEngineConfig::default(), crm).await?;
//!
//! let manager = Caller::manager();
//! let pulled = engine.sync_updates(&manager).await?;
//! println!("pulled {} calls", pulled.fetched);
//!
//! let page = engine.list(RecordFilter::default(), 1, None, &manager).await?;
//! println!("{} records, {} pages", page.total, page.total_pages);
//! # Ok(())
//! # }
//! ```

mod api;
mod locks;
mod pipeline;
mod types;

pub use types::{PullSummary, RecordDetail, RetrySummary};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::SyncEngineConfig;
use crate::health::HealthAggregator;
use crate::mapping::{MappingCache, MappingCacheStats, MappingResolver};
use crate::rbac::RbacFilter;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitState};
use crate::source::{AuditDirectory, CrmSource, TranscriptFeed};
use crate::storage::traits::StorageError;
use crate::storage::{open_stores, Stores};

use locks::KeyedLocks;
use pipeline::{PipelineSettings, SyncPipeline};

/// Main sync engine coordinator.
///
/// # Thread Safety
///
/// The engine is `Send + Sync` and designed for concurrent access. Reads
/// never take record locks; mutations of the same `call_id` are serialized
/// and mutations of distinct records run in parallel.
pub struct SyncEngine {
    pub(super) config: SyncEngineConfig,

    /// Pull → map → save, plus the stores and resolver it writes through
    pub(super) pipeline: SyncPipeline,

    pub(super) rbac: RbacFilter,

    pub(super) health: HealthAggregator,

    /// Audit lookups for `detail()` (optional)
    pub(super) audits: Option<Arc<dyn AuditDirectory>>,

    /// High-water mark of CRM `updated_at` seen by `sync_updates()`
    pub(super) watermark: parking_lot::Mutex<Option<DateTime<Utc>>>,

    /// One incremental pull cycle at a time
    pub(super) pull_cycle: tokio::sync::Mutex<()>,
}

impl SyncEngine {
    /// Create an engine over already opened stores.
    pub fn new(config: SyncEngineConfig, stores: Stores, source: Arc<dyn CrmSource>) -> Self {
        let resolver = MappingResolver::new(stores.mappings, Arc::new(MappingCache::new()));

        let breaker = (config.circuit_window > 0).then(|| {
            Arc::new(CircuitBreaker::new(
                "crm",
                CircuitConfig {
                    window: config.circuit_window,
                    recovery_timeout: Duration::from_secs(config.circuit_recovery_secs),
                    ..Default::default()
                },
            ))
        });

        let pipeline = SyncPipeline {
            store: stores.records.clone(),
            resolver: resolver.clone(),
            source,
            transcripts: None,
            breaker,
            locks: KeyedLocks::new(),
            settings: Arc::new(PipelineSettings::from_config(&config)),
        };

        info!(
            deadline_ms = config.attempt_deadline_ms,
            freshness_secs = config.freshness_window_secs,
            circuit_breaker = config.circuit_window > 0,
            "sync engine created"
        );

        Self {
            health: HealthAggregator::new(stores.records, config.freshness_window()),
            rbac: RbacFilter::new(resolver),
            pipeline,
            audits: None,
            watermark: parking_lot::Mutex::new(None),
            pull_cycle: tokio::sync::Mutex::new(()),
            config,
        }
    }

    /// Open the stores named by `config` (SQL or in-memory) and create the
    /// engine over them.
    pub async fn connect(config: SyncEngineConfig, source: Arc<dyn CrmSource>) -> Result<Self, StorageError> {
        let stores = open_stores(&config).await?;
        Ok(Self::new(config, stores, source))
    }

    /// Merge transcript signals from the transcription pipeline at pull time.
    #[must_use]
    pub fn with_transcript_feed(mut self, feed: Arc<dyn TranscriptFeed>) -> Self {
        self.pipeline.transcripts = Some(feed);
        self
    }

    /// Resolve `audit_id` links in `detail()`.
    #[must_use]
    pub fn with_audit_directory(mut self, directory: Arc<dyn AuditDirectory>) -> Self {
        self.audits = Some(directory);
        self
    }

    #[must_use]
    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    /// State of the CRM circuit breaker; `None` when it is disabled.
    #[must_use]
    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.pipeline.breaker.as_ref().map(|b| b.state())
    }

    #[must_use]
    pub fn mapping_cache_stats(&self) -> MappingCacheStats {
        self.pipeline.resolver.cache_stats()
    }

    /// Watermark the next `sync_updates()` will pull from.
    #[must_use]
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        *self.watermark.lock()
    }
}
