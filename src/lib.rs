// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # CRM Sync Engine
//!
//! Keeps an internal store of call records consistent with an external
//! CRM / recording source, tracks each call's transcript availability, and
//! serves role-scoped, auditable views of that state.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 SyncEngine (caller-facing API)              │
//! │  • list / detail / health / trends        (reads)          │
//! │  • resync / validate_mapping / retry_failed / sync_updates │
//! └─────────────────────────────────────────────────────────────┘
//!          │ scope once per request            │ mutate
//!          ▼                                   ▼
//! ┌──────────────────────┐      ┌──────────────────────────────┐
//! │   RBAC View Filter   │      │   Pipeline: pull → map → save │
//! │  role → capability   │      │  • per-record lock            │
//! │  auditor → team      │      │  • retry + circuit breaker    │
//! │  agents              │      │  • deadline per attempt       │
//! └──────────────────────┘      └──────────────────────────────┘
//!          │                                   │
//!          ▼                                   ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Record Store (memory / SQLite / MySQL)   Mapping Resolver  │
//! │  • record + log entry commit atomically   • cycle cache     │
//! │  • optimistic version check               • one active per  │
//! │                                             agent           │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │ read-only pass
//!                     Health Aggregator
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use crm_sync_engine::{AgentMapping, Caller, SyncEngine, SyncEngineConfig};
//! # use crm_sync_engine::source::CrmSource;
//! # use std::sync::Arc;
//!
//! # async fn example(crm: Arc<dyn CrmSource>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncEngineConfig {
//!     sql_url: Some("sqlite:crm.db?mode=rwc".into()),
//!     ..Default::default()
//! };
//! let engine = SyncEngine::connect(config, crm).await?;
//!
//! let admin = Caller::admin();
//! engine.put_mapping(AgentMapping::new("agent-17", "u-42", Some("team-a".into())), &admin).await?;
//! engine.sync_updates(&admin).await?;
//!
//! let retried = engine.retry_failed(&admin).await?;
//! println!("{retried}");
//!
//! let health = engine.health(&Caller::auditor("team-a")).await?;
//! println!("success rate {:.1}%", health.success_rate);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`SyncEngine`] and its pipeline
//! - [`storage`]: record and mapping stores (memory, SQL)
//! - [`mapping`]: agent mapping resolution and its cache
//! - [`rbac`]: roles, capabilities and access scopes
//! - [`health`]: snapshot and trend aggregation
//! - [`source`]: traits for the CRM, transcription and audit collaborators
//! - [`resilience`]: retry and circuit breaker

pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod mapping;
pub mod metrics;
pub mod query;
pub mod rbac;
pub mod record;
pub mod resilience;
pub mod source;
pub mod storage;

#[cfg(any(test, feature = "test-utils"))]
pub mod fixtures;

pub use config::SyncEngineConfig;
pub use coordinator::{PullSummary, RecordDetail, RetrySummary, SyncEngine};
pub use error::{EngineError, SyncFailure};
pub use health::{HealthSnapshot, TrendPoint};
pub use mapping::{AgentMapping, MappingCacheStats, MappingVerdict, ValidationResult};
pub use query::{Page, PageRequest, RecordFilter};
pub use rbac::{Caller, Capability, Role};
pub use record::{
    CrmRecord, LogStatus, SyncAction, SyncLogEntry, SyncStatus, TranscriptSignal, TranscriptState,
    TranscriptStatus,
};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
pub use resilience::retry::RetryConfig;
pub use source::{AuditInfo, RawCallRecord, SourceError};
pub use storage::traits::StorageError;
pub use metrics::LatencyTimer;
