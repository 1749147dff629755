// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy.
//!
//! Two families, handled very differently:
//!
//! - [`EngineError`] is a request-level failure returned to the caller
//!   (unknown record, caller not allowed, malformed request, store down).
//! - [`SyncFailure`] is the outcome of a failed sync step. It is never
//!   returned as an error: it is written into the record's sync log and the
//!   record's `sync_status`, and the caller gets a well-formed record back.

use std::time::Duration;
use thiserror::Error;

use crate::storage::traits::StorageError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A batch-level call to an external collaborator failed. Per-record
    /// failures are never reported this way.
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EngineError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden(_))
    }
}

/// Why a sync attempt failed. The `Display` form is what lands in
/// `SyncLogEntry::error_message` and `CrmRecord::sync_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncFailure {
    /// The CRM (or transcript pipeline) call failed
    #[error("pull: {0}")]
    Upstream(String),

    /// The CRM no longer knows the call
    #[error("pull: call {0} not found in CRM")]
    Vanished(String),

    #[error("pull: CRM circuit open, call not attempted")]
    CircuitOpen,

    #[error("deadline of {}ms exceeded", .0.as_millis())]
    DeadlineExceeded(Duration),

    /// Agent mapping missing or inconsistent
    #[error("map: {0}")]
    ValidationConflict(String),

    /// Pulled data breaks a data-model invariant
    #[error("save: {0}")]
    Integrity(String),

    #[error("save: {0}")]
    Storage(String),
}

impl SyncFailure {
    /// Label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Upstream(_) => "upstream",
            Self::Vanished(_) => "vanished",
            Self::CircuitOpen => "circuit_open",
            Self::DeadlineExceeded(_) => "deadline",
            Self::ValidationConflict(_) => "validation_conflict",
            Self::Integrity(_) => "integrity",
            Self::Storage(_) => "storage",
        }
    }
}
