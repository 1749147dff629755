// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record and mapping storage.
//!
//! - [`memory`]: `DashMap`-backed stores for tests and single-process use
//! - [`sql`]: SQLite / MySQL through the sqlx `Any` driver

pub mod memory;
pub mod sql;
pub mod traits;

use std::sync::Arc;
use tracing::info;

use crate::config::SyncEngineConfig;
use traits::{MappingStore, RecordStore, StorageError};

/// Record and mapping stores sharing one backend.
#[derive(Clone)]
pub struct Stores {
    pub records: Arc<dyn RecordStore>,
    pub mappings: Arc<dyn MappingStore>,
}

/// Open the stores described by `config`: SQL when `sql_url` is set,
/// in-memory otherwise.
pub async fn open_stores(config: &SyncEngineConfig) -> Result<Stores, StorageError> {
    match config.sql_url.as_deref() {
        Some(url) => {
            let store = Arc::new(sql::SqlStore::new(url).await?);
            info!(backend = if url.starts_with("sqlite:") { "sqlite" } else { "mysql" }, "SQL stores ready");
            Ok(Stores { records: store.clone(), mappings: store })
        }
        None => {
            info!(backend = "memory", "in-memory stores ready");
            Ok(Stores {
                records: Arc::new(memory::InMemoryRecordStore::new()),
                mappings: Arc::new(memory::InMemoryMappingStore::new()),
            })
        }
    }
}
