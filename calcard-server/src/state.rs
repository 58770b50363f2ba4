use std::sync::Arc;

use anyhow::Result;
use calcard_core::config::{DatabaseLocation, ServerConfig};
use calcard_core::{CalendarService, ComponentStore, MemoryStore, SqliteStore};
use tracing::info;

use crate::singleton::{self, LockGuard};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: CalendarService<dyn ComponentStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn ComponentStore>, max_instances: u16) -> Self {
        AppState {
            service: CalendarService::new(store, max_instances),
        }
    }

    /// Open the configured store. A file database is locked for the life of
    /// the returned guard.
    pub fn open(config: &ServerConfig) -> Result<(Self, Option<LockGuard>)> {
        let (store, lock): (Arc<dyn ComponentStore>, _) = match config.database_location() {
            DatabaseLocation::Memory => {
                info!("Using in-memory store; data is lost on exit");
                (Arc::new(MemoryStore::new()), None)
            }
            DatabaseLocation::Sqlite(path) => {
                let lock = singleton::acquire_lock(&path)?;
                (Arc::new(SqliteStore::open(&path)?), Some(lock))
            }
        };
        Ok((Self::new(store, config.max_instances_per_series), lock))
    }
}
