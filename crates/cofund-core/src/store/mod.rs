//! Persistence for pledges, boosts, failure records, withdrawal schedules,
//! settlements and the activity log.
//!
//! Every read-then-decide sequence on a shared counter lives behind a single
//! store method so the backend can make it atomic.

mod memory;
mod postgres;
mod traits;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use traits::{
    AccountStore, ActivityStore, BoostRejection, BoostStore, FailureStore, FailureUpdate, PledgeStore,
    ResourceStore, Settlement, SettlementApplied, SettlementEffect, SettlementStore,
    StorageResult, Store, WithdrawalStore,
};

use crate::config::StorageConfig;
use crate::error::CofundError;
use std::sync::Arc;
use thiserror::Error;

/// Storage-specific errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness violation (e.g. open pledge already exists)
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),
}

impl From<StorageError> for CofundError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(message) => CofundError::NotFound(message),
            StorageError::Conflict(message) => CofundError::Conflict(message),
            StorageError::InvalidData(message) => CofundError::Serialization(message),
            StorageError::Connection(message) | StorageError::Query(message) => {
                CofundError::Persistence(message)
            }
        }
    }
}

/// Open the configured backend.
pub async fn bootstrap_store(config: &StorageConfig) -> Result<Arc<dyn Store>, CofundError> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresStore::connect(database_url, *max_connections).await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_keep_their_class() {
        assert!(matches!(
            CofundError::from(StorageError::Conflict("dup".into())),
            CofundError::Conflict(_)
        ));
        assert!(matches!(
            CofundError::from(StorageError::Query("boom".into())),
            CofundError::Persistence(_)
        ));
    }

    #[tokio::test]
    async fn memory_backend_bootstraps() {
        let store = bootstrap_store(&StorageConfig::memory()).await.unwrap();
        assert_eq!(store.backend_label(), "memory");
    }
}
