//! Document storage.
//!
//! A store durably holds exactly one current [`Document`]. It has no business
//! logic: ids, ordering and defaults are settled by the reconciler before a
//! document reaches [`DocumentStore::replace`].
//!
//! Backends:
//! - [`MemoryStore`]: process-local, for tests and throwaway runs
//! - [`JsonFileStore`]: one JSON file, replaced atomically
//! - [`PgDocumentStore`]: PostgreSQL via sqlx, one transaction per replace

mod file;
mod memory;
mod postgres;

pub use file::JsonFileStore;
pub use memory::MemoryStore;
pub use postgres::PgDocumentStore;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};
use crate::document::Document;
use crate::error::Result;

/// Persistence contract for the shared document.
///
/// Connectivity failures must surface as retryable errors
/// ([`crate::error::ErrorCode::StorageUnavailable`]) so the reconciler can
/// back off and try again.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load the current document.
    ///
    /// Returns defaults when nothing is stored yet or when the stored data
    /// cannot be read back. Malformed data is logged, never an error.
    async fn load(&self) -> Result<Document>;

    /// Atomically replace the stored document.
    ///
    /// Lines and people absent from `document` are deleted (a line's people
    /// first), matching ones updated in place and new ones inserted.
    async fn replace(&self, document: &Document) -> Result<()>;

    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;
}

/// Open the store selected by configuration.
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn DocumentStore>> {
    let store: Arc<dyn DocumentStore> = match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::File => Arc::new(JsonFileStore::new(&config.path)),
        StorageBackend::Postgres => {
            let store = PgDocumentStore::connect(config).await?;
            store.migrate().await?;
            Arc::new(store)
        }
    };

    tracing::info!(backend = store.backend(), "Document store opened");
    Ok(store)
}
