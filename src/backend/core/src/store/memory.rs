use async_trait::async_trait;
use parking_lot::RwLock;

use super::DocumentStore;
use crate::document::Document;
use crate::error::Result;

/// In-process store. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    document: RwLock<Option<Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an existing document.
    pub fn with_document(document: Document) -> Self {
        Self {
            document: RwLock::new(Some(document)),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self) -> Result<Document> {
        Ok(self.document.read().clone().unwrap_or_default())
    }

    async fn replace(&self, document: &Document) -> Result<()> {
        *self.document.write() = Some(document.clone());
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
