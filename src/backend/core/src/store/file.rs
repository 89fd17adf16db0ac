use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::DocumentStore;
use crate::document::Document;
use crate::error::{Result, SyncError};

/// Stores the document as a single JSON file.
///
/// Writes go to a sibling temp file which is then renamed over the target, so
/// readers never observe a half-written document.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn load(&self) -> Result<Document> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file yet, using defaults");
                return Ok(Document::default());
            }
            Err(e) => return Err(SyncError::from(e)),
        };

        match serde_json::from_slice::<Document>(&bytes) {
            Ok(document) => Ok(document),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "State file is malformed, falling back to defaults"
                );
                Ok(Document::default())
            }
        }
    }

    async fn replace(&self, document: &Document) -> Result<()> {
        let json = serde_json::to_vec_pretty(document).map_err(|e| {
            SyncError::with_internal(
                crate::error::ErrorCode::SerializationError,
                "Failed to serialize state",
                e.to_string(),
            )
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, &json).await?;
        tokio::fs::rename(&temp, &self.path).await?;

        debug!(path = %self.path.display(), bytes = json.len(), "State file replaced");
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}
