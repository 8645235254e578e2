//! Export bundles as JSON files in a local directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use async_trait::async_trait;
use uuid::Uuid;

use mdr_core::error::MdrError;
use mdr_core::ports::{BundleStore, Result};

#[derive(Debug, Clone)]
pub struct FsBundleStore {
    root: PathBuf,
}

impl FsBundleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl BundleStore for FsBundleStore {
    async fn store(&self, bytes: Vec<u8>) -> Result<String> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| anyhow!("creating {}: {e}", self.root.display()))?;
        let path = self.root.join(format!("{}.json", Uuid::new_v4()));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| anyhow!("writing {}: {e}", path.display()))?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "bundle stored");
        Ok(path.display().to_string())
    }

    async fn load(&self, location: &str) -> Result<Vec<u8>> {
        let path = self.contained(location).await?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(location, e))
    }
}

impl FsBundleStore {
    /// Canonical path of `location`, refused unless it lies under the root.
    async fn contained(&self, location: &str) -> Result<PathBuf> {
        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|e| io_error(location, e))?;
        let path = tokio::fs::canonicalize(location)
            .await
            .map_err(|e| io_error(location, e))?;
        if path.starts_with(&root) {
            Ok(path)
        } else {
            Err(MdrError::InvalidInput(format!(
                "{location} is outside the bundle directory"
            )))
        }
    }
}

fn io_error(location: &str, e: std::io::Error) -> MdrError {
    if e.kind() == ErrorKind::NotFound {
        MdrError::NotFound(format!("bundle {location}"))
    } else {
        MdrError::Internal(anyhow!("reading {location}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_and_loads() {
        let dir = std::env::temp_dir().join(format!("mdr-bundles-{}", Uuid::new_v4()));
        let store = FsBundleStore::new(&dir);
        let location = store.store(b"{\"elements\":[]}".to_vec()).await.unwrap();
        assert!(location.starts_with(&dir.display().to_string()));
        assert_eq!(store.load(&location).await.unwrap(), b"{\"elements\":[]}");

        let missing = dir.join("nope.json").display().to_string();
        assert!(matches!(
            store.load(&missing).await,
            Err(MdrError::NotFound(_))
        ));
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn refuses_paths_outside_the_root() {
        let base = std::env::temp_dir().join(format!("mdr-bundles-{}", Uuid::new_v4()));
        let store = FsBundleStore::new(base.join("bundles"));
        store.store(b"{}".to_vec()).await.unwrap();
        let outside = base.join("secret.json");
        tokio::fs::write(&outside, b"{}").await.unwrap();

        let direct = outside.display().to_string();
        assert!(matches!(
            store.load(&direct).await,
            Err(MdrError::InvalidInput(_))
        ));
        let traversal = base.join("bundles/../secret.json").display().to_string();
        assert!(matches!(
            store.load(&traversal).await,
            Err(MdrError::InvalidInput(_))
        ));
        tokio::fs::remove_dir_all(&base).await.unwrap();
    }
}
