use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::ContentStore;
use crate::error::{EntityKind, Error, Result, Step};

/// Content stored as plain files under a root directory.
pub struct DiskContentStore {
    root: PathBuf,
}

impl DiskContentStore {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::backend(Step::Provision, e))?;
        Ok(Self { root })
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn io_error(step: Step, path: &str, err: std::io::Error) -> Error {
        if err.kind() == ErrorKind::NotFound {
            Error::not_found(EntityKind::Content, path)
        } else {
            Error::backend(step, err)
        }
    }
}

#[async_trait]
impl ContentStore for DiskContentStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.full_path(path))
            .await
            .map_err(|e| Self::io_error(Step::ReadContent, path, e))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::backend(Step::WriteContent, e))?;
        }
        fs::write(&full, data)
            .await
            .map_err(|e| Error::backend(Step::WriteContent, e))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        fs::remove_file(self.full_path(path))
            .await
            .map_err(|e| Self::io_error(Step::RemoveContent, path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_create_intermediate_directories() {
        let dir = TempDir::new().unwrap();
        let store = DiskContentStore::new(dir.path()).await.unwrap();

        store.write("guides/setup/intro.md", b"# Intro").await.unwrap();

        assert_eq!(store.read("guides/setup/intro.md").await.unwrap(), b"# Intro");
        assert!(dir.path().join("guides/setup/intro.md").exists());
    }

    #[tokio::test]
    async fn missing_files_are_not_found() {
        let dir = TempDir::new().unwrap();
        let store = DiskContentStore::new(dir.path()).await.unwrap();

        assert!(store.read("nope.md").await.unwrap_err().is_not_found());
        assert!(store.remove("nope.md").await.unwrap_err().is_not_found());
    }
}
