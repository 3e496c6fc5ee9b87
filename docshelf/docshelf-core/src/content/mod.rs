//! Byte storage for document bodies, addressed by document path.

mod disk;
mod s3;

pub use disk::DiskContentStore;
pub use s3::S3ContentStore;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{EntityKind, Error, Result, Step};

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Returns [`Error::NotFound`] when nothing is stored at `path`.
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;
    /// Returns [`Error::NotFound`] when nothing is stored at `path`.
    async fn remove(&self, path: &str) -> Result<()>;
}

/// Process-local content store with switchable failures.
#[derive(Default)]
pub struct MemoryContentStore {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
    fail_removes: AtomicBool,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.read().contains_key(path)
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::not_found(EntityKind::Content, path))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::backend(
                Step::WriteContent,
                anyhow::anyhow!("forced write failure for {path}"),
            ));
        }
        self.files.write().insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(Error::backend(
                Step::RemoveContent,
                anyhow::anyhow!("forced remove failure for {path}"),
            ));
        }
        self.files
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(EntityKind::Content, path))
    }
}
