//! Free-text indexing of documents.
//!
//! A text index is keyed by document path and answers queries with the
//! matching paths. It never sees tags.

mod full_text;

pub use full_text::TantivyTextIndex;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result, Step};
use crate::model::Document;

#[async_trait]
pub trait TextIndex: Send + Sync {
    /// Index `doc` (title and content) under its path, replacing any earlier entry.
    async fn index(&self, doc: &Document) -> Result<()>;
    async fn search(&self, query: &str) -> Result<Vec<String>>;
    async fn remove(&self, path: &str) -> Result<()>;
}

/// Case-insensitive term matching over an in-process map.
///
/// A document matches when every whitespace-separated query term occurs in
/// its title or content.
#[derive(Default)]
pub struct MemoryTextIndex {
    docs: RwLock<BTreeMap<String, String>>,
    fail: AtomicBool,
}

impl MemoryTextIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_indexing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.docs.read().contains_key(path)
    }
}

#[async_trait]
impl TextIndex for MemoryTextIndex {
    async fn index(&self, doc: &Document) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::backend(
                Step::IndexText,
                anyhow::anyhow!("forced indexing failure for {}", doc.path),
            ));
        }
        let text = format!("{} {}", doc.title, doc.content_string()).to_lowercase();
        self.docs.write().insert(doc.path.clone(), text);
        Ok(())
    }

    async fn search(&self, query: &str) -> Result<Vec<String>> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .docs
            .read()
            .iter()
            .filter(|(_, text)| terms.iter().all(|t| text.contains(t.as_str())))
            .map(|(path, _)| path.clone())
            .collect())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.docs.write().remove(path);
        Ok(())
    }
}
