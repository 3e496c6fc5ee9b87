//! The document repository: one entry point over content, metadata and text search.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::content::ContentStore;
use crate::error::{Error, Result, Step};
use crate::id::Id;
use crate::model::{normalize_tags, path_from_title, validate_path, Document, Group, Policy, User};
use crate::protocol::WriteProtocol;
use crate::search::TextIndex;
use crate::storage::MetadataStore;

/// Criteria for [`DocumentRepository::list`]. Empty fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentFilter {
    pub prefix: String,
    pub query: String,
    pub tags: Vec<String>,
}

impl DocumentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

pub struct DocumentRepository {
    content: Arc<dyn ContentStore>,
    meta: Arc<dyn MetadataStore>,
    index: Arc<dyn TextIndex>,
}

impl DocumentRepository {
    pub fn new(
        content: Arc<dyn ContentStore>,
        meta: Arc<dyn MetadataStore>,
        index: Arc<dyn TextIndex>,
    ) -> Self {
        Self {
            content,
            meta,
            index,
        }
    }

    /// Look a document up by id, falling back to the path index.
    ///
    /// Ids are opaque, so every non-empty key is tried as one first.
    async fn resolve(&self, id_or_path: &str) -> Result<Document> {
        if !id_or_path.is_empty() {
            match self.meta.get_document(&Id::from(id_or_path)).await {
                Err(e) if e.is_not_found() => {}
                found => return found,
            }
        }
        self.meta.get_document_by_path(id_or_path).await
    }

    pub async fn get_document(&self, id_or_path: &str) -> Result<Document> {
        let mut doc = self.resolve(id_or_path).await?;
        doc.content = self.content.read(&doc.path).await?;
        Ok(doc)
    }

    /// Create (no id) or update a document.
    ///
    /// Content is written first, then the text index, then the metadata
    /// record. A failed metadata commit undoes the content and index writes.
    /// A failed index write does not stop the save; it is reported as
    /// [`Error::Indexing`] carrying the id of the saved document.
    pub async fn save_document(&self, mut doc: Document) -> Result<Id> {
        if doc.title.trim().is_empty() {
            return Err(Error::validation("title", "a document needs a title"));
        }
        doc.tags = normalize_tags(&doc.tags)?;

        let existing = match &doc.id {
            Some(id) => Some(self.meta.get_document(id).await?),
            None => None,
        };
        if doc.path.is_empty() {
            doc.path = match &existing {
                Some(prev) => prev.path.clone(),
                None => path_from_title(&doc.title),
            };
        }
        validate_path(&doc.path)?;
        self.meta
            .check_document_path(doc.id.as_ref(), &doc.path)
            .await?;

        // An in-place update must be able to put the old bytes back.
        let in_place = existing.as_ref().filter(|prev| prev.path == doc.path);
        let previous = match in_place {
            Some(_) => match self.content.read(&doc.path).await {
                Ok(bytes) => Some(bytes),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        let mut protocol = WriteProtocol::new();

        self.content.write(&doc.path, &doc.content).await?;
        {
            let content = Arc::clone(&self.content);
            let path = doc.path.clone();
            let previous = previous.clone();
            protocol.completed(Step::WriteContent, move || async move {
                match previous {
                    Some(bytes) => content.write(&path, &bytes).await,
                    None => content.remove(&path).await,
                }
            });
        }

        let indexed = self.index.index(&doc).await;
        match &indexed {
            Ok(()) => {
                let index = Arc::clone(&self.index);
                let path = doc.path.clone();
                let restore = in_place.cloned().map(|mut prev| {
                    prev.content = previous.unwrap_or_default();
                    prev
                });
                protocol.completed(Step::IndexText, move || async move {
                    match restore {
                        Some(prev) => index.index(&prev).await,
                        None => index.remove(&path).await,
                    }
                });
            }
            Err(e) => warn!(path = %doc.path, error = %e, "text indexing failed, saving anyway"),
        }

        doc.content = Vec::new();
        let path = doc.path.clone();
        let id = match self.meta.put_document(doc).await {
            Ok(id) => id,
            Err(e) => {
                warn!(path = %path, error = %e, "metadata commit failed, rolling back");
                return Err(protocol.unwind(e).await);
            }
        };
        protocol.finish();
        info!(%id, path = %path, "saved document");

        if let Some(prev) = existing.filter(|prev| prev.path != path) {
            self.forget_path(&prev.path).await;
        }

        match indexed {
            Ok(()) => Ok(id),
            Err(e) => Err(Error::Indexing {
                id,
                source: Box::new(e),
            }),
        }
    }

    /// Best-effort removal of the content and index entries left at a path
    /// a document no longer occupies.
    async fn forget_path(&self, path: &str) {
        match self.content.remove(path).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(path, error = %e, "failed to remove content at old path"),
        }
        if let Err(e) = self.index.remove(path).await {
            warn!(path, error = %e, "failed to remove old path from text index");
        }
    }

    /// Remove content first, then metadata.
    ///
    /// If the metadata removal fails after the content is gone, the record is
    /// orphaned. That is logged and returned; nothing is restored.
    pub async fn remove_document(&self, id_or_path: &str) -> Result<()> {
        let doc = self.resolve(id_or_path).await?;
        let id = record_id(&doc)?;

        match self.content.remove(&doc.path).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(path = %doc.path, "content already gone"),
            Err(e) => return Err(e),
        }

        if let Err(e) = self.meta.remove_document(&id).await {
            warn!(
                %id,
                path = %doc.path,
                error = %e,
                "content removed but metadata removal failed, record is orphaned"
            );
            return Err(e);
        }

        if let Err(e) = self.index.remove(&doc.path).await {
            warn!(path = %doc.path, error = %e, "failed to remove document from text index");
        }
        info!(%id, path = %doc.path, "removed document");
        Ok(())
    }

    pub async fn tag_document(&self, id_or_path: &str, tags: &[String]) -> Result<()> {
        let doc = self.resolve(id_or_path).await?;
        self.meta.tag_document(&record_id(&doc)?, tags).await
    }

    pub async fn resolve_tags(&self, tags: &[String]) -> Result<Vec<Id>> {
        self.meta.resolve_tags(tags).await
    }

    /// Documents matching `query` and carrying every tag in `tags`.
    pub async fn list_documents(&self, query: &str, tags: &[String]) -> Result<Vec<Document>> {
        self.list(&DocumentFilter {
            query: query.to_string(),
            tags: tags.to_vec(),
            ..Default::default()
        })
        .await
    }

    /// Resolve a listing. Results are sorted by path and carry no content.
    ///
    /// Text and tag candidates are gathered independently and intersected by
    /// id. Candidates that no longer resolve to a record are dropped.
    pub async fn list(&self, filter: &DocumentFilter) -> Result<Vec<Document>> {
        let query = filter.query.trim();
        let tags: Vec<String> = normalize_tags(&filter.tags)?.into_iter().collect();

        if query.is_empty() && tags.is_empty() {
            return self.meta.list_documents(&filter.prefix).await;
        }

        let text_hits = if query.is_empty() {
            None
        } else {
            let mut docs = Vec::new();
            for path in self.index.search(query).await? {
                if !path.starts_with(&filter.prefix) {
                    continue;
                }
                match self.meta.get_document_by_path(&path).await {
                    Ok(doc) => docs.push(doc),
                    Err(e) if e.is_not_found() => debug!(path = %path, "dropping stale text hit"),
                    Err(e) => return Err(e),
                }
            }
            Some(docs)
        };

        let mut docs = match (text_hits, tags.is_empty()) {
            (Some(docs), true) => docs,
            (Some(docs), false) => {
                let tagged: BTreeSet<Id> =
                    self.meta.resolve_tags(&tags).await?.into_iter().collect();
                docs.into_iter()
                    .filter(|doc| doc.id.as_ref().is_some_and(|id| tagged.contains(id)))
                    .collect()
            }
            (None, _) => {
                let ids = self.meta.resolve_tags(&tags).await?;
                let mut docs = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.meta.get_document(&id).await {
                        Ok(doc) => docs.push(doc),
                        Err(e) if e.is_not_found() => debug!(%id, "dropping stale tag entry"),
                        Err(e) => return Err(e),
                    }
                }
                docs
            }
        };

        // Index entries can lag behind the records they point at.
        docs.retain(|doc| {
            doc.path.starts_with(&filter.prefix) && tags.iter().all(|t| doc.tags.contains(t))
        });
        docs.sort_by(|a, b| a.path.cmp(&b.path));
        docs.dedup_by(|a, b| a.id == b.id);
        Ok(docs)
    }

    /// By id, or by email when the key contains `@`.
    pub async fn get_user(&self, id_or_email: &str) -> Result<User> {
        if id_or_email.contains('@') {
            self.meta.get_user_by_email(id_or_email).await
        } else {
            self.meta.get_user(&Id::from(id_or_email)).await
        }
    }

    pub async fn save_user(&self, user: User) -> Result<Id> {
        self.meta.put_user(user).await
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        self.meta.list_users().await
    }

    pub async fn remove_user(&self, id: &Id) -> Result<()> {
        self.meta.remove_user(id).await
    }

    pub async fn get_group(&self, id: &Id) -> Result<Group> {
        self.meta.get_group(id).await
    }

    pub async fn save_group(&self, group: Group) -> Result<Id> {
        self.meta.put_group(group).await
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        self.meta.list_groups().await
    }

    pub async fn remove_group(&self, id: &Id) -> Result<()> {
        self.meta.remove_group(id).await
    }

    pub async fn get_policy(&self, id: &Id) -> Result<Policy> {
        self.meta.get_policy(id).await
    }

    pub async fn save_policy(&self, policy: Policy) -> Result<Id> {
        self.meta.put_policy(policy).await
    }

    pub async fn list_policies(&self) -> Result<Vec<Policy>> {
        self.meta.list_policies().await
    }

    pub async fn remove_policy(&self, id: &Id) -> Result<()> {
        self.meta.remove_policy(id).await
    }
}

fn record_id(doc: &Document) -> Result<Id> {
    doc.id.clone().ok_or_else(|| {
        Error::backend(
            Step::ReadMetadata,
            anyhow::anyhow!("stored document {} has no id", doc.path),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_builder() {
        let filter = DocumentFilter::new()
            .prefix("guides/")
            .query("deploy")
            .tags(["ops"]);
        assert_eq!(filter.prefix, "guides/");
        assert_eq!(filter.query, "deploy");
        assert_eq!(filter.tags, vec!["ops"]);
    }

    #[test]
    fn stored_documents_need_an_id() {
        let err = record_id(&Document::new("t", "").with_path("t.md")).unwrap_err();
        assert_eq!(err.step(), Some(Step::ReadMetadata));
    }
}
