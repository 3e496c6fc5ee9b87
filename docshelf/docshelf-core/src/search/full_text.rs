use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use tantivy::{
    collector::TopDocs,
    directory::MmapDirectory,
    doc,
    query::QueryParser,
    schema::{Field, Schema, STORED, STRING, TEXT},
    Index, IndexReader, IndexWriter, ReloadPolicy, Term,
};

use super::TextIndex;
use crate::config::DEFAULT_SEARCH_LIMIT;
use crate::error::{Error, Result, Step};
use crate::model::Document;

const WRITER_HEAP_BYTES: usize = 50_000_000;

/// Tantivy-backed text index. Entries are keyed by document path.
///
/// Writer commits run synchronously on the calling task.
pub struct TantivyTextIndex {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    limit: usize,
    path: Field,
    title: Field,
    content: Field,
}

impl TantivyTextIndex {
    /// Open the index stored at `dir`, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| Error::backend(Step::Provision, e))?;
        let mmap = MmapDirectory::open(dir).map_err(|e| Error::backend(Step::Provision, e))?;
        let index = Index::open_or_create(mmap, Self::schema())
            .map_err(|e| Error::backend(Step::Provision, e))?;
        Self::from_index(index)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_index(Index::create_in_ram(Self::schema()))
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn schema() -> Schema {
        let mut builder = Schema::builder();
        builder.add_text_field("path", STRING | STORED);
        builder.add_text_field("title", TEXT);
        builder.add_text_field("content", TEXT);
        builder.build()
    }

    fn from_index(index: Index) -> Result<Self> {
        let schema = index.schema();
        let field = |name: &str| {
            schema.get_field(name).ok_or_else(|| {
                Error::backend(Step::Provision, anyhow::anyhow!("index has no {name} field"))
            })
        };
        let path = field("path")?;
        let title = field("title")?;
        let content = field("content")?;

        let writer = index
            .writer(WRITER_HEAP_BYTES)
            .map_err(|e| Error::backend(Step::Provision, e))?;
        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e| Error::backend(Step::Provision, e))?;

        Ok(Self {
            index,
            reader,
            writer: Mutex::new(writer),
            limit: DEFAULT_SEARCH_LIMIT,
            path,
            title,
            content,
        })
    }

    fn commit(&self, writer: &mut IndexWriter, step: Step) -> Result<()> {
        writer.commit().map_err(|e| Error::backend(step, e))?;
        self.reader.reload().map_err(|e| Error::backend(step, e))
    }
}

#[async_trait]
impl TextIndex for TantivyTextIndex {
    async fn index(&self, doc: &Document) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.path, &doc.path));
        writer
            .add_document(doc!(
                self.path => doc.path.as_str(),
                self.title => doc.title.as_str(),
                self.content => doc.content_string(),
            ))
            .map_err(|e| Error::backend(Step::IndexText, e))?;
        self.commit(&mut writer, Step::IndexText)
    }

    async fn search(&self, query: &str) -> Result<Vec<String>> {
        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.title, self.content]);
        let q = parser
            .parse_query(query)
            .map_err(|e| Error::validation("query", e.to_string()))?;
        let hits = searcher
            .search(&q, &TopDocs::with_limit(self.limit))
            .map_err(|e| Error::backend(Step::SearchText, e))?;

        Ok(hits
            .into_iter()
            .filter_map(|(_score, addr)| {
                let retrieved = searcher.doc(addr).ok()?;
                retrieved
                    .get_first(self.path)
                    .and_then(|v| v.as_text())
                    .map(str::to_string)
            })
            .collect())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.path, path));
        self.commit(&mut writer, Step::IndexText)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn finds_documents_by_title_and_content() {
        let index = TantivyTextIndex::in_memory().unwrap();
        index
            .index(&Document::new("Release checklist", "tag the build").with_path("release.md"))
            .await
            .unwrap();
        index
            .index(&Document::new("Onboarding", "laptop setup").with_path("onboarding.md"))
            .await
            .unwrap();

        assert_eq!(index.search("checklist").await.unwrap(), vec!["release.md"]);
        assert_eq!(index.search("laptop").await.unwrap(), vec!["onboarding.md"]);
    }

    #[tokio::test]
    async fn reindex_and_remove_replace_entries() {
        let index = TantivyTextIndex::in_memory().unwrap();
        index
            .index(&Document::new("Plan", "alpha").with_path("plan.md"))
            .await
            .unwrap();
        index
            .index(&Document::new("Plan", "beta").with_path("plan.md"))
            .await
            .unwrap();

        assert!(index.search("alpha").await.unwrap().is_empty());
        assert_eq!(index.search("beta").await.unwrap(), vec!["plan.md"]);

        index.remove("plan.md").await.unwrap();
        assert!(index.search("beta").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reopens_from_disk() {
        let dir = TempDir::new().unwrap();
        {
            let index = TantivyTextIndex::open(dir.path()).unwrap();
            index
                .index(&Document::new("Persisted", "durable words").with_path("p.md"))
                .await
                .unwrap();
        }

        let index = TantivyTextIndex::open(dir.path()).unwrap();
        assert_eq!(index.search("durable").await.unwrap(), vec!["p.md"]);
    }

    #[tokio::test]
    async fn malformed_queries_are_validation_errors() {
        let index = TantivyTextIndex::in_memory().unwrap();
        let err = index.search("title:(").await.unwrap_err();
        assert!(matches!(err, Error::Validation { field: "query", .. }));
    }
}
