//! Metadata store over per-item tables.
//!
//! Records and index entries live in separate tables and are written with
//! independent item operations. Writes claim new index entries first, then
//! write the record (the commit point), then release stale entries. A
//! failure after the commit point only leaves stale index entries behind;
//! every index read is checked against the record it points at.

mod dynamo;
mod memory;

pub use dynamo::DynamoItemClient;
pub use memory::MemoryItemClient;

use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{
    check_email_owner, check_path_owner, ensure_active, intersect_all, prepare_document,
    prepare_user, stamp, tag_changes, MetadataStore, Record,
};
use crate::config::StoreConfig;
use crate::error::{EntityKind, Error, Result, ResultExt, Step};
use crate::id::{Id, IdGenerator, TimeOrderedIds};
use crate::model::{normalize_tags, Document, Group, Lifecycle, Policy, User};

/// Key/value access to a set of tables holding string bodies.
#[async_trait]
pub trait ItemClient: Send + Sync + 'static {
    /// Create `table` if needed and wait until it accepts traffic.
    async fn ensure_table(&self, table: &str) -> Result<()>;
    async fn get_item(&self, table: &str, key: &str) -> Result<Option<String>>;
    async fn put_item(&self, table: &str, key: &str, body: String) -> Result<()>;
    /// Deleting a missing key is not an error.
    async fn delete_item(&self, table: &str, key: &str) -> Result<()>;
    async fn scan(&self, table: &str) -> Result<Vec<(String, String)>>;
}

pub struct DistributedStore {
    client: Arc<dyn ItemClient>,
    config: StoreConfig,
    ids: Arc<dyn IdGenerator>,
}

impl DistributedStore {
    /// Provision every table concurrently. Any failed table fails the store.
    pub async fn new(client: Arc<dyn ItemClient>, config: StoreConfig) -> Result<Self> {
        provision(&client, config.tables()).await?;
        info!(tables = config.tables().len(), "distributed metadata store ready");
        Ok(Self {
            client,
            config,
            ids: Arc::new(TimeOrderedIds),
        })
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    async fn get_json<T: DeserializeOwned>(&self, table: &str, key: &str) -> Result<Option<T>> {
        match self.client.get_item(table, key).await? {
            Some(body) => Ok(Some(serde_json::from_str(&body).at(Step::ReadMetadata)?)),
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize + Sync>(&self, table: &str, key: &str, value: &T) -> Result<()> {
        let body = serde_json::to_string(value).at(Step::CommitMetadata)?;
        self.client.put_item(table, key, body).await
    }

    async fn get_record<R: Record>(&self, table: &str, id: &Id) -> Result<R> {
        self.get_json(table, id.as_str())
            .await?
            .ok_or_else(|| Error::not_found(R::KIND, id.as_str()))
    }

    async fn list_records<R: Record>(&self, table: &str) -> Result<Vec<R>> {
        self.client
            .scan(table)
            .await?
            .into_iter()
            .map(|(_, body)| serde_json::from_str(&body).at(Step::ReadMetadata))
            .collect()
    }

    async fn put_record<R: Record>(&self, table: &str, mut record: R) -> Result<Id> {
        let existing: Option<R> = match record.id() {
            Some(id) => Some(self.get_record(table, id).await?),
            None => None,
        };
        let id = stamp(&mut record, existing.as_ref(), self.ids.as_ref(), Utc::now());
        self.put_json(table, id.as_str(), &record).await?;
        Ok(id)
    }

    async fn remove_record<R: Record>(&self, table: &str, id: &Id) -> Result<()> {
        self.get_record::<R>(table, id).await?;
        self.client.delete_item(table, id.as_str()).await
    }

    async fn index_entry(&self, index: &str, key: &str) -> Result<Option<Id>> {
        Ok(self.client.get_item(index, key).await?.map(Id::from))
    }

    async fn path_owner(&self, path: &str) -> Result<Option<Document>> {
        match self.index_entry(&self.config.doc_path_index, path).await? {
            Some(id) => self.get_json(&self.config.doc_table, id.as_str()).await,
            None => Ok(None),
        }
    }

    async fn email_owner(&self, email: &str) -> Result<Option<User>> {
        match self.index_entry(&self.config.user_email_index, email).await? {
            Some(id) => self.get_json(&self.config.user_table, id.as_str()).await,
            None => Ok(None),
        }
    }

    /// Drop `key` from a single-valued index if it still points at `id`.
    async fn release(&self, index: &str, key: &str, id: &Id) -> Result<()> {
        if self.index_entry(index, key).await?.as_ref() == Some(id) {
            self.client.delete_item(index, key).await?;
        }
        Ok(())
    }

    async fn tag_members(&self, tag: &str) -> Result<BTreeSet<Id>> {
        Ok(self
            .get_json(&self.config.tag_table, tag)
            .await?
            .unwrap_or_default())
    }

    async fn add_tag_member(&self, tag: &str, id: &Id) -> Result<()> {
        let mut members = self.tag_members(tag).await?;
        if members.insert(id.clone()) {
            self.put_json(&self.config.tag_table, tag, &members).await?;
        }
        Ok(())
    }

    async fn remove_tag_member(&self, tag: &str, id: &Id) -> Result<()> {
        let mut members = self.tag_members(tag).await?;
        if !members.remove(id) {
            return Ok(());
        }
        if members.is_empty() {
            self.client.delete_item(&self.config.tag_table, tag).await
        } else {
            self.put_json(&self.config.tag_table, tag, &members).await
        }
    }

    /// Release index entries a committed document no longer owns.
    async fn cleanup_document(&self, id: &Id, old_path: Option<&str>, dropped: &[String]) {
        if let Some(path) = old_path {
            if let Err(e) = self.release(&self.config.doc_path_index, path, id).await {
                warn!(%id, path, error = %e, "failed to release old path index entry");
            }
        }
        for tag in dropped {
            if let Err(e) = self.remove_tag_member(tag, id).await {
                warn!(%id, tag = %tag, error = %e, "failed to update tag index");
            }
        }
    }
}

async fn provision(client: &Arc<dyn ItemClient>, tables: Vec<String>) -> Result<()> {
    let mut tasks = JoinSet::new();
    for table in tables {
        let client = Arc::clone(client);
        tasks.spawn(async move {
            let result = client.ensure_table(&table).await;
            (table, result)
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((table, Ok(()))) => debug!(table = %table, "table ready"),
            Ok((table, Err(e))) => {
                warn!(table = %table, error = %e, "table provisioning failed");
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(Error::backend(Step::Provision, e));
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[async_trait]
impl MetadataStore for DistributedStore {
    async fn get_document(&self, id: &Id) -> Result<Document> {
        self.get_record(&self.config.doc_table, id).await
    }

    async fn get_document_by_path(&self, path: &str) -> Result<Document> {
        self.path_owner(path)
            .await?
            .filter(|doc| doc.path == path)
            .ok_or_else(|| Error::not_found(EntityKind::Document, path))
    }

    async fn list_documents(&self, prefix: &str) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = self.list_records(&self.config.doc_table).await?;
        docs.retain(|doc| doc.path.starts_with(prefix));
        docs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(docs)
    }

    async fn check_document_path(&self, id: Option<&Id>, path: &str) -> Result<()> {
        check_path_owner(path, id, self.path_owner(path).await?.as_ref())
    }

    async fn put_document(&self, mut doc: Document) -> Result<Id> {
        let existing: Option<Document> = match &doc.id {
            Some(id) => Some(self.get_record(&self.config.doc_table, id).await?),
            None => None,
        };
        self.check_document_path(doc.id.as_ref(), &doc.path).await?;

        let id = prepare_document(&mut doc, existing.as_ref(), self.ids.as_ref(), Utc::now());
        let before = existing.as_ref().map(|prev| prev.tags.clone()).unwrap_or_default();
        let (added, dropped) = tag_changes(&before, &doc.tags);

        self.client
            .put_item(&self.config.doc_path_index, &doc.path, id.to_string())
            .await?;
        for tag in &added {
            self.add_tag_member(tag, &id).await?;
        }
        self.put_json(&self.config.doc_table, id.as_str(), &doc).await?;
        debug!(%id, path = %doc.path, "document record committed");

        let old_path = existing
            .as_ref()
            .map(|prev| prev.path.as_str())
            .filter(|old| *old != doc.path);
        self.cleanup_document(&id, old_path, &dropped).await;
        Ok(id)
    }

    async fn remove_document(&self, id: &Id) -> Result<()> {
        let doc: Document = self.get_record(&self.config.doc_table, id).await?;
        self.client
            .delete_item(&self.config.doc_table, id.as_str())
            .await?;

        let tags: Vec<String> = doc.tags.iter().cloned().collect();
        self.cleanup_document(id, Some(&doc.path), &tags).await;
        Ok(())
    }

    async fn tag_document(&self, id: &Id, tags: &[String]) -> Result<()> {
        let tags = normalize_tags(tags)?;
        let mut doc: Document = self.get_record(&self.config.doc_table, id).await?;

        let added: Vec<String> = tags.difference(&doc.tags).cloned().collect();
        for tag in &tags {
            self.add_tag_member(tag, id).await?;
        }
        if added.is_empty() {
            return Ok(());
        }
        doc.tags.extend(added);
        doc.updated_at = Utc::now();
        self.put_json(&self.config.doc_table, id.as_str(), &doc).await
    }

    async fn tagged(&self, tag: &str) -> Result<Vec<Id>> {
        Ok(self.tag_members(tag).await?.into_iter().collect())
    }

    async fn resolve_tags(&self, tags: &[String]) -> Result<Vec<Id>> {
        let mut lists = Vec::with_capacity(tags.len());
        for tag in tags {
            let members = self.tag_members(tag).await?;
            if members.is_empty() {
                return Ok(Vec::new());
            }
            lists.push(members.into_iter().collect());
        }
        Ok(intersect_all(lists))
    }

    async fn get_user(&self, id: &Id) -> Result<User> {
        let user: User = self.get_record(&self.config.user_table, id).await?;
        ensure_active(user, id.as_str())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<User> {
        match self.email_owner(email).await?.filter(|u| u.email == email) {
            Some(user) => ensure_active(user, email),
            None => Err(Error::not_found(EntityKind::User, email)),
        }
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let mut users: Vec<User> = self.list_records(&self.config.user_table).await?;
        users.retain(|u| u.lifecycle.is_active());
        Ok(users)
    }

    async fn put_user(&self, mut user: User) -> Result<Id> {
        let existing = match &user.id {
            Some(id) => {
                let found: User = self.get_record(&self.config.user_table, id).await?;
                Some(ensure_active(found, id.as_str())?)
            }
            None => None,
        };
        let id = prepare_user(&mut user, existing.as_ref(), self.ids.as_ref(), Utc::now())?;
        check_email_owner(&user.email, Some(&id), self.email_owner(&user.email).await?.as_ref())?;

        self.client
            .put_item(&self.config.user_email_index, &user.email, id.to_string())
            .await?;
        self.put_json(&self.config.user_table, id.as_str(), &user).await?;

        if let Some(prev) = existing.as_ref().filter(|prev| prev.email != user.email) {
            if let Err(e) = self.release(&self.config.user_email_index, &prev.email, &id).await {
                warn!(
                    %id,
                    email = %prev.email,
                    error = %e,
                    "failed to release old email index entry"
                );
            }
        }
        Ok(id)
    }

    async fn remove_user(&self, id: &Id) -> Result<()> {
        let found: User = self.get_record(&self.config.user_table, id).await?;
        let mut user = ensure_active(found, id.as_str())?;
        let now = Utc::now();
        user.lifecycle = Lifecycle::Removed { at: now };
        user.updated_at = now;
        self.put_json(&self.config.user_table, id.as_str(), &user).await
    }

    async fn get_group(&self, id: &Id) -> Result<Group> {
        self.get_record(&self.config.group_table, id).await
    }

    async fn list_groups(&self) -> Result<Vec<Group>> {
        self.list_records(&self.config.group_table).await
    }

    async fn put_group(&self, group: Group) -> Result<Id> {
        self.put_record(&self.config.group_table, group).await
    }

    async fn remove_group(&self, id: &Id) -> Result<()> {
        self.remove_record::<Group>(&self.config.group_table, id).await
    }

    async fn get_policy(&self, id: &Id) -> Result<Policy> {
        self.get_record(&self.config.policy_table, id).await
    }

    async fn list_policies(&self) -> Result<Vec<Policy>> {
        self.list_records(&self.config.policy_table).await
    }

    async fn put_policy(&self, policy: Policy) -> Result<Id> {
        self.put_record(&self.config.policy_table, policy).await
    }

    async fn remove_policy(&self, id: &Id) -> Result<()> {
        self.remove_record::<Policy>(&self.config.policy_table, id).await
    }
}
