//! Embedded metadata store on a single redb file.
//!
//! One table per entity kind plus the path, email and tag index tables, all
//! keyed by string and holding JSON (or raw id bytes for the single-valued
//! indices). Every mutation runs in one write transaction, so a record and
//! its index entries commit or roll back together.

use async_trait::async_trait;
use chrono::Utc;
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    check_email_owner, check_path_owner, decode, encode, ensure_active, intersect_all,
    prepare_document, prepare_user, stamp, tag_changes, MetadataStore, Record,
};
use crate::config::StoreConfig;
use crate::error::{EntityKind, Error, Result, ResultExt, Step};
use crate::id::{Id, IdGenerator, TimeOrderedIds};
use crate::model::{normalize_tags, Document, Group, Lifecycle, Policy, User};

type Def<'a> = TableDefinition<'a, &'static str, &'static [u8]>;
type WriteTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

fn def(name: &str) -> Def<'_> {
    TableDefinition::new(name)
}

/// Metadata in a single redb file. Transactions commit synchronously on the
/// calling task.
pub struct EmbeddedStore {
    db: Database,
    config: StoreConfig,
    ids: Arc<dyn IdGenerator>,
}

impl EmbeddedStore {
    /// Open (or create) the database at `path` and make sure every table exists.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).at(Step::Provision)?;
        }
        let db = Database::create(path).at(Step::Provision)?;

        let txn = db.begin_write().at(Step::Provision)?;
        for name in config.tables() {
            txn.open_table(def(&name)).at(Step::Provision)?;
        }
        txn.commit().at(Step::Provision)?;

        info!(path = %path.display(), "opened embedded metadata store");
        Ok(Self {
            db,
            config,
            ids: Arc::new(TimeOrderedIds),
        })
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    fn get_record<R: Record>(&self, table: &str, id: &Id) -> Result<R> {
        let txn = self.db.begin_read().at(Step::ReadMetadata)?;
        let records = txn.open_table(def(table)).at(Step::ReadMetadata)?;
        read_json(&records, id.as_str())?.ok_or_else(|| Error::not_found(R::KIND, id.as_str()))
    }

    fn list_records<R: Record>(&self, table: &str) -> Result<Vec<R>> {
        let txn = self.db.begin_read().at(Step::ReadMetadata)?;
        let records = txn.open_table(def(table)).at(Step::ReadMetadata)?;
        scan(&records)
    }

    fn put_record<R: Record>(&self, table: &str, mut record: R) -> Result<Id> {
        let txn = self.db.begin_write().at(Step::CommitMetadata)?;
        let id = {
            let mut records = txn.open_table(def(table)).at(Step::CommitMetadata)?;
            let existing: Option<R> = match record.id() {
                Some(id) => Some(
                    read_json(&records, id.as_str())?
                        .ok_or_else(|| Error::not_found(R::KIND, id.as_str()))?,
                ),
                None => None,
            };
            let id = stamp(&mut record, existing.as_ref(), self.ids.as_ref(), Utc::now());
            write_json(&mut records, id.as_str(), &record)?;
            id
        };
        txn.commit().at(Step::CommitMetadata)?;
        Ok(id)
    }

    fn remove_record(&self, table: &str, kind: EntityKind, id: &Id) -> Result<()> {
        let txn = self.db.begin_write().at(Step::RemoveMetadata)?;
        {
            let mut records = txn.open_table(def(table)).at(Step::RemoveMetadata)?;
            let existed = records.remove(id.as_str()).at(Step::RemoveMetadata)?.is_some();
            if !existed {
                return Err(Error::not_found(kind, id.as_str()));
            }
        }
        txn.commit().at(Step::RemoveMetadata)
    }
}

fn read_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<T>> {
    match table.get(key).at(Step::ReadMetadata)? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn read_id(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<Id>> {
    Ok(table
        .get(key)
        .at(Step::ReadMetadata)?
        .map(|guard| Id::from(String::from_utf8_lossy(guard.value()).into_owned())))
}

fn write_json<T: serde::Serialize>(table: &mut WriteTable<'_>, key: &str, value: &T) -> Result<()> {
    let bytes = encode(value)?;
    table.insert(key, bytes.as_slice()).at(Step::CommitMetadata)?;
    Ok(())
}

fn scan<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for entry in table.iter().at(Step::ReadMetadata)? {
        let (_, value) = entry.at(Step::ReadMetadata)?;
        out.push(decode(value.value())?);
    }
    Ok(out)
}

/// The document the path index points at, if any.
fn path_owner(
    docs: &impl ReadableTable<&'static str, &'static [u8]>,
    paths: &impl ReadableTable<&'static str, &'static [u8]>,
    path: &str,
) -> Result<Option<Document>> {
    match read_id(paths, path)? {
        Some(id) => read_json(docs, id.as_str()),
        None => Ok(None),
    }
}

fn tag_members(
    tags: &impl ReadableTable<&'static str, &'static [u8]>,
    tag: &str,
) -> Result<BTreeSet<Id>> {
    Ok(read_json(tags, tag)?.unwrap_or_default())
}

fn add_tag_member(tags: &mut WriteTable<'_>, tag: &str, id: &Id) -> Result<()> {
    let mut members = tag_members(&*tags, tag)?;
    if members.insert(id.clone()) {
        write_json(tags, tag, &members)?;
    }
    Ok(())
}

fn remove_tag_member(tags: &mut WriteTable<'_>, tag: &str, id: &Id) -> Result<()> {
    let mut members = tag_members(&*tags, tag)?;
    if !members.remove(id) {
        return Ok(());
    }
    if members.is_empty() {
        tags.remove(tag).at(Step::CommitMetadata)?;
    } else {
        write_json(tags, tag, &members)?;
    }
    Ok(())
}

/// Drop `key` from a single-valued index if it still points at `id`.
fn release(index: &mut WriteTable<'_>, key: &str, id: &Id) -> Result<()> {
    if read_id(&*index, key)?.as_ref() == Some(id) {
        index.remove(key).at(Step::CommitMetadata)?;
    }
    Ok(())
}

#[async_trait]
impl MetadataStore for EmbeddedStore {
    async fn get_document(&self, id: &Id) -> Result<Document> {
        self.get_record(&self.config.doc_table, id)
    }

    async fn get_document_by_path(&self, path: &str) -> Result<Document> {
        let txn = self.db.begin_read().at(Step::ReadMetadata)?;
        let docs = txn.open_table(def(&self.config.doc_table)).at(Step::ReadMetadata)?;
        let paths = txn
            .open_table(def(&self.config.doc_path_index))
            .at(Step::ReadMetadata)?;
        path_owner(&docs, &paths, path)?
            .filter(|doc| doc.path == path)
            .ok_or_else(|| Error::not_found(EntityKind::Document, path))
    }

    async fn list_documents(&self, prefix: &str) -> Result<Vec<Document>> {
        let txn = self.db.begin_read().at(Step::ReadMetadata)?;
        let docs = txn.open_table(def(&self.config.doc_table)).at(Step::ReadMetadata)?;

        let mut out: Vec<Document> = if prefix.is_empty() {
            scan(&docs)?
        } else {
            let paths = txn
                .open_table(def(&self.config.doc_path_index))
                .at(Step::ReadMetadata)?;
            let mut found = Vec::new();
            for entry in paths.range(prefix..).at(Step::ReadMetadata)? {
                let (path, id) = entry.at(Step::ReadMetadata)?;
                let path = path.value();
                if !path.starts_with(prefix) {
                    break;
                }
                let id = String::from_utf8_lossy(id.value()).into_owned();
                if let Some(doc) = read_json::<Document>(&docs, &id)? {
                    if doc.path == path {
                        found.push(doc);
                    }
                }
            }
            found
        };
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn check_document_path(&self, id: Option<&Id>, path: &str) -> Result<()> {
        let txn = self.db.begin_read().at(Step::ReadMetadata)?;
        let docs = txn.open_table(def(&self.config.doc_table)).at(Step::ReadMetadata)?;
        let paths = txn
            .open_table(def(&self.config.doc_path_index))
            .at(Step::ReadMetadata)?;
        check_path_owner(path, id, path_owner(&docs, &paths, path)?.as_ref())
    }

    async fn put_document(&self, mut doc: Document) -> Result<Id> {
        let txn = self.db.begin_write().at(Step::CommitMetadata)?;
        let id = {
            let mut docs = txn.open_table(def(&self.config.doc_table)).at(Step::CommitMetadata)?;
            let mut paths = txn
                .open_table(def(&self.config.doc_path_index))
                .at(Step::CommitMetadata)?;
            let mut tags = txn.open_table(def(&self.config.tag_table)).at(Step::CommitMetadata)?;

            let existing: Option<Document> = match &doc.id {
                Some(id) => Some(
                    read_json(&docs, id.as_str())?
                        .ok_or_else(|| Error::not_found(EntityKind::Document, id.as_str()))?,
                ),
                None => None,
            };
            let owner = path_owner(&docs, &paths, &doc.path)?;
            check_path_owner(&doc.path, doc.id.as_ref(), owner.as_ref())?;

            let id = prepare_document(&mut doc, existing.as_ref(), self.ids.as_ref(), Utc::now());
            write_json(&mut docs, id.as_str(), &doc)?;

            if let Some(prev) = existing.as_ref().filter(|prev| prev.path != doc.path) {
                release(&mut paths, &prev.path, &id)?;
            }
            paths
                .insert(doc.path.as_str(), id.as_str().as_bytes())
                .at(Step::CommitMetadata)?;

            let before = existing.map(|prev| prev.tags).unwrap_or_default();
            let (added, dropped) = tag_changes(&before, &doc.tags);
            for tag in &added {
                add_tag_member(&mut tags, tag, &id)?;
            }
            for tag in &dropped {
                remove_tag_member(&mut tags, tag, &id)?;
            }
            id
        };
        txn.commit().at(Step::CommitMetadata)?;
        debug!(%id, path = %doc.path, "document record committed");
        Ok(id)
    }

    async fn remove_document(&self, id: &Id) -> Result<()> {
        let txn = self.db.begin_write().at(Step::RemoveMetadata)?;
        {
            let mut docs = txn.open_table(def(&self.config.doc_table)).at(Step::RemoveMetadata)?;
            let mut paths = txn
                .open_table(def(&self.config.doc_path_index))
                .at(Step::RemoveMetadata)?;
            let mut tags = txn.open_table(def(&self.config.tag_table)).at(Step::RemoveMetadata)?;

            let removed: Document = match docs.remove(id.as_str()).at(Step::RemoveMetadata)? {
                Some(guard) => decode(guard.value())?,
                None => return Err(Error::not_found(EntityKind::Document, id.as_str())),
            };
            release(&mut paths, &removed.path, id)?;
            for tag in &removed.tags {
                remove_tag_member(&mut tags, tag, id)?;
            }
        }
        txn.commit().at(Step::RemoveMetadata)
    }

    async fn tag_document(&self, id: &Id, new_tags: &[String]) -> Result<()> {
        let new_tags = normalize_tags(new_tags)?;
        let txn = self.db.begin_write().at(Step::CommitMetadata)?;
        {
            let mut docs = txn.open_table(def(&self.config.doc_table)).at(Step::CommitMetadata)?;
            let mut tags = txn.open_table(def(&self.config.tag_table)).at(Step::CommitMetadata)?;

            let mut doc: Document = read_json(&docs, id.as_str())?
                .ok_or_else(|| Error::not_found(EntityKind::Document, id.as_str()))?;
            let mut changed = false;
            for tag in new_tags {
                add_tag_member(&mut tags, &tag, id)?;
                changed |= doc.tags.insert(tag);
            }
            if changed {
                doc.updated_at = Utc::now();
                write_json(&mut docs, id.as_str(), &doc)?;
            }
        }
        txn.commit().at(Step::CommitMetadata)
    }

    async fn tagged(&self, tag: &str) -> Result<Vec<Id>> {
        let txn = self.db.begin_read().at(Step::ReadMetadata)?;
        let tags = txn.open_table(def(&self.config.tag_table)).at(Step::ReadMetadata)?;
        Ok(tag_members(&tags, tag)?.into_iter().collect())
    }

    async fn resolve_tags(&self, tags: &[String]) -> Result<Vec<Id>> {
        let txn = self.db.begin_read().at(Step::ReadMetadata)?;
        let table = txn.open_table(def(&self.config.tag_table)).at(Step::ReadMetadata)?;
        let mut lists = Vec::with_capacity(tags.len());
        for tag in tags {
            let members = tag_members(&table, tag)?;
            if members.is_empty() {
                return Ok(Vec::new());
            }
            lists.push(members.into_iter().collect());
        }
        Ok(intersect_all(lists))
    }

    async fn get_user(&self, id: &Id) -> Result<User> {
        let user: User = self.get_record(&self.config.user_table, id)?;
        ensure_active(user, id.as_str())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<User> {
        let txn = self.db.begin_read().at(Step::ReadMetadata)?;
        let users = txn.open_table(def(&self.config.user_table)).at(Step::ReadMetadata)?;
        let emails = txn
            .open_table(def(&self.config.user_email_index))
            .at(Step::ReadMetadata)?;
        let user = match read_id(&emails, email)? {
            Some(id) => read_json::<User>(&users, id.as_str())?,
            None => None,
        };
        match user.filter(|u| u.email == email) {
            Some(user) => ensure_active(user, email),
            None => Err(Error::not_found(EntityKind::User, email)),
        }
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let mut users: Vec<User> = self.list_records(&self.config.user_table)?;
        users.retain(|u| u.lifecycle.is_active());
        Ok(users)
    }

    async fn put_user(&self, mut user: User) -> Result<Id> {
        let txn = self.db.begin_write().at(Step::CommitMetadata)?;
        let id = {
            let mut users = txn.open_table(def(&self.config.user_table)).at(Step::CommitMetadata)?;
            let mut emails = txn
                .open_table(def(&self.config.user_email_index))
                .at(Step::CommitMetadata)?;

            let existing = match &user.id {
                Some(id) => {
                    let found: User = read_json(&users, id.as_str())?
                        .ok_or_else(|| Error::not_found(EntityKind::User, id.as_str()))?;
                    Some(ensure_active(found, id.as_str())?)
                }
                None => None,
            };
            let id = prepare_user(&mut user, existing.as_ref(), self.ids.as_ref(), Utc::now())?;

            let owner = match read_id(&emails, &user.email)? {
                Some(owner_id) => read_json::<User>(&users, owner_id.as_str())?,
                None => None,
            };
            check_email_owner(&user.email, Some(&id), owner.as_ref())?;

            write_json(&mut users, id.as_str(), &user)?;
            if let Some(prev) = existing.as_ref().filter(|prev| prev.email != user.email) {
                release(&mut emails, &prev.email, &id)?;
            }
            emails
                .insert(user.email.as_str(), id.as_str().as_bytes())
                .at(Step::CommitMetadata)?;
            id
        };
        txn.commit().at(Step::CommitMetadata)?;
        Ok(id)
    }

    async fn remove_user(&self, id: &Id) -> Result<()> {
        let txn = self.db.begin_write().at(Step::RemoveMetadata)?;
        {
            let mut users = txn.open_table(def(&self.config.user_table)).at(Step::RemoveMetadata)?;
            let found: User = read_json(&users, id.as_str())?
                .ok_or_else(|| Error::not_found(EntityKind::User, id.as_str()))?;
            let mut user = ensure_active(found, id.as_str())?;
            let now = Utc::now();
            user.lifecycle = Lifecycle::Removed { at: now };
            user.updated_at = now;
            write_json(&mut users, id.as_str(), &user)?;
        }
        txn.commit().at(Step::RemoveMetadata)
    }

    async fn get_group(&self, id: &Id) -> Result<Group> {
        self.get_record(&self.config.group_table, id)
    }

    async fn list_groups(&self) -> Result<Vec<Group>> {
        self.list_records(&self.config.group_table)
    }

    async fn put_group(&self, group: Group) -> Result<Id> {
        self.put_record(&self.config.group_table, group)
    }

    async fn remove_group(&self, id: &Id) -> Result<()> {
        self.remove_record(&self.config.group_table, EntityKind::Group, id)
    }

    async fn get_policy(&self, id: &Id) -> Result<Policy> {
        self.get_record(&self.config.policy_table, id)
    }

    async fn list_policies(&self) -> Result<Vec<Policy>> {
        self.list_records(&self.config.policy_table)
    }

    async fn put_policy(&self, policy: Policy) -> Result<Id> {
        self.put_record(&self.config.policy_table, policy)
    }

    async fn remove_policy(&self, id: &Id) -> Result<()> {
        self.remove_record(&self.config.policy_table, EntityKind::Policy, id)
    }
}
