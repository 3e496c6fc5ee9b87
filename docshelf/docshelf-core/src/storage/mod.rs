//! Metadata storage: entity records plus the secondary indices kept beside them.
//!
//! Two backends implement [`MetadataStore`]:
//! - [`EmbeddedStore`]: a single redb file. Every record write commits
//!   together with its path, email and tag index entries in one transaction.
//! - [`DistributedStore`]: per-item tables behind an [`ItemClient`]. Record
//!   and index writes are independent item operations; a failure between them
//!   can leave an index entry stale, which reads verify against the record.

pub mod distributed;
pub mod embedded;

#[cfg(test)]
mod tests;

pub use distributed::{DistributedStore, DynamoItemClient, ItemClient, MemoryItemClient};
pub use embedded::EmbeddedStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeSet;

use crate::error::{EntityKind, Error, Result, ResultExt, Step};
use crate::id::{Id, IdGenerator};
use crate::model::{Document, Group, Lifecycle, Policy, User};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_document(&self, id: &Id) -> Result<Document>;
    async fn get_document_by_path(&self, path: &str) -> Result<Document>;
    /// Documents whose path starts with `prefix`. An empty prefix lists everything.
    async fn list_documents(&self, prefix: &str) -> Result<Vec<Document>>;
    /// [`Error::Conflict`] when `path` is owned by a document other than `id`.
    async fn check_document_path(&self, id: Option<&Id>, path: &str) -> Result<()>;
    /// Create (no id) or update a document record together with its path and tag entries.
    async fn put_document(&self, doc: Document) -> Result<Id>;
    async fn remove_document(&self, id: &Id) -> Result<()>;
    /// Add `tags` to the document and to each tag entry. Already-present tags are skipped.
    async fn tag_document(&self, id: &Id, tags: &[String]) -> Result<()>;
    /// Ids of the documents in a single tag entry; empty when the tag was never applied.
    async fn tagged(&self, tag: &str) -> Result<Vec<Id>>;
    /// Ids carrying every tag in `tags`.
    async fn resolve_tags(&self, tags: &[String]) -> Result<Vec<Id>>;

    /// [`Error::Removed`] for soft-deleted users.
    async fn get_user(&self, id: &Id) -> Result<User>;
    async fn get_user_by_email(&self, email: &str) -> Result<User>;
    /// Active users only.
    async fn list_users(&self) -> Result<Vec<User>>;
    async fn put_user(&self, user: User) -> Result<Id>;
    /// Soft delete: the record stays, marked [`Lifecycle::Removed`].
    async fn remove_user(&self, id: &Id) -> Result<()>;

    async fn get_group(&self, id: &Id) -> Result<Group>;
    async fn list_groups(&self) -> Result<Vec<Group>>;
    async fn put_group(&self, group: Group) -> Result<Id>;
    async fn remove_group(&self, id: &Id) -> Result<()>;

    async fn get_policy(&self, id: &Id) -> Result<Policy>;
    async fn list_policies(&self) -> Result<Vec<Policy>>;
    async fn put_policy(&self, policy: Policy) -> Result<Id>;
    async fn remove_policy(&self, id: &Id) -> Result<()>;
}

/// Bookkeeping shared by every persisted entity kind.
pub(crate) trait Record: Serialize + DeserializeOwned + Send + Sync {
    const KIND: EntityKind;

    fn id(&self) -> Option<&Id>;
    fn set_id(&mut self, id: Id);
    fn created_at(&self) -> DateTime<Utc>;
    fn set_created_at(&mut self, at: DateTime<Utc>);
    fn set_updated_at(&mut self, at: DateTime<Utc>);
}

macro_rules! impl_record {
    ($ty:ty, $kind:expr) => {
        impl Record for $ty {
            const KIND: EntityKind = $kind;

            fn id(&self) -> Option<&Id> {
                self.id.as_ref()
            }

            fn set_id(&mut self, id: Id) {
                self.id = Some(id);
            }

            fn created_at(&self) -> DateTime<Utc> {
                self.created_at
            }

            fn set_created_at(&mut self, at: DateTime<Utc>) {
                self.created_at = at;
            }

            fn set_updated_at(&mut self, at: DateTime<Utc>) {
                self.updated_at = at;
            }
        }
    };
}

impl_record!(Document, EntityKind::Document);
impl_record!(User, EntityKind::User);
impl_record!(Group, EntityKind::Group);
impl_record!(Policy, EntityKind::Policy);

/// Assign identity and timestamps before a record is written.
///
/// New records get a generated id and a creation time. Updates keep the
/// creation time of `existing`. Both refresh the update time.
pub(crate) fn stamp<R: Record>(
    record: &mut R,
    existing: Option<&R>,
    ids: &dyn IdGenerator,
    now: DateTime<Utc>,
) -> Id {
    match (record.id().cloned(), existing) {
        (Some(id), Some(existing)) => {
            record.set_created_at(existing.created_at());
            record.set_updated_at(now);
            id
        }
        (Some(id), None) => {
            record.set_created_at(now);
            record.set_updated_at(now);
            id
        }
        (None, _) => {
            let id = ids.generate();
            record.set_id(id.clone());
            record.set_created_at(now);
            record.set_updated_at(now);
            id
        }
    }
}

/// Document-specific carry-forward on top of [`stamp`].
pub(crate) fn prepare_document(
    doc: &mut Document,
    existing: Option<&Document>,
    ids: &dyn IdGenerator,
    now: DateTime<Utc>,
) -> Id {
    doc.content.clear();
    match existing {
        Some(existing) => doc.created_by = existing.created_by.clone(),
        None => {
            if doc.created_by.is_none() {
                doc.created_by = doc.updated_by.clone();
            }
        }
    }
    stamp(doc, existing, ids, now)
}

/// Validate and carry forward a user before it is written.
pub(crate) fn prepare_user(
    user: &mut User,
    existing: Option<&User>,
    ids: &dyn IdGenerator,
    now: DateTime<Utc>,
) -> Result<Id> {
    match existing {
        Some(existing) => {
            if user.email.is_empty() {
                user.email = existing.email.clone();
            }
            user.lifecycle = existing.lifecycle;
        }
        None => {
            if user.email.is_empty() {
                return Err(Error::validation(
                    "email",
                    "cannot create a user without an email address",
                ));
            }
            user.lifecycle = Lifecycle::Active;
        }
    }
    Ok(stamp(user, existing, ids, now))
}

/// Fail with [`Error::Removed`] for a soft-deleted user.
pub(crate) fn ensure_active(user: User, key: &str) -> Result<User> {
    match user.lifecycle {
        Lifecycle::Active => Ok(user),
        Lifecycle::Removed { at } => Err(Error::Removed {
            kind: EntityKind::User,
            key: key.to_string(),
            at,
        }),
    }
}

/// Decide whether `path` is free for document `id`.
///
/// `owner` is the record the path index currently resolves to. An index
/// entry whose record no longer carries `path` is stale and does not count.
pub(crate) fn check_path_owner(
    path: &str,
    id: Option<&Id>,
    owner: Option<&Document>,
) -> Result<()> {
    match owner {
        Some(owner) if owner.path == path && owner.id.as_ref() != id => {
            Err(Error::conflict(EntityKind::Document, path))
        }
        _ => Ok(()),
    }
}

/// Same rule as [`check_path_owner`] for the email index.
pub(crate) fn check_email_owner(email: &str, id: Option<&Id>, owner: Option<&User>) -> Result<()> {
    match owner {
        Some(owner)
            if owner.email == email && owner.lifecycle.is_active() && owner.id.as_ref() != id =>
        {
            Err(Error::conflict(EntityKind::User, email))
        }
        _ => Ok(()),
    }
}

/// Tags to add to and remove from the tag index when a document's tag set changes.
pub(crate) fn tag_changes(
    before: &BTreeSet<String>,
    after: &BTreeSet<String>,
) -> (Vec<String>, Vec<String>) {
    (
        after.difference(before).cloned().collect(),
        before.difference(after).cloned().collect(),
    )
}

/// Intersection of id lists. No lists yields no ids.
pub fn intersect_all<I>(lists: I) -> Vec<Id>
where
    I: IntoIterator<Item = Vec<Id>>,
{
    let mut lists = lists.into_iter();
    let Some(first) = lists.next() else {
        return Vec::new();
    };
    let mut acc: BTreeSet<Id> = first.into_iter().collect();
    for list in lists {
        let other: BTreeSet<Id> = list.into_iter().collect();
        acc.retain(|id| other.contains(id));
        if acc.is_empty() {
            break;
        }
    }
    acc.into_iter().collect()
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).at(Step::CommitMetadata)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).at(Step::ReadMetadata)
}
