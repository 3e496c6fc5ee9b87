//! Behaviour every [`MetadataStore`] backend must share.

use std::sync::Arc;
use tempfile::TempDir;

use super::*;
use crate::config::StoreConfig;
use crate::model::{Document, Group, Policy, User};

async fn embedded() -> (EmbeddedStore, TempDir) {
    let dir = TempDir::new().unwrap();
    let store =
        EmbeddedStore::open(dir.path().join("docshelf.db"), StoreConfig::default()).unwrap();
    (store, dir)
}

async fn distributed() -> (DistributedStore, ()) {
    let store = DistributedStore::new(Arc::new(MemoryItemClient::new()), StoreConfig::default())
        .await
        .unwrap();
    (store, ())
}

macro_rules! for_each_backend {
    ($($name:ident),* $(,)?) => {
        mod embedded_backend {
            $(
                #[tokio::test]
                async fn $name() {
                    let (store, _guard) = super::embedded().await;
                    super::$name(&store).await;
                }
            )*
        }

        mod distributed_backend {
            $(
                #[tokio::test]
                async fn $name() {
                    let (store, _guard) = super::distributed().await;
                    super::$name(&store).await;
                }
            )*
        }
    };
}

for_each_backend!(
    document_round_trip,
    create_on_taken_path_conflicts,
    update_to_own_path_is_allowed,
    rename_moves_path_index,
    remove_erases_record_and_indices,
    tagging_is_idempotent,
    tag_queries_intersect,
    prefix_listing,
    user_soft_delete,
    user_email_is_unique_among_active_users,
    user_lookup_by_email,
    group_crud,
    policy_crud,
    updates_of_missing_records_fail,
);

fn tags(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

async fn document_round_trip(store: &dyn MetadataStore) {
    let mut doc = Document::new("Notes", "ignored by metadata")
        .with_path("notes.md")
        .with_tags(["work"]);
    doc.updated_by = Some("alice".into());
    let id = store.put_document(doc).await.unwrap();

    let stored = store.get_document(&id).await.unwrap();
    assert_eq!(stored.id, Some(id.clone()));
    assert_eq!(stored.path, "notes.md");
    assert!(stored.content.is_empty());
    assert_eq!(stored.created_by, Some("alice".into()));
    assert_eq!(stored.created_at, stored.updated_at);

    assert_eq!(store.get_document_by_path("notes.md").await.unwrap().id, Some(id));
}

async fn create_on_taken_path_conflicts(store: &dyn MetadataStore) {
    store
        .put_document(Document::new("A", "").with_path("a.md"))
        .await
        .unwrap();

    let err = store
        .put_document(Document::new("B", "").with_path("a.md"))
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "{err}");
    assert!(store.check_document_path(None, "a.md").await.unwrap_err().is_conflict());
}

async fn update_to_own_path_is_allowed(store: &dyn MetadataStore) {
    let id = store
        .put_document(Document::new("A", "").with_path("a.md"))
        .await
        .unwrap();
    store.check_document_path(Some(&id), "a.md").await.unwrap();

    let mut doc = store.get_document(&id).await.unwrap();
    let created_at = doc.created_at;
    doc.title = "A, revised".into();
    store.put_document(doc).await.unwrap();

    let stored = store.get_document(&id).await.unwrap();
    assert_eq!(stored.title, "A, revised");
    assert_eq!(stored.created_at, created_at);
    assert!(stored.updated_at >= created_at);
}

async fn rename_moves_path_index(store: &dyn MetadataStore) {
    let a = store
        .put_document(Document::new("A", "").with_path("a.md"))
        .await
        .unwrap();
    store
        .put_document(Document::new("B", "").with_path("b.md"))
        .await
        .unwrap();

    let mut doc = store.get_document(&a).await.unwrap();
    doc.path = "b.md".into();
    assert!(store.put_document(doc.clone()).await.unwrap_err().is_conflict());

    doc.path = "c.md".into();
    store.put_document(doc).await.unwrap();
    assert!(store.get_document_by_path("a.md").await.unwrap_err().is_not_found());
    assert_eq!(store.get_document_by_path("c.md").await.unwrap().id, Some(a));

    store
        .put_document(Document::new("New A", "").with_path("a.md"))
        .await
        .unwrap();
}

async fn remove_erases_record_and_indices(store: &dyn MetadataStore) {
    let id = store
        .put_document(Document::new("A", "").with_path("a.md").with_tags(["t"]))
        .await
        .unwrap();
    store.remove_document(&id).await.unwrap();

    assert!(store.get_document(&id).await.unwrap_err().is_not_found());
    assert!(store.get_document_by_path("a.md").await.unwrap_err().is_not_found());
    assert!(store.tagged("t").await.unwrap().is_empty());
    assert!(store.remove_document(&id).await.unwrap_err().is_not_found());
}

async fn tagging_is_idempotent(store: &dyn MetadataStore) {
    let id = store
        .put_document(Document::new("A", "").with_path("a.md"))
        .await
        .unwrap();

    store.tag_document(&id, &tags(&["x", "y"])).await.unwrap();
    store.tag_document(&id, &tags(&["x", "y"])).await.unwrap();

    let doc = store.get_document(&id).await.unwrap();
    assert_eq!(doc.tags.iter().cloned().collect::<Vec<_>>(), tags(&["x", "y"]));
    assert_eq!(store.tagged("x").await.unwrap(), vec![id.clone()]);
    assert_eq!(store.tagged("y").await.unwrap(), vec![id.clone()]);

    let missing = Id::from("missing");
    assert!(store.tag_document(&missing, &tags(&["x"])).await.unwrap_err().is_not_found());
    assert!(store.tag_document(&id, &tags(&[" "])).await.is_err());
}

async fn tag_queries_intersect(store: &dyn MetadataStore) {
    let a = store
        .put_document(Document::new("A", "").with_path("a.md").with_tags(["shared", "x"]))
        .await
        .unwrap();
    let b = store
        .put_document(Document::new("B", "").with_path("b.md").with_tags(["shared"]))
        .await
        .unwrap();

    let mut both = vec![a.clone(), b];
    both.sort();
    assert_eq!(store.resolve_tags(&tags(&["shared"])).await.unwrap(), both);
    assert_eq!(store.resolve_tags(&tags(&["shared", "x"])).await.unwrap(), vec![a.clone()]);
    assert!(store.resolve_tags(&tags(&["shared", "never"])).await.unwrap().is_empty());

    let mut doc = store.get_document(&a).await.unwrap();
    doc.tags.remove("x");
    store.put_document(doc).await.unwrap();
    assert!(store.tagged("x").await.unwrap().is_empty());
}

async fn prefix_listing(store: &dyn MetadataStore) {
    for path in ["guides/b.md", "notes.md", "guides/a.md", "guidebook.md"] {
        store
            .put_document(Document::new(path, "").with_path(path))
            .await
            .unwrap();
    }

    let paths = |docs: Vec<Document>| docs.into_iter().map(|d| d.path).collect::<Vec<_>>();
    assert_eq!(
        paths(store.list_documents("guides/").await.unwrap()),
        vec!["guides/a.md", "guides/b.md"]
    );
    assert_eq!(
        paths(store.list_documents("").await.unwrap()),
        vec!["guidebook.md", "guides/a.md", "guides/b.md", "notes.md"]
    );
    assert!(store.list_documents("zzz").await.unwrap().is_empty());
}

async fn user_soft_delete(store: &dyn MetadataStore) {
    let id = store
        .put_user(User {
            email: "ada@docshelf.io".into(),
            name: "Ada".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(store.list_users().await.unwrap().len(), 1);

    store.remove_user(&id).await.unwrap();

    assert!(store.get_user(&id).await.unwrap_err().is_removed());
    assert!(store.get_user_by_email("ada@docshelf.io").await.unwrap_err().is_removed());
    assert!(store.list_users().await.unwrap().is_empty());
    assert!(store.remove_user(&id).await.unwrap_err().is_removed());
    assert!(store.get_user(&Id::from("nobody")).await.unwrap_err().is_not_found());
}

async fn user_email_is_unique_among_active_users(store: &dyn MetadataStore) {
    let user = |email: &str| User {
        email: email.into(),
        ..Default::default()
    };
    let first = store.put_user(user("ada@docshelf.io")).await.unwrap();
    assert!(store.put_user(user("ada@docshelf.io")).await.unwrap_err().is_conflict());

    store.remove_user(&first).await.unwrap();
    let second = store.put_user(user("ada@docshelf.io")).await.unwrap();
    assert_eq!(store.get_user_by_email("ada@docshelf.io").await.unwrap().id, Some(second));

    assert!(matches!(
        store.put_user(User::default()).await.unwrap_err(),
        Error::Validation { field: "email", .. }
    ));
}

async fn user_lookup_by_email(store: &dyn MetadataStore) {
    let id = store
        .put_user(User {
            email: "old@docshelf.io".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let mut user = store.get_user(&id).await.unwrap();
    user.email = "new@docshelf.io".into();
    store.put_user(user).await.unwrap();

    assert_eq!(store.get_user_by_email("new@docshelf.io").await.unwrap().id, Some(id));
    assert!(store.get_user_by_email("old@docshelf.io").await.unwrap_err().is_not_found());
}

async fn group_crud(store: &dyn MetadataStore) {
    let id = store
        .put_group(Group {
            name: "writers".into(),
            users: vec!["u1".into(), "u1".into()],
            ..Default::default()
        })
        .await
        .unwrap();

    let mut group = store.get_group(&id).await.unwrap();
    assert_eq!(group.users.len(), 2);
    group.name = "editors".into();
    store.put_group(group).await.unwrap();
    assert_eq!(store.list_groups().await.unwrap()[0].name, "editors");

    store.remove_group(&id).await.unwrap();
    assert!(store.get_group(&id).await.unwrap_err().is_not_found());
    assert!(store.remove_group(&id).await.unwrap_err().is_not_found());
}

async fn policy_crud(store: &dyn MetadataStore) {
    let id = store
        .put_policy(Policy {
            groups: vec!["g1".into()],
            read_only: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(store.get_policy(&id).await.unwrap().read_only);
    assert_eq!(store.list_policies().await.unwrap().len(), 1);

    store.remove_policy(&id).await.unwrap();
    assert!(store.list_policies().await.unwrap().is_empty());
}

async fn updates_of_missing_records_fail(store: &dyn MetadataStore) {
    let ghost = || Some(Id::from("ghost"));
    let doc = Document {
        id: ghost(),
        path: "ghost.md".into(),
        ..Default::default()
    };
    assert!(store.put_document(doc).await.unwrap_err().is_not_found());
    let group = Group {
        id: ghost(),
        ..Default::default()
    };
    assert!(store.put_group(group).await.unwrap_err().is_not_found());
    let user = User {
        id: ghost(),
        email: "ghost@docshelf.io".into(),
        ..Default::default()
    };
    assert!(store.put_user(user).await.unwrap_err().is_not_found());
}
