use anyhow::{anyhow, bail, Result};
use argon2::password_hash::{PasswordHasher, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use docshelf_core::config::{Config, ContentBackend, MetadataBackend};
use docshelf_core::content::{ContentStore, DiskContentStore, S3ContentStore};
use docshelf_core::search::{TantivyTextIndex, TextIndex};
use docshelf_core::storage::{DistributedStore, DynamoItemClient, EmbeddedStore, MetadataStore};
use docshelf_core::{DocumentRepository, User};
use rand::RngCore;
use std::sync::Arc;
use tracing::info;

pub const ROOT_EMAIL: &str = "root@docshelf.io";

pub async fn build_repository(config: &Config) -> Result<DocumentRepository> {
    let content: Arc<dyn ContentStore> = match config.file_backend {
        ContentBackend::Disk => Arc::new(DiskContentStore::new(&config.file_prefix).await?),
        ContentBackend::S3 => {
            if config.s3_bucket.is_empty() {
                bail!("DS_S3_BUCKET must be set for the s3 file backend");
            }
            Arc::new(S3ContentStore::connect(&config.s3_bucket, &config.file_prefix).await?)
        }
    };

    let meta: Arc<dyn MetadataStore> = match config.backend {
        MetadataBackend::Embedded => {
            Arc::new(EmbeddedStore::open(&config.db_path, config.store.clone())?)
        }
        MetadataBackend::Dynamo => {
            let client = Arc::new(DynamoItemClient::connect().await);
            Arc::new(DistributedStore::new(client, config.store.clone()).await?)
        }
    };

    let index: Arc<dyn TextIndex> =
        Arc::new(TantivyTextIndex::open(&config.index_path)?.with_limit(config.search_limit));

    info!(backend = ?config.backend, files = ?config.file_backend, "docshelf ready");
    Ok(DocumentRepository::new(content, meta, index))
}

/// Create the root user unless an active one exists. Returns the clear
/// token of a newly created user.
pub async fn ensure_root_user(repo: &DocumentRepository) -> Result<Option<String>> {
    match repo.get_user(ROOT_EMAIL).await {
        Ok(_) => return Ok(None),
        Err(e) if e.is_not_found() || e.is_removed() => {}
        Err(e) => return Err(e.into()),
    }

    let token = random_token();
    let id = repo
        .save_user(User {
            email: ROOT_EMAIL.to_string(),
            name: "root".to_string(),
            token: hash_token(&token)?,
            ..Default::default()
        })
        .await?;
    info!(%id, token = %token, "created root user");
    Ok(Some(token))
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn hash_token(token: &str) -> Result<String> {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt).map_err(|e| anyhow!("salt: {e}"))?;
    let hash = Argon2::default()
        .hash_password(token.as_bytes(), &salt)
        .map_err(|e| anyhow!("hashing token: {e}"))?;
    Ok(hash.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::password_hash::{PasswordHash, PasswordVerifier};
    use docshelf_core::config::StoreConfig;
    use docshelf_core::content::MemoryContentStore;
    use docshelf_core::search::MemoryTextIndex;
    use tempfile::TempDir;

    fn repo(dir: &TempDir) -> DocumentRepository {
        let meta = EmbeddedStore::open(dir.path().join("docshelf.db"), StoreConfig::default())
            .unwrap();
        DocumentRepository::new(
            Arc::new(MemoryContentStore::new()),
            Arc::new(meta),
            Arc::new(MemoryTextIndex::new()),
        )
    }

    #[tokio::test]
    async fn root_user_is_created_once() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir);

        let token = ensure_root_user(&repo).await.unwrap().unwrap();
        assert!(ensure_root_user(&repo).await.unwrap().is_none());

        let root = repo.get_user(ROOT_EMAIL).await.unwrap();
        assert_ne!(root.token, token);
        let hash = PasswordHash::new(&root.token).unwrap();
        assert!(Argon2::default()
            .verify_password(token.as_bytes(), &hash)
            .is_ok());
    }

    #[tokio::test]
    async fn removed_root_is_recreated() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir);
        ensure_root_user(&repo).await.unwrap();
        let old = repo.get_user(ROOT_EMAIL).await.unwrap();
        repo.remove_user(old.id.as_ref().unwrap()).await.unwrap();

        assert!(ensure_root_user(&repo).await.unwrap().is_some());
        assert_ne!(repo.get_user(ROOT_EMAIL).await.unwrap().id, old.id);
    }

    #[test]
    fn tokens_are_random() {
        assert_ne!(random_token(), random_token());
        assert_eq!(random_token().len(), 43);
    }
}
