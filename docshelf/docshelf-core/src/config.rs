//! Construction-time configuration.
//!
//! Values come from `DS_*` environment variables with the defaults below.

use std::path::PathBuf;

use crate::error::{Error, Result};

pub const DEFAULT_DOC_TABLE: &str = "docshelf_doc";
pub const DEFAULT_USER_TABLE: &str = "docshelf_user";
pub const DEFAULT_GROUP_TABLE: &str = "docshelf_group";
pub const DEFAULT_POLICY_TABLE: &str = "docshelf_policy";
pub const DEFAULT_TAG_TABLE: &str = "docshelf_tag";
pub const DEFAULT_SEARCH_LIMIT: usize = 1000;

/// Names of the keyed collections a metadata store persists into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub doc_table: String,
    pub doc_path_index: String,
    pub user_table: String,
    pub user_email_index: String,
    pub group_table: String,
    pub policy_table: String,
    pub tag_table: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::with_tables(
            DEFAULT_DOC_TABLE,
            DEFAULT_USER_TABLE,
            DEFAULT_GROUP_TABLE,
            DEFAULT_POLICY_TABLE,
            DEFAULT_TAG_TABLE,
        )
    }
}

impl StoreConfig {
    /// Index collections are named after the table they index.
    pub fn with_tables(doc: &str, user: &str, group: &str, policy: &str, tag: &str) -> Self {
        Self {
            doc_table: doc.to_string(),
            doc_path_index: format!("{doc}_path_idx"),
            user_table: user.to_string(),
            user_email_index: format!("{user}_email_idx"),
            group_table: group.to_string(),
            policy_table: policy.to_string(),
            tag_table: tag.to_string(),
        }
    }

    pub fn from_env() -> Self {
        Self::with_tables(
            &env_or("DS_DYNAMO_DOC_TABLE", DEFAULT_DOC_TABLE),
            &env_or("DS_DYNAMO_USER_TABLE", DEFAULT_USER_TABLE),
            &env_or("DS_DYNAMO_GROUP_TABLE", DEFAULT_GROUP_TABLE),
            &env_or("DS_DYNAMO_POLICY_TABLE", DEFAULT_POLICY_TABLE),
            &env_or("DS_DYNAMO_TAG_TABLE", DEFAULT_TAG_TABLE),
        )
    }

    /// Every collection, in provisioning order.
    pub fn tables(&self) -> Vec<String> {
        vec![
            self.doc_table.clone(),
            self.doc_path_index.clone(),
            self.user_table.clone(),
            self.user_email_index.clone(),
            self.group_table.clone(),
            self.policy_table.clone(),
            self.tag_table.clone(),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataBackend {
    /// Single-file transactional store.
    Embedded,
    /// Per-item managed table store.
    Dynamo,
}

impl MetadataBackend {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "bolt" | "embedded" | "redb" => Ok(MetadataBackend::Embedded),
            "dynamo" => Ok(MetadataBackend::Dynamo),
            other => Err(Error::validation(
                "backend",
                format!("unknown metadata backend {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentBackend {
    Disk,
    S3,
}

impl ContentBackend {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "disk" => Ok(ContentBackend::Disk),
            "s3" => Ok(ContentBackend::S3),
            other => Err(Error::validation(
                "file backend",
                format!("unknown content backend {other}"),
            )),
        }
    }
}

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: MetadataBackend,
    pub file_backend: ContentBackend,
    pub s3_bucket: String,
    /// Disk root for the disk backend, key prefix for S3.
    pub file_prefix: String,
    pub db_path: PathBuf,
    pub index_path: PathBuf,
    pub search_limit: usize,
    pub store: StoreConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let db_path = std::env::var("DS_DB_PATH")
            .or_else(|_| std::env::var("DS_BOLTDB_PATH"))
            .unwrap_or_else(|_| "docshelf.db".to_string());
        let search_limit = match std::env::var("DS_SEARCH_LIMIT") {
            Ok(raw) => raw.parse().map_err(|_| {
                Error::validation("search limit", format!("{raw} is not a number"))
            })?,
            Err(_) => DEFAULT_SEARCH_LIMIT,
        };

        Ok(Self {
            backend: MetadataBackend::parse(&env_or("DS_BACKEND", "embedded"))?,
            file_backend: ContentBackend::parse(&env_or("DS_FILE_BACKEND", "disk"))?,
            s3_bucket: env_or("DS_S3_BUCKET", ""),
            file_prefix: env_or("DS_FILE_PREFIX", "documents"),
            db_path: PathBuf::from(db_path),
            index_path: PathBuf::from(env_or("DS_INDEX_PATH", "docshelf.index")),
            search_limit,
            store: StoreConfig::from_env(),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_names_follow_their_tables() {
        let cfg = StoreConfig::with_tables("d", "u", "g", "p", "t");
        assert_eq!(cfg.doc_path_index, "d_path_idx");
        assert_eq!(cfg.user_email_index, "u_email_idx");
        assert_eq!(cfg.tables().len(), 7);
    }

    #[test]
    fn backend_names() {
        assert_eq!(MetadataBackend::parse("bolt").unwrap(), MetadataBackend::Embedded);
        assert_eq!(MetadataBackend::parse("dynamo").unwrap(), MetadataBackend::Dynamo);
        assert!(MetadataBackend::parse("mongo").is_err());
        assert_eq!(ContentBackend::parse("s3").unwrap(), ContentBackend::S3);
    }
}
