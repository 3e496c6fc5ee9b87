//! Records persisted by the metadata store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::id::Id;

/// A docshelf document: metadata plus content.
///
/// `content` lives in the content store only. It is skipped by serde so a
/// metadata record can never carry it at rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: Option<Id>,
    pub path: String,
    pub title: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(skip)]
    pub content: Vec<u8>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub created_by: Option<Id>,
    pub updated_by: Option<Id>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(title: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn content_string(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

/// Whether a user is live or soft-deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum Lifecycle {
    #[default]
    Active,
    Removed { at: DateTime<Utc> },
}

impl Lifecycle {
    pub fn is_active(&self) -> bool {
        matches!(self, Lifecycle::Active)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Option<Id>,
    pub email: String,
    #[serde(default)]
    pub name: String,
    /// Credential hash. Only the authentication layer interprets it.
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub groups: Vec<Id>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

/// A collection of users. Member uniqueness is the caller's concern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: Option<Id>,
    pub name: String,
    #[serde(default)]
    pub users: Vec<Id>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub id: Option<Id>,
    #[serde(default)]
    pub users: Vec<Id>,
    #[serde(default)]
    pub groups: Vec<Id>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

/// Derive a path from a title: lower-cased, whitespace runs become `-`.
pub fn path_from_title(title: &str) -> String {
    title
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}

/// Reject paths that could escape a content root or that address nothing.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::validation("path", "path is empty"));
    }
    if path.starts_with('/') {
        return Err(Error::validation("path", format!("{path} must be relative")));
    }
    if path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(Error::validation(
            "path",
            format!("{path} contains an empty or relative segment"),
        ));
    }
    Ok(())
}

/// Trim tags and reject empty ones.
pub fn normalize_tags<I, S>(tags: I) -> Result<BTreeSet<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| {
            let t = t.as_ref().trim();
            if t.is_empty() {
                Err(Error::validation("tags", "tags must not be empty"))
            } else {
                Ok(t.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_is_never_serialized() {
        let doc = Document::new("Notes", "secret body").with_path("notes.md");
        let json = serde_json::to_string(&doc).unwrap();
        assert!(!json.contains("secret body"));

        let back: Document = serde_json::from_str(&json).unwrap();
        assert!(back.content.is_empty());
        assert_eq!(back.path, "notes.md");
    }

    #[test]
    fn lifecycle_round_trips_removed_state() {
        let user = User {
            email: "a@b.io".into(),
            lifecycle: Lifecycle::Removed { at: Utc::now() },
            ..Default::default()
        };
        let back: User = serde_json::from_str(&serde_json::to_string(&user).unwrap()).unwrap();
        assert_eq!(back.lifecycle, user.lifecycle);
        assert!(!back.lifecycle.is_active());
    }

    #[test]
    fn missing_lifecycle_means_active() {
        let user: User = serde_json::from_str(r#"{"id":null,"email":"a@b.io"}"#).unwrap();
        assert!(user.lifecycle.is_active());
    }

    #[test]
    fn title_becomes_path() {
        assert_eq!(path_from_title("Meeting  Notes Q3"), "meeting-notes-q3");
    }

    #[test]
    fn path_validation() {
        assert!(validate_path("a/b.md").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("a/../b").is_err());
        assert!(validate_path("a//b").is_err());
    }

    #[test]
    fn tags_are_trimmed_and_deduplicated() {
        let tags = normalize_tags([" a", "b ", "a"]).unwrap();
        assert_eq!(tags.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(normalize_tags(["  "]).is_err());
    }
}
