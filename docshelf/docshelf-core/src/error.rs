//! Error kinds shared by every docshelf component.
//!
//! Callers branch on [`Error::NotFound`], [`Error::Removed`] and
//! [`Error::Conflict`]; everything a backend or collaborator reports goes
//! through [`Error::Backend`] tagged with the [`Step`] that failed.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::id::Id;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The kind of entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Document,
    User,
    Group,
    Policy,
    Tag,
    Content,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Document => "document",
            EntityKind::User => "user",
            EntityKind::Group => "group",
            EntityKind::Policy => "policy",
            EntityKind::Tag => "tag",
            EntityKind::Content => "content",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step of a storage operation or of the document write protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ReadContent,
    WriteContent,
    RemoveContent,
    IndexText,
    SearchText,
    ReadMetadata,
    CommitMetadata,
    RemoveMetadata,
    Provision,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::ReadContent => "read content",
            Step::WriteContent => "write content",
            Step::RemoveContent => "remove content",
            Step::IndexText => "index text",
            Step::SearchText => "search text",
            Step::ReadMetadata => "read metadata",
            Step::CommitMetadata => "commit metadata",
            Step::RemoveMetadata => "remove metadata",
            Step::Provision => "provision",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} {key} does not exist")]
    NotFound { kind: EntityKind, key: String },

    #[error("{kind} {key} was removed at {at}")]
    Removed {
        kind: EntityKind,
        key: String,
        at: DateTime<Utc>,
    },

    #[error("{kind} {key} already exists")]
    Conflict { kind: EntityKind, key: String },

    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    /// The document was persisted but the text index did not accept it.
    #[error("document {id} saved, but indexing failed: {source}")]
    Indexing {
        id: Id,
        #[source]
        source: Box<Error>,
    },

    #[error("{step} failed: {source}")]
    Backend {
        step: Step,
        #[source]
        source: anyhow::Error,
    },

    /// A protocol step failed and at least one compensating action failed too.
    #[error("{source}; rollback also failed: {}", join_failures(.failures))]
    Compensation {
        #[source]
        source: Box<Error>,
        failures: Vec<Error>,
    },
}

fn join_failures(failures: &[Error]) -> String {
    failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn not_found(kind: EntityKind, key: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn conflict(kind: EntityKind, key: impl Into<String>) -> Self {
        Error::Conflict {
            kind,
            key: key.into(),
        }
    }

    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Error::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn backend(step: Step, source: impl Into<anyhow::Error>) -> Self {
        Error::Backend {
            step,
            source: source.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, Error::Removed { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// The step that failed, looking through partial-success and rollback wrappers.
    pub fn step(&self) -> Option<Step> {
        match self {
            Error::Backend { step, .. } => Some(*step),
            Error::Indexing { source, .. } | Error::Compensation { source, .. } => source.step(),
            _ => None,
        }
    }
}

/// Tags a foreign error with the step it happened in.
pub(crate) trait ResultExt<T> {
    fn at(self, step: Step) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn at(self, step: Step) -> Result<T> {
        self.map_err(|e| Error::backend(step, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_is_visible_through_compensation() {
        let err = Error::Compensation {
            source: Box::new(Error::backend(
                Step::CommitMetadata,
                anyhow::anyhow!("disk full"),
            )),
            failures: vec![Error::backend(
                Step::RemoveContent,
                anyhow::anyhow!("permission denied"),
            )],
        };

        assert_eq!(err.step(), Some(Step::CommitMetadata));
        let msg = err.to_string();
        assert!(msg.contains("commit metadata failed: disk full"));
        assert!(msg.contains("remove content failed: permission denied"));
    }

    #[test]
    fn not_found_and_removed_are_distinct() {
        let missing = Error::not_found(EntityKind::User, "abc");
        let removed = Error::Removed {
            kind: EntityKind::User,
            key: "abc".into(),
            at: Utc::now(),
        };

        assert!(missing.is_not_found() && !missing.is_removed());
        assert!(removed.is_removed() && !removed.is_not_found());
        assert_eq!(missing.to_string(), "user abc does not exist");
    }
}
