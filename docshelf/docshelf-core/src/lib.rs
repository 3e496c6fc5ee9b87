pub mod config;
pub mod content;
pub mod error;
pub mod id;
pub mod model;
pub mod protocol;
pub mod repository;
pub mod search;
pub mod storage;

pub use error::{EntityKind, Error, Result, Step};
pub use id::{Id, IdGenerator, TimeOrderedIds};
pub use model::{Document, Group, Lifecycle, Policy, User};
pub use repository::{DocumentFilter, DocumentRepository};
