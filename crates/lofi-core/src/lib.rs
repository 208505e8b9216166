//! LOFI Core - local document store and reactive queries
//!
//! This crate provides the in-process side of LOFI:
//! - Schema-validated collections with revisioned documents and tombstones
//! - A per-collection, gap-free change stream
//! - Live queries maintained incrementally from the change stream
//! - Local (never replicated) documents, reactive state and field encryption at rest

pub mod changes;
pub mod cipher;
pub mod collection;
pub mod conflict;
pub mod database;
pub mod document;
pub mod error;
pub mod live;
pub mod local;
pub mod schema;
pub mod selector;
pub mod state;
pub mod value;

pub use changes::{ChangeEvent, ChangeKind, ChangeOrigin, ChangeStream};
pub use cipher::{open_fields, seal_fields, FieldCipher, PasswordCipher};
pub use collection::{ApplyOutcome, Collection};
pub use conflict::{ConflictHandler, LastWriteWins, Resolution};
pub use database::{CleanupPolicy, Database, DatabaseConfig};
pub use document::{now_ms, Document, DocumentId, Revision};
pub use error::{Error, Result};
pub use live::{CancelHandle, LiveEvent, LiveQuery, ResultChange};
pub use local::{LocalChange, LocalDocument, LocalDocuments, LocalWatch};
pub use schema::{CollectionSchema, FieldDescriptor, FieldType};
pub use selector::{Query, Selector, SortOrder};
pub use state::{State, StateWatch};
pub use value::{Fields, Number, Value};
