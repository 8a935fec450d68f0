//! Remora is a schema-driven `MongoDB` document mapper for Rust.
//!
//! Record types are declared at runtime as schemas: an ordered set of typed
//! field descriptors plus collection, index, and inheritance metadata.
//! Instances track exactly which (possibly nested) fields changed since they
//! were loaded, so persistence can be expressed in minimal update paths, and
//! declared indexes can be diffed against the live state of a collection.
//!
//! ## Example
//!
//! ```no_run
//! use mongodb::Client;
//! use mongodb::bson::doc;
//! use remora::{FieldDescriptor, FieldKind, FindOptions, Repo, Schema};
//!
//! # async fn demo() -> remora::Result<()> {
//! // Declare a record type
//! let user = Schema::document("User")
//!     .collection("users")
//!     .field(FieldDescriptor::new("email", FieldKind::string()).required())
//!     .field(FieldDescriptor::new("age", FieldKind::int()))
//!     .register()?;
//!
//! let client = Client::with_uri_str("mongodb://localhost:27017")
//!     .await
//!     .map_err(remora::Error::from)?;
//! let repo = Repo::new(&client.database("app"), &user)?;
//!
//! // Insert a record
//! let mut record = user.new_record(doc! { "email": "kit@example.com", "age": 33 })?;
//! repo.save(&mut record).await?;
//!
//! // Select a record by custom fields
//! let found = repo
//!     .find_one(doc! { "email": "kit@example.com" }, FindOptions::default())
//!     .await?;
//!
//! // Apply an update and refresh the in-memory copy
//! if let Some(mut found) = found {
//!     repo.inc(&mut found, doc! { "age": 1 }).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_errors_doc
)]

pub mod error;
pub mod field;
pub mod index;
pub mod ops;
pub mod record;
pub mod retry;
pub mod schema;
pub mod value;

pub use error::{Error, Result, ValidationError};
pub use field::{FieldDescriptor, FieldKind, ListSort};
pub use index::{IndexDefinition, KeyDirection, TaggedIndex, reconcile};
pub use ops::{BulkContext, FindAndModifyOptions, FindOptions, Repo, UpdateOutcome};
pub use record::Record;
pub use schema::{DISCRIMINATOR_KEY, ID_FIELD, Schema, SchemaBuilder};
pub use value::{TrackedArray, TrackedMap, Value};
