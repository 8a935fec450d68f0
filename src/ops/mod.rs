//! Collection-level operations for a registered record type.

mod bulk;
mod read;
mod write;

pub use bulk::BulkContext;
pub use read::FindOptions;
pub use write::{FindAndModifyOptions, UpdateOutcome};

use crate::error::{Error, Result};
use crate::index::{IndexDefinition, TaggedIndex, reconcile};
use crate::schema::Schema;
use futures_util::TryStreamExt;
use mongodb::bson::{Bson, Document};
use mongodb::options::IndexOptions;
use mongodb::{Collection, Database, IndexModel};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Server-side time budget applied to reads when the caller sets none.
pub const DEFAULT_MAX_TIME: Duration = Duration::from_millis(5000);
/// `find` result sizes beyond this log a warning suggesting `find_iter`.
pub const FIND_WARNING_DOCS_LIMIT: usize = 10_000;

const SLOW_OP_THRESHOLD: Duration = Duration::from_millis(100);

/// Handle binding a record type to its collection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Repo {
    schema: Arc<Schema>,
    db: Database,
    collection: Collection<Document>,
}

impl Repo {
    /// Fails for embedded types and for types declared without a collection.
    pub fn new(db: &Database, schema: &Arc<Schema>) -> Result<Self> {
        if schema.is_embedded() {
            return Err(Error::Definition(format!(
                "embedded type `{}` has no collection",
                schema.name()
            )));
        }
        let name = schema.collection().ok_or_else(|| {
            Error::Definition(format!(
                "record type `{}` declares no collection",
                schema.name()
            ))
        })?;
        Ok(Self {
            schema: Arc::clone(schema),
            db: db.clone(),
            collection: db.collection(name),
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn collection(&self) -> &Collection<Document> {
        &self.collection
    }

    pub(crate) fn rewrite_filter(&self, filter: Document) -> Document {
        rewrite_filter(&self.schema, filter)
    }

    pub(crate) fn rewrite_update(&self, update: Document) -> Result<Document> {
        rewrite_update(&self.schema, update)
    }

    /// Runs a driver call under a wall-clock timer, logging operations that
    /// exceed the slow threshold.
    pub(crate) async fn timed<T>(
        &self,
        op: &str,
        filter: &Document,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let start = Instant::now();
        let result = fut.await;
        let elapsed = start.elapsed();
        if elapsed > SLOW_OP_THRESHOLD {
            tracing::warn!(
                collection = self.collection.name(),
                op,
                ?filter,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow operation"
            );
        }
        result
    }

    pub(crate) fn check_read_max_time(&self, op: &str, max_time: Duration) {
        if max_time.is_zero() || max_time >= Duration::from_secs(10) {
            tracing::warn!(
                collection = self.collection.name(),
                op,
                "no timeout or large timeout for read operation"
            );
        }
    }

    /// Declared indexes diffed against the live indexes of the collection.
    pub async fn list_indexes(&self) -> Result<Vec<TaggedIndex>> {
        let models: Vec<IndexModel> = self
            .collection
            .list_indexes()
            .await
            .map_err(Error::from)?
            .try_collect()
            .await
            .map_err(Error::from)?;
        let live = models
            .iter()
            .map(TaggedIndex::from_index_model)
            .collect::<Result<Vec<_>>>()?;
        reconcile(self.schema.indexes(), live)
    }

    /// Builds every declared index that is missing and not redundant, in the
    /// background. Returns the canonical names of the indexes submitted.
    pub async fn create_indexes(&self) -> Result<Vec<String>> {
        let mut built = Vec::new();
        for entry in self.list_indexes().await? {
            if !entry.needs_build() {
                continue;
            }
            let definition = entry.definition();
            let model = IndexModel::builder()
                .keys(definition.to_wire_keys())
                .options(index_options(definition))
                .build();
            self.collection
                .create_index(model)
                .await
                .map_err(Error::from)?;
            tracing::info!(
                collection = self.collection.name(),
                index = %definition,
                "index build submitted in background"
            );
            built.push(definition.name());
        }
        Ok(built)
    }

    pub async fn drop_index(&self, name: &str) -> Result<()> {
        self.collection.drop_index(name).await.map_err(Error::from)
    }

    /// Creates the backing collection when it does not exist yet.
    pub async fn ensure_collection(&self) -> Result<()> {
        use mongodb::error::ErrorKind;

        match self.db.create_collection(self.collection.name()).await {
            Ok(()) => Ok(()),
            // 48: NamespaceExists
            Err(err) => match err.kind.as_ref() {
                ErrorKind::Command(cmd) if cmd.code == 48 => Ok(()),
                _ => Err(err.into()),
            },
        }
    }
}

fn index_options(definition: &IndexDefinition) -> IndexOptions {
    let mut options = IndexOptions::default();
    options.background = Some(true);
    if definition.is_unique() {
        options.unique = Some(true);
    }
    if definition.is_sparse() {
        options.sparse = Some(true);
    }
    if let Some(seconds) = definition.ttl_seconds() {
        options.expire_after = Some(Duration::from_secs(u64::try_from(seconds).unwrap_or(0)));
    }
    if let Some(filter) = definition.partial_filter_expression() {
        options.partial_filter_expression = Some(filter.clone());
    }
    options
}

/// Maps application field names in a filter onto wire keys (`id` -> `_id`,
/// renamed fields to their wire names). `$`-prefixed operator keys pass
/// through. Queries on a derived polymorphic type are constrained to that
/// type via the discriminator.
pub(crate) fn rewrite_filter(schema: &Schema, filter: Document) -> Document {
    let mut out = Document::new();
    for (key, value) in filter {
        let key = if key.starts_with('$') {
            key
        } else {
            schema.wire_path(&key)
        };
        out.insert(key, value);
    }
    if schema.allows_polymorphism() && schema.is_derived() {
        out.insert(crate::schema::DISCRIMINATOR_KEY, schema.name());
    }
    out
}

/// Rewrites an update document: each `$`-operator's argument keys are mapped
/// onto wire keys, and values addressing a declared top-level field are
/// coerced through the field's marshaler.
pub(crate) fn rewrite_update(schema: &Schema, update: Document) -> Result<Document> {
    let mut out = Document::new();
    for (op, args) in update {
        let Bson::Document(args) = args else {
            out.insert(op, args);
            continue;
        };
        let mut rewritten = Document::new();
        for (path, value) in args {
            let wire_path = schema.wire_path(&path);
            let value = match schema.field(&path) {
                Some(field) if !matches!(value, Bson::Null) => {
                    let app = field.to_application(value)?;
                    field.to_wire(&app, None)?
                }
                _ => value,
            };
            rewritten.insert(wire_path, value);
        }
        out.insert(op, rewritten);
    }
    Ok(out)
}

/// Wire-level projection document for a set of application field paths.
pub(crate) fn projection_document(schema: &Schema, fields: &[String]) -> Document {
    let mut doc = Document::new();
    for field in fields {
        doc.insert(schema.wire_path(field), 1);
    }
    doc
}
