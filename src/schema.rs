use crate::error::{Error, Result};
use crate::field::{FieldDescriptor, FieldKind};
use crate::index::IndexDefinition;
use crate::record::Record;
use indexmap::IndexMap;
use mongodb::bson::Document;
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the identity field on every collection-backed record type.
pub const ID_FIELD: &str = "id";
/// Wire key carrying the concrete type name of a polymorphic record.
pub const DISCRIMINATOR_KEY: &str = "_cls";

/// Schema of a record type: its ordered field descriptors, collection,
/// polymorphism/strictness flags, shard key, and declared indexes.
///
/// Built once through [`SchemaBuilder`] and shared read-only behind an `Arc`.
#[derive(Debug)]
pub struct Schema {
    name: String,
    bases: Vec<String>,
    collection: Option<String>,
    fields: IndexMap<String, FieldDescriptor>,
    wire_to_name: HashMap<String, String>,
    allow_polymorphism: bool,
    strict: bool,
    shard_key: Vec<String>,
    indexes: Vec<IndexDefinition>,
    embedded: bool,
}

impl Schema {
    /// Starts the schema of a collection-backed record type.
    pub fn document(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(name.into(), false)
    }

    /// Starts the schema of an embedded (sub-record) type.
    pub fn embedded(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(name.into(), true)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn is_embedded(&self) -> bool {
        self.embedded
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn allows_polymorphism(&self) -> bool {
        self.allow_polymorphism
    }

    pub fn shard_key(&self) -> &[String] {
        &self.shard_key
    }

    pub fn indexes(&self) -> &[IndexDefinition] {
        &self.indexes
    }

    /// Ancestor type names, outermost first.
    pub fn bases(&self) -> &[String] {
        &self.bases
    }

    pub fn is_derived(&self) -> bool {
        !self.bases.is_empty()
    }

    /// Whether this type is `name` or descends from it.
    pub fn is_a(&self, name: &str) -> bool {
        self.name == name || self.bases.iter().any(|base| base == name)
    }

    /// Field descriptors in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.values()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.get(name)
    }

    pub fn field_by_wire_key(&self, wire_key: &str) -> Option<&FieldDescriptor> {
        self.wire_to_name
            .get(wire_key)
            .and_then(|name| self.fields.get(name))
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Maps a dotted application path onto its wire path (first segment only;
    /// deeper segments are already wire-level for container elements).
    pub(crate) fn wire_path(&self, path: &str) -> String {
        match path.split_once('.') {
            Some((head, rest)) => {
                let head = self
                    .fields
                    .get(head)
                    .map_or(head, |field| field.wire_key());
                format!("{head}.{rest}")
            }
            None => self
                .fields
                .get(path)
                .map_or_else(|| path.to_string(), |field| field.wire_key().to_string()),
        }
    }

    /// Constructs a fresh (never-persisted) record of this type.
    pub fn new_record(self: &Arc<Self>, values: Document) -> Result<Record> {
        Record::new(self, values)
    }

    /// Unmarshals a record loaded from storage, resolving the concrete
    /// subtype through the registry when a discriminator is present.
    pub fn load(self: &Arc<Self>, raw: Document) -> Result<Record> {
        Record::from_wire(self, raw)
    }
}

/// Declaration-time builder; `register` publishes the finished schema to the
/// process-wide type registry.
#[derive(Debug)]
pub struct SchemaBuilder {
    schema: Schema,
}

impl SchemaBuilder {
    fn new(name: String, embedded: bool) -> Self {
        Self {
            schema: Schema {
                name,
                bases: Vec::new(),
                collection: None,
                fields: IndexMap::new(),
                wire_to_name: HashMap::new(),
                allow_polymorphism: false,
                strict: true,
                shard_key: Vec::new(),
                indexes: Vec::new(),
                embedded,
            },
        }
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.schema.collection = Some(collection.into());
        self
    }

    /// Inherits fields, collection, polymorphism, and shard key from a parent
    /// type, recording the ancestry for polymorphic dispatch.
    pub fn extends(mut self, parent: &Arc<Schema>) -> Self {
        self.schema.bases = parent.bases.clone();
        self.schema.bases.push(parent.name.clone());
        self.schema.collection = parent.collection.clone();
        self.schema.fields = parent.fields.clone();
        self.schema.wire_to_name = parent.wire_to_name.clone();
        self.schema.allow_polymorphism = parent.allow_polymorphism;
        self.schema.strict = parent.strict;
        self.schema.shard_key = parent.shard_key.clone();
        self.schema.embedded = parent.embedded;
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        let name = field.name().to_string();
        let wire = field.wire_key().to_string();
        self.schema.wire_to_name.insert(wire, name.clone());
        self.schema.fields.insert(name, field);
        self
    }

    pub fn polymorphic(mut self) -> Self {
        self.schema.allow_polymorphism = true;
        self
    }

    /// Unknown keys in stored data are preserved instead of rejected.
    pub fn non_strict(mut self) -> Self {
        self.schema.strict = false;
        self
    }

    pub fn shard_key(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.schema.shard_key = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn index(mut self, index: IndexDefinition) -> Self {
        self.schema.indexes.push(index);
        self
    }

    /// Validates the declaration and publishes it to the registry. Fails if
    /// the discriminator is already taken or the declaration is inconsistent.
    pub fn register(mut self) -> Result<Arc<Schema>> {
        if !self.schema.embedded && !self.schema.fields.contains_key(ID_FIELD) {
            let id = FieldDescriptor::new(ID_FIELD, FieldKind::ObjectId { auto: false })
                .wire_name("_id");
            self.schema.wire_to_name.insert("_id".into(), ID_FIELD.into());
            self.schema
                .fields
                .shift_insert(0, ID_FIELD.to_string(), id);
        }

        // embedded records marshal without a caching pass, so a
        // self-generating field there would mint a fresh value every time
        if self.schema.embedded {
            if let Some(field) = self
                .schema
                .fields
                .values()
                .find(|f| f.is_auto_generating())
            {
                return Err(Error::Definition(format!(
                    "self-generating field `{}` is not allowed on embedded type `{}`",
                    field.name(),
                    self.schema.name
                )));
            }
        }

        let mut seen_wire = HashMap::new();
        for field in self.schema.fields.values() {
            if let Some(previous) = seen_wire.insert(field.wire_key().to_string(), field.name()) {
                return Err(Error::Definition(format!(
                    "wire key `{}` declared by both `{previous}` and `{}` on `{}`",
                    field.wire_key(),
                    field.name(),
                    self.schema.name,
                )));
            }
        }

        for key in &self.schema.shard_key {
            if !self.schema.fields.contains_key(key) {
                return Err(Error::Definition(format!(
                    "shard key field `{key}` is not declared on `{}`",
                    self.schema.name
                )));
            }
        }

        registry::register(self.schema)
    }
}

/// Process-wide mapping of discriminator string -> record type.
///
/// Written exactly once per discriminator, at type-declaration time, and read
/// thereafter; concurrent first writes of the same name are serialized by the
/// map's shard locks.
pub mod registry {
    use super::Schema;
    use crate::error::{Error, Result};
    use dashmap::DashMap;
    use dashmap::mapref::entry::Entry;
    use std::sync::{Arc, LazyLock};

    static TYPES: LazyLock<DashMap<String, Arc<Schema>>> = LazyLock::new(DashMap::new);

    pub(super) fn register(schema: Schema) -> Result<Arc<Schema>> {
        match TYPES.entry(schema.name.clone()) {
            Entry::Occupied(_) => Err(Error::Definition(format!(
                "record type `{}` is already registered",
                schema.name
            ))),
            Entry::Vacant(entry) => {
                let arc = Arc::new(schema);
                entry.insert(Arc::clone(&arc));
                Ok(arc)
            }
        }
    }

    /// Resolves a discriminator to its registered record type.
    pub fn get(name: &str) -> Option<Arc<Schema>> {
        TYPES.get(name).map(|entry| Arc::clone(entry.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_schema_gets_an_identity_field() {
        let schema = Schema::document("SchemaIdTest")
            .collection("schema_id_test")
            .field(FieldDescriptor::new("n", FieldKind::int()))
            .register()
            .unwrap();

        let first = schema.fields().next().unwrap();
        assert_eq!(first.name(), ID_FIELD);
        assert_eq!(first.wire_key(), "_id");
        assert!(schema.field_by_wire_key("_id").is_some());
    }

    #[test]
    fn duplicate_discriminator_is_rejected() {
        Schema::embedded("SchemaDupTest").register().unwrap();
        let err = Schema::embedded("SchemaDupTest").register().unwrap_err();
        assert!(matches!(err, Error::Definition(_)));
    }

    #[test]
    fn duplicate_wire_key_is_rejected() {
        let err = Schema::embedded("SchemaWireClash")
            .field(FieldDescriptor::new("a", FieldKind::int()).wire_name("x"))
            .field(FieldDescriptor::new("b", FieldKind::int()).wire_name("x"))
            .register()
            .unwrap_err();
        assert!(matches!(err, Error::Definition(_)));
    }

    #[test]
    fn extends_inherits_fields_and_ancestry() {
        let base = Schema::document("SchemaBaseTest")
            .collection("schema_base_test")
            .polymorphic()
            .field(FieldDescriptor::new("a", FieldKind::int()))
            .register()
            .unwrap();
        let sub = Schema::document("SchemaSubTest")
            .extends(&base)
            .field(FieldDescriptor::new("b", FieldKind::int()))
            .register()
            .unwrap();

        assert!(sub.is_a("SchemaBaseTest"));
        assert!(sub.has_field("a"));
        assert!(sub.has_field("b"));
        assert_eq!(sub.collection(), Some("schema_base_test"));
        assert!(sub.allows_polymorphism());
        assert!(!base.is_a("SchemaSubTest"));
    }

    #[test]
    fn embedded_schema_rejects_self_generating_fields() {
        let err = Schema::embedded("SchemaEmbeddedAutoTest")
            .field(FieldDescriptor::new(
                "token",
                FieldKind::ObjectId { auto: true },
            ))
            .register()
            .unwrap_err();
        assert!(matches!(err, Error::Definition(_)));
    }

    #[test]
    fn shard_key_must_name_declared_fields() {
        let err = Schema::document("SchemaShardTest")
            .collection("c")
            .shard_key(["missing"])
            .register()
            .unwrap_err();
        assert!(matches!(err, Error::Definition(_)));
    }
}
