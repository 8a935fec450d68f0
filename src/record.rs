use crate::error::{Error, Result, ValidationError};
use crate::field::{FieldKind, ListSort};
use crate::schema::{DISCRIMINATOR_KEY, ID_FIELD, Schema, registry};
use crate::value::{TrackedArray, TrackedMap, Value};
use indexmap::IndexMap;
use mongodb::bson::{Bson, Document};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// One typed document instance.
///
/// A record owns a value store, a dirty-field set of wire paths (dotted for
/// nesting, e.g. `"address.city"`), and lifecycle flags distinguishing a
/// freshly constructed record from one loaded from storage. Not thread-safe
/// for concurrent mutation; confine each instance to one logical owner.
#[derive(Debug, Clone)]
pub struct Record {
    schema: Arc<Schema>,
    data: IndexMap<String, Value>,
    /// Unknown keys preserved verbatim on non-strict loads; never validated,
    /// never serialized back.
    extra: Document,
    changed: Vec<String>,
    is_new: bool,
}

impl Record {
    /// Constructs a fresh record, populating defaults for fields not
    /// supplied. `values` may key fields by name or wire name; unknown keys
    /// fail under strict schemas.
    pub(crate) fn new(schema: &Arc<Schema>, values: Document) -> Result<Self> {
        Self::construct(schema, values, true, true)
    }

    /// Unmarshals a raw wire document, resolving the concrete subtype via
    /// the discriminator. Coercion failures are collected per field and
    /// surfaced together; nothing is marked dirty on the result.
    pub(crate) fn from_wire(expected: &Arc<Schema>, raw: Document) -> Result<Self> {
        Self::from_wire_created(expected, raw, false)
    }

    pub(crate) fn from_wire_created(
        expected: &Arc<Schema>,
        mut raw: Document,
        created: bool,
    ) -> Result<Self> {
        let schema = match raw.remove(DISCRIMINATOR_KEY) {
            Some(Bson::String(cls)) if cls != expected.name() => registry::get(&cls)
                .ok_or_else(|| {
                    Error::Definition(format!("record type `{cls}` is not registered"))
                })?,
            _ => Arc::clone(expected),
        };

        let mut values = IndexMap::new();
        let mut extra = Document::new();
        let mut errors: BTreeMap<String, String> = BTreeMap::new();

        for (wire_key, bson) in raw {
            match schema.field_by_wire_key(&wire_key) {
                Some(field) => match field.to_application(bson) {
                    Ok(value) => {
                        values.insert(field.name().to_string(), value);
                    }
                    Err(err) => {
                        errors.insert(field.name().to_string(), err.to_string());
                    }
                },
                None => {
                    // strict schemas discard unknown keys; non-strict keep
                    // them for inspection, outside validation
                    if !schema.is_strict() {
                        extra.insert(wire_key, bson);
                    }
                }
            }
        }

        if !errors.is_empty() {
            return Err(Error::InvalidDocument {
                type_name: schema.name().to_string(),
                errors,
            });
        }

        Ok(Self::assemble(&schema, values, extra, created, created))
    }

    fn construct(
        schema: &Arc<Schema>,
        values: Document,
        auto_convert: bool,
        created: bool,
    ) -> Result<Self> {
        let mut resolved = IndexMap::new();
        let mut extra = Document::new();
        let mut unknown = Vec::new();

        for (key, bson) in values {
            let field = schema
                .field(&key)
                .or_else(|| schema.field_by_wire_key(&key));
            match field {
                Some(field) => {
                    let value = if auto_convert && !matches!(bson, Bson::Null) {
                        field.to_application(bson)?
                    } else {
                        Value::from_bson(bson)
                    };
                    resolved.insert(field.name().to_string(), value);
                }
                None if key == DISCRIMINATOR_KEY => {}
                None if schema.is_strict() => unknown.push(key),
                None => {
                    extra.insert(key, bson);
                }
            }
        }

        if !unknown.is_empty() {
            return Err(Error::FieldDoesNotExist {
                type_name: schema.name().to_string(),
                fields: unknown,
            });
        }

        Ok(Self::assemble(schema, resolved, extra, created, true))
    }

    /// Builds the value store in declaration order. Defaults are populated
    /// only for fresh constructions: a record loaded from storage mirrors
    /// exactly what was stored, so a field dropped by a partial projection
    /// stays absent instead of resurfacing as its default.
    fn assemble(
        schema: &Arc<Schema>,
        mut values: IndexMap<String, Value>,
        extra: Document,
        created: bool,
        fill_defaults: bool,
    ) -> Self {
        let mut data = IndexMap::new();
        for field in schema.fields() {
            match values.shift_remove(field.name()) {
                Some(value) => {
                    data.insert(field.name().to_string(), value);
                }
                None => {
                    if fill_defaults {
                        if let Some(default) = field.default_for() {
                            data.insert(field.name().to_string(), default);
                        }
                    }
                }
            }
        }

        Self {
            schema: Arc::clone(schema),
            data,
            extra,
            changed: Vec::new(),
            is_new: created,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn type_name(&self) -> &str {
        self.schema.name()
    }

    /// False once the record has been persisted (or was loaded from
    /// storage); the transition fires the first time the identity field is
    /// assigned and is terminal for the in-memory instance.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn id(&self) -> Option<&Value> {
        self.data.get(ID_FIELD).filter(|v| !v.is_null())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Mutable access to a field value. Records nothing by itself: nested
    /// records and containers track their own changes, and scalar
    /// replacement must go through [`set`](Self::set).
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.data.get_mut(name)
    }

    /// Unknown keys preserved from a non-strict load.
    pub fn extra(&self) -> &Document {
        &self.extra
    }

    /// Assigns a field value, enforcing shard-key immutability and the
    /// NEW -> PERSISTED identity transition, and marking the field dirty
    /// when the value actually changes.
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        if !self.schema.has_field(name) {
            if self.schema.is_strict() {
                return Err(Error::FieldDoesNotExist {
                    type_name: self.schema.name().to_string(),
                    fields: vec![name.to_string()],
                });
            }
            self.extra.insert(name.to_string(), value.to_bson()?);
            return Ok(());
        }

        let current = self.data.get(name);
        let differs = current != Some(&value);

        if !self.schema.is_embedded()
            && !self.is_new
            && self.schema.shard_key().iter().any(|k| k == name)
            && differs
        {
            return Err(Error::Operation(format!(
                "shard keys are immutable, tried to update `{name}`"
            )));
        }

        if differs {
            self.mark_changed(name);
        }
        self.data.insert(name.to_string(), value);

        if !self.schema.is_embedded() && self.is_new && name == ID_FIELD {
            self.is_new = false;
        }

        Ok(())
    }

    /// `set` accepting any serializable value, coerced through the field's
    /// descriptor on the way in.
    pub fn set_serialized<T: Serialize>(&mut self, name: &str, value: &T) -> Result<()> {
        let bson = mongodb::bson::to_bson(value)
            .map_err(|err| Error::Operation(format!("could not serialize value: {err}")))?;
        let value = match self.schema.field(name) {
            Some(field) => field.to_application(bson)?,
            None => Value::from_bson(bson),
        };
        self.set(name, value)
    }

    /// Resets a field back to its declared default.
    pub fn reset(&mut self, name: &str) -> Result<()> {
        let default = self
            .schema
            .field(name)
            .ok_or_else(|| Error::FieldDoesNotExist {
                type_name: self.schema.name().to_string(),
                fields: vec![name.to_string()],
            })?
            .default_for()
            .unwrap_or_else(Value::null);
        self.set(name, default)
    }

    /// Marks a wire path as explicitly changed, collapsing overlaps: a path
    /// already covered by a dirty prefix is a no-op, and marking a path
    /// clears any previously tracked sub-paths beneath it.
    pub fn mark_changed(&mut self, key: &str) {
        if key.is_empty() {
            return;
        }
        let key = self.schema.wire_path(key);

        if self.changed.contains(&key) {
            return;
        }

        let levels: Vec<&str> = key.split('.').collect();
        for idx in 1..=levels.len() {
            if self.changed.contains(&levels[..idx].join(".")) {
                return;
            }
        }

        let prefix = format!("{key}.");
        self.changed.retain(|existing| !existing.starts_with(&prefix));
        self.changed.push(key);
    }

    /// Returns every wire path changed since load / the last clear,
    /// recursing into nested records and containers. Paths never overlap: a
    /// dirty prefix suppresses its subtree.
    pub fn get_changed_fields(&self) -> Vec<String> {
        let mut changed = self.changed.clone();

        for field in self.schema.fields() {
            let wire = field.wire_key().to_string();
            if changed.contains(&wire) {
                continue;
            }
            let Some(value) = self.data.get(field.name()) else {
                continue;
            };
            let base = format!("{wire}.");

            match value {
                Value::Record(record) => {
                    for sub in record.get_changed_fields() {
                        push_unique(&mut changed, format!("{base}{sub}"));
                    }
                }
                Value::Array(array) => {
                    // reordering of a sorted list cannot be expressed as a
                    // sub-path: any changed sort key dirties the whole field
                    if let FieldKind::List {
                        sort: Some(ListSort {
                            ordering: Some(ordering),
                            ..
                        }),
                        ..
                    } = field.kind()
                    {
                        if array.iter().any(|element| {
                            element
                                .as_record()
                                .is_some_and(|rec| rec.changed.iter().any(|c| c == ordering))
                        }) {
                            push_unique(&mut changed, wire);
                            continue;
                        }
                    }

                    if array.whole_changed() {
                        push_unique(&mut changed, wire);
                        continue;
                    }
                    collect_array_changes(&mut changed, &base, array);
                }
                Value::Map(map) => {
                    collect_map_changes(&mut changed, &base, map);
                }
                Value::Scalar(_) => {}
            }
        }

        changed
    }

    /// Clears dirty state on this record and every nested container and
    /// embedded record beneath it.
    pub fn clear_changed_fields(&mut self) {
        self.changed.clear();
        for value in self.data.values_mut() {
            value.clear_changed();
        }
    }

    /// Marshals into a wire document: identity key first, discriminator only
    /// for polymorphic hierarchies, declared fields in declaration order.
    /// `fields` restricts output to the named paths (identity always
    /// considered); nested paths are threaded into embedded sub-records.
    /// Self-generating fields still unset are generated here and cached.
    pub fn to_wire(&mut self, fields: Option<&[&str]>) -> Result<Document> {
        let owned: Vec<String> = fields
            .unwrap_or_default()
            .iter()
            .map(|f| (*f).to_string())
            .collect();

        // cache self-generated values before the immutable marshal pass
        let auto_fields: Vec<String> = self
            .schema
            .fields()
            .filter(|f| f.is_auto_generating())
            .filter(|f| self.data.get(f.name()).is_none_or(Value::is_null))
            .map(|f| f.name().to_string())
            .collect();
        for name in auto_fields {
            if let Some(generated) = self.schema.field(&name).and_then(|f| f.generate()) {
                self.data.insert(name, generated);
            }
        }

        self.marshal(&owned)
    }

    /// Marshal entry point for embedded sub-records, with the projection
    /// prefix already stripped by the parent.
    pub(crate) fn to_wire_projected(&self, fields: Option<&[String]>) -> Result<Document> {
        self.marshal(fields.unwrap_or_default())
    }

    fn marshal(&self, fields: &[String]) -> Result<Document> {
        let mut doc = Document::new();
        let roots: HashSet<&str> = fields
            .iter()
            .filter_map(|f| f.split('.').next())
            .collect();

        // identity key first, omitted entirely when there is nothing to emit
        if let Some(id_field) = self.schema.field(ID_FIELD) {
            match self.data.get(ID_FIELD) {
                Some(value) if !value.is_null() => {
                    doc.insert(id_field.wire_key(), id_field.to_wire(value, None)?);
                }
                _ => {
                    if let Some(generated) = id_field.generate() {
                        doc.insert(id_field.wire_key(), id_field.to_wire(&generated, None)?);
                    }
                }
            }
        }

        if self.schema.allows_polymorphism() {
            doc.insert(DISCRIMINATOR_KEY, self.schema.name());
        }

        for field in self.schema.fields() {
            if field.name() == ID_FIELD && self.schema.field(ID_FIELD).is_some() {
                continue;
            }
            if !roots.is_empty() && !roots.contains(field.name()) {
                continue;
            }

            let value = self.data.get(field.name());
            match value {
                Some(value) if !value.is_null() => {
                    let prefix = format!("{}.", field.name());
                    let nested: Vec<String> = fields
                        .iter()
                        .filter_map(|f| f.strip_prefix(&prefix))
                        .map(str::to_string)
                        .collect();
                    let projection = if nested.is_empty() { None } else { Some(&nested[..]) };
                    doc.insert(field.wire_key(), field.to_wire(value, projection)?);
                }
                _ => match field.generate() {
                    Some(generated) => {
                        doc.insert(field.wire_key(), field.to_wire(&generated, None)?);
                    }
                    None => {
                        if field.is_nullable() {
                            doc.insert(field.wire_key(), Bson::Null);
                        }
                    }
                },
            }
        }

        Ok(doc)
    }

    /// Validates every field, accumulating one error per offending field
    /// instead of failing fast.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = BTreeMap::new();

        for field in self.schema.fields() {
            match self.data.get(field.name()) {
                Some(value) if !value.is_null() => {
                    if let Err(err) = field.validate(value) {
                        errors.insert(field.name().to_string(), err);
                    }
                }
                _ => {
                    if field.is_required() && !field.is_auto_generating() {
                        errors.insert(
                            field.name().to_string(),
                            ValidationError::for_field(field.name(), "Field is required"),
                        );
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            let id = self
                .id()
                .and_then(|v| v.to_bson().ok())
                .map_or_else(|| "None".to_string(), |bson| bson.to_string());
            Err(ValidationError::aggregate(
                format!("ValidationError ({}:{id})", self.schema.name()),
                errors,
            ))
        }
    }

    /// Relaxed extended-JSON rendering of the marshaled document.
    pub fn to_json(&mut self) -> Result<String> {
        let doc = self.to_wire(None)?;
        let json: serde_json::Value = Bson::Document(doc).into_relaxed_extjson();
        serde_json::to_string(&json)
            .map_err(|err| Error::Operation(format!("could not render JSON: {err}")))
    }

    /// Loads a record from extended JSON. `created` marks the result as a
    /// brand-new record instead of one mirroring storage.
    pub fn from_json(schema: &Arc<Schema>, json: &str, created: bool) -> Result<Self> {
        let parsed: serde_json::Value = serde_json::from_str(json)
            .map_err(|err| Error::Operation(format!("could not parse JSON: {err}")))?;
        let bson = Bson::try_from(parsed)
            .map_err(|err| Error::Operation(format!("could not parse JSON: {err}")))?;
        match bson {
            Bson::Document(doc) => Self::from_wire_created(schema, doc, created),
            _ => Err(Error::Operation("JSON root must be an object".into())),
        }
    }

    /// Overwrites this record's values with a freshly loaded copy of the
    /// same document, resetting dirty state.
    pub(crate) fn refresh_from(&mut self, other: Self) {
        self.data = other.data;
        self.extra = other.extra;
        self.changed.clear();
        self.is_new = false;
    }
}

/// Embedded records compare by field values; collection-backed records by
/// identity once both sides have one.
impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        if self.schema.name() != other.schema.name() {
            return false;
        }
        if !self.schema.is_embedded() {
            if let (Some(a), Some(b)) = (self.id(), other.id()) {
                return a == b;
            }
        }
        self.data == other.data
    }
}

fn push_unique(changed: &mut Vec<String>, path: String) {
    if !changed.contains(&path) {
        changed.push(path);
    }
}

fn collect_array_changes(changed: &mut Vec<String>, base: &str, array: &TrackedArray) {
    for slot in array.changed_slots() {
        push_unique(changed, format!("{base}{slot}"));
    }
    for (index, value) in array.iter().enumerate() {
        let item_path = format!("{base}{index}");
        if changed.contains(&item_path) {
            continue;
        }
        collect_value_changes(changed, &item_path, value);
    }
}

fn collect_map_changes(changed: &mut Vec<String>, base: &str, map: &TrackedMap) {
    for key in map.changed_keys() {
        push_unique(changed, format!("{base}{key}"));
    }
    for (key, value) in map.iter() {
        let item_path = format!("{base}{key}");
        if changed.contains(&item_path) {
            continue;
        }
        collect_value_changes(changed, &item_path, value);
    }
}

fn collect_value_changes(changed: &mut Vec<String>, item_path: &str, value: &Value) {
    match value {
        Value::Record(record) => {
            for sub in record.get_changed_fields() {
                push_unique(changed, format!("{item_path}.{sub}"));
            }
        }
        Value::Array(array) => {
            if array.whole_changed() {
                push_unique(changed, item_path.to_string());
            } else {
                collect_array_changes(changed, &format!("{item_path}."), array);
            }
        }
        Value::Map(map) => {
            collect_map_changes(changed, &format!("{item_path}."), map);
        }
        Value::Scalar(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldDescriptor;
    use mongodb::bson::{doc, oid::ObjectId};
    use std::sync::OnceLock;

    fn address_schema() -> Arc<Schema> {
        static SCHEMA: OnceLock<Arc<Schema>> = OnceLock::new();
        SCHEMA
            .get_or_init(|| {
                Schema::embedded("RecAddress")
                    .field(FieldDescriptor::new("city", FieldKind::string()).required())
                    .field(FieldDescriptor::new("zip", FieldKind::string()))
                    .register()
                    .unwrap()
            })
            .clone()
    }

    fn person_schema() -> Arc<Schema> {
        static SCHEMA: OnceLock<Arc<Schema>> = OnceLock::new();
        SCHEMA
            .get_or_init(|| {
                address_schema();
                Schema::document("RecPerson")
                    .collection("rec_person")
                    .shard_key(["region"])
                    .field(FieldDescriptor::new("name", FieldKind::string()).required())
                    .field(FieldDescriptor::new("age", FieldKind::int()).default_value(0))
                    .field(FieldDescriptor::new("region", FieldKind::string()))
                    .field(FieldDescriptor::new("nick", FieldKind::string()).nullable())
                    .field(FieldDescriptor::new(
                        "address",
                        FieldKind::embedded("RecAddress"),
                    ))
                    .field(FieldDescriptor::new(
                        "tags",
                        FieldKind::list(FieldKind::string()),
                    ))
                    .register()
                    .unwrap()
            })
            .clone()
    }

    fn loaded_person() -> Record {
        person_schema()
            .load(doc! {
                "_id": ObjectId::new(),
                "name": "Ada",
                "age": 36,
                "region": "emea",
                "address": { "city": "London", "zip": "N1" },
                "tags": ["a", "b"],
            })
            .unwrap()
    }

    #[test]
    fn defaults_populate_only_missing_fields() {
        let record = person_schema().new_record(doc! { "name": "Ada" }).unwrap();
        assert_eq!(record.get("age").unwrap().as_i32(), Some(0));
        assert!(record.get("tags").unwrap().as_array().unwrap().is_empty());
        assert!(record.is_new());
    }

    #[test]
    fn loaded_records_skip_defaults_for_partial_projections() {
        // "age" absent from the stored data must not resurface as default 0,
        // which would falsely mark it dirty on a later full save
        let record = person_schema().load(doc! { "name": "Ada" }).unwrap();
        assert!(record.get("age").is_none() || record.get("age").unwrap().as_i32() != Some(0));
    }

    #[test]
    fn strict_construction_rejects_unknown_fields() {
        let err = person_schema()
            .new_record(doc! { "name": "Ada", "bogus": 1, "also_bogus": 2 })
            .unwrap_err();
        match err {
            Error::FieldDoesNotExist { fields, .. } => assert_eq!(fields.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn loading_is_never_dirty() {
        let record = loaded_person();
        assert!(record.get_changed_fields().is_empty());
        assert!(!record.is_new());
    }

    #[test]
    fn assignment_marks_dirty_only_on_change() {
        let mut record = loaded_person();
        let name = record.get("name").cloned().unwrap();
        record.set("name", name).unwrap();
        assert!(record.get_changed_fields().is_empty());

        record.set_serialized("name", &"Grace").unwrap();
        assert_eq!(record.get_changed_fields(), ["name"]);
    }

    #[test]
    fn nested_leaf_mutation_yields_minimal_path() {
        let mut record = loaded_person();
        record
            .get_mut("address")
            .and_then(Value::as_record_mut)
            .unwrap()
            .set_serialized("city", &"Paris")
            .unwrap();

        assert_eq!(record.get_changed_fields(), ["address.city"]);
    }

    #[test]
    fn prefix_collapsing() {
        let mut record = loaded_person();
        record.mark_changed("address");
        record.mark_changed("address.city");
        assert_eq!(record.get_changed_fields(), ["address"]);

        let mut record = loaded_person();
        record.mark_changed("address.city");
        record.mark_changed("address.zip");
        record.mark_changed("address");
        assert_eq!(record.get_changed_fields(), ["address"]);
    }

    #[test]
    fn container_mutations_surface_as_paths() {
        let mut record = loaded_person();
        record
            .get_mut("tags")
            .and_then(Value::as_array_mut)
            .unwrap()
            .set(1, Value::from_bson(Bson::String("c".into())));
        assert_eq!(record.get_changed_fields(), ["tags.1"]);

        let mut record = loaded_person();
        record
            .get_mut("tags")
            .and_then(Value::as_array_mut)
            .unwrap()
            .push(Value::from_bson(Bson::String("c".into())));
        assert_eq!(record.get_changed_fields(), ["tags"]);
    }

    #[test]
    fn identity_assignment_transitions_new_to_persisted() {
        let mut record = person_schema().new_record(doc! { "name": "Ada" }).unwrap();
        assert!(record.is_new());
        record
            .set("id", Value::Scalar(Bson::ObjectId(ObjectId::new())))
            .unwrap();
        assert!(!record.is_new());
    }

    #[test]
    fn shard_key_immutable_once_persisted() {
        let mut record = loaded_person();
        assert!(!record.is_new());

        // same value is a no-op, not an error
        record.set_serialized("region", &"emea").unwrap();

        let err = record.set_serialized("region", &"apac").unwrap_err();
        assert!(matches!(err, Error::Operation(_)));
    }

    #[test]
    fn marshal_puts_identity_first_and_omits_absent_id() {
        let mut record = loaded_person();
        let doc = record.to_wire(None).unwrap();
        assert_eq!(doc.keys().next().map(String::as_str), Some("_id"));
        assert!(!doc.contains_key(DISCRIMINATOR_KEY));

        let mut fresh = person_schema().new_record(doc! { "name": "Ada" }).unwrap();
        let doc = fresh.to_wire(None).unwrap();
        assert!(!doc.contains_key("_id"));
    }

    #[test]
    fn marshal_includes_null_only_for_nullable_fields() {
        let mut record = person_schema().new_record(doc! { "name": "Ada" }).unwrap();
        let doc = record.to_wire(None).unwrap();
        assert_eq!(doc.get("nick"), Some(&Bson::Null));
        assert!(!doc.contains_key("address"));
    }

    #[test]
    fn projection_limits_output_to_requested_roots() {
        let mut record = loaded_person();
        let doc = record.to_wire(Some(&["name"])).unwrap();
        let keys: Vec<&str> = doc.keys().map(String::as_str).collect();
        assert_eq!(keys, ["_id", "name"]);
    }

    #[test]
    fn nested_projection_threads_into_embedded_records() {
        let mut record = loaded_person();
        let doc = record.to_wire(Some(&["address.city"])).unwrap();
        let address = doc.get_document("address").unwrap();
        let keys: Vec<&str> = address.keys().map(String::as_str).collect();
        assert_eq!(keys, ["city"]);
    }

    #[test]
    fn round_trip_is_lossless_and_clean() {
        let mut record = loaded_person();
        let wire = record.to_wire(None).unwrap();
        let loaded = person_schema().load(wire).unwrap();

        assert_eq!(loaded, record);
        assert!(loaded.get_changed_fields().is_empty());
    }

    #[test]
    fn validation_accumulates_all_field_errors() {
        let schema = Schema::embedded("RecValAgg")
            .field(FieldDescriptor::new("a", FieldKind::string()).required())
            .field(FieldDescriptor::new("b", FieldKind::int()).required())
            .register()
            .unwrap();
        let record = schema.new_record(doc! {}).unwrap();

        let err = record.validate().unwrap_err();
        assert_eq!(err.errors().len(), 2);
        assert!(err.errors().contains_key("a"));
        assert!(err.errors().contains_key("b"));
    }

    #[test]
    fn unmarshal_collects_every_coercion_failure() {
        address_schema();
        let schema = Schema::document("RecBadLoad")
            .collection("rec_bad_load")
            .field(FieldDescriptor::new("a", FieldKind::embedded("RecAddress")))
            .field(FieldDescriptor::new("b", FieldKind::embedded("RecAddress")))
            .register()
            .unwrap();

        let err = schema
            .load(doc! { "a": "not a document", "b": 42 })
            .unwrap_err();
        match err {
            Error::InvalidDocument { errors, .. } => {
                assert_eq!(errors.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn polymorphic_load_resolves_most_derived_type() {
        let base = Schema::document("RecShape")
            .collection("rec_shapes")
            .polymorphic()
            .field(FieldDescriptor::new("name", FieldKind::string()))
            .register()
            .unwrap();
        Schema::document("RecCircle")
            .extends(&base)
            .field(FieldDescriptor::new("radius", FieldKind::float()))
            .register()
            .unwrap();

        let loaded = base
            .load(doc! { "_cls": "RecCircle", "name": "c", "radius": 2.0 })
            .unwrap();
        assert_eq!(loaded.type_name(), "RecCircle");
        assert_eq!(loaded.get("radius").unwrap().as_f64(), Some(2.0));

        // marshaling a polymorphic record carries the most-derived name
        let mut loaded = loaded;
        let wire = loaded.to_wire(None).unwrap();
        assert_eq!(wire.get_str(DISCRIMINATOR_KEY).unwrap(), "RecCircle");
    }

    #[test]
    fn non_strict_load_preserves_unknown_keys() {
        let schema = Schema::document("RecLoose")
            .collection("rec_loose")
            .non_strict()
            .field(FieldDescriptor::new("name", FieldKind::string()))
            .register()
            .unwrap();

        let record = schema
            .load(doc! { "name": "x", "legacy": { "n": 1 } })
            .unwrap();
        assert!(record.extra().contains_key("legacy"));

        // unknown keys stay off the wire and out of validation
        let mut record = record;
        assert!(record.validate().is_ok());
        assert!(!record.to_wire(None).unwrap().contains_key("legacy"));
    }

    #[test]
    fn sorted_list_ordering_change_dirties_whole_field() {
        address_schema();
        let schema = Schema::document("RecSortedOwner")
            .collection("rec_sorted")
            .field(FieldDescriptor::new(
                "stops",
                FieldKind::sorted_list(FieldKind::embedded("RecAddress"), Some("city"), false),
            ))
            .register()
            .unwrap();

        let mut record = schema
            .load(doc! { "stops": [ { "city": "B" }, { "city": "A" } ] })
            .unwrap();
        record
            .get_mut("stops")
            .and_then(Value::as_array_mut)
            .unwrap()
            .get_mut(0)
            .and_then(Value::as_record_mut)
            .unwrap()
            .set_serialized("city", &"Z")
            .unwrap();

        assert_eq!(record.get_changed_fields(), ["stops"]);
    }

    #[test]
    fn clear_changed_fields_resets_nested_state() {
        let mut record = loaded_person();
        record
            .get_mut("address")
            .and_then(Value::as_record_mut)
            .unwrap()
            .set_serialized("city", &"Paris")
            .unwrap();
        record
            .get_mut("tags")
            .and_then(Value::as_array_mut)
            .unwrap()
            .push(Value::from_bson(Bson::String("c".into())));

        record.clear_changed_fields();
        assert!(record.get_changed_fields().is_empty());
    }

    #[test]
    fn json_round_trip() {
        let mut record = loaded_person();
        let json = record.to_json().unwrap();
        let loaded = Record::from_json(&person_schema(), &json, false).unwrap();
        assert_eq!(loaded, record);
        assert!(!loaded.is_new());
    }
}
