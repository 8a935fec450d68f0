use crate::error::{Error, Result};
use crate::record::Record;
use indexmap::IndexMap;
use mongodb::bson::Bson;
use serde::Serialize;

/// An application-level field value.
///
/// Scalars are carried as raw [`Bson`]; sequences and mappings are wrapped in
/// change-tracking containers so that element-level mutation can be reported
/// back to the owning [`Record`] without a parent back-pointer: each container
/// keeps its own changed-path set and the record pulls it on demand.
///
/// Invariant: `Scalar` never holds `Bson::Array` or `Bson::Document` — those
/// always enter as `Array` / `Map` (or `Record` for typed sub-documents).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(Bson),
    Array(TrackedArray),
    Map(TrackedMap),
    Record(Record),
}

impl Value {
    /// Converts raw wire data with no schema knowledge. Typed coercion
    /// (embedded records, datetimes, ...) is the field descriptor's job.
    pub fn from_bson(bson: Bson) -> Self {
        match bson {
            Bson::Array(items) => {
                Self::Array(TrackedArray::from_values(
                    items.into_iter().map(Self::from_bson).collect(),
                ))
            }
            Bson::Document(doc) => Self::Map(TrackedMap::from_entries(
                doc.into_iter().map(|(k, v)| (k, Self::from_bson(v))),
            )),
            other => Self::Scalar(other),
        }
    }

    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        let bson = mongodb::bson::to_bson(value)
            .map_err(|err| Error::Operation(format!("could not serialize value: {err}")))?;
        Ok(Self::from_bson(bson))
    }

    pub fn to_bson(&self) -> Result<Bson> {
        match self {
            Self::Scalar(bson) => Ok(bson.clone()),
            Self::Array(array) => Ok(Bson::Array(
                array
                    .iter()
                    .map(Self::to_bson)
                    .collect::<Result<Vec<_>>>()?,
            )),
            Self::Map(map) => {
                let mut doc = mongodb::bson::Document::new();
                for (key, value) in map.iter() {
                    doc.insert(key.clone(), value.to_bson()?);
                }
                Ok(Bson::Document(doc))
            }
            Self::Record(record) => Ok(Bson::Document(record.to_wire_projected(None)?)),
        }
    }

    pub fn null() -> Self {
        Self::Scalar(Bson::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Scalar(Bson::Null))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Scalar(Bson::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Scalar(Bson::Int32(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Scalar(Bson::Int64(n)) => Some(*n),
            Self::Scalar(Bson::Int32(n)) => Some(i64::from(*n)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Scalar(Bson::Double(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Scalar(Bson::Boolean(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object_id(&self) -> Option<mongodb::bson::oid::ObjectId> {
        match self {
            Self::Scalar(Bson::ObjectId(oid)) => Some(*oid),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_record_mut(&mut self) -> Option<&mut Record> {
        match self {
            Self::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&TrackedArray> {
        match self {
            Self::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut TrackedArray> {
        match self {
            Self::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&TrackedMap> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut TrackedMap> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Clears dirty state on this value and everything below it.
    pub(crate) fn clear_changed(&mut self) {
        match self {
            Self::Scalar(_) => {}
            Self::Array(array) => array.clear_changed(),
            Self::Map(map) => map.clear_changed(),
            Self::Record(record) => record.clear_changed_fields(),
        }
    }
}

impl From<Bson> for Value {
    fn from(bson: Bson) -> Self {
        Self::from_bson(bson)
    }
}

/// List wrapper that records which of its slots were mutated.
///
/// Replacing one slot through [`set`](Self::set) records just that index;
/// structural mutation (push/insert/remove/clear/sort) cannot be expressed as
/// a sub-path and marks the whole container. [`get_mut`](Self::get_mut)
/// records nothing: nested records track their own changes, and scalar
/// replacement must go through `set`.
#[derive(Debug, Clone, Default)]
pub struct TrackedArray {
    items: Vec<Value>,
    changed: Vec<String>,
    whole_changed: bool,
}

impl TrackedArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(items: Vec<Value>) -> Self {
        Self {
            items,
            changed: Vec::new(),
            whole_changed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Value> {
        self.items.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.items.iter()
    }

    /// Replaces the slot at `index`, recording it as changed.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn set(&mut self, index: usize, value: Value) {
        self.items[index] = value;
        let key = index.to_string();
        if !self.changed.contains(&key) {
            self.changed.push(key);
        }
    }

    pub fn push(&mut self, value: Value) {
        self.items.push(value);
        self.whole_changed = true;
    }

    pub fn insert(&mut self, index: usize, value: Value) {
        self.items.insert(index, value);
        self.whole_changed = true;
    }

    pub fn remove(&mut self, index: usize) -> Value {
        self.whole_changed = true;
        self.items.remove(index)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.whole_changed = true;
    }

    pub fn whole_changed(&self) -> bool {
        self.whole_changed
    }

    pub fn changed_slots(&self) -> &[String] {
        &self.changed
    }

    pub(crate) fn clear_changed(&mut self) {
        self.changed.clear();
        self.whole_changed = false;
        for item in &mut self.items {
            item.clear_changed();
        }
    }
}

impl PartialEq for TrackedArray {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl<'a> IntoIterator for &'a TrackedArray {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl FromIterator<Value> for TrackedArray {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self::from_values(iter.into_iter().collect())
    }
}

/// Insertion-ordered map wrapper that records mutated keys.
#[derive(Debug, Clone, Default)]
pub struct TrackedMap {
    entries: IndexMap<String, Value>,
    changed: Vec<String>,
}

impl TrackedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
            changed: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.get_mut(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, String, Value> {
        self.entries.iter()
    }

    pub fn keys(&self) -> indexmap::map::Keys<'_, String, Value> {
        self.entries.keys()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        if !self.changed.contains(&key) {
            self.changed.push(key.clone());
        }
        self.entries.insert(key, value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.entries.shift_remove(key);
        if removed.is_some() && !self.changed.iter().any(|k| k == key) {
            self.changed.push(key.to_string());
        }
        removed
    }

    pub fn changed_keys(&self) -> &[String] {
        &self.changed
    }

    pub(crate) fn clear_changed(&mut self) {
        self.changed.clear();
        for value in self.entries.values_mut() {
            value.clear_changed();
        }
    }
}

impl PartialEq for TrackedMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl FromIterator<(String, Value)> for TrackedMap {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self::from_entries(iter)
    }
}
