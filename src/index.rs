use crate::error::{Error, Result};
use mongodb::IndexModel;
use mongodb::bson::{Bson, Document};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Direction of one index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyDirection {
    Ascending,
    Descending,
    Hashed,
}

impl KeyDirection {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "1" => Ok(Self::Ascending),
            "-1" => Ok(Self::Descending),
            "hashed" => Ok(Self::Hashed),
            other => Err(Error::Definition(format!(
                "invalid index key direction `{other}`"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ascending => "1",
            Self::Descending => "-1",
            Self::Hashed => "hashed",
        }
    }

    pub fn to_bson(self) -> Bson {
        match self {
            Self::Ascending => Bson::Int32(1),
            Self::Descending => Bson::Int32(-1),
            Self::Hashed => Bson::String("hashed".into()),
        }
    }

    fn from_bson(bson: &Bson) -> Result<Self> {
        match bson {
            Bson::Int32(1) | Bson::Int64(1) => Ok(Self::Ascending),
            Bson::Int32(-1) | Bson::Int64(-1) => Ok(Self::Descending),
            Bson::Double(d) if *d == 1.0 => Ok(Self::Ascending),
            Bson::Double(d) if *d == -1.0 => Ok(Self::Descending),
            Bson::String(s) if s == "hashed" => Ok(Self::Hashed),
            other => Err(Error::Definition(format!(
                "invalid index key direction `{other}`"
            ))),
        }
    }
}

impl fmt::Display for KeyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural index properties, one bit each.
pub mod property {
    pub const UNIQUE: u8 = 1 << 0;
    pub const SPARSE: u8 = 1 << 1;
    pub const TTL: u8 = 1 << 2;
}

/// Reconciliation tags, one bit each. The numeric value doubles as the
/// display sort rank.
pub mod tag {
    pub const DEFINED: u8 = 1 << 0;
    pub const BUILT: u8 = 1 << 1;
    pub const COVERED: u8 = 1 << 2;
}

/// A declared index: an ordered key sequence plus structural properties.
///
/// Equality and hashing cover the keys and the property bits only. TTL
/// seconds and partial filter expressions are carried along but deliberately
/// excluded, so a live index whose expiry drifted from the declaration still
/// matches it and is left alone rather than rebuilt.
#[derive(Debug, Clone)]
pub struct IndexDefinition {
    keys: Vec<(String, KeyDirection)>,
    property: u8,
    expire_after_seconds: Option<i32>,
    partial_filter: Option<Document>,
}

impl IndexDefinition {
    /// Parses a compact keys spec like `"owner:1,created:-1"`. The
    /// application-level key `id` maps to `_id`.
    pub fn parse(keys_str: &str) -> Result<Self> {
        let mut keys = Vec::new();
        for part in keys_str.split(',') {
            let (name, dir) = part.split_once(':').ok_or_else(|| {
                Error::Definition(format!("invalid index key spec `{part}`"))
            })?;
            let name = if name == "id" { "_id" } else { name };
            keys.push((name.to_string(), KeyDirection::parse(dir)?));
        }
        Self::new(keys)
    }

    pub fn new(keys: Vec<(String, KeyDirection)>) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::Definition("empty index keys definition".into()));
        }
        Ok(Self {
            keys,
            property: 0,
            expire_after_seconds: None,
            partial_filter: None,
        })
    }

    /// Unique indexes cannot contain hashed keys.
    pub fn unique(mut self) -> Result<Self> {
        if self
            .keys
            .iter()
            .any(|(_, dir)| *dir == KeyDirection::Hashed)
        {
            return Err(Error::Definition(
                "unique index must not contain hashed keys".into(),
            ));
        }
        self.property |= property::UNIQUE;
        Ok(self)
    }

    pub fn sparse(mut self) -> Self {
        self.property |= property::SPARSE;
        self
    }

    /// TTL indexes must be single-key.
    pub fn expire_after_seconds(mut self, seconds: i32) -> Result<Self> {
        if self.keys.len() > 1 {
            return Err(Error::Definition(
                "TTL index must be a single-field index".into(),
            ));
        }
        self.property |= property::TTL;
        self.expire_after_seconds = Some(seconds);
        Ok(self)
    }

    pub fn partial_filter(mut self, filter: Document) -> Self {
        self.partial_filter = Some(filter);
        self
    }

    pub fn keys(&self) -> &[(String, KeyDirection)] {
        &self.keys
    }

    pub fn property_bits(&self) -> u8 {
        self.property
    }

    pub fn is_unique(&self) -> bool {
        self.property & property::UNIQUE != 0
    }

    pub fn is_sparse(&self) -> bool {
        self.property & property::SPARSE != 0
    }

    pub fn is_ttl(&self) -> bool {
        self.property & property::TTL != 0
    }

    pub fn ttl_seconds(&self) -> Option<i32> {
        self.expire_after_seconds
    }

    pub fn partial_filter_expression(&self) -> Option<&Document> {
        self.partial_filter.as_ref()
    }

    /// Canonical name derived from the key sequence, e.g. `owner_1_created_-1`.
    pub fn name(&self) -> String {
        self.keys
            .iter()
            .map(|(name, dir)| format!("{name}_{dir}"))
            .collect::<Vec<_>>()
            .join("_")
    }

    /// True when `other`'s key sequence starts with this index's entire key
    /// sequence, in order with matching directions, and is strictly longer.
    /// Such an index is redundant: any query it serves is served by `other`.
    pub fn is_covered_by(&self, other: &Self) -> bool {
        if self.keys.len() >= other.keys.len() {
            return false;
        }
        self.keys
            .iter()
            .zip(&other.keys)
            .all(|(a, b)| a == b)
    }

    /// Key document in the shape the server expects.
    pub fn to_wire_keys(&self) -> Document {
        let mut doc = Document::new();
        for (name, dir) in &self.keys {
            doc.insert(name.clone(), dir.to_bson());
        }
        doc
    }
}

impl fmt::Display for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        if self.is_unique() {
            write!(f, "_UNIQUE")?;
        }
        if self.is_sparse() {
            write!(f, "_SPARSE")?;
        }
        if self.is_ttl() {
            write!(f, "_TTL")?;
        }
        Ok(())
    }
}

impl PartialEq for IndexDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.keys == other.keys && self.property == other.property
    }
}

impl Eq for IndexDefinition {}

impl Hash for IndexDefinition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.keys.hash(state);
        self.property.hash(state);
    }
}

/// An index annotated with its reconciliation state: declared in the schema,
/// present on the server, or both, plus redundancy.
#[derive(Debug, Clone)]
pub struct TaggedIndex {
    index: IndexDefinition,
    tags: u8,
    real_name: Option<String>,
}

impl TaggedIndex {
    pub fn from_definition(index: IndexDefinition) -> Self {
        Self {
            index,
            tags: tag::DEFINED,
            real_name: None,
        }
    }

    /// Parses a live index reported by the server.
    pub fn from_index_model(model: &IndexModel) -> Result<Self> {
        let mut keys = Vec::new();
        for (name, dir) in &model.keys {
            keys.push((name.clone(), KeyDirection::from_bson(dir)?));
        }
        let mut index = IndexDefinition::new(keys)?;
        let mut real_name = None;

        if let Some(options) = &model.options {
            if options.unique == Some(true) {
                index.property |= property::UNIQUE;
            }
            if options.sparse == Some(true) {
                index.property |= property::SPARSE;
            }
            if let Some(expire) = options.expire_after {
                index.property |= property::TTL;
                index.expire_after_seconds = Some(expire.as_secs() as i32);
            }
            if let Some(filter) = &options.partial_filter_expression {
                index.partial_filter = Some(filter.clone());
            }
            real_name = options.name.clone();
        }

        Ok(Self {
            index,
            tags: tag::BUILT,
            real_name,
        })
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.index
    }

    pub fn is_defined(&self) -> bool {
        self.tags & tag::DEFINED != 0
    }

    pub fn is_built(&self) -> bool {
        self.tags & tag::BUILT != 0
    }

    pub fn is_covered(&self) -> bool {
        self.tags & tag::COVERED != 0
    }

    pub fn tags(&self) -> u8 {
        self.tags
    }

    /// The server-side name when the index exists, else the canonical name.
    pub fn display_name(&self) -> String {
        self.real_name
            .clone()
            .unwrap_or_else(|| self.index.name())
    }

    pub fn real_name(&self) -> Option<&str> {
        self.real_name.as_deref()
    }

    /// Whether `create_indexes` should build this one: declared, missing on
    /// the server, and not redundant.
    pub fn needs_build(&self) -> bool {
        self.is_defined() && !self.is_built() && !self.is_covered() && self.index.name() != "_id_1"
    }
}

/// Diffs the declared indexes of a record type against the live indexes of
/// its collection.
///
/// The mandatory `_id` index is always treated as declared. A declared index
/// matching a live one (by keys and properties) merges into a single entry
/// tagged both DEFINED and BUILT, keeping the server-side name. Redundancy is
/// then computed: a plain index (no properties) strictly prefixed by a longer
/// non-sparse non-TTL index is tagged COVERED. The result is sorted by tag
/// rank descending, so fully-reconciled entries come first and stale
/// server-only entries come last.
pub fn reconcile(desired: &[IndexDefinition], live: Vec<TaggedIndex>) -> Result<Vec<TaggedIndex>> {
    let mut entries: Vec<TaggedIndex> = Vec::new();
    for definition in desired {
        if !entries.iter().any(|e| e.index == *definition) {
            entries.push(TaggedIndex::from_definition(definition.clone()));
        }
    }
    let id_index = IndexDefinition::parse("id:1")?;
    if !entries.iter().any(|e| e.index == id_index) {
        entries.push(TaggedIndex::from_definition(id_index));
    }

    let mut live = live;
    for entry in &mut entries {
        if let Some(pos) = live.iter().position(|l| l.index == entry.index) {
            let matched = live.swap_remove(pos);
            entry.tags |= tag::BUILT;
            entry.real_name = matched.real_name;
        }
    }
    entries.extend(live);

    // redundancy over the combined view; only property-free indexes can be
    // redundant, and sparse/TTL indexes never subsume anything
    let covered: Vec<bool> = entries
        .iter()
        .map(|entry| {
            entry.index.property_bits() == 0
                && entries.iter().any(|other| {
                    !std::ptr::eq(entry, other)
                        && !other.index.is_sparse()
                        && !other.index.is_ttl()
                        && entry.index.is_covered_by(&other.index)
                })
        })
        .collect();
    for (entry, is_covered) in entries.iter_mut().zip(covered) {
        if is_covered {
            entry.tags |= tag::COVERED;
        }
    }

    entries.sort_by(|a, b| b.tags.cmp(&a.tags));
    Ok(entries)
}
