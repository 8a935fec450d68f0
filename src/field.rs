use crate::error::{Error, Result, ValidationError};
use crate::schema::registry;
use crate::value::{TrackedArray, TrackedMap, Value};
use mongodb::bson::{Bson, oid::ObjectId};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// The typed shape of one field, with its kind-specific validation rules.
#[derive(Debug, Clone)]
pub enum FieldKind {
    String {
        min_length: Option<usize>,
        max_length: Option<usize>,
        pattern: Option<Regex>,
    },
    /// 32-bit integer.
    Int { min: Option<i32>, max: Option<i32> },
    /// 64-bit integer.
    Long { min: Option<i64>, max: Option<i64> },
    Float { min: Option<f64>, max: Option<f64> },
    Boolean,
    DateTime,
    ObjectId {
        /// Self-generating: produces a fresh id at marshal time when unset.
        auto: bool,
    },
    Binary { max_bytes: Option<usize> },
    /// A typed sub-record, resolved through the type registry by name.
    Embedded { type_name: String },
    List {
        item: Box<FieldKind>,
        /// When set, the marshaled list is sorted before hitting the wire;
        /// `ordering` names the element key to sort by (embedded elements),
        /// scalars sort by natural BSON comparison.
        sort: Option<ListSort>,
    },
    Map { value: Box<FieldKind> },
}

#[derive(Debug, Clone)]
pub struct ListSort {
    pub ordering: Option<String>,
    pub reverse: bool,
}

impl FieldKind {
    pub fn string() -> Self {
        Self::String {
            min_length: None,
            max_length: None,
            pattern: None,
        }
    }

    pub fn int() -> Self {
        Self::Int { min: None, max: None }
    }

    pub fn long() -> Self {
        Self::Long { min: None, max: None }
    }

    pub fn float() -> Self {
        Self::Float { min: None, max: None }
    }

    pub fn embedded(type_name: impl Into<String>) -> Self {
        Self::Embedded {
            type_name: type_name.into(),
        }
    }

    pub fn list(item: FieldKind) -> Self {
        Self::List {
            item: Box::new(item),
            sort: None,
        }
    }

    pub fn sorted_list(item: FieldKind, ordering: Option<&str>, reverse: bool) -> Self {
        Self::List {
            item: Box::new(item),
            sort: Some(ListSort {
                ordering: ordering.map(str::to_string),
                reverse,
            }),
        }
    }

    pub fn map(value: FieldKind) -> Self {
        Self::Map {
            value: Box::new(value),
        }
    }

    pub fn with_length(self, min_length: Option<usize>, max_length: Option<usize>) -> Self {
        match self {
            Self::String { pattern, .. } => Self::String {
                min_length,
                max_length,
                pattern,
            },
            other => other,
        }
    }

    pub fn with_pattern(self, pattern: Regex) -> Self {
        match self {
            Self::String {
                min_length,
                max_length,
                ..
            } => Self::String {
                min_length,
                max_length,
                pattern: Some(pattern),
            },
            other => other,
        }
    }

    pub fn with_int_bounds(self, min: Option<i32>, max: Option<i32>) -> Self {
        match self {
            Self::Int { .. } => Self::Int { min, max },
            other => other,
        }
    }

    pub fn with_long_bounds(self, min: Option<i64>, max: Option<i64>) -> Self {
        match self {
            Self::Long { .. } => Self::Long { min, max },
            other => other,
        }
    }

    pub fn with_float_bounds(self, min: Option<f64>, max: Option<f64>) -> Self {
        match self {
            Self::Float { .. } => Self::Float { min, max },
            other => other,
        }
    }
}

/// Default value for a field that was not supplied at construction time.
#[derive(Clone)]
pub enum DefaultValue {
    Fixed(Bson),
    Factory(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(bson) => write!(f, "Fixed({bson})"),
            Self::Factory(_) => write!(f, "Factory(..)"),
        }
    }
}

/// Typed slot definition attached to a record type. Created once at schema
/// declaration time and shared read-only across all instances of that type.
#[derive(Clone)]
pub struct FieldDescriptor {
    name: String,
    wire_name: String,
    kind: FieldKind,
    required: bool,
    nullable: bool,
    default: Option<DefaultValue>,
    choices: Option<Vec<Bson>>,
    validator: Option<Arc<dyn Fn(&Value) -> bool + Send + Sync>>,
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("wire_name", &self.wire_name)
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("nullable", &self.nullable)
            .field("choices", &self.choices)
            .finish_non_exhaustive()
    }
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        Self {
            wire_name: name.clone(),
            name,
            kind,
            required: false,
            nullable: false,
            default: None,
            choices: None,
            validator: None,
        }
    }

    pub fn wire_name(mut self, wire_name: impl Into<String>) -> Self {
        self.wire_name = wire_name.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default_value(mut self, default: impl Into<Bson>) -> Self {
        self.default = Some(DefaultValue::Fixed(default.into()));
        self
    }

    pub fn default_with(mut self, factory: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.default = Some(DefaultValue::Factory(Arc::new(factory)));
        self
    }

    pub fn choices(mut self, choices: impl IntoIterator<Item = impl Into<Bson>>) -> Self {
        self.choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    pub fn validated_by(mut self, validator: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wire_key(&self) -> &str {
        &self.wire_name
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_auto_generating(&self) -> bool {
        matches!(self.kind, FieldKind::ObjectId { auto: true })
    }

    /// Fresh value for a self-generating field that is still unset at
    /// marshal time.
    pub fn generate(&self) -> Option<Value> {
        if self.is_auto_generating() {
            Some(Value::Scalar(Bson::ObjectId(ObjectId::new())))
        } else {
            None
        }
    }

    /// Default for a field not supplied at construction. Lists and maps fall
    /// back to an empty container; a present empty container satisfies
    /// `required`, which only demands a non-null value.
    pub fn default_for(&self) -> Option<Value> {
        match &self.default {
            Some(DefaultValue::Fixed(bson)) => Some(Value::from_bson(bson.clone())),
            Some(DefaultValue::Factory(factory)) => Some(factory()),
            None => match &self.kind {
                FieldKind::List { .. } => Some(Value::Array(TrackedArray::new())),
                FieldKind::Map { .. } => Some(Value::Map(TrackedMap::new())),
                _ => None,
            },
        }
    }

    /// Best-effort coercion of a wire value into its application shape.
    ///
    /// Malformed scalar input is passed through unchanged rather than
    /// rejected — `validate` catches it later. Only sub-record unmarshaling
    /// can fail here, and those failures are accumulated by the caller.
    pub fn to_application(&self, wire: Bson) -> Result<Value> {
        if matches!(wire, Bson::Null) {
            return Ok(Value::null());
        }
        match &self.kind {
            FieldKind::String { .. } => match wire {
                Bson::String(s) => Ok(Value::Scalar(Bson::String(s))),
                other => Ok(Value::from_bson(other)),
            },
            FieldKind::Int { .. } => Ok(Value::Scalar(coerce_int(wire))),
            FieldKind::Long { .. } => Ok(Value::Scalar(coerce_long(wire))),
            FieldKind::Float { .. } => Ok(Value::Scalar(coerce_float(wire))),
            FieldKind::Boolean => Ok(Value::from_bson(wire)),
            FieldKind::DateTime => Ok(Value::Scalar(coerce_datetime(wire))),
            FieldKind::ObjectId { .. } => match wire {
                Bson::String(s) => match ObjectId::parse_str(&s) {
                    Ok(oid) => Ok(Value::Scalar(Bson::ObjectId(oid))),
                    Err(_) => Ok(Value::Scalar(Bson::String(s))),
                },
                other => Ok(Value::from_bson(other)),
            },
            FieldKind::Binary { .. } => Ok(Value::from_bson(wire)),
            FieldKind::Embedded { type_name } => match wire {
                Bson::Document(doc) => {
                    let schema = registry::get(type_name).ok_or_else(|| {
                        Error::Definition(format!("embedded type `{type_name}` is not registered"))
                    })?;
                    let record = crate::record::Record::from_wire(&schema, doc)?;
                    Ok(Value::Record(record))
                }
                _ => Err(Error::Operation(format!(
                    "embedded field `{}` requires a document value",
                    self.name
                ))),
            },
            FieldKind::List { item, .. } => match wire {
                Bson::Array(items) => {
                    let inner = self.element_descriptor(item);
                    let converted = items
                        .into_iter()
                        .map(|v| inner.to_application(v))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(Value::Array(TrackedArray::from_values(converted)))
                }
                other => Ok(Value::from_bson(other)),
            },
            FieldKind::Map { value } => match wire {
                Bson::Document(doc) => {
                    let inner = self.element_descriptor(value);
                    let mut entries = Vec::with_capacity(doc.len());
                    for (key, v) in doc {
                        entries.push((key, inner.to_application(v)?));
                    }
                    Ok(Value::Map(TrackedMap::from_entries(entries)))
                }
                other => Ok(Value::from_bson(other)),
            },
        }
    }

    /// Serializes an application value for the wire. `projection` is a set of
    /// nested paths to include, threaded into embedded sub-records.
    pub fn to_wire(&self, value: &Value, projection: Option<&[String]>) -> Result<Bson> {
        match (&self.kind, value) {
            (FieldKind::Embedded { .. }, Value::Record(record)) => {
                Ok(Bson::Document(record.to_wire_projected(projection)?))
            }
            (FieldKind::List { item, sort }, Value::Array(array)) => {
                let inner = self.element_descriptor(item);
                let mut items = array
                    .iter()
                    .map(|v| inner.to_wire(v, projection))
                    .collect::<Result<Vec<_>>>()?;
                if let Some(sort) = sort {
                    sort_wire_list(&mut items, sort);
                }
                Ok(Bson::Array(items))
            }
            (FieldKind::Map { value: item }, Value::Map(map)) => {
                let inner = self.element_descriptor(item);
                let mut doc = mongodb::bson::Document::new();
                for (key, v) in map.iter() {
                    doc.insert(key.clone(), inner.to_wire(v, projection)?);
                }
                Ok(Bson::Document(doc))
            }
            (FieldKind::Long { .. }, Value::Scalar(Bson::Int32(n))) => Ok(Bson::Int64(i64::from(*n))),
            (FieldKind::DateTime, Value::Scalar(scalar)) => Ok(coerce_datetime(scalar.clone())),
            _ => value.to_bson(),
        }
    }

    /// Validates a non-null value. Composite kinds validate every element and
    /// aggregate per-index / per-key errors into a single error.
    pub fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        self.validate_kind(value)?;

        if let Some(choices) = &self.choices {
            let bson = value
                .to_bson()
                .map_err(|err| self.error(format!("value not comparable to choices: {err}")))?;
            if !choices.contains(&bson) {
                return Err(self.error(format!("value {bson} is not an allowed choice")));
            }
        }

        if let Some(validator) = &self.validator {
            if !validator(value) {
                return Err(self.error("value failed custom validation"));
            }
        }

        Ok(())
    }

    fn validate_kind(&self, value: &Value) -> Result<(), ValidationError> {
        match &self.kind {
            FieldKind::String {
                min_length,
                max_length,
                pattern,
            } => {
                let Some(s) = value.as_str() else {
                    return Err(self.error("only accepts string values"));
                };
                if let Some(max) = max_length {
                    if s.chars().count() > *max {
                        return Err(self.error("string value is too long"));
                    }
                }
                if let Some(min) = min_length {
                    if s.chars().count() < *min {
                        return Err(self.error("string value is too short"));
                    }
                }
                if let Some(pattern) = pattern {
                    if !pattern.is_match(s) {
                        return Err(self.error("string value did not match validation regex"));
                    }
                }
                Ok(())
            }
            FieldKind::Int { min, max } => {
                let Some(n) = value.as_i32() else {
                    return Err(self.error("could not be interpreted as a 32-bit integer"));
                };
                if min.is_some_and(|min| n < min) {
                    return Err(self.error("integer value is too small"));
                }
                if max.is_some_and(|max| n > max) {
                    return Err(self.error("integer value is too large"));
                }
                Ok(())
            }
            FieldKind::Long { min, max } => {
                let Some(n) = value.as_i64() else {
                    return Err(self.error("could not be interpreted as a 64-bit integer"));
                };
                if min.is_some_and(|min| n < min) {
                    return Err(self.error("long value is too small"));
                }
                if max.is_some_and(|max| n > max) {
                    return Err(self.error("long value is too large"));
                }
                Ok(())
            }
            FieldKind::Float { min, max } => {
                let n = match value {
                    Value::Scalar(Bson::Double(n)) => *n,
                    Value::Scalar(Bson::Int32(n)) => f64::from(*n),
                    _ => return Err(self.error("only accepts float and integer values")),
                };
                if min.is_some_and(|min| n < min) {
                    return Err(self.error("float value is too small"));
                }
                if max.is_some_and(|max| n > max) {
                    return Err(self.error("float value is too large"));
                }
                Ok(())
            }
            FieldKind::Boolean => {
                if value.as_bool().is_none() {
                    return Err(self.error("only accepts boolean values"));
                }
                Ok(())
            }
            FieldKind::DateTime => match value {
                Value::Scalar(Bson::DateTime(_)) => Ok(()),
                Value::Scalar(scalar) if matches!(coerce_datetime(scalar.clone()), Bson::DateTime(_)) => {
                    Ok(())
                }
                _ => Err(self.error("cannot parse date")),
            },
            FieldKind::ObjectId { .. } => match value {
                Value::Scalar(Bson::ObjectId(_)) => Ok(()),
                Value::Scalar(Bson::String(s)) if ObjectId::parse_str(s).is_ok() => Ok(()),
                _ => Err(self.error("could not convert to ObjectId")),
            },
            FieldKind::Binary { max_bytes } => match value {
                Value::Scalar(Bson::Binary(binary)) => {
                    if max_bytes.is_some_and(|max| binary.bytes.len() > max) {
                        return Err(self.error("binary value is too long"));
                    }
                    Ok(())
                }
                _ => Err(self.error("only accepts binary values")),
            },
            FieldKind::Embedded { type_name } => {
                let Some(record) = value.as_record() else {
                    return Err(self.error("invalid embedded record instance"));
                };
                if !record.schema().is_a(type_name) {
                    return Err(self.error(format!(
                        "expected an embedded `{type_name}`, got `{}`",
                        record.schema().name()
                    )));
                }
                match record.validate() {
                    Ok(()) => Ok(()),
                    Err(err) => Err(ValidationError::aggregate(
                        format!("invalid embedded `{type_name}`"),
                        if err.errors().is_empty() {
                            BTreeMap::from([(self.name.clone(), err)])
                        } else {
                            err.errors().clone()
                        },
                    )),
                }
            }
            FieldKind::List { item, .. } => {
                let Some(array) = value.as_array() else {
                    return Err(self.error("only lists may be used in a list field"));
                };
                let inner = self.element_descriptor(item);
                let mut errors = BTreeMap::new();
                for (index, element) in array.iter().enumerate() {
                    if let Err(err) = inner.validate(element) {
                        errors.insert(index.to_string(), err);
                    }
                }
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(ValidationError::aggregate("invalid list contents", errors))
                }
            }
            FieldKind::Map { value: item } => {
                let Some(map) = value.as_map() else {
                    return Err(self.error("only mappings may be used in a map field"));
                };
                for key in map.keys() {
                    if key.contains('.') || key.starts_with('$') {
                        return Err(self.error(
                            "invalid mapping key - keys may not contain `.` or start with `$`",
                        ));
                    }
                }
                let inner = self.element_descriptor(item);
                let mut errors = BTreeMap::new();
                for (key, element) in map.iter() {
                    if let Err(err) = inner.validate(element) {
                        errors.insert(key.clone(), err);
                    }
                }
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(ValidationError::aggregate("invalid map contents", errors))
                }
            }
        }
    }

    /// Anonymous descriptor for one element of a composite field.
    fn element_descriptor(&self, kind: &FieldKind) -> FieldDescriptor {
        FieldDescriptor::new(self.name.clone(), kind.clone())
    }

    fn error(&self, message: impl Into<String>) -> ValidationError {
        ValidationError::for_field(self.name.clone(), message)
    }
}

fn coerce_int(wire: Bson) -> Bson {
    match wire {
        Bson::Int32(n) => Bson::Int32(n),
        Bson::Int64(n) => i32::try_from(n).map_or(Bson::Int64(n), Bson::Int32),
        Bson::Double(n) if n.fract() == 0.0 && n >= f64::from(i32::MIN) && n <= f64::from(i32::MAX) => {
            Bson::Int32(n as i32)
        }
        Bson::String(s) => match s.parse::<i32>() {
            Ok(n) => Bson::Int32(n),
            Err(_) => Bson::String(s),
        },
        other => other,
    }
}

fn coerce_long(wire: Bson) -> Bson {
    match wire {
        Bson::Int64(n) => Bson::Int64(n),
        Bson::Int32(n) => Bson::Int64(i64::from(n)),
        Bson::Double(n) if n.fract() == 0.0 => Bson::Int64(n as i64),
        Bson::String(s) => match s.parse::<i64>() {
            Ok(n) => Bson::Int64(n),
            Err(_) => Bson::String(s),
        },
        other => other,
    }
}

fn coerce_float(wire: Bson) -> Bson {
    match wire {
        Bson::Double(n) => Bson::Double(n),
        Bson::Int32(n) => Bson::Double(f64::from(n)),
        Bson::Int64(n) => Bson::Double(n as f64),
        Bson::String(s) => match s.parse::<f64>() {
            Ok(n) => Bson::Double(n),
            Err(_) => Bson::String(s),
        },
        other => other,
    }
}

fn coerce_datetime(wire: Bson) -> Bson {
    match wire {
        Bson::DateTime(dt) => Bson::DateTime(dt),
        Bson::String(s) => match chrono::DateTime::parse_from_rfc3339(&s) {
            Ok(parsed) => Bson::DateTime(mongodb::bson::DateTime::from_chrono(parsed)),
            Err(_) => Bson::String(s),
        },
        other => other,
    }
}

/// Total-enough ordering over wire scalars for sorted-list marshaling.
fn bson_cmp(a: &Bson, b: &Bson) -> Ordering {
    fn as_f64(bson: &Bson) -> Option<f64> {
        match bson {
            Bson::Int32(n) => Some(f64::from(*n)),
            Bson::Int64(n) => Some(*n as f64),
            Bson::Double(n) => Some(*n),
            _ => None,
        }
    }

    match (a, b) {
        (Bson::String(a), Bson::String(b)) => a.cmp(b),
        (Bson::DateTime(a), Bson::DateTime(b)) => a.cmp(b),
        (Bson::ObjectId(a), Bson::ObjectId(b)) => a.bytes().cmp(&b.bytes()),
        (Bson::Boolean(a), Bson::Boolean(b)) => a.cmp(b),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

fn sort_wire_list(items: &mut [Bson], sort: &ListSort) {
    items.sort_by(|a, b| {
        let ordering = match &sort.ordering {
            Some(key) => {
                let missing = Bson::Null;
                let a_key = match a {
                    Bson::Document(doc) => doc.get(key).unwrap_or(&missing),
                    other => other,
                };
                let b_key = match b {
                    Bson::Document(doc) => doc.get(key).unwrap_or(&missing),
                    other => other,
                };
                bson_cmp(a_key, b_key)
            }
            None => bson_cmp(a, b),
        };
        if sort.reverse { ordering.reverse() } else { ordering }
    });
}
