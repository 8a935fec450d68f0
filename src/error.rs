use std::collections::BTreeMap;
use std::fmt;

/// Validation failure for a single field or a whole document.
///
/// A document-level error carries one entry per offending field in
/// [`errors`](Self::errors); composite fields nest further, keyed by element
/// index (sequences) or key (mappings).
#[derive(Debug, Clone, Default)]
pub struct ValidationError {
    message: String,
    field_name: Option<String>,
    errors: BTreeMap<String, ValidationError>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field_name: None,
            errors: BTreeMap::new(),
        }
    }

    pub fn for_field(field_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field_name: Some(field_name.into()),
            errors: BTreeMap::new(),
        }
    }

    pub fn aggregate(message: impl Into<String>, errors: BTreeMap<String, ValidationError>) -> Self {
        Self {
            message: message.into(),
            field_name: None,
            errors,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn field_name(&self) -> Option<&str> {
        self.field_name.as_deref()
    }

    /// Nested per-field errors; empty for a leaf error.
    pub fn errors(&self) -> &BTreeMap<String, ValidationError> {
        &self.errors
    }

    /// Flattens the error tree into dotted-path -> message pairs.
    pub fn to_paths(&self) -> BTreeMap<String, String> {
        fn walk(prefix: &str, err: &ValidationError, out: &mut BTreeMap<String, String>) {
            if err.errors.is_empty() {
                out.insert(prefix.to_string(), err.message.clone());
                return;
            }
            for (key, sub) in &err.errors {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                walk(&path, sub, out);
            }
        }

        let mut out = BTreeMap::new();
        walk("", self, &mut out);
        out
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.errors.is_empty() {
            let details = self
                .to_paths()
                .into_iter()
                .map(|(path, msg)| format!("{path}: {msg}"))
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A wire document could not be coerced into the declared schema. One
    /// entry per failing field; collected, not fail-fast.
    #[error("invalid data to create a `{type_name}` instance: {}", format_field_errors(.errors))]
    InvalidDocument {
        type_name: String,
        errors: BTreeMap<String, String>,
    },

    #[error("the fields {fields:?} do not exist on the document `{type_name}`")]
    FieldDoesNotExist {
        type_name: String,
        fields: Vec<String>,
    },

    /// Illegal identity/shard-key mutation, or a failed write surfaced from
    /// the driver.
    #[error("operation error: {0}")]
    Operation(String),

    #[error("not unique: {0}")]
    NotUnique(String),

    /// Partial bulk-write failure; each entry is the zero-based position of
    /// a failing operation in the batch and the driver's message for it.
    #[error("bulk operation failed at {}", format_bulk_failures(.failures))]
    BulkOperation { failures: Vec<(usize, String)> },

    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed schema or index declaration.
    #[error("definition error: {0}")]
    Definition(String),

    #[error(transparent)]
    Database(mongodb::error::Error),
}

fn format_field_errors(errors: &BTreeMap<String, String>) -> String {
    errors
        .iter()
        .map(|(field, msg)| format!("{field} - {msg}"))
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_bulk_failures(failures: &[(usize, String)]) -> String {
    failures
        .iter()
        .map(|(idx, msg)| format!("op #{idx}: {msg}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<mongodb::error::Error> for Error {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::{ErrorKind, WriteFailure};

        match err.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(write_err)) => {
                // 11000/11001: duplicate key
                if write_err.code == 11000 || write_err.code == 11001 {
                    Self::NotUnique(write_err.message.clone())
                } else {
                    Self::Operation(write_err.message.clone())
                }
            }
            ErrorKind::Write(WriteFailure::WriteConcernError(wc_err)) => {
                Self::Operation(wc_err.message.clone())
            }
            ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } => {
                Self::Connection(err.to_string())
            }
            _ => Self::Database(err),
        }
    }
}

impl Error {
    /// Connection-level failures are the only transient kind: they are the
    /// designated trigger for the read-path retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_flattens_nested_paths() {
        let inner = ValidationError::aggregate(
            "ValidationError",
            BTreeMap::from([(
                "city".to_string(),
                ValidationError::for_field("city", "Field is required"),
            )]),
        );
        let outer = ValidationError::aggregate(
            "ValidationError",
            BTreeMap::from([("address".to_string(), inner)]),
        );

        let paths = outer.to_paths();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths["address.city"], "Field is required");
    }

    #[test]
    fn transient_classification() {
        assert!(Error::Connection("no reachable servers".into()).is_transient());
        assert!(!Error::Operation("boom".into()).is_transient());
        assert!(!Error::Validation(ValidationError::new("bad")).is_transient());
    }
}
