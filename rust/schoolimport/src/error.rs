use std::path::PathBuf;
use thiserror::Error;

use crate::model::EntityType;
use crate::schema::Violation;

/// Fatal conditions. A run that returns one of these has written nothing.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("source file not found: {path}")]
    SourceMissing { path: PathBuf },

    #[error("schema file not found: {path}")]
    SchemaMissing { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("source document {path} is not well-formed XML: {source}")]
    MalformedSource {
        path: PathBuf,
        #[source]
        source: roxmltree::Error,
    },

    #[error("schema {path} could not be loaded: {source}")]
    Schema {
        path: PathBuf,
        #[source]
        source: SchemaError,
    },

    #[error("source document {path} failed schema validation with {} violation(s)", violations.len())]
    SchemaViolations {
        path: PathBuf,
        violations: Vec<Violation>,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Problems with the XSD document itself.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("not well-formed XML: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("root element must be xs:schema, found <{0}>")]
    NotASchema(String),

    #[error("schema declares no global element")]
    NoGlobalElement,

    #[error("unsupported schema construct <xs:{construct}> at line {line}")]
    Unsupported { construct: String, line: u32 },

    #[error("unknown type reference '{name}' at line {line}")]
    UnknownType { name: String, line: u32 },

    #[error("unknown element reference '{name}' at line {line}")]
    UnknownElement { name: String, line: u32 },

    #[error("invalid value '{value}' for {attribute} at line {line}")]
    BadAttribute {
        attribute: String,
        value: String,
        line: u32,
    },

    #[error("element declaration at line {line} has no name")]
    Unnamed { line: u32 },
}

/// Store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{field} refers to a record that was never persisted")]
    UnresolvedReference { field: &'static str },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A single legacy record could not be mapped to an entity.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MapError {
    #[error("missing required field '{field}'")]
    MissingField { field: &'static str },

    #[error("field '{field}' has value '{value}' which does not match date format {format}")]
    InvalidDate {
        field: &'static str,
        value: String,
        format: String,
    },

    #[error("field '{field}' has non-numeric value '{value}'")]
    InvalidNumber { field: &'static str, value: String },

    #[error("field '{field}' {reason}")]
    Integrity { field: &'static str, reason: String },

    #[error("unknown record kind <{0}>")]
    UnknownKind(String),
}

/// Change-log writes that fail the whitelist check.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuditError {
    #[error("unknown entity type '{0}'")]
    UnknownEntityType(String),

    #[error("entity type {0} is not enabled for auditing")]
    NotAudited(EntityType),

    #[error("change set for {entity_type} {entity_id} is empty")]
    EmptyChangeSet {
        entity_type: EntityType,
        entity_id: i64,
    },
}

/// Per-record failure. Becomes an `Error` outcome; never aborts the run.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error(transparent)]
    Map(#[from] MapError),

    #[error("audit: {0}")]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for RecordError {
    fn from(e: rusqlite::Error) -> Self {
        RecordError::Store(StoreError::Sqlite(e))
    }
}
