use std::{borrow::Cow, io};

use crate::{
    catalog::{record::Record, schema::SchemaId},
    store::StoreAction,
};

pub type DbResult<T, E = Error> = Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A value doesn't satisfy the constraints of its column.
    #[error("invalid value for column `{column}`: {reason}")]
    Validation {
        column: String,
        reason: Cow<'static, str>,
    },

    /// Structural misuse of a column set, schema or model.
    #[error("schema violation: {0}")]
    SchemaViolation(Cow<'static, str>),

    /// Malformed text representation.
    #[error("failed to parse `{column}`: {reason}")]
    Parse {
        column: String,
        reason: Cow<'static, str>,
    },

    /// The (primary) key of a record of the given schema is not fully set.
    #[error("incomplete key for records of `{0}`")]
    IncompleteKey(String),

    /// Storing the record would produce a duplicate key in an unique index.
    #[error("duplicate key for unique index `{index}` of `{schema}`")]
    UniqueViolation { schema: String, index: String },

    /// Tried to replace a stored record with an older version.
    #[error("cannot replace record of `{}` with an out-dated version", .0.schema().name())]
    StorageConflict(Box<Record>),

    /// The store action doesn't allow the required insert or update.
    #[error("{action:?} doesn't allow storing this record of `{}`", record.schema().name())]
    ActionNotAllowed {
        action: StoreAction,
        record: Box<Record>,
    },

    /// A failed store-level operation, with the record it failed on, if any.
    #[error("{operation} failed: {source}")]
    Db {
        operation: &'static str,
        record: Option<Box<Record>>,
        #[source]
        source: Box<Error>,
    },

    /// A persisted data file doesn't have the expected structure.
    #[error("corrupted data: {0}")]
    Corrupted(Cow<'static, str>),

    /// Invalid type tag.
    #[error("corrupted type tag ({0})")]
    CorruptedTypeTag(u8),

    /// UTF-8 error.
    #[error("utf-8 error while decoding string")]
    CorruptedUtf8,

    /// No schema with the given id is known.
    #[error("unknown schema {0}")]
    UnknownSchema(SchemaId),

    /// The query can't be built or can't produce the expected result.
    #[error("invalid query: {0}")]
    InvalidQuery(Cow<'static, str>),

    /// A query expected to match at most one record matched more.
    #[error("expected a single record, but {0} match")]
    NotUnique(usize),

    /// Operation on a closed store.
    #[error("store is closed")]
    Closed,

    /// Reading past the end of a bit stream.
    #[error("bit stream error: {0}")]
    Bits(#[from] bitbuff::Error),

    /// An generic IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Wraps the error as a failure of the given store operation.
    pub fn in_operation(self, operation: &'static str, record: Option<&Record>) -> Error {
        match self {
            // Already carries its own context.
            Error::Db { .. } | Error::Closed => self,
            source => Error::Db {
                operation,
                record: record.map(|r| Box::new(r.clone())),
                source: Box::new(source),
            },
        }
    }

    /// Returns the innermost error, skipping over store operation wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Db { source, .. } => source.root(),
            other => other,
        }
    }
}
