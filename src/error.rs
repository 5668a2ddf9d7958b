//! The error type shared by all knowledge-base operations.

use thiserror::Error;

//-----------------------------------------------------------------------------

/// A report from the object store when it refuses to persist a record.
///
/// The report is raw: it names the offending fields but does not know what they mean.
/// Entity classes turn it into a [`KBError::Validation`] through their validation hook.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationFailure {
    /// Class of the refused record.
    pub class: String,
    /// Required fields that were absent.
    pub missing: Vec<String>,
    /// Unique key that already belongs to another record.
    pub duplicate_key: Option<String>,
}

impl ValidationFailure {
    /// Returns `true` if the report does not describe any problem.
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.duplicate_key.is_none()
    }
}

//-----------------------------------------------------------------------------

/// Knowledge-base error.
///
/// Every failure surfaced by the crate is a `KBError` with a message that names the table, field, or entity involved.
#[derive(Debug, Error)]
pub enum KBError {
    /// A named table does not exist in the catalog.
    #[error("the requested {0} table is missing")]
    MissingTable(String),

    /// An entity, row, or enum value does not exist.
    #[error("{0}")]
    NotFound(String),

    /// A record violates the schema of its entity class.
    #[error("{0}")]
    Validation(String),

    /// The object store refused to persist a record.
    #[error("validation failed for {}: missing {:?}, duplicate key {:?}", .0.class, .0.missing, .0.duplicate_key)]
    BackendValidation(ValidationFailure),

    /// The requested service kind does not exist.
    #[error("unsupported service kind: {0}")]
    UnsupportedServiceKind(String),

    /// The service does not expose the requested action.
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),

    /// Session could not be authenticated.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A selector expression could not be parsed or does not match the table.
    #[error("invalid selector: {0}")]
    Selector(String),

    /// Transport or storage failure in the backend.
    #[error("backend error while {context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    /// An internal invariant does not hold; the operation was aborted.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl KBError {
    /// Wraps a backend error with a description of what was being done.
    pub fn backend<S: Into<String>>(context: S, source: rusqlite::Error) -> Self {
        KBError::Backend { context: context.into(), source }
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, KBError>;

/// Extension for attaching context to backend results.
pub(crate) trait BackendContext<T> {
    fn context(self, context: &str) -> Result<T>;
}

impl<T> BackendContext<T> for rusqlite::Result<T> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|x| KBError::backend(context, x))
    }
}

//-----------------------------------------------------------------------------
