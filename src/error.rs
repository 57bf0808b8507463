//! Error taxonomy shared by the store, the reconciliation flows and the
//! master-data sync coordinator.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Input rejected before any write happened.
    #[error("{0}")]
    Validation(String),

    /// The local SQLite store failed (constraint, I/O, corruption).
    #[error("local store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// A write would break a uniqueness or lifecycle rule.
    #[error("{0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Remote master API failure: network, HTTP >= 400 or malformed body.
    #[error("remote sync error: {0}")]
    Remote(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database lock poisoned")]
    Lock,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Error::Remote(msg.into())
    }

    /// Whether the failure came from the local side and aborted the
    /// operation.
    ///
    /// Remote errors are only a warning once the local write has committed;
    /// the write paths report them as a deferred outcome. A flow with nothing
    /// committed locally (a refresh) still returns them as `Err`.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Error::Remote(_))
    }

    /// True when SQLite rejected the write because of a UNIQUE constraint.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Store(rusqlite::Error::SqliteFailure(e, _)) => {
                e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            }
            _ => false,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::Lock
    }
}

impl From<Error> for String {
    fn from(e: Error) -> Self {
        e.to_string()
    }
}
