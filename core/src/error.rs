//! Error taxonomy for the bridge, the schema loader and the engine worker.
//!
//! Per-file failures during a schema load are kept as individual `Error`
//! values and bundled into `Error::Aggregate` once the whole batch has been
//! attempted, so callers see every failure instead of only the first.

use std::fmt;
use thiserror::Error;

/// Failures raised by the persistent schema cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("cache transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("cache table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("cache storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("cache commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("cache directory error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced through a `Pending` result or returned by the loader.
#[derive(Debug, Error)]
pub enum Error {
    /// The schema source answered with a non-success status or the request failed.
    #[error("failed to download {url}: {reason}")]
    Transport { url: String, reason: String },

    /// Downloaded (or cached) bytes do not hash to the manifest's value.
    #[error("error downloading {path}: expected SHA-256 hash {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Storage(#[from] CacheError),

    #[error("engine filesystem error at {path}: {source}")]
    Filesystem {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A manifest path that is empty or escapes the shared directory.
    #[error("invalid schema path {0:?}")]
    InvalidPath(String),

    /// The engine adapter reported an error (or panicked) for this call.
    #[error("engine error: {0}")]
    Engine(String),

    /// The engine returned a result string of an unexpected shape.
    #[error("malformed engine response: {0}")]
    Decode(String),

    #[error("{}", AggregateDisplay(.message, .errors))]
    Aggregate { message: String, errors: Vec<Error> },

    /// The engine worker is gone; no further operations can run.
    #[error("engine worker disconnected")]
    Disconnected,

    #[error("failed to start engine worker: {0}")]
    WorkerStart(String),
}

impl Error {
    pub(crate) fn filesystem(path: impl Into<String>, source: std::io::Error) -> Self {
        Error::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Bundle `errors` under `message`, or `None` when nothing failed.
    pub fn aggregate(message: impl Into<String>, errors: Vec<Error>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Error::Aggregate {
                message: message.into(),
                errors,
            })
        }
    }

    /// The individual failures of an aggregate error; a single-element slice otherwise.
    pub fn failures(&self) -> &[Error] {
        match self {
            Error::Aggregate { errors, .. } => errors,
            other => std::slice::from_ref(other),
        }
    }
}

struct AggregateDisplay<'a>(&'a String, &'a Vec<Error>);

impl fmt::Display for AggregateDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} failure", self.0, self.1.len())?;
        if self.1.len() != 1 {
            f.write_str("s")?;
        }
        f.write_str(")")?;
        for err in self.1 {
            write!(f, "; {err}")?;
        }
        Ok(())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
