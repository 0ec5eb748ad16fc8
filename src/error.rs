use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One unresolvable unique-constraint collision, reported to the caller so a
/// human can untangle the rows involved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConflictEntry {
    pub content_type: String,
    pub pk: i64,
    pub columns: Vec<String>,
}

/// Where a row was looked for when a merge-time fetch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Container {
    Db,
    Msg,
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Container::Db => f.write_str("local database"),
            Container::Msg => f.write_str("sync message"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// The server is ahead of the pushing client; pull first.
    #[error("push rejected: client at version {client}, server at version {server}")]
    PushRejected { client: i64, server: i64 },
    /// Merge found unique-constraint collisions it cannot resolve from the
    /// pull message alone.
    #[error("unsolvable unique constraint conflict over {} row(s)", entries.len())]
    UniqueConflict { entries: Vec<UniqueConflictEntry> },
    /// A row required by conflict detection is absent where it should be.
    #[error("row {pk} of '{type_id}' could not be read from the {container}")]
    MergeFetch {
        type_id: String,
        pk: i64,
        container: Container,
    },
    /// A store constraint fired while committing pushed operations.
    #[error("integrity violation on '{type_id}' pk {pk}: {message}")]
    Integrity {
        type_id: String,
        pk: i64,
        message: String,
    },
    #[error("auth: {0}")]
    Auth(String),
    #[error("invalid state: {0}")]
    Config(&'static str),
    #[error("transport: {0}")]
    Transport(String),
    #[error("unknown content type '{0}'")]
    UnknownContentType(String),
    #[error("sync gave up after {0} push attempts")]
    RetriesExhausted(u32),
}

impl SyncError {
    /// Remap a store-level constraint failure to a typed integrity error
    /// naming the offending row. Other errors pass through untouched.
    pub(crate) fn into_integrity(self, type_id: &str, pk: i64) -> SyncError {
        match self {
            SyncError::Sqlite(rusqlite::Error::SqliteFailure(f, msg))
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                SyncError::Integrity {
                    type_id: type_id.to_string(),
                    pk,
                    message: msg.unwrap_or_else(|| "constraint violation".to_string()),
                }
            }
            other => other,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}
