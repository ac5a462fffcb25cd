//! Crate-wide error type.

use thiserror::Error;

use crate::api::RemoteError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("migration v{version} failed: {source}")]
    Migration {
        version: i32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("database lock poisoned: {0}")]
    Lock(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("device is offline")]
    Offline,

    #[error("invalid transaction: {0}")]
    Validation(String),

    #[error("invalid login or password")]
    InvalidCredentials,

    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// True when the failure came from the network rather than the server or
    /// the local store.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Error::Offline => true,
            Error::Remote(e) => e.is_connectivity(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
