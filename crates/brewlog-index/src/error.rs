//! Error types for the indexer.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while indexing or serving index queries.
#[derive(Error, Debug)]
pub enum Error {
    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// A record or frame could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] brewlog_core::Error),

    /// Stored value could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The external repository service failed.
    #[error("Client error: {0}")]
    Client(String),

    /// The event stream connection failed.
    #[error("Stream error: {0}")]
    Stream(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A blocking storage task panicked or was cancelled.
    #[error("Blocking task failed: {0}")]
    Task(String),

    /// A store namespace was missing when the database was opened.
    #[error("missing column family '{0}'")]
    MissingColumnFamily(&'static str),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Decode failures are permanent for a given payload; storage, network
    /// and stream failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RocksDb(_) | Self::Client(_) | Self::Stream(_) | Self::Io(_)
        )
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Client(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Stream(err.to_string())
    }
}
