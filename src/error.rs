//! Error types for facade

use thiserror::Error;

/// Result type alias using facade Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving and serving cached content
#[derive(Error, Debug)]
pub enum Error {
    /// No application, version, or object for the request
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing or inconsistent configuration; requests fail closed
    #[error("configuration error: {0}")]
    Config(String),

    /// Cold-fill failure (registry pull, download, extraction, CDN upload)
    #[error("acquisition error: {0}")]
    Acquire(String),

    /// Metadata repository errors
    #[error("store error: {0}")]
    Store(String),

    /// CDN object store errors
    #[error("cdn error: {0}")]
    Cdn(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Image extraction errors
    #[error("image error: {0}")]
    Oci(#[from] facade_oci::OciError),
}

impl Error {
    /// The HTTP status the serving surface answers with for this error.
    pub fn status(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            _ => 500,
        }
    }
}
