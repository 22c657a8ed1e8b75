//! Error types for document building and preview hosting.

use std::path::PathBuf;
use thiserror::Error;

/// A fragment could not be turned into a sandbox document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// The base document has no closing marker where an insertion is required.
    #[error("malformed document: no `{marker}` marker to insert the {purpose} before")]
    MissingMarker {
        marker: &'static str,
        purpose: &'static str,
    },
}

/// Host-level failures. These surface as a banner in the host UI, never in
/// the sandbox console.
#[derive(Error, Debug)]
pub enum HostError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The handle was never materialized or has already been released.
    #[error("resource handle `{0}` is not live")]
    UnknownHandle(String),

    /// The isolated surface could not be created or failed outside user code.
    #[error("sandbox surface failed: {0}")]
    Surface(#[source] anyhow::Error),
}

/// Configuration could not be read or is inconsistent.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type alias for host operations.
pub type Result<T> = std::result::Result<T, HostError>;
