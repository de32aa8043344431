use std::path::PathBuf;

use thiserror::Error;

use crate::types::ClusterVersion;

#[derive(Debug, Error)]
pub enum ConsoleError {
    // Startup
    #[error("Cannot determine cluster version: {0}")]
    Probe(#[from] ProbeError),

    #[error("Waiting for cluster endpoints {0:?}")]
    ConnectionPending(Vec<String>),

    // Dispatch
    #[error("'{operation}' is not supported by etcd {version}")]
    UnsupportedForVersion {
        operation: &'static str,
        version: ClusterVersion,
    },

    // Caller input
    #[error("Invalid request: {0}")]
    Validation(String),

    // Cluster
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    // Backups
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    // Deadline context
    #[error("Operation timed out")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found at {0}")]
    ConfigNotFound(String),
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no endpoint answered the version request ({0})")]
    Unreachable(String),

    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),

    #[error("version payload is not valid: {0}")]
    Malformed(String),

    #[error("cannot parse server version {0:?}")]
    Unparseable(String),

    #[error("unsupported major version {0}")]
    UnsupportedMajor(u64),
}

/// Error reported by the active generation's client, carried verbatim.
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Call(String),
}

impl ClusterError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ClusterError::PermissionDenied(_))
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Backup directory {0} is missing or not a directory")]
    DirectoryMissing(PathBuf),

    #[error("Cannot find backup {0}")]
    NotFound(String),

    #[error("Cannot remove backup {name}: {source}")]
    Remove {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<std::io::Error> for ConsoleError {
    fn from(e: std::io::Error) -> Self {
        ConsoleError::Catalog(CatalogError::Io(e))
    }
}

pub type Result<T> = std::result::Result<T, ConsoleError>;
