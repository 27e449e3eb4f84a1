//! Error types for docvault
//!
//! A single closed error enum is shared by the archive, the transfer engine
//! and the orchestration layer. Callers match on the variant instead of
//! inspecting messages.

use std::path::PathBuf;

use thiserror::Error;

/// One failed transfer unit inside a [`BackupError::PartialTransfer`]
#[derive(Debug)]
pub struct TransferFailure {
    /// Name of the unit (the bucket name)
    pub unit: String,
    /// The typed cause reported by the unit
    pub error: Box<BackupError>,
}

/// The main error type for docvault operations
#[derive(Error, Debug)]
pub enum BackupError {
    /// The cluster rejected the credentials
    #[error("Authentication failed (HTTP {status})")]
    Authentication { status: u16 },

    /// Any other HTTP-style failure reported by a cluster collaborator
    #[error("Cluster request failed (HTTP {status}): {message}")]
    Http { status: u16, message: String },

    /// A restore stage required a bucket that does not exist
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    /// The archive directory does not exist and creation was not requested
    #[error("Archive not found: {}", .0.display())]
    ArchiveNotFound(PathBuf),

    /// The archive (or a file in it) cannot be written
    #[error("Permission denied: {path}: {message}")]
    Permission { path: String, message: String },

    /// Repository already exists with a different configuration
    #[error("Repository already exists with a different configuration: {0}")]
    RepositoryExists(String),

    /// Repository is not present in the archive
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    /// Another backup or merge is mutating the repository
    #[error("Repository is locked by another backup or merge: {0}")]
    RepositoryBusy(String),

    /// A named backup instance is not present in the repository
    #[error("Backup instance not found in repository '{repository}': {instance}")]
    InstanceNotFound {
        repository: String,
        instance: String,
    },

    /// Merge bounds are in the wrong order
    #[error("Invalid range: '{first}' is after '{last}'")]
    InvalidRange { first: String, last: String },

    /// A restore start/end point does not exist in the repository
    #[error("Restore point not found: {0}")]
    RangePoint(String),

    /// The resolved restore range contains no backups
    #[error("Nothing to restore in repository '{0}'")]
    EmptyRange(String),

    /// Invalid or contradictory configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// One or more transfer units failed
    #[error("{} transfer unit(s) failed: {}", .failures.len(), summarize(.failures))]
    PartialTransfer { failures: Vec<TransferFailure> },

    /// Archive contents are unreadable or inconsistent
    #[error("Corrupt archive data: {0}")]
    Corrupt(String),

    /// Cluster collaborator failure that is not HTTP-shaped
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(String),
}

fn summarize(failures: &[TransferFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.unit, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl BackupError {
    /// Create an "instance not found" error
    pub fn instance_not_found(repository: impl Into<String>, instance: impl Into<String>) -> Self {
        Self::InstanceNotFound {
            repository: repository.into(),
            instance: instance.into(),
        }
    }

    /// Create a permission error for a path
    pub fn permission(path: impl AsRef<std::path::Path>, message: impl Into<String>) -> Self {
        Self::Permission {
            path: path.as_ref().display().to_string(),
            message: message.into(),
        }
    }

    /// Collapse unit failures into a single error
    ///
    /// A lone failure is returned unchanged so its kind stays visible to the
    /// caller; several failures are wrapped in `PartialTransfer`.
    pub fn from_failures(mut failures: Vec<TransferFailure>) -> Option<Self> {
        match failures.len() {
            0 => None,
            1 => failures.pop().map(|f| *f.error),
            _ => Some(Self::PartialTransfer { failures }),
        }
    }

    /// HTTP status carried by the error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Authentication { status } | Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Per-unit failures of a partial transfer
    pub fn failures(&self) -> &[TransferFailure] {
        match self {
            Self::PartialTransfer { failures } => failures,
            _ => &[],
        }
    }

    /// Check if this is one of the "not found" errors
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BucketNotFound(_)
                | Self::ArchiveNotFound(_)
                | Self::RepositoryNotFound(_)
                | Self::InstanceNotFound { .. }
                | Self::RangePoint(_)
        )
    }

    /// Check if this is an authentication failure
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Self::Permission {
                path: String::new(),
                message: err.to_string(),
            }
        } else {
            Self::Io(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Result type alias for docvault operations
pub type BackupResult<T> = Result<T, BackupError>;
