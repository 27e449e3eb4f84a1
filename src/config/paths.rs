//! Path management for docvault archives
//!
//! Every file the engine reads or writes is located through [`ArchivePaths`],
//! so the on-disk layout lives in one place.
//!
//! ## Archive Root Resolution
//!
//! 1. Explicit path passed by the caller (`--archive`)
//! 2. `DOCVAULT_ARCHIVE` environment variable

use std::path::{Path, PathBuf};

use crate::error::BackupError;

/// Environment variable naming the default archive root
pub const ARCHIVE_ENV_VAR: &str = "DOCVAULT_ARCHIVE";

/// Name of the directory holding an in-progress capture
pub const STAGING_DIR: &str = ".staging";

const SETTINGS_FILE: &str = "settings.json";
const LOGS_DIR: &str = "logs";

/// Entries of the archive root that are not repositories
pub const RESERVED_NAMES: &[&str] = &[SETTINGS_FILE, LOGS_DIR];

/// Manages all paths inside one archive
#[derive(Debug, Clone)]
pub struct ArchivePaths {
    /// Root directory of the archive
    root: PathBuf,
}

impl ArchivePaths {
    /// Resolve the archive root from the environment
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `DOCVAULT_ARCHIVE` is not set.
    pub fn from_env() -> Result<Self, BackupError> {
        let root = std::env::var(ARCHIVE_ENV_VAR).map_err(|_| {
            BackupError::Config(format!(
                "No archive given and {} is not set",
                ARCHIVE_ENV_VAR
            ))
        })?;
        Ok(Self::with_root(PathBuf::from(root)))
    }

    /// Create ArchivePaths for an explicit root directory
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the archive root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Marker file identifying a directory as an archive
    pub fn marker_file(&self) -> PathBuf {
        self.root.join(".archive.json")
    }

    /// Engine settings file
    pub fn settings_file(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    /// Directory holding log files
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    /// Log file written by the command line tool
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("docvault.log")
    }

    /// Directory of a repository
    pub fn repository_dir(&self, repo: &str) -> PathBuf {
        self.root.join(repo)
    }

    /// Repository metadata (name, config, creation time)
    pub fn repository_meta(&self, repo: &str) -> PathBuf {
        self.repository_dir(repo).join("backup-meta.json")
    }

    /// Ordered index of the repository's backup instances
    pub fn instance_index(&self, repo: &str) -> PathBuf {
        self.repository_dir(repo).join("instances.json")
    }

    /// Lock file held while a backup or merge mutates the repository
    pub fn lock_file(&self, repo: &str) -> PathBuf {
        self.repository_dir(repo).join(".lock")
    }

    /// Parent directory for in-progress captures
    pub fn staging_dir(&self, repo: &str) -> PathBuf {
        self.repository_dir(repo).join(STAGING_DIR)
    }

    /// Directory of a committed instance
    pub fn instance_dir(&self, repo: &str, dir: &str) -> PathBuf {
        self.repository_dir(repo).join(dir)
    }

    /// Ensure the archive root exists
    pub fn ensure_root(&self) -> Result<(), BackupError> {
        std::fs::create_dir_all(&self.root).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                BackupError::permission(&self.root, e.to_string())
            } else {
                BackupError::Io(format!("Failed to create archive directory: {}", e))
            }
        })
    }
}

/// Files and directories inside one instance (or staged instance) directory
#[derive(Debug, Clone)]
pub struct InstancePaths {
    dir: PathBuf,
}

impl InstancePaths {
    /// Wrap an instance directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The instance directory itself
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Instance metadata, written last on commit
    pub fn meta_file(&self) -> PathBuf {
        self.dir.join("instance.json")
    }

    /// Marker describing a staged (uncommitted) instance
    pub fn staging_file(&self) -> PathBuf {
        self.dir.join("staging.json")
    }

    /// Directory of one bucket
    pub fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.dir.join(bucket)
    }

    /// Archived bucket settings
    pub fn bucket_config(&self, bucket: &str) -> PathBuf {
        self.bucket_dir(bucket).join("bucket-config.json")
    }

    /// Archived design documents
    pub fn views_file(&self, bucket: &str) -> PathBuf {
        self.bucket_dir(bucket).join("views.json")
    }

    /// Archived GSI index definitions
    pub fn gsi_file(&self, bucket: &str) -> PathBuf {
        self.bucket_dir(bucket).join("gsi.json")
    }

    /// Archived full-text index definitions
    pub fn fts_file(&self, bucket: &str) -> PathBuf {
        self.bucket_dir(bucket).join("fts.json")
    }

    /// Directory of the bucket's document shards
    pub fn data_dir(&self, bucket: &str) -> PathBuf {
        self.bucket_dir(bucket).join("data")
    }
}
