//! Archive and repository management
//!
//! An archive is a directory holding any number of repositories. Each
//! repository keeps an immutable [`BackupConfig`], an ordered index of
//! backup instances and one directory per instance.
//!
//! Mutations (backup, merge) take the repository lock. Readers never lock:
//! they read the index, which is only ever replaced atomically, and then
//! the immutable instance directories it points at. If a concurrent merge
//! removed a directory in between, the read is retried once against the
//! fresh index. Only one merge can run at a time, so one retry is enough.

pub mod file_io;
pub mod instance;
pub mod lock;
pub mod merge;
pub mod shard;
pub mod staging;

pub use instance::{
    ArchivedInstance, BucketRecord, IndexEntry, InstanceIndex, InstanceMeta, RepositoryMeta,
    StageStatus,
};
pub use shard::{ShardFile, ShardMeta, VBucketCapture};
pub use staging::StagedInstance;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ArchivePaths, BackupConfig, Settings};
use crate::error::{BackupError, BackupResult};
use file_io::{dir_size, io_error, read_json, read_json_required, write_json_atomic};
use instance::validate_repository_name;

/// Contents of the `.archive.json` marker
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArchiveMarker {
    created_at: DateTime<Utc>,
    version: String,
}

/// Overview of one repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySummary {
    pub name: String,
    /// Instances currently in the index
    pub num_incr_backups: usize,
    /// Live documents over all buckets as of the newest instance
    pub total_docs: u64,
    pub buckets: Vec<String>,
    pub first: Option<String>,
    pub last: Option<String>,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// A mounted archive
#[derive(Debug, Clone)]
pub struct Archive {
    paths: ArchivePaths,
    settings: Settings,
}

impl Archive {
    /// Mount the archive at `path`
    ///
    /// # Errors
    ///
    /// `ArchiveNotFound` if the directory (or its marker) is missing and
    /// `create_if_missing` is false; `Permission` if it cannot be written.
    pub fn mount(path: impl AsRef<Path>, create_if_missing: bool) -> BackupResult<Self> {
        let paths = ArchivePaths::with_root(path.as_ref());

        if !paths.marker_file().exists() {
            if !create_if_missing {
                return Err(BackupError::ArchiveNotFound(paths.root().to_path_buf()));
            }
            paths.ensure_root()?;
        }

        // Check writability before anything else is written
        let check = paths.root().join(".write-check");
        fs::write(&check, b"").map_err(|e| io_error(paths.root(), "write to archive", e))?;
        fs::remove_file(&check).map_err(|e| io_error(&check, "remove", e))?;

        if !paths.marker_file().exists() {
            let marker = ArchiveMarker {
                created_at: Utc::now(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            };
            write_json_atomic(paths.marker_file(), &marker)?;
            info!(archive = %paths.root().display(), "created archive");
        }

        let settings = Settings::load_or_create(&paths)?;
        Ok(Self { paths, settings })
    }

    pub fn paths(&self) -> &ArchivePaths {
        &self.paths
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Create a repository, or confirm an identical one exists
    pub fn create_repository(&self, name: &str, config: &BackupConfig) -> BackupResult<()> {
        validate_repository_name(name)?;
        config.validate()?;

        let meta_file = self.paths.repository_meta(name);
        if meta_file.exists() {
            let existing: RepositoryMeta = read_json_required(&meta_file)?;
            if existing.config == *config {
                debug!(repository = name, "repository already exists with the same config");
                return Ok(());
            }
            return Err(BackupError::RepositoryExists(name.to_string()));
        }

        let meta = RepositoryMeta {
            name: name.to_string(),
            config: config.clone(),
            created_at: Utc::now(),
            schema_version: 1,
        };
        write_json_atomic(self.paths.instance_index(name), &InstanceIndex::default())?;
        write_json_atomic(&meta_file, &meta)?;

        info!(repository = name, "created repository");
        Ok(())
    }

    pub(crate) fn repository_meta(&self, name: &str) -> BackupResult<RepositoryMeta> {
        let meta_file = self.paths.repository_meta(name);
        if !meta_file.exists() {
            return Err(BackupError::RepositoryNotFound(name.to_string()));
        }
        read_json_required(meta_file)
    }

    /// The config a repository was created with
    pub fn repository_config(&self, name: &str) -> BackupResult<BackupConfig> {
        let config = self.repository_meta(name)?.config;
        config.validate()?;
        Ok(config)
    }

    /// Names of all repositories, sorted
    pub fn list_repositories(&self) -> BackupResult<Vec<String>> {
        let root = self.paths.root();
        let entries = fs::read_dir(root).map_err(|e| io_error(root, "read directory", e))?;

        let mut names: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| self.paths.repository_meta(name).exists())
            .collect();
        names.sort();
        Ok(names)
    }

    pub(crate) fn read_index(&self, repository: &str) -> BackupResult<InstanceIndex> {
        self.repository_meta(repository)?;
        read_json(self.paths.instance_index(repository))
    }

    /// Instance names, oldest first
    pub fn list_instances(&self, repository: &str) -> BackupResult<Vec<String>> {
        Ok(self.read_index(repository)?.names())
    }

    /// Open one committed instance
    pub fn open_instance(&self, repository: &str, name: &str) -> BackupResult<ArchivedInstance> {
        for attempt in 0..2 {
            let index = self.read_index(repository)?;
            let entry = index
                .get(name)
                .ok_or_else(|| BackupError::instance_not_found(repository, name))?;
            if let Some(instance) = self.load_entry(repository, entry)? {
                return Ok(instance);
            }
            debug!(repository, instance = name, attempt, "instance directory moved, re-reading index");
        }

        Err(BackupError::Corrupt(format!(
            "instance '{}' is indexed but its directory is missing",
            name
        )))
    }

    /// Open every committed instance, oldest first
    pub fn open_history(&self, repository: &str) -> BackupResult<Vec<ArchivedInstance>> {
        'attempt: for attempt in 0..2 {
            let index = self.read_index(repository)?;
            let mut history = Vec::with_capacity(index.instances.len());
            for entry in &index.instances {
                match self.load_entry(repository, entry)? {
                    Some(instance) => history.push(instance),
                    None => {
                        debug!(repository, attempt, "instance directory moved, re-reading index");
                        continue 'attempt;
                    }
                }
            }
            return Ok(history);
        }

        Err(BackupError::Corrupt(format!(
            "repository '{}' index points at missing instances",
            repository
        )))
    }

    /// Load an indexed instance; `None` if a merge removed it meanwhile
    fn load_entry(
        &self,
        repository: &str,
        entry: &IndexEntry,
    ) -> BackupResult<Option<ArchivedInstance>> {
        let dir = self.paths.instance_dir(repository, &entry.dir);
        match ArchivedInstance::load(&dir) {
            Ok(instance) => Ok(Some(instance)),
            Err(_) if !dir.join("instance.json").exists() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Metadata of one instance
    pub fn instance(&self, repository: &str, name: &str) -> BackupResult<InstanceMeta> {
        Ok(self.open_instance(repository, name)?.meta)
    }

    /// The bucket records of exactly one instance (its delta)
    pub fn incr_backup_info(
        &self,
        repository: &str,
        name: &str,
    ) -> BackupResult<BTreeMap<String, BucketRecord>> {
        Ok(self.instance(repository, name)?.buckets)
    }

    /// Cumulative bucket records up to and including `name` (or the newest)
    pub fn backup_info(
        &self,
        repository: &str,
        name: Option<&str>,
    ) -> BackupResult<BTreeMap<String, BucketRecord>> {
        let history = self.open_history(repository)?;

        let upto = match name {
            Some(name) => {
                history
                    .iter()
                    .position(|i| i.name() == name)
                    .ok_or_else(|| BackupError::instance_not_found(repository, name))?
                    + 1
            }
            None => history.len(),
        };

        Ok(cumulative(history[..upto].iter().map(|i| &i.meta)))
    }

    /// Summary of a repository
    pub fn repository_summary(&self, repository: &str) -> BackupResult<RepositorySummary> {
        let meta = self.repository_meta(repository)?;
        let history = self.open_history(repository)?;
        let buckets = cumulative(history.iter().map(|i| &i.meta));

        Ok(RepositorySummary {
            name: meta.name,
            num_incr_backups: history.len(),
            total_docs: buckets.values().map(|r| r.num_docs).sum(),
            buckets: buckets.keys().cloned().collect(),
            first: history.first().map(|i| i.name().to_string()),
            last: history.last().map(|i| i.name().to_string()),
            created_at: meta.created_at,
            size_bytes: dir_size(&self.paths.repository_dir(repository)),
        })
    }
}

/// Fold instance records, oldest first, into cumulative per-bucket records
pub(crate) fn cumulative<'a>(
    instances: impl IntoIterator<Item = &'a InstanceMeta>,
) -> BTreeMap<String, BucketRecord> {
    let mut buckets: BTreeMap<String, BucketRecord> = BTreeMap::new();
    for instance in instances {
        for (bucket, record) in &instance.buckets {
            match buckets.get_mut(bucket) {
                Some(acc) if !record.is_full_baseline() => acc.accumulate(record),
                _ => {
                    buckets.insert(bucket.clone(), record.cumulative());
                }
            }
        }
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Stage;
    use tempfile::TempDir;

    #[test]
    fn test_mount_missing_archive() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing");

        let err = Archive::mount(&path, false).unwrap_err();
        assert!(matches!(err, BackupError::ArchiveNotFound(_)));

        Archive::mount(&path, true).unwrap();
        assert!(path.join(".archive.json").exists());
        Archive::mount(&path, false).unwrap();
    }

    #[test]
    fn test_create_repository_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let archive = Archive::mount(temp_dir.path(), true).unwrap();
        let config = BackupConfig::default();

        archive.create_repository("name", &config).unwrap();
        archive.create_repository("name", &config).unwrap();

        let other = BackupConfig::builder()
            .skip(Stage::Views, true)
            .build()
            .unwrap();
        let err = archive.create_repository("name", &other).unwrap_err();
        assert!(matches!(err, BackupError::RepositoryExists(_)));

        assert_eq!(archive.repository_config("name").unwrap(), config);
        assert_eq!(archive.list_repositories().unwrap(), vec!["name"]);
    }

    #[test]
    fn test_unknown_repository() {
        let temp_dir = TempDir::new().unwrap();
        let archive = Archive::mount(temp_dir.path(), true).unwrap();
        assert!(matches!(
            archive.list_instances("nope"),
            Err(BackupError::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn test_empty_repository_summary() {
        let temp_dir = TempDir::new().unwrap();
        let archive = Archive::mount(temp_dir.path(), true).unwrap();
        archive
            .create_repository("repo", &BackupConfig::default())
            .unwrap();

        let summary = archive.repository_summary("repo").unwrap();
        assert_eq!(summary.num_incr_backups, 0);
        assert_eq!(summary.total_docs, 0);
        assert!(summary.first.is_none());
        assert!(archive.backup_info("repo", None).unwrap().is_empty());
        assert!(matches!(
            archive.backup_info("repo", Some("missing")),
            Err(BackupError::InstanceNotFound { .. })
        ));
    }
}
