//! Staged instances
//!
//! A capture writes into `<repo>/.staging/<name>/` while holding the
//! repository lock. Nothing in the staging area is visible to readers.
//! Committing writes `instance.json`, renames the directory into the
//! repository and appends it to the index, in that order.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::file_io::{io_error, read_json, read_json_required, write_json_atomic};
use super::instance::{next_instance_name, BucketRecord, IndexEntry, InstanceIndex, InstanceMeta};
use super::lock::RepositoryLock;
use super::shard::{list_shards, remove_incomplete};
use super::Archive;
use crate::config::paths::InstancePaths;
use crate::config::BucketSelection;
use crate::error::{BackupError, BackupResult};

/// Contents of `staging.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingMeta {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub previous: Option<String>,
}

/// An instance being captured
#[derive(Debug)]
pub struct StagedInstance {
    repository: String,
    meta: StagingMeta,
    paths: InstancePaths,
    repository_dir: PathBuf,
    index_file: PathBuf,
    resumed: bool,
    _lock: RepositoryLock,
}

impl StagedInstance {
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn paths(&self) -> &InstancePaths {
        &self.paths
    }

    /// True when an interrupted capture was picked up again
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Vbuckets of a bucket whose shards are already complete
    ///
    /// Partial data files are removed on the way.
    pub fn completed_vbuckets(&self, bucket: &str) -> BackupResult<BTreeSet<u16>> {
        let data_dir = self.paths.data_dir(bucket);
        let removed = remove_incomplete(&data_dir)?;
        if removed > 0 {
            debug!(bucket, removed, "discarded incomplete shards");
        }

        Ok(list_shards(&data_dir)?
            .iter()
            .flat_map(|shard| shard.meta.vbuckets.keys().copied())
            .collect())
    }

    /// Publish the instance
    pub fn commit(
        &self,
        buckets: BTreeMap<String, BucketRecord>,
        excluded: BTreeMap<String, BucketSelection>,
    ) -> BackupResult<InstanceMeta> {
        let meta = InstanceMeta {
            name: self.meta.name.clone(),
            created_at: self.meta.created_at,
            previous: self.meta.previous.clone(),
            merged_from: Vec::new(),
            buckets,
            excluded,
        };

        write_json_atomic(self.paths.meta_file(), &meta)?;
        let _ = fs::remove_file(self.paths.staging_file());

        let target = self.repository_dir.join(&self.meta.name);
        fs::rename(self.paths.dir(), &target)
            .map_err(|e| io_error(&target, "move staged instance to", e))?;

        let mut index: InstanceIndex = read_json(&self.index_file)?;
        index.instances.push(IndexEntry {
            name: self.meta.name.clone(),
            dir: self.meta.name.clone(),
        });
        write_json_atomic(&self.index_file, &index)?;

        info!(
            repository = %self.repository,
            instance = %self.meta.name,
            buckets = meta.buckets.len(),
            "backup instance committed"
        );
        Ok(meta)
    }
}

impl Archive {
    /// Lock a repository and open a staged instance for capture
    ///
    /// With `resume`, an interrupted staged instance is reused so its
    /// completed shards are not captured again; otherwise stale staging
    /// directories are discarded.
    pub fn begin_instance(&self, repository: &str, resume: bool) -> BackupResult<StagedInstance> {
        self.repository_meta(repository)?;

        let paths = self.paths();
        let lock = RepositoryLock::acquire(&paths.lock_file(repository), repository, "backup")?;

        let index: InstanceIndex = read_json(paths.instance_index(repository))?;
        let last = index.last().map(|e| e.name.clone());
        let staging_root = paths.staging_dir(repository);

        let mut reusable = None;
        if staging_root.exists() {
            let entries = fs::read_dir(&staging_root)
                .map_err(|e| io_error(&staging_root, "read directory", e))?;
            for entry in entries.flatten() {
                let staged = InstancePaths::new(entry.path());
                let meta = read_json_required::<StagingMeta, _>(staged.staging_file()).ok();
                match meta {
                    Some(meta)
                        if resume
                            && reusable.is_none()
                            && meta.previous == last
                            && Some(meta.name.as_str()) > last.as_deref() =>
                    {
                        reusable = Some((meta, staged));
                    }
                    _ => {
                        warn!(dir = %entry.path().display(), "discarding stale staged instance");
                        fs::remove_dir_all(entry.path())
                            .map_err(|e| io_error(&entry.path(), "remove", e))?;
                    }
                }
            }
        }

        let (meta, instance_paths, resumed) = match reusable {
            Some((meta, staged)) => {
                info!(repository, instance = %meta.name, "resuming staged backup");
                (meta, staged, true)
            }
            None => {
                let now = Utc::now();
                let meta = StagingMeta {
                    name: next_instance_name(now, last.as_deref()),
                    created_at: now,
                    previous: last,
                };
                let staged = InstancePaths::new(staging_root.join(&meta.name));
                write_json_atomic(staged.staging_file(), &meta)?;
                (meta, staged, false)
            }
        };

        if paths.repository_dir(repository).join(&meta.name).exists() {
            return Err(BackupError::Corrupt(format!(
                "instance directory {} already exists",
                meta.name
            )));
        }

        Ok(StagedInstance {
            repository: repository.to_string(),
            meta,
            paths: instance_paths,
            repository_dir: paths.repository_dir(repository),
            index_file: paths.instance_index(repository),
            resumed,
            _lock: lock,
        })
    }
}
