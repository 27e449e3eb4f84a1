//! Merging a contiguous range of instances
//!
//! The merged instance holds, per bucket and vbucket, the latest version of
//! every key seen in the range. Tombstones are kept so the merged instance
//! still deletes on replay. A vbucket rebaselined by an instance drops what
//! the older instances in the range had for it.
//!
//! The merged key deltas are the range's deltas folded together, so the
//! cumulative view of the repository is the same before and after a merge.
//!
//! The merge writes a fresh directory (`instance.json` last), swaps the
//! index, and only then removes the old directories. Directories an
//! interrupted merge left behind are not in the index and are swept at the
//! start of the next merge.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::file_io::{io_error, write_json_atomic};
use super::instance::{
    latest_versions, ArchivedInstance, BucketRecord, IndexEntry, InstanceIndex, InstanceMeta,
};
use super::lock::RepositoryLock;
use super::shard::{partition, ShardWriter};
use super::Archive;
use crate::cluster::Document;
use crate::config::paths::InstancePaths;
use crate::error::{BackupError, BackupResult};

impl Archive {
    /// Merge instances `first..=last` into one instance named `last`
    ///
    /// Returns the name of the merged instance.
    pub fn merge_incr_backups(
        &self,
        repository: &str,
        first: &str,
        last: &str,
    ) -> BackupResult<String> {
        self.repository_meta(repository)?;
        let _lock =
            RepositoryLock::acquire(&self.paths().lock_file(repository), repository, "merge")?;

        let index = self.read_index(repository)?;
        self.sweep_orphans(repository, &index)?;

        let start = index
            .position(first)
            .ok_or_else(|| BackupError::instance_not_found(repository, first))?;
        let end = index
            .position(last)
            .ok_or_else(|| BackupError::instance_not_found(repository, last))?;

        if start > end {
            return Err(BackupError::InvalidRange {
                first: first.to_string(),
                last: last.to_string(),
            });
        }
        if start == end {
            debug!(repository, instance = last, "single instance range, nothing to merge");
            return Ok(last.to_string());
        }

        let range = index.instances[start..=end]
            .iter()
            .map(|entry| ArchivedInstance::load(&self.paths().instance_dir(repository, &entry.dir)))
            .collect::<BackupResult<Vec<_>>>()?;

        let suffix = Uuid::new_v4().simple().to_string();
        let dir_name = format!("{}-merged-{}", last, &suffix[..8]);
        let target = InstancePaths::new(self.paths().instance_dir(repository, &dir_name));

        info!(
            repository,
            first,
            last,
            instances = range.len(),
            "merging backup instances"
        );

        let bucket_names: BTreeSet<&str> = range
            .iter()
            .flat_map(|i| i.meta.buckets.keys().map(String::as_str))
            .collect();

        let mut buckets = BTreeMap::new();
        for bucket in bucket_names {
            let record = merge_bucket(
                &range,
                bucket,
                &target,
                self.settings().compression_level,
            )?;
            buckets.insert(bucket.to_string(), record);
        }

        let newest = &range[range.len() - 1].meta;
        let merged = InstanceMeta {
            name: newest.name.clone(),
            created_at: newest.created_at,
            previous: range[0].meta.previous.clone(),
            merged_from: range.iter().map(|i| i.name().to_string()).collect(),
            buckets,
            excluded: newest.excluded.clone(),
        };
        write_json_atomic(target.meta_file(), &merged)?;

        let mut instances = index.instances.clone();
        let old: Vec<IndexEntry> = instances
            .splice(
                start..=end,
                std::iter::once(IndexEntry {
                    name: merged.name.clone(),
                    dir: dir_name,
                }),
            )
            .collect();
        write_json_atomic(
            self.paths().instance_index(repository),
            &InstanceIndex { instances },
        )?;

        for entry in old {
            let dir = self.paths().instance_dir(repository, &entry.dir);
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %e, "failed to remove merged instance directory");
            }
        }

        info!(repository, instance = %merged.name, "merge complete");
        Ok(merged.name)
    }

    /// Remove instance directories the index does not reference
    fn sweep_orphans(&self, repository: &str, index: &InstanceIndex) -> BackupResult<()> {
        let repo_dir = self.paths().repository_dir(repository);
        let referenced: HashSet<&str> = index.instances.iter().map(|e| e.dir.as_str()).collect();

        let entries = fs::read_dir(&repo_dir).map_err(|e| io_error(&repo_dir, "read directory", e))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.path().is_dir() || referenced.contains(name.as_str())
            {
                continue;
            }
            warn!(dir = %entry.path().display(), "removing unreferenced instance directory");
            fs::remove_dir_all(entry.path()).map_err(|e| io_error(&entry.path(), "remove", e))?;
        }
        Ok(())
    }
}

fn merge_bucket(
    range: &[ArchivedInstance],
    bucket: &str,
    target: &InstancePaths,
    compression_level: i32,
) -> BackupResult<BucketRecord> {
    let holders: Vec<(&ArchivedInstance, &BucketRecord)> = range
        .iter()
        .filter_map(|i| i.record(bucket).map(|r| (i, r)))
        .collect();

    for pick in [
        InstancePaths::bucket_config as fn(&InstancePaths, &str) -> PathBuf,
        InstancePaths::views_file,
        InstancePaths::gsi_file,
        InstancePaths::fts_file,
    ] {
        let source = holders
            .iter()
            .rev()
            .map(|(i, _)| pick(&i.paths, bucket))
            .find(|path| path.exists());
        if let Some(source) = source {
            copy_file(&source, &pick(target, bucket))?;
        }
    }

    let mut shard_count = 1;
    let mut merged: Option<BucketRecord> = None;

    for (instance, record) in &holders {
        shard_count = shard_count.max(instance.shards(bucket)?.len());
        match merged.as_mut() {
            Some(acc) => {
                for (vb, capture) in &record.vbuckets {
                    acc.vbuckets
                        .entry(*vb)
                        .and_modify(|state| state.absorb(capture))
                        .or_insert(*capture);
                }
                acc.reason = record.reason;
                acc.stages = record.stages.clone();
            }
            None => merged = Some((*record).clone()),
        }
    }

    let Some(mut merged) = merged else {
        return Err(BackupError::Corrupt(format!(
            "bucket '{}' has no records in the merge range",
            bucket
        )));
    };

    let keys = latest_versions(range, bucket, |_| true, |doc| doc)?;

    let vbuckets: Vec<u16> = merged.vbuckets.keys().copied().collect();
    let data_dir = target.data_dir(bucket);
    let mut metas = Vec::new();

    for part in partition(&vbuckets, shard_count) {
        let (Some(first), Some(last)) = (part.first(), part.last()) else {
            continue;
        };
        let mut writer = ShardWriter::create(&data_dir, *first, *last, compression_level)?;

        for vb in &part {
            let mut docs: Vec<&Document> =
                keys.get(vb).map(|m| m.values().collect()).unwrap_or_default();
            docs.sort_by_key(|d| d.seqno);
            for doc in &docs {
                writer.write(doc)?;
            }

            if let Some(capture) = merged.vbuckets.get_mut(vb) {
                capture.deletions = docs.iter().filter(|d| d.deleted).count() as u64;
                capture.mutations = docs.len() as u64 - capture.deletions;
                writer.record_vbucket(*vb, *capture);
            }
        }

        metas.push(writer.finish()?);
    }

    merged.recount();
    debug!(
        bucket,
        docs = merged.num_docs,
        deletions = merged.num_deletions,
        shards = metas.len(),
        "merged bucket"
    );
    Ok(merged)
}

fn copy_file(from: &Path, to: &Path) -> BackupResult<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, "create directory", e))?;
    }
    fs::copy(from, to).map_err(|e| io_error(to, "copy", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::instance::StageStatus;
    use crate::archive::shard::VBucketCapture;
    use crate::config::{BackupConfig, BucketSelection, Stage};
    use tempfile::TempDir;

    /// Commit an instance with one bucket holding `docs` in vbucket 0
    fn commit(archive: &Archive, docs: &[Document], rebaselined: bool) -> String {
        let history = archive.open_history("repo").unwrap();
        let archived = latest_versions(&history, "default", |_| true, |doc| doc.deleted).unwrap();

        let staged = archive.begin_instance("repo", false).unwrap();
        let data_dir = staged.paths().data_dir("default");
        let mut writer = ShardWriter::create(&data_dir, 0, 0, 3).unwrap();
        for doc in docs {
            writer.write(doc).unwrap();
        }
        let deletions = docs.iter().filter(|d| d.deleted).count() as u64;
        let high_seqno = docs.iter().map(|d| d.seqno).max().unwrap_or(0);
        let capture = if rebaselined {
            VBucketCapture::baseline(9, high_seqno, docs.len() as u64 - deletions, deletions)
        } else {
            let mut capture =
                VBucketCapture::incremental(9, high_seqno, docs.len() as u64 - deletions, deletions);
            for doc in docs {
                let before = archived.get(&0).and_then(|keys| keys.get(&doc.key)).copied();
                capture.count_change(before, doc.deleted);
            }
            capture
        };
        writer.record_vbucket(0, capture);
        let meta = writer.finish().unwrap();

        let mut stages = BTreeMap::new();
        stages.insert(Stage::Data, StageStatus::Captured);
        let record = BucketRecord::from_shards(BucketSelection::AllBuckets, stages, [&meta]);

        let mut buckets = BTreeMap::new();
        buckets.insert("default".to_string(), record);
        staged.commit(buckets, BTreeMap::new()).unwrap().name
    }

    fn doc(key: &str, seqno: u64) -> Document {
        Document::mutation(key, 0, seqno, serde_json::json!({"seq": seqno}))
    }

    fn setup() -> (TempDir, Archive) {
        let temp_dir = TempDir::new().unwrap();
        let archive = Archive::mount(temp_dir.path(), true).unwrap();
        archive
            .create_repository("repo", &BackupConfig::default())
            .unwrap();
        (temp_dir, archive)
    }

    #[test]
    fn test_merge_keeps_latest_versions() {
        let (_dir, archive) = setup();
        let a = commit(&archive, &[doc("k1", 1), doc("k2", 2)], true);
        let b = commit(&archive, &[doc("k1", 3), doc("k3", 4)], false);
        let c = commit(&archive, &[Document::tombstone("k2", 0, 5)], false);

        let merged = archive.merge_incr_backups("repo", &a, &c).unwrap();
        assert_eq!(merged, c);
        assert_eq!(archive.list_instances("repo").unwrap(), vec![c.clone()]);

        let instance = archive.open_instance("repo", &c).unwrap();
        assert_eq!(instance.meta.merged_from, vec![a, b, c.clone()]);

        let record = instance.record("default").unwrap();
        assert_eq!(record.num_docs, 2);
        assert_eq!(record.num_deletions, 1);
        assert!(record.is_full_baseline());
        assert_eq!(record.vbuckets[&0].high_seqno, 5);

        let docs: Vec<Document> = instance.shards("default").unwrap()[0]
            .reader()
            .unwrap()
            .collect::<BackupResult<_>>()
            .unwrap();
        let seqnos: Vec<u64> = docs.iter().map(|d| d.seqno).collect();
        assert_eq!(seqnos, vec![3, 4, 5]);
    }

    #[test]
    fn test_rebaseline_drops_older_versions() {
        let (_dir, archive) = setup();
        let a = commit(&archive, &[doc("old", 1)], true);
        let b = commit(&archive, &[doc("new", 1)], true);

        archive.merge_incr_backups("repo", &a, &b).unwrap();
        let info = archive.incr_backup_info("repo", &b).unwrap();
        assert_eq!(info["default"].num_docs, 1);
    }

    #[test]
    fn test_merge_keeps_cumulative_view() {
        let (_dir, archive) = setup();
        let a = commit(&archive, &[doc("k1", 1), doc("k2", 2), doc("k3", 3)], true);
        commit(&archive, &[doc("k1", 4), Document::tombstone("k2", 0, 5)], false);
        let c = commit(&archive, &[doc("k2", 6), doc("k4", 7)], false);

        let before = archive.backup_info("repo", None).unwrap();
        assert_eq!(before["default"].num_docs, 4);
        assert_eq!(before["default"].num_deletions, 0);

        archive.merge_incr_backups("repo", &a, &c).unwrap();
        assert_eq!(archive.backup_info("repo", None).unwrap(), before);
    }

    #[test]
    fn test_merge_errors() {
        let (_dir, archive) = setup();
        let a = commit(&archive, &[doc("k", 1)], true);
        let b = commit(&archive, &[doc("k", 2)], false);

        assert!(matches!(
            archive.merge_incr_backups("repo", &b, &a),
            Err(BackupError::InvalidRange { .. })
        ));
        assert!(matches!(
            archive.merge_incr_backups("repo", "missing", &b),
            Err(BackupError::InstanceNotFound { .. })
        ));
        assert_eq!(archive.merge_incr_backups("repo", &a, &a).unwrap(), a);
        assert_eq!(archive.list_instances("repo").unwrap().len(), 2);
    }

    #[test]
    fn test_merge_sweeps_orphans() {
        let (dir, archive) = setup();
        let a = commit(&archive, &[doc("k", 1)], true);
        let b = commit(&archive, &[doc("k", 2)], false);

        let orphan = dir.path().join("repo").join("leftover-merged-12345678");
        fs::create_dir_all(&orphan).unwrap();

        archive.merge_incr_backups("repo", &a, &b).unwrap();
        assert!(!orphan.exists());
        assert_eq!(archive.backup_info("repo", None).unwrap()["default"].num_docs, 1);
    }
}
