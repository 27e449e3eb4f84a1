//! Repository and instance metadata
//!
//! These are the records persisted in a repository: `backup-meta.json`
//! ([`RepositoryMeta`]), the ordered `instances.json` index
//! ([`InstanceIndex`]) and one `instance.json` per backup instance
//! ([`InstanceMeta`]).
//!
//! Document counts are kept per vbucket so that a vbucket re-captured from
//! sequence zero replaces its earlier counts instead of adding to them. An
//! instance record counts what the instance holds; a cumulative record
//! counts the live and deleted keys of the archive as of its last instance.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::file_io::read_json_required;
use super::shard::{list_shards, ShardFile, ShardMeta, VBucketCapture};
use crate::cluster::{BucketSettings, DesignDocument, Document, FtsIndex, GsiIndex};
use crate::config::paths::{InstancePaths, RESERVED_NAMES};
use crate::config::{BackupConfig, BucketSelection, Stage};
use crate::error::{BackupError, BackupResult};

/// Format of instance names; lexicographic order is chronological order
pub const INSTANCE_NAME_FORMAT: &str = "%Y-%m-%dT%H_%M_%S%.9fZ";

/// Name for a new instance, strictly after `last`
pub fn next_instance_name(now: DateTime<Utc>, last: Option<&str>) -> String {
    let candidate = now.format(INSTANCE_NAME_FORMAT).to_string();
    let Some(last) = last else {
        return candidate;
    };
    if candidate.as_str() > last {
        return candidate;
    }

    match NaiveDateTime::parse_from_str(last, INSTANCE_NAME_FORMAT) {
        Ok(parsed) => (parsed + Duration::nanoseconds(1))
            .format(INSTANCE_NAME_FORMAT)
            .to_string(),
        // Names we did not generate: any suffix sorts after them
        Err(_) => format!("{}0", last),
    }
}

/// Contents of `backup-meta.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryMeta {
    pub name: String,
    pub config: BackupConfig,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    1
}

/// One entry of the instance index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Instance name
    pub name: String,
    /// Directory under the repository holding the instance
    pub dir: String,
}

/// Ordered instance index, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceIndex {
    #[serde(default)]
    pub instances: Vec<IndexEntry>,
}

impl InstanceIndex {
    pub fn names(&self) -> Vec<String> {
        self.instances.iter().map(|e| e.name.clone()).collect()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.instances.iter().position(|e| e.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&IndexEntry> {
        self.instances.iter().find(|e| e.name == name)
    }

    pub fn last(&self) -> Option<&IndexEntry> {
        self.instances.last()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Whether a stage was captured for a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Captured,
    Skipped,
}

/// What one instance holds for one bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRecord {
    /// Why the bucket was included
    pub reason: BucketSelection,
    /// Live mutations captured, or live documents in a cumulative record
    pub num_docs: u64,
    /// Tombstones captured, or deleted keys in a cumulative record
    pub num_deletions: u64,
    #[serde(default)]
    pub stages: BTreeMap<Stage, StageStatus>,
    /// Per-vbucket sequence state and counts
    #[serde(default)]
    pub vbuckets: BTreeMap<u16, VBucketCapture>,
}

impl BucketRecord {
    /// Build a record from the completed shards of a bucket
    pub fn from_shards<'a>(
        reason: BucketSelection,
        stages: BTreeMap<Stage, StageStatus>,
        shards: impl IntoIterator<Item = &'a ShardMeta>,
    ) -> Self {
        let vbuckets = shards
            .into_iter()
            .flat_map(|meta| meta.vbuckets.iter().map(|(vb, c)| (*vb, *c)))
            .collect();
        let mut record = Self {
            reason,
            num_docs: 0,
            num_deletions: 0,
            stages,
            vbuckets,
        };
        record.recount();
        record
    }

    /// Recompute the bucket totals from the per-vbucket counts
    pub fn recount(&mut self) {
        self.num_docs = self.vbuckets.values().map(|c| c.mutations).sum();
        self.num_deletions = self.vbuckets.values().map(|c| c.deletions).sum();
    }

    /// Vbuckets captured from sequence zero
    pub fn rebaselined(&self) -> Vec<u16> {
        self.vbuckets
            .iter()
            .filter(|(_, c)| c.rebaselined)
            .map(|(vb, _)| *vb)
            .collect()
    }

    /// Every captured vbucket was streamed from zero
    pub fn is_full_baseline(&self) -> bool {
        !self.vbuckets.is_empty() && self.vbuckets.values().all(|c| c.rebaselined)
    }

    /// Whether a stage was captured
    pub fn captured(&self, stage: Stage) -> bool {
        self.stages.get(&stage) == Some(&StageStatus::Captured)
    }

    /// Fold a later record into this cumulative one
    ///
    /// A rebaselined vbucket replaces the accumulated state, any other adds
    /// its key deltas and advances the sequence state. Reason and stage
    /// flags come from the later record.
    pub fn accumulate(&mut self, later: &BucketRecord) {
        for (vb, capture) in &later.vbuckets {
            self.vbuckets
                .entry(*vb)
                .and_modify(|acc| acc.absorb(capture))
                .or_insert(*capture);
        }
        self.reason = later.reason;
        self.stages = later.stages.clone();
        self.settle();
    }

    /// This record as the start of a cumulative fold
    pub fn cumulative(&self) -> Self {
        let mut record = self.clone();
        record.settle();
        record
    }

    /// Turn folded deltas into key counts
    fn settle(&mut self) {
        for capture in self.vbuckets.values_mut() {
            capture.mutations = capture.live_keys();
            capture.deletions = capture.deleted_keys();
        }
        self.recount();
    }
}

/// Contents of `instance.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMeta {
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Instance that was newest when this one was captured
    #[serde(default)]
    pub previous: Option<String>,
    /// Instances consolidated into this one by a merge
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<String>,
    #[serde(default)]
    pub buckets: BTreeMap<String, BucketRecord>,
    /// Buckets seen on the cluster but not captured, with the reason
    #[serde(default)]
    pub excluded: BTreeMap<String, BucketSelection>,
}

/// A committed instance opened for reading
#[derive(Debug, Clone)]
pub struct ArchivedInstance {
    pub meta: InstanceMeta,
    pub paths: InstancePaths,
}

impl ArchivedInstance {
    pub(crate) fn load(dir: &Path) -> BackupResult<Self> {
        let paths = InstancePaths::new(dir);
        let meta = read_json_required(paths.meta_file())?;
        Ok(Self { meta, paths })
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn record(&self, bucket: &str) -> Option<&BucketRecord> {
        self.meta.buckets.get(bucket)
    }

    /// Archived bucket settings, if captured
    pub fn bucket_settings(&self, bucket: &str) -> BackupResult<Option<BucketSettings>> {
        read_optional(&self.paths.bucket_config(bucket))
    }

    pub fn views(&self, bucket: &str) -> BackupResult<Option<Vec<DesignDocument>>> {
        read_optional(&self.paths.views_file(bucket))
    }

    pub fn gsi_indexes(&self, bucket: &str) -> BackupResult<Option<Vec<GsiIndex>>> {
        read_optional(&self.paths.gsi_file(bucket))
    }

    pub fn fts_indexes(&self, bucket: &str) -> BackupResult<Option<Vec<FtsIndex>>> {
        read_optional(&self.paths.fts_file(bucket))
    }

    /// Completed document shards of a bucket
    pub fn shards(&self, bucket: &str) -> BackupResult<Vec<ShardFile>> {
        list_shards(&self.paths.data_dir(bucket))
    }
}

/// Latest archived version of every key of some vbuckets of a bucket
///
/// Instances are read oldest first. A vbucket an instance re-baselined
/// forgets what the older instances held for it. `keep` maps each document
/// to what is stored for its key.
pub(crate) fn latest_versions<T>(
    history: &[ArchivedInstance],
    bucket: &str,
    wanted: impl Fn(u16) -> bool,
    keep: impl Fn(Document) -> T,
) -> BackupResult<BTreeMap<u16, HashMap<String, T>>> {
    let mut keys: BTreeMap<u16, HashMap<String, T>> = BTreeMap::new();

    for instance in history {
        let Some(record) = instance.record(bucket) else {
            continue;
        };
        for vb in record.rebaselined() {
            if wanted(vb) {
                keys.remove(&vb);
            }
        }

        for shard in instance.shards(bucket)? {
            if !shard.meta.vbuckets.keys().any(|vb| wanted(*vb)) {
                continue;
            }
            for doc in shard.reader()? {
                let doc = doc?;
                if !wanted(doc.vbucket) {
                    continue;
                }
                let vbucket = doc.vbucket;
                let key = doc.key.clone();
                keys.entry(vbucket).or_default().insert(key, keep(doc));
            }
        }
    }

    Ok(keys)
}

fn read_optional<T: serde::de::DeserializeOwned>(path: &Path) -> BackupResult<Option<T>> {
    if path.exists() {
        read_json_required(path).map(Some)
    } else {
        Ok(None)
    }
}

/// Check a repository name is usable as a directory name
pub fn validate_repository_name(name: &str) -> BackupResult<()> {
    if name.trim().is_empty() {
        return Err(BackupError::Config("repository name cannot be empty".into()));
    }
    if name.starts_with('.') || name.contains('/') || name.contains('\\') {
        return Err(BackupError::Config(format!(
            "invalid repository name '{}'",
            name
        )));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(BackupError::Config(format!(
            "'{}' is used by the archive itself and cannot name a repository",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn capture(mutations: u64, rebaselined: bool) -> VBucketCapture {
        if rebaselined {
            VBucketCapture::baseline(1, mutations, mutations, 0)
        } else {
            let mut capture = VBucketCapture::incremental(1, mutations, mutations, 0);
            capture.live_delta = mutations as i64;
            capture
        }
    }

    fn record(vbuckets: &[(u16, VBucketCapture)]) -> BucketRecord {
        let mut record = BucketRecord {
            reason: BucketSelection::AllBuckets,
            num_docs: 0,
            num_deletions: 0,
            stages: BTreeMap::new(),
            vbuckets: vbuckets.iter().copied().collect(),
        };
        record.recount();
        record
    }

    #[test]
    fn test_instance_names_increase() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let first = next_instance_name(now, None);
        assert_eq!(first, "2026-03-01T12_00_00.000000000Z");

        let second = next_instance_name(now, Some(&first));
        assert!(second > first);
        assert_eq!(second, "2026-03-01T12_00_00.000000001Z");

        let later = now + Duration::seconds(1);
        assert!(next_instance_name(later, Some(&second)) > second);
    }

    #[test]
    fn test_full_baseline() {
        assert!(record(&[(0, capture(5, true)), (1, capture(5, true))]).is_full_baseline());
        assert!(!record(&[(0, capture(5, true)), (1, capture(5, false))]).is_full_baseline());
        assert!(!record(&[]).is_full_baseline());
    }

    #[test]
    fn test_accumulate_adds_and_resets() {
        let mut acc = record(&[(0, capture(10, true)), (1, capture(10, true))]);
        acc.accumulate(&record(&[(0, capture(3, false)), (1, capture(4, false))]));
        assert_eq!(acc.num_docs, 27);

        // vbucket 1 captured again from zero
        acc.accumulate(&record(&[(1, capture(6, true))]));
        assert_eq!(acc.num_docs, 19);
        assert_eq!(acc.vbuckets[&1].mutations, 6);
    }

    #[test]
    fn test_accumulate_subtracts_deleted_keys() {
        let mut acc = record(&[(0, capture(10, true))]).cumulative();

        // three live keys deleted, two rewritten
        let mut later = VBucketCapture::incremental(1, 15, 2, 3);
        later.live_delta = -3;
        later.deleted_delta = 3;
        acc.accumulate(&record(&[(0, later)]));

        assert_eq!(acc.num_docs, 7);
        assert_eq!(acc.num_deletions, 3);
        assert_eq!(acc.vbuckets[&0].high_seqno, 15);
    }

    #[test]
    fn test_repository_names() {
        assert!(validate_repository_name("incr").is_ok());
        assert!(validate_repository_name("").is_err());
        assert!(validate_repository_name(".staging").is_err());
        assert!(validate_repository_name("a/b").is_err());
        assert!(validate_repository_name("logs").is_err());
        assert!(validate_repository_name("settings.json").is_err());
    }

    #[test]
    fn test_index_lookup() {
        let index = InstanceIndex {
            instances: vec![
                IndexEntry {
                    name: "a".into(),
                    dir: "a".into(),
                },
                IndexEntry {
                    name: "b".into(),
                    dir: "b-merged".into(),
                },
            ],
        };
        assert_eq!(index.position("b"), Some(1));
        assert_eq!(index.get("b").unwrap().dir, "b-merged");
        assert_eq!(index.names(), vec!["a", "b"]);
    }
}
