//! Replaying archived instances into one bucket
//!
//! Stages run in the fixed restore order. The bucket settings stage may
//! create a missing bucket from its archived settings; every later stage
//! needs the bucket to exist. The data stage replays the instances oldest
//! first, spreading each instance's shards over the bucket's worker pool.
//! A vbucket re-baselined inside the range is replayed from that instance
//! on; older instances' documents for it are left out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::pool::{build_pool, run_all};
use super::TransferOptions;
use crate::archive::{ArchivedInstance, ShardFile};
use crate::cluster::{BucketSettings, Cluster, Document};
use crate::config::{BackupConfig, Stage};
use crate::error::{BackupError, BackupResult};

/// Counts reported by a replayed bucket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Stages that ran, in order
    pub stages: Vec<Stage>,
    /// Bucket was created from archived settings
    pub created_bucket: bool,
    /// Live documents written
    pub docs: u64,
    /// Deletions applied
    pub deletions: u64,
    /// Documents already present at the archived revision
    pub skipped: u64,
}

impl ReplayStats {
    fn add(&mut self, other: &ReplayStats) {
        self.docs += other.docs;
        self.deletions += other.deletions;
        self.skipped += other.skipped;
    }
}

/// Replays one bucket
pub struct ReplayTask<'a> {
    pub(crate) cluster: &'a dyn Cluster,
    pub(crate) bucket: String,
    /// Instances in range, oldest first
    pub(crate) instances: Arc<[ArchivedInstance]>,
    pub(crate) config: BackupConfig,
    pub(crate) options: TransferOptions,
    pub(crate) ready_timeout: Duration,
    pub(crate) ready_poll: Duration,
}

impl<'a> ReplayTask<'a> {
    pub(crate) fn run(&self) -> BackupResult<ReplayStats> {
        let mut stats = ReplayStats::default();
        let mut bucket_checked = false;

        for stage in self.config.enabled_stages() {
            if stage != Stage::BucketSettings && !bucket_checked {
                if self.cluster.bucket_settings(&self.bucket)?.is_none() {
                    return Err(BackupError::BucketNotFound(self.bucket.clone()));
                }
                bucket_checked = true;
            }

            debug!(bucket = %self.bucket, stage = %stage, "restoring stage");
            match stage {
                Stage::BucketSettings => {
                    stats.created_bucket = self.restore_bucket_settings()?;
                }
                Stage::Views => {
                    if let Some(ddocs) = self.latest(|i| i.views(&self.bucket))? {
                        self.cluster.put_views(&self.bucket, &ddocs)?;
                    }
                }
                Stage::GsiIndexes => {
                    if let Some(indexes) = self.latest(|i| i.gsi_indexes(&self.bucket))? {
                        self.cluster.put_gsi_indexes(&self.bucket, &indexes)?;
                    }
                }
                Stage::FtsIndexes => {
                    if let Some(indexes) = self.latest(|i| i.fts_indexes(&self.bucket))? {
                        self.cluster.put_fts_indexes(&self.bucket, &indexes)?;
                    }
                }
                Stage::Data => {
                    let data = self.restore_data()?;
                    stats.add(&data);
                }
            }
            stats.stages.push(stage);
        }

        info!(
            bucket = %self.bucket,
            docs = stats.docs,
            deletions = stats.deletions,
            skipped = stats.skipped,
            "bucket restored"
        );
        Ok(stats)
    }

    /// Newest value in range that holds the bucket's metadata
    fn latest<T>(
        &self,
        read: impl Fn(&ArchivedInstance) -> BackupResult<Option<T>>,
    ) -> BackupResult<Option<T>> {
        for instance in self.instances.iter().rev() {
            if instance.record(&self.bucket).is_none() {
                continue;
            }
            if let Some(value) = read(instance)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Create the bucket if it is missing; returns whether it was created
    fn restore_bucket_settings(&self) -> BackupResult<bool> {
        if self.cluster.bucket_settings(&self.bucket)?.is_some() {
            debug!(bucket = %self.bucket, "bucket exists, keeping its settings");
            return Ok(false);
        }

        let Some(settings) = self.latest(|i| i.bucket_settings(&self.bucket))? else {
            warn!(bucket = %self.bucket, "no archived settings to create bucket from");
            return Ok(false);
        };

        let settings = BucketSettings {
            name: self.bucket.clone(),
            ..settings
        };
        info!(bucket = %self.bucket, "creating bucket from archived settings");
        self.cluster.create_bucket(&settings)?;
        self.wait_until_ready()?;
        Ok(true)
    }

    fn wait_until_ready(&self) -> BackupResult<()> {
        let started = Instant::now();
        loop {
            if self.cluster.is_bucket_ready(&self.bucket)? {
                return Ok(());
            }
            if started.elapsed() >= self.ready_timeout {
                return Err(BackupError::Http {
                    status: 503,
                    message: format!(
                        "bucket '{}' not ready after {}s",
                        self.bucket,
                        self.ready_timeout.as_secs()
                    ),
                });
            }
            std::thread::sleep(self.ready_poll);
        }
    }

    /// Position of the last instance in range that re-baselined each vbucket
    fn baselines(&self) -> BTreeMap<u16, usize> {
        let mut baselines = BTreeMap::new();
        for (position, instance) in self.instances.iter().enumerate() {
            if let Some(record) = instance.record(&self.bucket) {
                for vb in record.rebaselined() {
                    baselines.insert(vb, position);
                }
            }
        }
        baselines
    }

    fn restore_data(&self) -> BackupResult<ReplayStats> {
        let pool = build_pool(self.options.threads, "docvault-replay")?;
        let baselines = self.baselines();
        let mut stats = ReplayStats::default();

        for (position, instance) in self.instances.iter().enumerate() {
            if instance.record(&self.bucket).is_none() {
                continue;
            }

            let current = |vb: u16| baselines.get(&vb).map_or(true, |base| *base <= position);
            let shards: Vec<ShardFile> = instance
                .shards(&self.bucket)?
                .into_iter()
                .filter(|shard| shard.meta.vbuckets.keys().any(|vb| current(*vb)))
                .collect();
            debug!(
                bucket = %self.bucket,
                instance = instance.name(),
                shards = shards.len(),
                "replaying instance"
            );

            let results = run_all(&pool, &shards, |shard| self.replay_shard(shard, &current));

            // Later instances overwrite earlier ones, so stop at a failed instance
            let mut first_error = None;
            for result in results {
                match result {
                    Ok(shard_stats) => stats.add(&shard_stats),
                    Err(e) => {
                        warn!(bucket = %self.bucket, error = %e, "shard replay failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        Ok(stats)
    }

    fn replay_shard(
        &self,
        shard: &ShardFile,
        current: &(dyn Fn(u16) -> bool + Sync),
    ) -> BackupResult<ReplayStats> {
        let mut stats = ReplayStats::default();
        let mut batch = Vec::with_capacity(self.options.batch_size);

        for doc in shard.reader()? {
            let doc = doc?;
            if !self.config.selects_vbucket(doc.vbucket) || !current(doc.vbucket) {
                continue;
            }
            batch.push(doc);
            if batch.len() >= self.options.batch_size {
                self.flush(&mut batch, &mut stats)?;
            }
        }
        self.flush(&mut batch, &mut stats)?;

        Ok(stats)
    }

    fn flush(&self, batch: &mut Vec<Document>, stats: &mut ReplayStats) -> BackupResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        if self.options.resume {
            let keys: Vec<&str> = batch.iter().map(|d| d.key.as_str()).collect();
            let existing = self.cluster.document_revs(&self.bucket, &keys)?;
            let before = batch.len();
            batch.retain(|doc| {
                existing
                    .get(&doc.key)
                    .map_or(true, |rev| rev.rev != doc.seqno || rev.deleted != doc.deleted)
            });
            stats.skipped += (before - batch.len()) as u64;
        }

        let results = self.cluster.upsert_batch(&self.bucket, batch)?;
        let failed: Vec<String> = batch
            .iter()
            .zip(&results)
            .filter_map(|(doc, result)| {
                result
                    .as_ref()
                    .err()
                    .map(|msg| format!("{}: {}", doc.key, msg))
            })
            .collect();

        if !failed.is_empty() {
            return Err(BackupError::Cluster(format!(
                "{} of {} documents failed to restore in bucket '{}' ({})",
                failed.len(),
                batch.len(),
                self.bucket,
                failed.iter().take(3).cloned().collect::<Vec<_>>().join(", ")
            )));
        }

        let deletions = batch.iter().filter(|d| d.deleted).count() as u64;
        stats.deletions += deletions;
        stats.docs += batch.len() as u64 - deletions;
        batch.clear();
        Ok(())
    }
}
