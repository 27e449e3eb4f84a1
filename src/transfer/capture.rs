//! Capturing one bucket into a staged instance
//!
//! Metadata stages are written first. The data stage splits the bucket's
//! selected vbuckets into contiguous shards and streams each shard on the
//! bucket's worker pool. A vbucket continues from the previous high-water
//! mark when the cluster can still serve it; otherwise it is re-baselined
//! from sequence zero.
//!
//! An incremental vbucket also remembers which keys it saw, so the shard
//! can record how the archived key set changed once the archive has been
//! consulted for their earlier state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::pool::{build_pool, run_all};
use super::TransferOptions;
use crate::archive::file_io::write_json_atomic;
use crate::archive::instance::latest_versions;
use crate::archive::shard::{list_shards, partition, ShardMeta, ShardWriter, VBucketCapture};
use crate::archive::{ArchivedInstance, BucketRecord, StageStatus, StagedInstance};
use crate::cluster::{BucketSettings, Cluster, StreamEnd, StreamRequest, VBucketState};
use crate::config::{BackupConfig, BucketSelection, Stage};
use crate::error::{BackupError, BackupResult};

/// Captures one bucket
pub struct CaptureTask<'a> {
    pub(crate) cluster: &'a dyn Cluster,
    pub(crate) staged: Arc<StagedInstance>,
    pub(crate) bucket: BucketSettings,
    pub(crate) reason: BucketSelection,
    pub(crate) config: BackupConfig,
    /// Cumulative record of the bucket before this capture
    pub(crate) previous: Option<BucketRecord>,
    /// Committed instances, oldest first
    pub(crate) history: Arc<[ArchivedInstance]>,
    pub(crate) options: TransferOptions,
    pub(crate) compression_level: i32,
}

impl<'a> CaptureTask<'a> {
    pub(crate) fn run(&self) -> BackupResult<BucketRecord> {
        let name = self.bucket.name.as_str();
        let paths = self.staged.paths();
        let mut stages = BTreeMap::new();

        for stage in Stage::RESTORE_ORDER {
            if self.config.skips(stage) {
                stages.insert(stage, StageStatus::Skipped);
                continue;
            }
            match stage {
                Stage::BucketSettings => write_json_atomic(paths.bucket_config(name), &self.bucket)?,
                Stage::Views => {
                    write_json_atomic(paths.views_file(name), &self.cluster.get_views(name)?)?
                }
                Stage::GsiIndexes => {
                    write_json_atomic(paths.gsi_file(name), &self.cluster.get_gsi_indexes(name)?)?
                }
                Stage::FtsIndexes => {
                    write_json_atomic(paths.fts_file(name), &self.cluster.get_fts_indexes(name)?)?
                }
                Stage::Data => self.capture_data()?,
            }
            stages.insert(stage, StageStatus::Captured);
        }

        let shards = list_shards(&paths.data_dir(name))?;
        let record = BucketRecord::from_shards(
            self.reason,
            stages,
            shards.iter().map(|shard| &shard.meta),
        );

        info!(
            bucket = name,
            docs = record.num_docs,
            deletions = record.num_deletions,
            rebaselined = record.rebaselined().len(),
            "bucket captured"
        );
        Ok(record)
    }

    fn capture_data(&self) -> BackupResult<()> {
        let name = self.bucket.name.as_str();
        let states: BTreeMap<u16, VBucketState> = self
            .cluster
            .vbucket_states(name)?
            .into_iter()
            .map(|state| (state.id, state))
            .collect();

        let done = self.staged.completed_vbuckets(name)?;
        let pending: Vec<u16> = states
            .keys()
            .copied()
            .filter(|vb| self.config.selects_vbucket(*vb) && !done.contains(vb))
            .collect();

        if !done.is_empty() {
            info!(bucket = name, completed = done.len(), "resuming capture");
        }
        if pending.is_empty() {
            return Ok(());
        }

        let shards = partition(&pending, self.options.threads);
        let pool = build_pool(self.options.threads, "docvault-shard")?;
        let results = run_all(&pool, &shards, |vbuckets| self.capture_shard(vbuckets, &states));

        // Every shard has finished; report the first failure
        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                warn!(bucket = name, error = %e, "shard capture failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn capture_shard(
        &self,
        vbuckets: &[u16],
        states: &BTreeMap<u16, VBucketState>,
    ) -> BackupResult<ShardMeta> {
        let name = self.bucket.name.as_str();
        let (Some(first), Some(last)) = (vbuckets.first(), vbuckets.last()) else {
            return Err(BackupError::Config("empty shard".into()));
        };

        let data_dir = self.staged.paths().data_dir(name);
        let mut writer = ShardWriter::create(&data_dir, *first, *last, self.compression_level)?;

        let mut captured = Vec::with_capacity(vbuckets.len());
        for vb in vbuckets {
            let state = states
                .get(vb)
                .ok_or_else(|| BackupError::Cluster(format!("no state for vbucket {}", vb)))?;
            captured.push((*vb, self.capture_vbucket(&mut writer, *state)?));
        }

        let changed: BTreeSet<u16> = captured
            .iter()
            .filter(|(_, (_, changes))| !changes.is_empty())
            .map(|(vb, _)| *vb)
            .collect();
        let archived = self.archived_keys(&changed)?;

        for (vb, (mut capture, changes)) in captured {
            let keys = archived.get(&vb);
            for (key, deleted) in &changes {
                capture.count_change(keys.and_then(|k| k.get(key)).copied(), *deleted);
            }
            writer.record_vbucket(vb, capture);
        }

        let meta = writer.finish()?;

        if self.options.purge {
            for (vb, capture) in &meta.vbuckets {
                let purged = self
                    .cluster
                    .purge_tombstones(name, *vb, capture.high_seqno)?;
                if purged > 0 {
                    debug!(bucket = name, vbucket = vb, purged, "purged captured tombstones");
                }
            }
        }

        Ok(meta)
    }

    /// Whether each key of `vbuckets` is held deleted by the archive
    fn archived_keys(
        &self,
        vbuckets: &BTreeSet<u16>,
    ) -> BackupResult<BTreeMap<u16, HashMap<String, bool>>> {
        if vbuckets.is_empty() {
            return Ok(BTreeMap::new());
        }
        latest_versions(
            &self.history,
            &self.bucket.name,
            |vb| vbuckets.contains(&vb),
            |doc| doc.deleted,
        )
    }

    /// Where to start a vbucket, and whether that is a re-baseline
    fn start_point(&self, state: &VBucketState) -> (StreamRequest, bool) {
        let previous = self
            .previous
            .as_ref()
            .and_then(|record| record.vbuckets.get(&state.id));

        let Some(previous) = previous else {
            return (StreamRequest::from_zero(), true);
        };

        let reason = if previous.uuid != state.uuid {
            "vbucket uuid changed"
        } else if previous.high_seqno > state.high_seqno {
            "sequence number went backwards"
        } else if previous.high_seqno < state.purge_seqno {
            "tombstones purged past the last backup"
        } else {
            let request = StreamRequest {
                start_seqno: previous.high_seqno,
                vb_uuid: previous.uuid,
            };
            return (request, false);
        };

        warn!(
            bucket = %self.bucket.name,
            vbucket = state.id,
            reason,
            "re-baselining vbucket"
        );
        (StreamRequest::from_zero(), true)
    }

    /// Stream one vbucket; an incremental capture also returns the keys it
    /// saw and whether each ended up deleted
    fn capture_vbucket(
        &self,
        writer: &mut ShardWriter,
        state: VBucketState,
    ) -> BackupResult<(VBucketCapture, Vec<(String, bool)>)> {
        let (request, rebaselined) = self.start_point(&state);

        match self.stream(writer, state.id, request, !rebaselined)? {
            (StreamEnd::Completed { uuid, snapshot_end }, counts) => {
                let high_seqno = snapshot_end.max(counts.last_seqno);
                if rebaselined {
                    let capture =
                        VBucketCapture::baseline(uuid, high_seqno, counts.mutations, counts.deletions);
                    Ok((capture, Vec::new()))
                } else {
                    let capture = VBucketCapture::incremental(
                        uuid,
                        high_seqno,
                        counts.mutations,
                        counts.deletions,
                    );
                    Ok((capture, counts.changes))
                }
            }
            (StreamEnd::Rollback { to_seqno }, _) if request.start_seqno > 0 => {
                warn!(
                    bucket = %self.bucket.name,
                    vbucket = state.id,
                    to_seqno,
                    "cluster requested rollback, re-baselining vbucket"
                );
                match self.stream(writer, state.id, StreamRequest::from_zero(), false)? {
                    (StreamEnd::Completed { uuid, snapshot_end }, counts) => {
                        let high_seqno = snapshot_end.max(counts.last_seqno);
                        let capture = VBucketCapture::baseline(
                            uuid,
                            high_seqno,
                            counts.mutations,
                            counts.deletions,
                        );
                        Ok((capture, Vec::new()))
                    }
                    (StreamEnd::Rollback { .. }, _) => Err(rollback_from_zero(state.id)),
                }
            }
            (StreamEnd::Rollback { .. }, _) => Err(rollback_from_zero(state.id)),
        }
    }

    fn stream(
        &self,
        writer: &mut ShardWriter,
        vbucket: u16,
        request: StreamRequest,
        track_keys: bool,
    ) -> BackupResult<(StreamEnd, StreamCounts)> {
        let mut counts = StreamCounts {
            last_seqno: request.start_seqno,
            mutations: 0,
            deletions: 0,
            changes: Vec::new(),
        };

        let end = self.cluster.stream_vbucket(
            &self.bucket.name,
            vbucket,
            request,
            &mut |doc| {
                if doc.seqno <= counts.last_seqno {
                    return Err(BackupError::Cluster(format!(
                        "vbucket {} delivered seqno {} after {}",
                        vbucket, doc.seqno, counts.last_seqno
                    )));
                }
                counts.last_seqno = doc.seqno;
                if doc.deleted {
                    counts.deletions += 1;
                } else {
                    counts.mutations += 1;
                }
                if track_keys {
                    counts.changes.push((doc.key.clone(), doc.deleted));
                }
                writer.write(&doc)
            },
        )?;

        Ok((end, counts))
    }
}

struct StreamCounts {
    last_seqno: u64,
    mutations: u64,
    deletions: u64,
    /// Keys seen by an incremental stream
    changes: Vec<(String, bool)>,
}

fn rollback_from_zero(vbucket: u16) -> BackupError {
    BackupError::Cluster(format!(
        "vbucket {} requested a rollback of a stream from zero",
        vbucket
    ))
}
