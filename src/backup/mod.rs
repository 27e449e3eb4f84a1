//! Backup, restore and merge entry points
//!
//! These functions tie the archive, the transfer engine and a cluster
//! together. Each receives the [`Archive`] and the cluster explicitly; there
//! is no global connection.
//!
//! # Restore Order
//!
//! Per bucket, stages always run in this order, skipping disabled ones:
//!
//! 1. bucket settings (may create a missing bucket)
//! 2. views
//! 3. GSI indexes
//! 4. FTS indexes
//! 5. data
//!
//! Every stage after bucket settings requires the bucket to exist; when it
//! does not, the bucket fails with `BucketNotFound` before any stage runs.
//!
//! # Example
//!
//! ```rust,ignore
//! use docvault::archive::Archive;
//! use docvault::backup;
//! use docvault::transfer::TransferOptions;
//!
//! let archive = Archive::mount("/backups", true)?;
//! archive.create_repository("nightly", &BackupConfig::default())?;
//!
//! let options = TransferOptions::from_settings(archive.settings());
//! let report = backup::backup(&archive, &session, "nightly", &options)?;
//! println!("{}", report.summary());
//! ```

mod range;

pub use range::resolve_range;

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::archive::{Archive, BucketRecord};
use crate::cluster::Cluster;
use crate::config::{BackupConfig, BucketSelection};
use crate::error::{BackupError, BackupResult};
use crate::transfer::{
    build_transferable, ReplayStats, TransferOptions, TransferPool, TransferRequest, UnitOutcome,
};

/// Result of a backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    /// Name of the committed instance
    pub instance: String,
    /// What was captured per bucket
    pub buckets: BTreeMap<String, BucketRecord>,
    /// Buckets left out, with the reason
    pub excluded: BTreeMap<String, BucketSelection>,
}

impl BackupReport {
    /// Total live documents captured
    pub fn total_docs(&self) -> u64 {
        self.buckets.values().map(|r| r.num_docs).sum()
    }

    /// Get a summary message
    pub fn summary(&self) -> String {
        format!(
            "Backup {} complete: {} bucket(s), {} document(s), {} deletion(s)",
            self.instance,
            self.buckets.len(),
            self.total_docs(),
            self.buckets.values().map(|r| r.num_deletions).sum::<u64>()
        )
    }
}

/// Result of a restore
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RestoreReport {
    /// Instances replayed, oldest first
    pub instances: Vec<String>,
    pub buckets: BTreeMap<String, ReplayStats>,
    pub excluded: BTreeMap<String, BucketSelection>,
}

impl RestoreReport {
    /// Total live documents written
    pub fn total_docs(&self) -> u64 {
        self.buckets.values().map(|s| s.docs).sum()
    }

    /// Get a summary message
    pub fn summary(&self) -> String {
        let skipped: u64 = self.buckets.values().map(|s| s.skipped).sum();
        let mut summary = format!(
            "Restored {} instance(s) into {} bucket(s): {} document(s), {} deletion(s)",
            self.instances.len(),
            self.buckets.len(),
            self.total_docs(),
            self.buckets.values().map(|s| s.deletions).sum::<u64>()
        );
        if skipped > 0 {
            summary.push_str(&format!(", {} already present", skipped));
        }
        summary
    }
}

/// Capture every eligible bucket into a new instance of `repository`
///
/// The instance is committed only if every bucket succeeded. Otherwise the
/// staged data is kept so a later run with `resume` can pick it up.
pub fn backup(
    archive: &Archive,
    cluster: &dyn Cluster,
    repository: &str,
    options: &TransferOptions,
) -> BackupResult<BackupReport> {
    let request = TransferRequest::capture(repository, options.clone());
    let transferables = build_transferable(archive, cluster, &request)?;
    let pool = TransferPool::new(archive.settings().bucket_concurrency)?;

    let (outcomes, failures) = transferables.run(&pool);
    if let Some(error) = BackupError::from_failures(failures) {
        warn!(repository, error = %error, "backup failed; staged data kept for resume");
        return Err(error);
    }

    let buckets: BTreeMap<String, BucketRecord> = outcomes
        .into_iter()
        .filter_map(|(bucket, outcome)| match outcome {
            UnitOutcome::Captured(record) => Some((bucket, record)),
            UnitOutcome::Replayed(_) => None,
        })
        .collect();

    let staged = transferables
        .staged
        .as_ref()
        .ok_or_else(|| BackupError::Config("capture without a staged instance".into()))?;
    let meta = staged.commit(buckets, transferables.excluded.clone())?;

    let report = BackupReport {
        instance: meta.name,
        buckets: meta.buckets,
        excluded: meta.excluded,
    };
    info!(repository, "{}", report.summary());
    Ok(report)
}

/// Replay the instances `start..=end` of `repository` into the cluster
///
/// `config` replaces the repository's config for this restore, e.g. to
/// skip stages or pick buckets.
pub fn restore(
    archive: &Archive,
    cluster: &dyn Cluster,
    repository: &str,
    start: Option<&str>,
    end: Option<&str>,
    options: &TransferOptions,
    config: Option<&BackupConfig>,
) -> BackupResult<RestoreReport> {
    let request = TransferRequest::replay(repository, start, end, options.clone())
        .with_config(config.cloned());
    let transferables = build_transferable(archive, cluster, &request)?;
    let pool = TransferPool::new(archive.settings().bucket_concurrency)?;

    let (outcomes, failures) = transferables.run(&pool);
    if let Some(error) = BackupError::from_failures(failures) {
        warn!(repository, error = %error, "restore failed");
        return Err(error);
    }

    let report = RestoreReport {
        instances: transferables.instances.clone(),
        buckets: outcomes
            .into_iter()
            .filter_map(|(bucket, outcome)| match outcome {
                UnitOutcome::Replayed(stats) => Some((bucket, stats)),
                UnitOutcome::Captured(_) => None,
            })
            .collect(),
        excluded: transferables.excluded.clone(),
    };
    info!(repository, "{}", report.summary());
    Ok(report)
}

/// Merge the instances `first..=last` of `repository`
///
/// Returns the merged instance's name, which is `last`.
pub fn merge(archive: &Archive, repository: &str, first: &str, last: &str) -> BackupResult<String> {
    archive.merge_incr_backups(repository, first, last)
}
