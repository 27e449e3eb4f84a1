#![allow(dead_code)]

use std::collections::BTreeMap;

use tempfile::TempDir;

use docvault::archive::{Archive, BucketRecord};
use docvault::cluster::{Credentials, MemoryCluster, MemorySession};
use docvault::config::BackupConfig;
use docvault::transfer::TransferOptions;

pub const REPO: &str = "incr-backup-test";

/// An archive in a temp dir plus an in-process cluster with a `default` bucket
pub struct Fixture {
    pub dir: TempDir,
    pub archive: Archive,
    pub cluster: MemoryCluster,
    pub session: MemorySession,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(&BackupConfig::default())
    }

    pub fn with_config(config: &BackupConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::mount(dir.path().join("archive"), true).unwrap();
        archive.create_repository(REPO, config).unwrap();

        let cluster = MemoryCluster::new();
        cluster.create_couchbase_bucket("default").unwrap();
        let session = cluster.connect(Credentials::new("Administrator", "password"));

        Self {
            dir,
            archive,
            cluster,
            session,
        }
    }

    pub fn options(&self) -> TransferOptions {
        TransferOptions::from_settings(self.archive.settings()).with_threads(4)
    }

    pub fn backup(&self) -> String {
        docvault::backup::backup(&self.archive, &self.session, REPO, &self.options())
            .unwrap()
            .instance
    }

    pub fn restore(&self, start: Option<&str>, end: Option<&str>) -> u64 {
        docvault::backup::restore(
            &self.archive,
            &self.session,
            REPO,
            start,
            end,
            &self.options(),
            None,
        )
        .unwrap();
        self.cluster.item_count("default").unwrap()
    }

    pub fn incr_docs(&self, name: &str) -> u64 {
        self.archive.incr_backup_info(REPO, name).unwrap()["default"].num_docs
    }

    pub fn info(&self) -> BTreeMap<String, BucketRecord> {
        self.archive.backup_info(REPO, None).unwrap()
    }
}

pub fn wrong_credentials(cluster: &MemoryCluster) -> MemorySession {
    cluster.connect(Credentials::new("Administrator", "not-the-password"))
}
