//! Cluster collaborators
//!
//! The engine never talks to a cluster directly; it goes through three
//! narrow traits:
//!
//! - [`DataClient`]: stream a vbucket's changes and upsert document batches
//! - [`MetadataClient`]: read and write view, GSI and FTS definitions
//! - [`BucketManager`]: list, create, delete and poll buckets
//!
//! [`Cluster`] is implemented for anything providing all three. A session is
//! bound to its credentials when it is created, so every call is
//! authenticated; bad credentials surface as
//! [`BackupError::Authentication`](crate::error::BackupError::Authentication).
//!
//! [`MemoryCluster`] is the in-process implementation used by the tests and
//! by `file://` endpoints.

mod credentials;
mod endpoint;
mod memory;
mod types;

pub use credentials::{Credentials, SecureString};
pub use endpoint::{connect, ClusterEndpoint, Connection};
pub use memory::{MemoryCluster, MemorySession};
pub use types::{
    BucketKind, BucketSettings, DesignDocument, Document, DocumentRev, FtsIndex, GsiIndex,
    ItemResult, StreamEnd, StreamRequest, VBucketState, ViewDefinition,
};

use std::collections::HashMap;

use crate::error::BackupResult;

/// Document streaming and mutation
pub trait DataClient: Send + Sync {
    /// Current sequence state of every vbucket of a bucket
    fn vbucket_states(&self, bucket: &str) -> BackupResult<Vec<VBucketState>>;

    /// Stream a vbucket's items after `request.start_seqno`, in sequence order
    ///
    /// Items are handed to `sink` one at a time. A rollback is reported
    /// before any item is delivered.
    fn stream_vbucket(
        &self,
        bucket: &str,
        vbucket: u16,
        request: StreamRequest,
        sink: &mut dyn FnMut(Document) -> BackupResult<()>,
    ) -> BackupResult<StreamEnd>;

    /// Write a batch of documents (tombstones delete the key)
    fn upsert_batch(&self, bucket: &str, docs: &[Document]) -> BackupResult<Vec<ItemResult>>;

    /// Revisions of the given keys that already exist in the bucket
    fn document_revs(&self, bucket: &str, keys: &[&str])
        -> BackupResult<HashMap<String, DocumentRev>>;

    /// Drop tombstones up to a sequence number; returns how many were removed
    fn purge_tombstones(&self, bucket: &str, vbucket: u16, up_to_seqno: u64) -> BackupResult<u64>;
}

/// View, GSI and full-text index definitions
pub trait MetadataClient: Send + Sync {
    fn get_views(&self, bucket: &str) -> BackupResult<Vec<DesignDocument>>;
    fn put_views(&self, bucket: &str, ddocs: &[DesignDocument]) -> BackupResult<()>;
    fn get_gsi_indexes(&self, bucket: &str) -> BackupResult<Vec<GsiIndex>>;
    fn put_gsi_indexes(&self, bucket: &str, indexes: &[GsiIndex]) -> BackupResult<()>;
    fn get_fts_indexes(&self, bucket: &str) -> BackupResult<Vec<FtsIndex>>;
    fn put_fts_indexes(&self, bucket: &str, indexes: &[FtsIndex]) -> BackupResult<()>;
}

/// Bucket lifecycle
pub trait BucketManager: Send + Sync {
    fn list_buckets(&self) -> BackupResult<Vec<BucketSettings>>;
    fn bucket_settings(&self, bucket: &str) -> BackupResult<Option<BucketSettings>>;
    fn create_bucket(&self, settings: &BucketSettings) -> BackupResult<()>;
    fn delete_bucket(&self, bucket: &str) -> BackupResult<()>;
    /// True once every node reports the bucket healthy
    fn is_bucket_ready(&self, bucket: &str) -> BackupResult<bool>;
}

/// Everything the engine needs from a cluster
pub trait Cluster: DataClient + MetadataClient + BucketManager {}

impl<T: DataClient + MetadataClient + BucketManager> Cluster for T {}

/// Map a key to its vbucket the way the cluster's client library does
pub fn vbucket_for_key(key: &str, num_vbuckets: u16) -> u16 {
    let hash = crc32fast::hash(key.as_bytes());
    (((hash >> 16) & 0x7fff) % u32::from(num_vbuckets.max(1))) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vbucket_for_key_in_range() {
        for i in 0..1000 {
            let key = format!("key{}", i);
            assert!(vbucket_for_key(&key, 64) < 64);
        }
        assert_eq!(vbucket_for_key("anything", 1), 0);
    }

    #[test]
    fn test_vbucket_for_key_stable() {
        assert_eq!(vbucket_for_key("full1", 1024), vbucket_for_key("full1", 1024));
    }
}
