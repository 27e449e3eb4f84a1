//! Data exchanged with cluster collaborators

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKind {
    /// Persistent bucket with vbuckets and sequence numbers
    #[default]
    Couchbase,
    /// Cache-only bucket, never backed up
    Memcached,
}

impl fmt::Display for BucketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketKind::Couchbase => write!(f, "couchbase"),
            BucketKind::Memcached => write!(f, "memcached"),
        }
    }
}

/// Bucket settings as reported by (and given to) the bucket manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSettings {
    pub name: String,
    #[serde(default)]
    pub kind: BucketKind,
    #[serde(default = "default_quota")]
    pub ram_quota_mb: u64,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub flush_enabled: bool,
    #[serde(default = "default_vbuckets")]
    pub num_vbuckets: u16,
}

fn default_quota() -> u64 {
    256
}

fn default_vbuckets() -> u16 {
    64
}

impl BucketSettings {
    /// Settings for a persistent bucket with default quota and vbucket count
    pub fn couchbase(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: BucketKind::Couchbase,
            ram_quota_mb: default_quota(),
            replicas: 0,
            flush_enabled: false,
            num_vbuckets: default_vbuckets(),
        }
    }

    /// Settings for a memcached bucket
    pub fn memcached(name: impl Into<String>) -> Self {
        Self {
            kind: BucketKind::Memcached,
            ..Self::couchbase(name)
        }
    }
}

/// One document version, as streamed from or replayed into a bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: String,
    pub vbucket: u16,
    /// Sequence number at the source; carried as the revision on replay
    pub seqno: u64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub expiry: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl Document {
    /// A live document version
    pub fn mutation(
        key: impl Into<String>,
        vbucket: u16,
        seqno: u64,
        value: serde_json::Value,
    ) -> Self {
        Self {
            key: key.into(),
            vbucket,
            seqno,
            deleted: false,
            flags: 0,
            expiry: 0,
            value: Some(value),
        }
    }

    /// A deletion marker
    pub fn tombstone(key: impl Into<String>, vbucket: u16, seqno: u64) -> Self {
        Self {
            key: key.into(),
            vbucket,
            seqno,
            deleted: true,
            flags: 0,
            expiry: 0,
            value: None,
        }
    }
}

/// Revision of a document already present in the target bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentRev {
    pub rev: u64,
    pub deleted: bool,
}

/// One view inside a design document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub map: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<String>,
}

/// A design document: map/reduce views plus spatial views
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignDocument {
    pub name: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub views: BTreeMap<String, ViewDefinition>,
    #[serde(default)]
    pub spatial: BTreeMap<String, String>,
}

/// A secondary index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GsiIndex {
    pub name: String,
    pub bucket: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub primary: bool,
}

/// A full-text index definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FtsIndex {
    pub name: String,
    pub source_bucket: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Sequence state of one vbucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VBucketState {
    pub id: u16,
    pub uuid: u64,
    pub high_seqno: u64,
    pub purge_seqno: u64,
}

/// Where to resume a vbucket stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamRequest {
    /// Last sequence number already captured (0 streams everything)
    pub start_seqno: u64,
    /// UUID the start sequence belongs to; ignored when streaming from zero
    pub vb_uuid: u64,
}

impl StreamRequest {
    /// Stream the whole vbucket
    pub fn from_zero() -> Self {
        Self::default()
    }
}

/// How a vbucket stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// All items up to `snapshot_end` were delivered
    Completed { uuid: u64, snapshot_end: u64 },
    /// The requested start cannot be served; restart from `to_seqno`
    Rollback { to_seqno: u64 },
}

/// Outcome of one item in an upsert batch
pub type ItemResult = Result<(), String>;
