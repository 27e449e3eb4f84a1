//! In-process cluster
//!
//! [`MemoryCluster`] keeps buckets, vbuckets and documents in memory behind
//! a lock and hands out authenticated [`MemorySession`]s implementing the
//! cluster traits. It follows the sequence-number rules the engine relies
//! on: every mutation or deletion takes the vbucket's next sequence number,
//! compaction drops tombstones and raises the purge sequence number, and a
//! stream that cannot be continued asks for a rollback to zero.
//!
//! A cluster can be persisted to a directory (`cluster.json`) so the command
//! line tool can target it through a `file://` endpoint.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::credentials::Credentials;
use super::types::{
    BucketKind, BucketSettings, DesignDocument, Document, DocumentRev, FtsIndex, GsiIndex,
    ItemResult, StreamEnd, StreamRequest, VBucketState,
};
use super::{vbucket_for_key, BucketManager, DataClient, MetadataClient};
use crate::archive::file_io::{read_json_required, write_json_atomic};
use crate::error::{BackupError, BackupResult};

const STATE_FILE: &str = "cluster.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDoc {
    seqno: u64,
    rev: u64,
    deleted: bool,
    #[serde(default)]
    flags: u32,
    #[serde(default)]
    expiry: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VBucket {
    uuid: u64,
    high_seqno: u64,
    purge_seqno: u64,
    docs: BTreeMap<String, StoredDoc>,
}

impl VBucket {
    fn new() -> Self {
        Self {
            uuid: Uuid::new_v4().as_u64_pair().0,
            high_seqno: 0,
            purge_seqno: 0,
            docs: BTreeMap::new(),
        }
    }

    fn next_seqno(&mut self) -> u64 {
        self.high_seqno += 1;
        self.high_seqno
    }

    fn purge(&mut self, up_to_seqno: u64) -> u64 {
        let doomed: Vec<(String, u64)> = self
            .docs
            .iter()
            .filter(|(_, doc)| doc.deleted && doc.seqno <= up_to_seqno)
            .map(|(key, doc)| (key.clone(), doc.seqno))
            .collect();

        for (key, seqno) in &doomed {
            self.docs.remove(key);
            self.purge_seqno = self.purge_seqno.max(*seqno);
        }

        doomed.len() as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketState {
    settings: BucketSettings,
    vbuckets: Vec<VBucket>,
    #[serde(default)]
    views: Vec<DesignDocument>,
    #[serde(default)]
    gsi: Vec<GsiIndex>,
    #[serde(default)]
    fts: Vec<FtsIndex>,
    /// Readiness polls left before the bucket reports healthy
    #[serde(default)]
    warmup_polls: u32,
    /// Data calls fail with HTTP 503 while set
    #[serde(default)]
    unavailable: bool,
}

impl BucketState {
    fn new(settings: BucketSettings, warmup_polls: u32) -> Self {
        let count = match settings.kind {
            BucketKind::Couchbase => settings.num_vbuckets.max(1),
            BucketKind::Memcached => 0,
        };
        Self {
            vbuckets: (0..count).map(|_| VBucket::new()).collect(),
            settings,
            views: Vec::new(),
            gsi: Vec::new(),
            fts: Vec::new(),
            warmup_polls,
            unavailable: false,
        }
    }

    fn num_vbuckets(&self) -> u16 {
        self.vbuckets.len() as u16
    }

    fn vbucket_mut(&mut self, key: &str) -> &mut VBucket {
        let vb = vbucket_for_key(key, self.num_vbuckets());
        &mut self.vbuckets[usize::from(vb)]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClusterState {
    users: BTreeMap<String, String>,
    buckets: BTreeMap<String, BucketState>,
    #[serde(default)]
    warmup_polls: u32,
}

impl Default for ClusterState {
    fn default() -> Self {
        let mut users = BTreeMap::new();
        users.insert("Administrator".to_string(), "password".to_string());
        Self {
            users,
            buckets: BTreeMap::new(),
            warmup_polls: 0,
        }
    }
}

/// An in-process cluster
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    state: Arc<RwLock<ClusterState>>,
    persist_dir: Option<PathBuf>,
}

impl MemoryCluster {
    /// Create an empty cluster with the user `Administrator`/`password`
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a persisted cluster, creating an empty one if the directory has none
    pub fn open(dir: impl AsRef<Path>) -> BackupResult<Self> {
        let dir = dir.as_ref();
        let state_file = dir.join(STATE_FILE);
        let state = if state_file.exists() {
            read_json_required(&state_file)?
        } else {
            ClusterState::default()
        };

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            persist_dir: Some(dir.to_path_buf()),
        })
    }

    /// Persist to the directory given to [`MemoryCluster::open`] or [`MemoryCluster::save_to`]
    pub fn save(&self) -> BackupResult<()> {
        match &self.persist_dir {
            Some(dir) => self.save_to(dir),
            None => Ok(()),
        }
    }

    /// Persist to a directory
    pub fn save_to(&self, dir: impl AsRef<Path>) -> BackupResult<()> {
        let state = self.state.read();
        write_json_atomic(dir.as_ref().join(STATE_FILE), &*state)
    }

    /// Open an authenticated session
    pub fn connect(&self, credentials: Credentials) -> MemorySession {
        MemorySession {
            cluster: self.clone(),
            credentials,
        }
    }

    /// Add (or replace) a user
    pub fn add_user(&self, username: impl Into<String>, password: impl Into<String>) {
        self.state
            .write()
            .users
            .insert(username.into(), password.into());
    }

    /// Number of readiness polls newly created buckets need before they are ready
    pub fn set_bucket_warmup(&self, polls: u32) {
        self.state.write().warmup_polls = polls;
    }

    /// Create a bucket
    pub fn create_bucket(&self, settings: BucketSettings) -> BackupResult<()> {
        let mut state = self.state.write();
        if state.buckets.contains_key(&settings.name) {
            return Err(BackupError::Http {
                status: 400,
                message: format!("bucket '{}' already exists", settings.name),
            });
        }
        let warmup = state.warmup_polls;
        debug!(bucket = %settings.name, kind = %settings.kind, "creating bucket");
        state
            .buckets
            .insert(settings.name.clone(), BucketState::new(settings, warmup));
        Ok(())
    }

    /// Create a persistent bucket with default settings
    pub fn create_couchbase_bucket(&self, name: &str) -> BackupResult<()> {
        self.create_bucket(BucketSettings::couchbase(name))
    }

    /// Create a memcached bucket
    pub fn create_memcached_bucket(&self, name: &str) -> BackupResult<()> {
        self.create_bucket(BucketSettings::memcached(name))
    }

    /// Delete a bucket and everything in it
    pub fn delete_bucket(&self, name: &str) -> BackupResult<()> {
        self.state
            .write()
            .buckets
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BackupError::BucketNotFound(name.to_string()))
    }

    /// Delete every bucket
    pub fn delete_all_buckets(&self) {
        self.state.write().buckets.clear();
    }

    /// Names of all buckets
    pub fn bucket_names(&self) -> Vec<String> {
        self.state.read().buckets.keys().cloned().collect()
    }

    /// Insert `count` documents `{prefix}{i}` with value `{"x": i}`
    pub fn load_documents(&self, bucket: &str, prefix: &str, count: usize) -> BackupResult<()> {
        let mut state = self.state.write();
        let bucket_state = persistent_bucket_mut(&mut state, bucket)?;

        for i in 0..count {
            let key = format!("{}{}", prefix, i);
            let vbucket = bucket_state.vbucket_mut(&key);
            let seqno = vbucket.next_seqno();
            vbucket.docs.insert(
                key,
                StoredDoc {
                    seqno,
                    rev: seqno,
                    deleted: false,
                    flags: 0,
                    expiry: 0,
                    value: Some(serde_json::json!({ "x": i })),
                },
            );
        }

        Ok(())
    }

    /// Delete `count` documents `{prefix}{i}`, leaving tombstones
    pub fn delete_documents(&self, bucket: &str, prefix: &str, count: usize) -> BackupResult<()> {
        let mut state = self.state.write();
        let bucket_state = persistent_bucket_mut(&mut state, bucket)?;

        for i in 0..count {
            let key = format!("{}{}", prefix, i);
            let vbucket = bucket_state.vbucket_mut(&key);
            let live = vbucket.docs.get(&key).map_or(false, |doc| !doc.deleted);
            if !live {
                return Err(BackupError::Http {
                    status: 404,
                    message: format!("document '{}' not found", key),
                });
            }
            let seqno = vbucket.next_seqno();
            vbucket.docs.insert(
                key,
                StoredDoc {
                    seqno,
                    rev: seqno,
                    deleted: true,
                    flags: 0,
                    expiry: 0,
                    value: None,
                },
            );
        }

        Ok(())
    }

    /// Drop tombstones up to `purge_up_to` in every vbucket
    pub fn compact(&self, bucket: &str, purge_up_to: u64) -> BackupResult<u64> {
        let mut state = self.state.write();
        let bucket_state = persistent_bucket_mut(&mut state, bucket)?;
        Ok(bucket_state
            .vbuckets
            .iter_mut()
            .map(|vb| vb.purge(purge_up_to))
            .sum())
    }

    /// Number of live documents in a bucket
    pub fn item_count(&self, bucket: &str) -> BackupResult<u64> {
        let state = self.state.read();
        let bucket_state = state
            .buckets
            .get(bucket)
            .ok_or_else(|| BackupError::BucketNotFound(bucket.to_string()))?;
        Ok(bucket_state
            .vbuckets
            .iter()
            .flat_map(|vb| vb.docs.values())
            .filter(|doc| !doc.deleted)
            .count() as u64)
    }

    /// Fetch a live document's value
    pub fn get_document(&self, bucket: &str, key: &str) -> Option<serde_json::Value> {
        let state = self.state.read();
        let bucket_state = state.buckets.get(bucket)?;
        let vb = vbucket_for_key(key, bucket_state.num_vbuckets());
        bucket_state.vbuckets[usize::from(vb)]
            .docs
            .get(key)
            .filter(|doc| !doc.deleted)
            .and_then(|doc| doc.value.clone())
    }

    /// Make data calls against a bucket fail with HTTP 503
    pub fn set_unavailable(&self, bucket: &str, unavailable: bool) -> BackupResult<()> {
        let mut state = self.state.write();
        let bucket_state = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| BackupError::BucketNotFound(bucket.to_string()))?;
        bucket_state.unavailable = unavailable;
        Ok(())
    }
}

fn persistent_bucket_mut<'a>(
    state: &'a mut ClusterState,
    bucket: &str,
) -> BackupResult<&'a mut BucketState> {
    let bucket_state = state
        .buckets
        .get_mut(bucket)
        .ok_or_else(|| BackupError::BucketNotFound(bucket.to_string()))?;
    if bucket_state.settings.kind != BucketKind::Couchbase {
        return Err(BackupError::Http {
            status: 400,
            message: format!("bucket '{}' does not support document streams", bucket),
        });
    }
    if bucket_state.unavailable {
        return Err(BackupError::Http {
            status: 503,
            message: format!("bucket '{}' is temporarily unavailable", bucket),
        });
    }
    Ok(bucket_state)
}

/// An authenticated session against a [`MemoryCluster`]
#[derive(Debug, Clone)]
pub struct MemorySession {
    cluster: MemoryCluster,
    credentials: Credentials,
}

impl MemorySession {
    fn authenticate(&self, state: &ClusterState) -> BackupResult<()> {
        match state.users.get(self.credentials.username()) {
            Some(password) if password == self.credentials.password() => Ok(()),
            _ => Err(BackupError::Authentication { status: 401 }),
        }
    }

    fn read<T>(
        &self,
        f: impl FnOnce(&ClusterState) -> BackupResult<T>,
    ) -> BackupResult<T> {
        let state = self.cluster.state.read();
        self.authenticate(&state)?;
        f(&state)
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut ClusterState) -> BackupResult<T>,
    ) -> BackupResult<T> {
        let mut state = self.cluster.state.write();
        self.authenticate(&state)?;
        f(&mut state)
    }

    /// The cluster this session belongs to
    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }
}

fn bucket<'a>(state: &'a ClusterState, name: &str) -> BackupResult<&'a BucketState> {
    state
        .buckets
        .get(name)
        .ok_or_else(|| BackupError::BucketNotFound(name.to_string()))
}

fn bucket_mut<'a>(state: &'a mut ClusterState, name: &str) -> BackupResult<&'a mut BucketState> {
    state
        .buckets
        .get_mut(name)
        .ok_or_else(|| BackupError::BucketNotFound(name.to_string()))
}

fn persistent_bucket<'a>(state: &'a ClusterState, name: &str) -> BackupResult<&'a BucketState> {
    let bucket_state = bucket(state, name)?;
    if bucket_state.settings.kind != BucketKind::Couchbase {
        return Err(BackupError::Http {
            status: 400,
            message: format!("bucket '{}' does not support document streams", name),
        });
    }
    if bucket_state.unavailable {
        return Err(BackupError::Http {
            status: 503,
            message: format!("bucket '{}' is temporarily unavailable", name),
        });
    }
    Ok(bucket_state)
}

impl DataClient for MemorySession {
    fn vbucket_states(&self, bucket: &str) -> BackupResult<Vec<VBucketState>> {
        self.read(|state| {
            let bucket_state = persistent_bucket(state, bucket)?;
            Ok(bucket_state
                .vbuckets
                .iter()
                .enumerate()
                .map(|(id, vb)| VBucketState {
                    id: id as u16,
                    uuid: vb.uuid,
                    high_seqno: vb.high_seqno,
                    purge_seqno: vb.purge_seqno,
                })
                .collect())
        })
    }

    fn stream_vbucket(
        &self,
        bucket: &str,
        vbucket: u16,
        request: StreamRequest,
        sink: &mut dyn FnMut(Document) -> BackupResult<()>,
    ) -> BackupResult<StreamEnd> {
        // Snapshot under the lock, deliver without it
        let (uuid, snapshot_end, mut items) = self.read(|state| {
            let bucket_state = persistent_bucket(state, bucket)?;
            let vb = bucket_state
                .vbuckets
                .get(usize::from(vbucket))
                .ok_or_else(|| BackupError::Http {
                    status: 400,
                    message: format!("vbucket {} out of range", vbucket),
                })?;

            let start = request.start_seqno;
            if start > 0
                && (request.vb_uuid != vb.uuid
                    || start > vb.high_seqno
                    || start < vb.purge_seqno)
            {
                return Ok((vb.uuid, 0, None));
            }

            let items: Vec<Document> = vb
                .docs
                .iter()
                .filter(|(_, doc)| doc.seqno > start)
                .map(|(key, doc)| Document {
                    key: key.clone(),
                    vbucket,
                    seqno: doc.seqno,
                    deleted: doc.deleted,
                    flags: doc.flags,
                    expiry: doc.expiry,
                    value: doc.value.clone(),
                })
                .collect();
            Ok((vb.uuid, vb.high_seqno, Some(items)))
        })?;

        let Some(items) = items.as_mut() else {
            return Ok(StreamEnd::Rollback { to_seqno: 0 });
        };

        items.sort_by_key(|doc| doc.seqno);
        for doc in items.drain(..) {
            sink(doc)?;
        }

        Ok(StreamEnd::Completed { uuid, snapshot_end })
    }

    fn upsert_batch(&self, bucket: &str, docs: &[Document]) -> BackupResult<Vec<ItemResult>> {
        self.write(|state| {
            let bucket_state = persistent_bucket_mut(state, bucket)?;

            let results = docs
                .iter()
                .map(|doc| {
                    let vbucket = bucket_state.vbucket_mut(&doc.key);
                    let seqno = vbucket.next_seqno();
                    vbucket.docs.insert(
                        doc.key.clone(),
                        StoredDoc {
                            seqno,
                            rev: doc.seqno,
                            deleted: doc.deleted,
                            flags: doc.flags,
                            expiry: doc.expiry,
                            value: if doc.deleted { None } else { doc.value.clone() },
                        },
                    );
                    Ok(())
                })
                .collect();

            Ok(results)
        })
    }

    fn document_revs(
        &self,
        bucket: &str,
        keys: &[&str],
    ) -> BackupResult<HashMap<String, DocumentRev>> {
        self.read(|state| {
            let bucket_state = persistent_bucket(state, bucket)?;
            let num_vbuckets = bucket_state.num_vbuckets();
            Ok(keys
                .iter()
                .filter_map(|key| {
                    let vb = vbucket_for_key(key, num_vbuckets);
                    bucket_state.vbuckets[usize::from(vb)]
                        .docs
                        .get(*key)
                        .map(|doc| {
                            (
                                key.to_string(),
                                DocumentRev {
                                    rev: doc.rev,
                                    deleted: doc.deleted,
                                },
                            )
                        })
                })
                .collect())
        })
    }

    fn purge_tombstones(&self, bucket: &str, vbucket: u16, up_to_seqno: u64) -> BackupResult<u64> {
        self.write(|state| {
            let bucket_state = persistent_bucket_mut(state, bucket)?;
            let vb = bucket_state
                .vbuckets
                .get_mut(usize::from(vbucket))
                .ok_or_else(|| BackupError::Http {
                    status: 400,
                    message: format!("vbucket {} out of range", vbucket),
                })?;
            Ok(vb.purge(up_to_seqno))
        })
    }
}

fn upsert_by_name<T: Clone>(existing: &mut Vec<T>, incoming: &[T], name: impl Fn(&T) -> &str) {
    for item in incoming {
        match existing.iter_mut().find(|e| name(e) == name(item)) {
            Some(slot) => *slot = item.clone(),
            None => existing.push(item.clone()),
        }
    }
}

impl MetadataClient for MemorySession {
    fn get_views(&self, bucket_name: &str) -> BackupResult<Vec<DesignDocument>> {
        self.read(|state| Ok(bucket(state, bucket_name)?.views.clone()))
    }

    fn put_views(&self, bucket_name: &str, ddocs: &[DesignDocument]) -> BackupResult<()> {
        self.write(|state| {
            let bucket_state = bucket_mut(state, bucket_name)?;
            upsert_by_name(&mut bucket_state.views, ddocs, |d| &d.name);
            Ok(())
        })
    }

    fn get_gsi_indexes(&self, bucket_name: &str) -> BackupResult<Vec<GsiIndex>> {
        self.read(|state| Ok(bucket(state, bucket_name)?.gsi.clone()))
    }

    fn put_gsi_indexes(&self, bucket_name: &str, indexes: &[GsiIndex]) -> BackupResult<()> {
        self.write(|state| {
            let bucket_state = bucket_mut(state, bucket_name)?;
            let rebound: Vec<GsiIndex> = indexes
                .iter()
                .map(|index| GsiIndex {
                    bucket: bucket_name.to_string(),
                    ..index.clone()
                })
                .collect();
            upsert_by_name(&mut bucket_state.gsi, &rebound, |i| &i.name);
            Ok(())
        })
    }

    fn get_fts_indexes(&self, bucket_name: &str) -> BackupResult<Vec<FtsIndex>> {
        self.read(|state| Ok(bucket(state, bucket_name)?.fts.clone()))
    }

    fn put_fts_indexes(&self, bucket_name: &str, indexes: &[FtsIndex]) -> BackupResult<()> {
        self.write(|state| {
            let bucket_state = bucket_mut(state, bucket_name)?;
            let rebound: Vec<FtsIndex> = indexes
                .iter()
                .map(|index| FtsIndex {
                    source_bucket: bucket_name.to_string(),
                    ..index.clone()
                })
                .collect();
            upsert_by_name(&mut bucket_state.fts, &rebound, |i| &i.name);
            Ok(())
        })
    }
}

impl BucketManager for MemorySession {
    fn list_buckets(&self) -> BackupResult<Vec<BucketSettings>> {
        self.read(|state| {
            Ok(state
                .buckets
                .values()
                .map(|b| b.settings.clone())
                .collect())
        })
    }

    fn bucket_settings(&self, bucket_name: &str) -> BackupResult<Option<BucketSettings>> {
        self.read(|state| Ok(state.buckets.get(bucket_name).map(|b| b.settings.clone())))
    }

    fn create_bucket(&self, settings: &BucketSettings) -> BackupResult<()> {
        self.read(|_| Ok(()))?;
        self.cluster.create_bucket(settings.clone())
    }

    fn delete_bucket(&self, bucket_name: &str) -> BackupResult<()> {
        self.read(|_| Ok(()))?;
        self.cluster.delete_bucket(bucket_name)
    }

    fn is_bucket_ready(&self, bucket_name: &str) -> BackupResult<bool> {
        self.write(|state| match state.buckets.get_mut(bucket_name) {
            None => Ok(false),
            Some(bucket_state) if bucket_state.warmup_polls > 0 => {
                bucket_state.warmup_polls -= 1;
                Ok(false)
            }
            Some(_) => Ok(true),
        })
    }
}
