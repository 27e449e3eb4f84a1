//! Shard files
//!
//! A shard holds the documents captured from a contiguous range of vbuckets
//! of one bucket. Data goes to `shard-AAAA-BBBB.jsonl.zst` (one JSON document
//! per line, zstd-compressed); a `shard-AAAA-BBBB.meta.json` sidecar is
//! written atomically once the data file is synced. A shard without its
//! sidecar is incomplete and is discarded.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::file_io::{io_error, read_json_required, write_json_atomic};
use crate::cluster::Document;
use crate::error::{BackupError, BackupResult};

const DATA_SUFFIX: &str = ".jsonl.zst";
const META_SUFFIX: &str = ".meta.json";

/// Capture outcome of one vbucket
///
/// `mutations` and `deletions` count what the shard holds. The deltas count
/// how the archived key set changed: a key rewritten while live adds
/// nothing, a live key deleted moves one from live to deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VBucketCapture {
    pub uuid: u64,
    /// High-water sequence mark reached by the capture
    pub high_seqno: u64,
    /// Live mutations written
    pub mutations: u64,
    /// Tombstones written
    pub deletions: u64,
    /// Streamed from sequence zero
    pub rebaselined: bool,
    /// Net change in live keys
    #[serde(default)]
    pub live_delta: i64,
    /// Net change in deleted keys
    #[serde(default)]
    pub deleted_delta: i64,
}

impl VBucketCapture {
    /// A capture streamed from sequence zero; every key it holds is new
    pub fn baseline(uuid: u64, high_seqno: u64, mutations: u64, deletions: u64) -> Self {
        Self {
            uuid,
            high_seqno,
            mutations,
            deletions,
            rebaselined: true,
            live_delta: mutations as i64,
            deleted_delta: deletions as i64,
        }
    }

    /// A capture continuing from the previous high-water mark
    ///
    /// The deltas start at zero and are filled in by [`count_change`].
    ///
    /// [`count_change`]: VBucketCapture::count_change
    pub fn incremental(uuid: u64, high_seqno: u64, mutations: u64, deletions: u64) -> Self {
        Self {
            rebaselined: false,
            live_delta: 0,
            deleted_delta: 0,
            ..Self::baseline(uuid, high_seqno, mutations, deletions)
        }
    }

    /// Count one key moving to `deleted`
    ///
    /// `archived` is whether the archive holds the key as deleted, or
    /// `None` when it does not hold the key.
    pub fn count_change(&mut self, archived: Option<bool>, deleted: bool) {
        let was_live = archived == Some(false);
        let was_deleted = archived == Some(true);
        self.live_delta += i64::from(!deleted) - i64::from(was_live);
        self.deleted_delta += i64::from(deleted) - i64::from(was_deleted);
    }

    /// Fold a later capture of the same vbucket into this one
    ///
    /// A re-baselined capture replaces the state outright. Otherwise the
    /// sequence state moves forward and the deltas add up.
    pub fn absorb(&mut self, later: &VBucketCapture) {
        if later.rebaselined {
            *self = *later;
            return;
        }
        self.uuid = later.uuid;
        self.high_seqno = later.high_seqno;
        self.mutations += later.mutations;
        self.deletions += later.deletions;
        self.live_delta += later.live_delta;
        self.deleted_delta += later.deleted_delta;
    }

    /// Live keys after this capture, for a state folded from a baseline
    pub fn live_keys(&self) -> u64 {
        self.live_delta.max(0) as u64
    }

    /// Deleted keys after this capture, for a state folded from a baseline
    pub fn deleted_keys(&self) -> u64 {
        self.deleted_delta.max(0) as u64
    }
}

/// Sidecar describing a complete shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMeta {
    pub first_vbucket: u16,
    pub last_vbucket: u16,
    pub items: u64,
    /// CRC32 of the uncompressed lines
    pub checksum: u32,
    pub vbuckets: BTreeMap<u16, VBucketCapture>,
}

/// Base name of the shard covering `first..=last`
pub fn shard_name(first: u16, last: u16) -> String {
    format!("shard-{:04}-{:04}", first, last)
}

fn data_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}{}", name, DATA_SUFFIX))
}

fn meta_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}{}", name, META_SUFFIX))
}

/// A complete shard found on disk
#[derive(Debug, Clone)]
pub struct ShardFile {
    pub data: PathBuf,
    pub meta: ShardMeta,
}

impl ShardFile {
    /// Stream the shard's documents, verifying the checksum at the end
    pub fn reader(&self) -> BackupResult<ShardReader> {
        ShardReader::open(&self.data, self.meta.clone())
    }
}

/// List the complete shards of a data directory, ordered by first vbucket
///
/// Data files without a sidecar are left out.
pub fn list_shards(data_dir: &Path) -> BackupResult<Vec<ShardFile>> {
    if !data_dir.exists() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(data_dir).map_err(|e| io_error(data_dir, "read directory", e))?;

    let mut shards = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| io_error(data_dir, "read directory entry", e))?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(name) = file_name.strip_suffix(META_SUFFIX) else {
            continue;
        };

        let data = data_path(data_dir, name);
        if !data.exists() {
            return Err(BackupError::Corrupt(format!(
                "Shard metadata without data file: {}",
                entry.path().display()
            )));
        }

        let meta: ShardMeta = read_json_required(entry.path())?;
        shards.push(ShardFile { data, meta });
    }

    shards.sort_by_key(|shard| shard.meta.first_vbucket);
    Ok(shards)
}

/// Remove data files left behind by an interrupted capture
pub fn remove_incomplete(data_dir: &Path) -> BackupResult<usize> {
    if !data_dir.exists() {
        return Ok(0);
    }

    let entries = fs::read_dir(data_dir).map_err(|e| io_error(data_dir, "read directory", e))?;

    let mut removed = 0;
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(name) = file_name.strip_suffix(DATA_SUFFIX) else {
            continue;
        };
        if !meta_path(data_dir, name).exists() {
            fs::remove_file(entry.path()).map_err(|e| io_error(&entry.path(), "remove", e))?;
            removed += 1;
        }
    }

    Ok(removed)
}

/// Writes one shard
pub struct ShardWriter {
    dir: PathBuf,
    name: String,
    first_vbucket: u16,
    last_vbucket: u16,
    encoder: zstd::Encoder<'static, BufWriter<File>>,
    hasher: crc32fast::Hasher,
    items: u64,
    vbuckets: BTreeMap<u16, VBucketCapture>,
}

impl ShardWriter {
    /// Start a shard for vbuckets `first..=last` in `dir`
    pub fn create(dir: &Path, first: u16, last: u16, level: i32) -> BackupResult<Self> {
        fs::create_dir_all(dir).map_err(|e| io_error(dir, "create directory", e))?;

        let name = shard_name(first, last);
        let path = data_path(dir, &name);
        let file = File::create(&path).map_err(|e| io_error(&path, "create", e))?;
        let encoder = zstd::Encoder::new(BufWriter::new(file), level)
            .map_err(|e| io_error(&path, "start compressor for", e))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            name,
            first_vbucket: first,
            last_vbucket: last,
            encoder,
            hasher: crc32fast::Hasher::new(),
            items: 0,
            vbuckets: BTreeMap::new(),
        })
    }

    /// Append one document
    pub fn write(&mut self, doc: &Document) -> BackupResult<()> {
        let mut line = serde_json::to_vec(doc)?;
        line.push(b'\n');
        self.hasher.update(&line);
        self.encoder
            .write_all(&line)
            .map_err(|e| io_error(&data_path(&self.dir, &self.name), "write", e))?;
        self.items += 1;
        Ok(())
    }

    /// Record how a vbucket's capture ended
    pub fn record_vbucket(&mut self, vbucket: u16, capture: VBucketCapture) {
        self.vbuckets.insert(vbucket, capture);
    }

    /// Sync the data file, then publish the sidecar
    pub fn finish(self) -> BackupResult<ShardMeta> {
        let path = data_path(&self.dir, &self.name);
        let mut writer = self
            .encoder
            .finish()
            .map_err(|e| io_error(&path, "finish compressing", e))?;
        writer.flush().map_err(|e| io_error(&path, "flush", e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| io_error(&path, "sync", e))?;

        let meta = ShardMeta {
            first_vbucket: self.first_vbucket,
            last_vbucket: self.last_vbucket,
            items: self.items,
            checksum: self.hasher.finalize(),
            vbuckets: self.vbuckets,
        };
        write_json_atomic(meta_path(&self.dir, &self.name), &meta)?;
        Ok(meta)
    }
}

/// Iterates the documents of a shard
pub struct ShardReader {
    path: PathBuf,
    lines: Lines<BufReader<zstd::Decoder<'static, BufReader<File>>>>,
    hasher: crc32fast::Hasher,
    items: u64,
    meta: ShardMeta,
    done: bool,
}

impl ShardReader {
    fn open(path: &Path, meta: ShardMeta) -> BackupResult<Self> {
        let file = File::open(path).map_err(|e| io_error(path, "open", e))?;
        let decoder = zstd::Decoder::new(file).map_err(|e| io_error(path, "decompress", e))?;

        Ok(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(decoder).lines(),
            hasher: crc32fast::Hasher::new(),
            items: 0,
            meta,
            done: false,
        })
    }

    fn verify(&mut self) -> BackupResult<()> {
        let checksum = std::mem::take(&mut self.hasher).finalize();
        if self.items != self.meta.items || checksum != self.meta.checksum {
            return Err(BackupError::Corrupt(format!(
                "Shard {} does not match its metadata ({} of {} items, checksum {:08x} != {:08x})",
                self.path.display(),
                self.items,
                self.meta.items,
                checksum,
                self.meta.checksum
            )));
        }
        Ok(())
    }
}

impl Iterator for ShardReader {
    type Item = BackupResult<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.lines.next() {
            None => {
                self.done = true;
                self.verify().err().map(Err)
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(BackupError::Corrupt(format!(
                    "Failed to read shard {}: {}",
                    self.path.display(),
                    e
                ))))
            }
            Some(Ok(line)) => {
                self.hasher.update(line.as_bytes());
                self.hasher.update(b"\n");
                self.items += 1;
                Some(serde_json::from_str(&line).map_err(|e| {
                    BackupError::Corrupt(format!(
                        "Bad document in shard {}: {}",
                        self.path.display(),
                        e
                    ))
                }))
            }
        }
    }
}

/// Split vbuckets into at most `shards` contiguous runs
pub fn partition(vbuckets: &[u16], shards: usize) -> Vec<Vec<u16>> {
    if vbuckets.is_empty() {
        return Vec::new();
    }

    let shards = shards.clamp(1, vbuckets.len());
    let base = vbuckets.len() / shards;
    let extra = vbuckets.len() % shards;

    let mut result = Vec::with_capacity(shards);
    let mut start = 0;
    for i in 0..shards {
        let len = base + usize::from(i < extra);
        result.push(vbuckets[start..start + len].to_vec());
        start += len;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn capture(high: u64, mutations: u64) -> VBucketCapture {
        VBucketCapture::baseline(7, high, mutations, 0)
    }

    #[test]
    fn test_write_and_read_shard() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = ShardWriter::create(temp_dir.path(), 0, 3, 3).unwrap();
        for i in 0..10u64 {
            writer
                .write(&Document::mutation(format!("k{}", i), 1, i + 1, serde_json::json!({"x": i})))
                .unwrap();
        }
        writer.write(&Document::tombstone("gone", 2, 11)).unwrap();
        writer.record_vbucket(1, capture(10, 10));
        let meta = writer.finish().unwrap();
        assert_eq!(meta.items, 11);

        let shards = list_shards(temp_dir.path()).unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].meta, meta);

        let docs: Vec<Document> = shards[0].reader().unwrap().collect::<BackupResult<_>>().unwrap();
        assert_eq!(docs.len(), 11);
        assert_eq!(docs[0].key, "k0");
        assert!(docs[10].deleted);
    }

    #[test]
    fn test_incomplete_shard_ignored_and_removed() {
        let temp_dir = TempDir::new().unwrap();
        let writer = ShardWriter::create(temp_dir.path(), 0, 1, 3).unwrap();
        drop(writer);

        assert!(list_shards(temp_dir.path()).unwrap().is_empty());
        assert_eq!(remove_incomplete(temp_dir.path()).unwrap(), 1);
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = ShardWriter::create(temp_dir.path(), 0, 0, 3).unwrap();
        writer.write(&Document::tombstone("a", 0, 1)).unwrap();
        writer.finish().unwrap();

        let mut shard = list_shards(temp_dir.path()).unwrap().remove(0);
        shard.meta.checksum ^= 1;
        let result: BackupResult<Vec<Document>> = shard.reader().unwrap().collect();
        assert!(matches!(result, Err(BackupError::Corrupt(_))));
    }

    #[test]
    fn test_partition_contiguous() {
        let vbuckets: Vec<u16> = (0..10).collect();
        let parts = partition(&vbuckets, 4);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], vec![0, 1, 2]);
        assert_eq!(parts[1], vec![3, 4, 5]);
        assert_eq!(parts[2], vec![6, 7]);
        assert_eq!(parts[3], vec![8, 9]);

        assert_eq!(partition(&vbuckets[..2], 8).len(), 2);
        assert!(partition(&[], 4).is_empty());
    }

    #[test]
    fn test_count_change() {
        let mut capture = VBucketCapture::incremental(1, 10, 3, 2);
        capture.count_change(None, false); // new key
        capture.count_change(Some(false), false); // rewritten
        capture.count_change(Some(false), true); // deleted
        capture.count_change(Some(true), false); // recreated
        capture.count_change(None, true); // created and deleted in between
        assert_eq!(capture.live_delta, 1);
        assert_eq!(capture.deleted_delta, 1);
    }

    #[test]
    fn test_absorb() {
        let mut state = VBucketCapture::baseline(1, 10, 10, 0);
        let mut later = VBucketCapture::incremental(1, 14, 2, 2);
        later.live_delta = -2;
        later.deleted_delta = 2;
        state.absorb(&later);
        assert_eq!(state.high_seqno, 14);
        assert_eq!(state.live_keys(), 8);
        assert_eq!(state.deleted_keys(), 2);
        assert!(state.rebaselined);

        state.absorb(&VBucketCapture::baseline(2, 5, 5, 0));
        assert_eq!(state.uuid, 2);
        assert_eq!(state.live_keys(), 5);
        assert_eq!(state.deleted_keys(), 0);
    }

    #[test]
    fn test_shard_name() {
        assert_eq!(shard_name(0, 15), "shard-0000-0015");
    }
}
