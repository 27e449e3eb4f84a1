//! Transfer engine
//!
//! A transfer is described by a [`TransferRequest`] and turned into
//! [`Transferables`] by [`build_transferable`]: one [`TransferUnit`] per
//! eligible bucket. Building only resolves what to move; nothing is read
//! from or written to the cluster's data until a unit is executed.
//!
//! Units move through `Pending → Running → Completed | Failed` and are
//! normally executed on a [`TransferPool`].

pub mod capture;
pub mod pool;
pub mod replay;

pub use capture::CaptureTask;
pub use pool::TransferPool;
pub use replay::{ReplayStats, ReplayTask};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::archive::{cumulative, Archive, ArchivedInstance, BucketRecord, StagedInstance};
use crate::backup::resolve_range;
use crate::cluster::{BucketKind, Cluster};
use crate::config::{BackupConfig, BucketSelection, Settings};
use crate::error::{BackupError, BackupResult, TransferFailure};

/// Which way data moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Cluster to archive
    Capture,
    /// Archive to cluster
    Replay,
}

/// Tunables for one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// Shard workers per bucket
    pub threads: usize,
    /// Continue an interrupted transfer instead of starting over
    pub resume: bool,
    /// Purge captured tombstones from the source (capture only)
    pub purge: bool,
    /// Documents per upsert batch (replay only)
    pub batch_size: usize,
}

impl TransferOptions {
    /// Options taken from the archive settings
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            threads: settings.threads,
            resume: false,
            purge: false,
            batch_size: settings.batch_size,
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_purge(mut self, purge: bool) -> Self {
        self.purge = purge;
        self
    }

    fn validate(&self) -> BackupResult<()> {
        if self.threads == 0 {
            return Err(BackupError::Config("threads must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(BackupError::Config("batch size must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// What to transfer
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub repository: String,
    pub direction: Direction,
    /// First instance to replay; empty or `None` means the oldest
    pub range_start: Option<String>,
    /// Last instance to replay; empty or `None` means the newest
    pub range_end: Option<String>,
    pub options: TransferOptions,
    /// Replaces the repository config for a replay
    pub config: Option<BackupConfig>,
}

impl TransferRequest {
    /// Capture every eligible bucket into a new instance
    pub fn capture(repository: impl Into<String>, options: TransferOptions) -> Self {
        Self {
            repository: repository.into(),
            direction: Direction::Capture,
            range_start: None,
            range_end: None,
            options,
            config: None,
        }
    }

    /// Replay the instances between `start` and `end`
    pub fn replay(
        repository: impl Into<String>,
        start: Option<&str>,
        end: Option<&str>,
        options: TransferOptions,
    ) -> Self {
        Self {
            repository: repository.into(),
            direction: Direction::Replay,
            range_start: start.map(str::to_string),
            range_end: end.map(str::to_string),
            options,
            config: None,
        }
    }

    pub fn with_config(mut self, config: Option<BackupConfig>) -> Self {
        self.config = config;
        self
    }
}

/// Lifecycle of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitState::Pending => "pending",
            UnitState::Running => "running",
            UnitState::Completed => "completed",
            UnitState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of a completed unit
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Captured(BucketRecord),
    Replayed(ReplayStats),
}

enum UnitTask<'a> {
    Capture(CaptureTask<'a>),
    Replay(ReplayTask<'a>),
}

/// One bucket's worth of work
pub struct TransferUnit<'a> {
    name: String,
    state: Mutex<UnitState>,
    task: UnitTask<'a>,
}

impl<'a> TransferUnit<'a> {
    fn new(name: String, task: UnitTask<'a>) -> Self {
        Self {
            name,
            state: Mutex::new(UnitState::Pending),
            task,
        }
    }

    /// The bucket this unit transfers
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> UnitState {
        *self.state.lock()
    }

    /// Run the unit; a unit runs at most once
    pub fn execute(&self) -> BackupResult<UnitOutcome> {
        {
            let mut state = self.state.lock();
            if *state != UnitState::Pending {
                return Err(BackupError::Config(format!(
                    "transfer unit '{}' is already {}",
                    self.name, *state
                )));
            }
            *state = UnitState::Running;
        }

        let started = Instant::now();
        let result = match &self.task {
            UnitTask::Capture(task) => task.run().map(UnitOutcome::Captured),
            UnitTask::Replay(task) => task.run().map(UnitOutcome::Replayed),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                *self.state.lock() = UnitState::Completed;
                debug!(bucket = %self.name, elapsed_ms, "transfer unit completed");
            }
            Err(e) => {
                *self.state.lock() = UnitState::Failed;
                warn!(bucket = %self.name, elapsed_ms, error = %e, "transfer unit failed");
            }
        }
        result
    }
}

/// Everything a transfer will do
pub struct Transferables<'a> {
    pub direction: Direction,
    pub units: Vec<TransferUnit<'a>>,
    /// Instance being captured (capture only)
    pub staged: Option<Arc<StagedInstance>>,
    /// Buckets left out, with the reason
    pub excluded: BTreeMap<String, BucketSelection>,
    /// Instances being replayed, oldest first (replay only)
    pub instances: Vec<String>,
}

impl<'a> Transferables<'a> {
    /// Execute every unit on `pool`; returns successes and typed failures
    pub fn run(
        &self,
        pool: &TransferPool,
    ) -> (BTreeMap<String, UnitOutcome>, Vec<TransferFailure>) {
        let results = pool.run(&self.units, |unit| unit.execute());

        let mut outcomes = BTreeMap::new();
        let mut failures = Vec::new();
        for (unit, result) in self.units.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    outcomes.insert(unit.name().to_string(), outcome);
                }
                Err(error) => failures.push(TransferFailure {
                    unit: unit.name().to_string(),
                    error: Box::new(error),
                }),
            }
        }
        (outcomes, failures)
    }
}

/// Resolve a request into transfer units
pub fn build_transferable<'a>(
    archive: &'a Archive,
    cluster: &'a dyn Cluster,
    request: &TransferRequest,
) -> BackupResult<Transferables<'a>> {
    request.options.validate()?;
    match request.direction {
        Direction::Capture => build_capture(archive, cluster, request),
        Direction::Replay => build_replay(archive, cluster, request),
    }
}

fn build_capture<'a>(
    archive: &'a Archive,
    cluster: &'a dyn Cluster,
    request: &TransferRequest,
) -> BackupResult<Transferables<'a>> {
    let repository = &request.repository;
    let config = archive.repository_config(repository)?;

    // Authenticates before anything is staged
    let cluster_buckets = cluster.list_buckets()?;

    let staged = Arc::new(archive.begin_instance(repository, request.options.resume)?);
    let history: Arc<[ArchivedInstance]> = archive.open_history(repository)?.into();
    let previous = cumulative(history.iter().map(|i| &i.meta));

    let mut units = Vec::new();
    let mut excluded = BTreeMap::new();
    for settings in cluster_buckets {
        let selection = config.select_bucket(&settings.name, settings.kind);
        if !selection.is_included() {
            debug!(bucket = %settings.name, reason = %selection, "bucket excluded from backup");
            excluded.insert(settings.name.clone(), selection);
            continue;
        }

        let name = settings.name.clone();
        let task = CaptureTask {
            cluster,
            staged: Arc::clone(&staged),
            previous: previous.get(&name).cloned(),
            history: Arc::clone(&history),
            bucket: settings,
            reason: selection,
            config: config.clone(),
            options: request.options.clone(),
            compression_level: archive.settings().compression_level,
        };
        units.push(TransferUnit::new(name, UnitTask::Capture(task)));
    }

    info!(
        repository = %repository,
        instance = %staged.name(),
        buckets = units.len(),
        excluded = excluded.len(),
        "capture planned"
    );

    Ok(Transferables {
        direction: Direction::Capture,
        units,
        staged: Some(staged),
        excluded,
        instances: Vec::new(),
    })
}

fn build_replay<'a>(
    archive: &'a Archive,
    cluster: &'a dyn Cluster,
    request: &TransferRequest,
) -> BackupResult<Transferables<'a>> {
    let repository = &request.repository;
    let config = match &request.config {
        Some(config) => {
            config.validate()?;
            config.clone()
        }
        None => archive.repository_config(repository)?,
    };

    let names = archive.list_instances(repository)?;
    let range = resolve_range(
        repository,
        &names,
        request.range_start.as_deref(),
        request.range_end.as_deref(),
    )?;

    // Authenticates before any unit runs
    cluster.list_buckets()?;

    let instances = range
        .iter()
        .map(|name| archive.open_instance(repository, name))
        .collect::<BackupResult<Vec<_>>>()?;
    let instances: Arc<[_]> = instances.into();

    let mut buckets: BTreeMap<String, BucketKind> = BTreeMap::new();
    for instance in instances.iter() {
        for bucket in instance.meta.buckets.keys() {
            let kind = instance
                .bucket_settings(bucket)?
                .map(|s| s.kind)
                .unwrap_or_default();
            buckets.insert(bucket.clone(), kind);
        }
    }

    let mut units = Vec::new();
    let mut excluded = BTreeMap::new();
    for (bucket, kind) in buckets {
        let selection = config.select_bucket(&bucket, kind);
        if !selection.is_included() {
            debug!(bucket = %bucket, reason = %selection, "bucket excluded from restore");
            excluded.insert(bucket, selection);
            continue;
        }

        let task = ReplayTask {
            cluster,
            bucket: bucket.clone(),
            instances: Arc::clone(&instances),
            config: config.clone(),
            options: request.options.clone(),
            ready_timeout: archive.settings().bucket_ready_timeout(),
            ready_poll: archive.settings().bucket_ready_poll(),
        };
        units.push(TransferUnit::new(bucket, UnitTask::Replay(task)));
    }

    info!(
        repository = %repository,
        instances = range.len(),
        buckets = units.len(),
        "restore planned"
    );

    Ok(Transferables {
        direction: Direction::Replay,
        units,
        staged: None,
        excluded,
        instances: range,
    })
}
