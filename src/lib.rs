//! docvault - incremental backup and restore for clustered document databases
//!
//! Backups are written into an *archive*: a directory holding named
//! *repositories*, each an ordered history of backup *instances*. The first
//! instance of a repository is a full capture; later ones only hold what
//! changed since their predecessor. Restores replay any contiguous range of
//! that history, and merges fold a range into a single instance.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - `config`: Archive paths, settings and per-repository backup configuration
//! - `error`: The shared error type
//! - `cluster`: Collaborator traits plus the in-process `MemoryCluster`
//! - `archive`: On-disk layout, staging, shards, locking and merge
//! - `transfer`: Per-bucket capture and replay units and the worker pools
//! - `backup`: Backup, restore and merge entry points
//! - `cli`: Command handlers for the `docvault` binary
//! - `logging`: `tracing` subscriber setup
//!
//! # Example
//!
//! ```rust,ignore
//! use docvault::archive::Archive;
//! use docvault::cluster::{Credentials, MemoryCluster};
//! use docvault::config::BackupConfig;
//! use docvault::transfer::TransferOptions;
//!
//! let archive = Archive::mount("/backups", true)?;
//! archive.create_repository("nightly", &BackupConfig::default())?;
//!
//! let cluster = MemoryCluster::new();
//! let session = cluster.connect(Credentials::new("Administrator", "password"));
//! let options = TransferOptions::from_settings(archive.settings());
//! docvault::backup::backup(&archive, &session, "nightly", &options)?;
//! ```

pub mod archive;
pub mod backup;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod logging;
pub mod transfer;

pub use error::{BackupError, BackupResult};
