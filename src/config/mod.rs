//! Configuration module for docvault
//!
//! This module provides configuration management including:
//! - Archive root resolution and on-disk layout
//! - Per-repository backup configuration (bucket selection, stage skips)
//! - Engine settings persisted in the archive

pub mod backup_config;
pub mod paths;
pub mod settings;

pub use backup_config::{BackupConfig, BackupConfigBuilder, BucketSelection, Stage};
pub use paths::ArchivePaths;
pub use settings::Settings;
