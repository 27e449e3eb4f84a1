//! Engine settings for docvault
//!
//! Tunables that apply to every repository of an archive: worker counts,
//! batch sizes, compression and bucket readiness polling. Stored as
//! `settings.json` in the archive root; every field has a serde default so
//! older or partial files keep loading.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::paths::ArchivePaths;
use crate::error::BackupError;

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Schema version for migration support
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// Shard workers per bucket when the caller does not pass a count
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Buckets transferred at the same time
    #[serde(default = "default_bucket_concurrency")]
    pub bucket_concurrency: usize,

    /// Documents per upsert batch during restore
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// zstd level used for document shards
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// How long to wait for a recreated bucket to become ready
    #[serde(default = "default_bucket_ready_timeout_secs")]
    pub bucket_ready_timeout_secs: u64,

    /// Interval between bucket readiness polls
    #[serde(default = "default_bucket_ready_poll_ms")]
    pub bucket_ready_poll_ms: u64,
}

fn default_schema_version() -> u32 {
    1
}

fn default_threads() -> usize {
    4
}

fn default_bucket_concurrency() -> usize {
    2
}

fn default_batch_size() -> usize {
    500
}

fn default_compression_level() -> i32 {
    3
}

fn default_bucket_ready_timeout_secs() -> u64 {
    30
}

fn default_bucket_ready_poll_ms() -> u64 {
    1000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            threads: default_threads(),
            bucket_concurrency: default_bucket_concurrency(),
            batch_size: default_batch_size(),
            compression_level: default_compression_level(),
            bucket_ready_timeout_secs: default_bucket_ready_timeout_secs(),
            bucket_ready_poll_ms: default_bucket_ready_poll_ms(),
        }
    }
}

impl Settings {
    /// Load settings from the archive, or use defaults if the file doesn't exist
    pub fn load_or_create(paths: &ArchivePaths) -> Result<Self, BackupError> {
        let settings_path = paths.settings_file();

        if settings_path.exists() {
            let contents = std::fs::read_to_string(&settings_path).map_err(|e| {
                BackupError::Io(format!("Failed to read settings file: {}", e))
            })?;

            let settings: Settings = serde_json::from_str(&contents).map_err(|e| {
                BackupError::Config(format!("Failed to parse settings file: {}", e))
            })?;

            settings.validate()?;
            Ok(settings)
        } else {
            // Don't save yet - let caller decide when to persist
            Ok(Settings::default())
        }
    }

    /// Save settings to the archive root
    pub fn save(&self, paths: &ArchivePaths) -> Result<(), BackupError> {
        self.validate()?;
        paths.ensure_root()?;

        let contents = serde_json::to_string_pretty(self).map_err(|e| {
            BackupError::Config(format!("Failed to serialize settings: {}", e))
        })?;

        std::fs::write(paths.settings_file(), contents).map_err(|e| {
            BackupError::Io(format!("Failed to write settings file: {}", e))
        })?;

        Ok(())
    }

    /// Reject values that would stall the engine
    pub fn validate(&self) -> Result<(), BackupError> {
        if self.threads == 0 {
            return Err(BackupError::Config("threads must be at least 1".into()));
        }
        if self.bucket_concurrency == 0 {
            return Err(BackupError::Config(
                "bucket_concurrency must be at least 1".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(BackupError::Config("batch_size must be at least 1".into()));
        }
        Ok(())
    }

    /// Timeout for bucket readiness as a Duration
    pub fn bucket_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.bucket_ready_timeout_secs)
    }

    /// Readiness poll interval as a Duration
    pub fn bucket_ready_poll(&self) -> Duration {
        Duration::from_millis(self.bucket_ready_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.threads, 4);
        assert_eq!(settings.bucket_concurrency, 2);
        assert_eq!(settings.batch_size, 500);
        assert_eq!(settings.bucket_ready_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let paths = ArchivePaths::with_root(temp_dir.path());

        let settings = Settings {
            threads: 8,
            compression_level: 9,
            ..Settings::default()
        };
        settings.save(&paths).unwrap();

        let loaded = Settings::load_or_create(&paths).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let paths = ArchivePaths::with_root(temp_dir.path());
        std::fs::write(paths.settings_file(), r#"{"threads": 2}"#).unwrap();

        let loaded = Settings::load_or_create(&paths).unwrap();
        assert_eq!(loaded.threads, 2);
        assert_eq!(loaded.batch_size, 500);
    }

    #[test]
    fn test_zero_threads_rejected() {
        let settings = Settings {
            threads: 0,
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(BackupError::Config(_))));
    }
}
