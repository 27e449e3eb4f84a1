//! Per-repository backup configuration
//!
//! A [`BackupConfig`] is created once, when the repository is created, and
//! is stored with it. Every backup into the repository uses the stored
//! config; a restore may pass a different one to change which stages run.
//!
//! Configs are only constructed through [`BackupConfigBuilder`], which
//! rejects contradictory options instead of silently picking one.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cluster::BucketKind;
use crate::error::BackupError;

/// One restore/backup stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    BucketSettings,
    Views,
    GsiIndexes,
    FtsIndexes,
    Data,
}

impl Stage {
    /// Fixed restore order: later stages assume the bucket exists
    pub const RESTORE_ORDER: [Stage; 5] = [
        Stage::BucketSettings,
        Stage::Views,
        Stage::GsiIndexes,
        Stage::FtsIndexes,
        Stage::Data,
    ];

    /// Short name used in logs and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::BucketSettings => "bucket-settings",
            Stage::Views => "views",
            Stage::GsiIndexes => "gsi-indexes",
            Stage::FtsIndexes => "fts-indexes",
            Stage::Data => "data",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a bucket was or was not selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketSelection {
    /// No include or exclude list; every persistent bucket is taken
    AllBuckets,
    /// Named in the include list
    IncludeList,
    /// Not named in the exclude list
    NotExcluded,
    /// Named in the exclude list
    ExcludeList,
    /// Missing from a non-empty include list
    NotIncluded,
    /// Memcached buckets hold no persistent data
    NonPersistent,
}

impl BucketSelection {
    /// Whether the bucket takes part in the transfer
    pub fn is_included(&self) -> bool {
        matches!(
            self,
            BucketSelection::AllBuckets | BucketSelection::IncludeList | BucketSelection::NotExcluded
        )
    }
}

impl fmt::Display for BucketSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BucketSelection::AllBuckets => "all buckets",
            BucketSelection::IncludeList => "in include list",
            BucketSelection::NotExcluded => "not in exclude list",
            BucketSelection::ExcludeList => "in exclude list",
            BucketSelection::NotIncluded => "not in include list",
            BucketSelection::NonPersistent => "memcached bucket",
        };
        f.write_str(s)
    }
}

/// Immutable description of what a repository backs up and restores
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    include_buckets: Vec<String>,
    exclude_buckets: Vec<String>,
    disable_bucket_config: bool,
    disable_views: bool,
    disable_gsi_indexes: bool,
    disable_ft_indexes: bool,
    disable_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    vbuckets: Option<Vec<u16>>,
}

impl BackupConfig {
    /// Start building a config; all defaults select everything
    pub fn builder() -> BackupConfigBuilder {
        BackupConfigBuilder::default()
    }

    /// Buckets named in the include list
    pub fn include_buckets(&self) -> &[String] {
        &self.include_buckets
    }

    /// Buckets named in the exclude list
    pub fn exclude_buckets(&self) -> &[String] {
        &self.exclude_buckets
    }

    /// Explicit vbucket subset, if the config restricts capture/replay
    pub fn vbuckets(&self) -> Option<&[u16]> {
        self.vbuckets.as_deref()
    }

    /// Whether a vbucket takes part in the transfer
    pub fn selects_vbucket(&self, vb: u16) -> bool {
        match &self.vbuckets {
            Some(list) => list.binary_search(&vb).is_ok(),
            None => true,
        }
    }

    /// Whether a stage is disabled
    pub fn skips(&self, stage: Stage) -> bool {
        match stage {
            Stage::BucketSettings => self.disable_bucket_config,
            Stage::Views => self.disable_views,
            Stage::GsiIndexes => self.disable_gsi_indexes,
            Stage::FtsIndexes => self.disable_ft_indexes,
            Stage::Data => self.disable_data,
        }
    }

    /// Stages that will run, in restore order
    pub fn enabled_stages(&self) -> Vec<Stage> {
        Stage::RESTORE_ORDER
            .iter()
            .copied()
            .filter(|stage| !self.skips(*stage))
            .collect()
    }

    /// Decide whether a bucket is transferred
    ///
    /// Memcached buckets are always excluded; otherwise a non-empty include
    /// list wins, then a non-empty exclude list, then everything.
    pub fn select_bucket(&self, name: &str, kind: BucketKind) -> BucketSelection {
        if kind == BucketKind::Memcached {
            return BucketSelection::NonPersistent;
        }

        if !self.include_buckets.is_empty() {
            return if self.include_buckets.iter().any(|b| b == name) {
                BucketSelection::IncludeList
            } else {
                BucketSelection::NotIncluded
            };
        }

        if !self.exclude_buckets.is_empty() {
            return if self.exclude_buckets.iter().any(|b| b == name) {
                BucketSelection::ExcludeList
            } else {
                BucketSelection::NotExcluded
            };
        }

        BucketSelection::AllBuckets
    }

    /// Check mutually exclusive options
    pub fn validate(&self) -> Result<(), BackupError> {
        if !self.include_buckets.is_empty() && !self.exclude_buckets.is_empty() {
            return Err(BackupError::Config(
                "include and exclude bucket lists cannot both be set".into(),
            ));
        }

        if let Some(vbuckets) = &self.vbuckets {
            if vbuckets.is_empty() {
                return Err(BackupError::Config(
                    "an explicit vbucket list cannot be empty".into(),
                ));
            }
        }

        if Stage::RESTORE_ORDER.iter().all(|stage| self.skips(*stage)) {
            return Err(BackupError::Config("every stage is disabled".into()));
        }

        Ok(())
    }
}

/// Builder for [`BackupConfig`]
#[derive(Debug, Clone, Default)]
pub struct BackupConfigBuilder {
    config: BackupConfig,
}

impl BackupConfigBuilder {
    /// Only back up / restore these buckets
    pub fn include_buckets<I, S>(mut self, buckets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.include_buckets = normalize(buckets);
        self
    }

    /// Back up / restore everything except these buckets
    pub fn exclude_buckets<I, S>(mut self, buckets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.exclude_buckets = normalize(buckets);
        self
    }

    /// Disable or enable a stage
    pub fn skip(mut self, stage: Stage, skip: bool) -> Self {
        match stage {
            Stage::BucketSettings => self.config.disable_bucket_config = skip,
            Stage::Views => self.config.disable_views = skip,
            Stage::GsiIndexes => self.config.disable_gsi_indexes = skip,
            Stage::FtsIndexes => self.config.disable_ft_indexes = skip,
            Stage::Data => self.config.disable_data = skip,
        }
        self
    }

    /// Restrict the transfer to an explicit set of vbuckets
    pub fn vbuckets<I>(mut self, vbuckets: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        let mut list: Vec<u16> = vbuckets.into_iter().collect();
        list.sort_unstable();
        list.dedup();
        self.config.vbuckets = Some(list);
        self
    }

    /// Validate and produce the config
    pub fn build(self) -> Result<BackupConfig, BackupError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn normalize<I, S>(buckets: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut list: Vec<String> = buckets
        .into_iter()
        .map(Into::into)
        .filter(|b| !b.trim().is_empty())
        .collect();
    list.sort();
    list.dedup();
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_selects_everything() {
        let config = BackupConfig::builder().build().unwrap();
        assert_eq!(
            config.select_bucket("default", BucketKind::Couchbase),
            BucketSelection::AllBuckets
        );
        assert_eq!(config.enabled_stages().len(), 5);
        assert!(config.selects_vbucket(1023));
    }

    #[test]
    fn test_include_and_exclude_conflict() {
        let result = BackupConfig::builder()
            .include_buckets(["a"])
            .exclude_buckets(["b"])
            .build();
        assert!(matches!(result, Err(BackupError::Config(_))));
    }

    #[test]
    fn test_memcached_always_excluded() {
        let config = BackupConfig::builder()
            .include_buckets(["mcd"])
            .build()
            .unwrap();
        let selection = config.select_bucket("mcd", BucketKind::Memcached);
        assert_eq!(selection, BucketSelection::NonPersistent);
        assert!(!selection.is_included());
    }

    #[test]
    fn test_include_list() {
        let config = BackupConfig::builder()
            .include_buckets(["default"])
            .build()
            .unwrap();
        assert!(config
            .select_bucket("default", BucketKind::Couchbase)
            .is_included());
        assert_eq!(
            config.select_bucket("other", BucketKind::Couchbase),
            BucketSelection::NotIncluded
        );
    }

    #[test]
    fn test_exclude_list() {
        let config = BackupConfig::builder()
            .exclude_buckets(["default"])
            .build()
            .unwrap();
        assert_eq!(
            config.select_bucket("default", BucketKind::Couchbase),
            BucketSelection::ExcludeList
        );
        assert_eq!(
            config.select_bucket("saslbucket", BucketKind::Couchbase),
            BucketSelection::NotExcluded
        );
    }

    #[test]
    fn test_skip_flags_and_order() {
        let config = BackupConfig::builder()
            .skip(Stage::BucketSettings, true)
            .skip(Stage::Views, true)
            .build()
            .unwrap();
        assert_eq!(
            config.enabled_stages(),
            vec![Stage::GsiIndexes, Stage::FtsIndexes, Stage::Data]
        );
    }

    #[test]
    fn test_all_stages_disabled_rejected() {
        let mut builder = BackupConfig::builder();
        for stage in Stage::RESTORE_ORDER {
            builder = builder.skip(stage, true);
        }
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_vbucket_subset() {
        let config = BackupConfig::builder()
            .vbuckets([5, 1, 5, 3])
            .build()
            .unwrap();
        assert_eq!(config.vbuckets(), Some(&[1, 3, 5][..]));
        assert!(config.selects_vbucket(3));
        assert!(!config.selects_vbucket(2));

        let empty = BackupConfig::builder().vbuckets(Vec::new()).build();
        assert!(empty.is_err());
    }

    #[test]
    fn test_equality_ignores_list_order() {
        let a = BackupConfig::builder()
            .include_buckets(["x", "y"])
            .build()
            .unwrap();
        let b = BackupConfig::builder()
            .include_buckets(["y", "x", "x"])
            .build()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_serde_round_trip() {
        let config = BackupConfig::builder()
            .exclude_buckets(["default"])
            .skip(Stage::FtsIndexes, true)
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: BackupConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
