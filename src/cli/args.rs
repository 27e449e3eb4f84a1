//! Arguments shared by several commands

use clap::Args;

use crate::cluster::{connect, Connection, Credentials, SecureString};
use crate::config::{BackupConfig, Settings, Stage};
use crate::error::{BackupError, BackupResult};
use crate::transfer::TransferOptions;

/// Environment variable holding the cluster password
pub const PASSWORD_ENV_VAR: &str = "DOCVAULT_PASSWORD";

/// Where the cluster is and who to log in as
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Cluster endpoint (file://<dir>)
    #[arg(short, long)]
    pub cluster: String,

    /// Cluster user name
    #[arg(short, long, default_value = "Administrator")]
    pub username: String,

    /// Cluster password (prompted for when not given)
    #[arg(short, long, env = PASSWORD_ENV_VAR, hide_env_values = true)]
    pub password: Option<String>,
}

impl ClusterArgs {
    /// Credentials, prompting for the password if needed
    pub fn credentials(&self) -> BackupResult<Credentials> {
        let password = match &self.password {
            Some(password) => SecureString::new(password.as_str()),
            None => prompt_password(&format!("Password for {}: ", self.username))?,
        };
        Ok(Credentials::new(self.username.as_str(), password))
    }

    /// Open the cluster connection
    pub fn connect(&self) -> BackupResult<Connection> {
        connect(&self.cluster, self.credentials()?)
    }
}

/// Prompt for a password (hidden input)
fn prompt_password(prompt: &str) -> BackupResult<SecureString> {
    rpassword::prompt_password(prompt)
        .map(SecureString::from)
        .map_err(|e| BackupError::Config(format!("Failed to read password: {}", e)))
}

/// Worker and resume options
#[derive(Args, Debug, Clone, Default)]
pub struct TransferArgs {
    /// Shard workers per bucket (defaults to the archive setting)
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Continue an interrupted transfer
    #[arg(long)]
    pub resume: bool,
}

impl TransferArgs {
    pub fn options(&self, settings: &Settings) -> TransferOptions {
        let options = TransferOptions::from_settings(settings).with_resume(self.resume);
        match self.threads {
            Some(threads) => options.with_threads(threads),
            None => options,
        }
    }
}

/// Bucket selection and stage switches
#[derive(Args, Debug, Clone, Default)]
pub struct SelectionArgs {
    /// Only these buckets (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub include_buckets: Vec<String>,

    /// Every bucket except these (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub exclude_buckets: Vec<String>,

    /// Skip bucket settings
    #[arg(long)]
    pub disable_bucket_config: bool,

    /// Skip view definitions
    #[arg(long)]
    pub disable_views: bool,

    /// Skip GSI index definitions
    #[arg(long)]
    pub disable_gsi_indexes: bool,

    /// Skip full-text index definitions
    #[arg(long)]
    pub disable_ft_indexes: bool,

    /// Skip documents
    #[arg(long)]
    pub disable_data: bool,
}

impl SelectionArgs {
    /// True when no flag was given
    pub fn is_empty(&self) -> bool {
        self.include_buckets.is_empty()
            && self.exclude_buckets.is_empty()
            && !self.disable_bucket_config
            && !self.disable_views
            && !self.disable_gsi_indexes
            && !self.disable_ft_indexes
            && !self.disable_data
    }

    /// Build a config, optionally limited to some vbuckets
    pub fn to_config(&self, vbuckets: Option<&[u16]>) -> BackupResult<BackupConfig> {
        let mut builder = BackupConfig::builder()
            .include_buckets(self.include_buckets.iter().cloned())
            .exclude_buckets(self.exclude_buckets.iter().cloned())
            .skip(Stage::BucketSettings, self.disable_bucket_config)
            .skip(Stage::Views, self.disable_views)
            .skip(Stage::GsiIndexes, self.disable_gsi_indexes)
            .skip(Stage::FtsIndexes, self.disable_ft_indexes)
            .skip(Stage::Data, self.disable_data);
        if let Some(vbuckets) = vbuckets {
            builder = builder.vbuckets(vbuckets.iter().copied());
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_to_config() {
        let args = SelectionArgs {
            include_buckets: vec!["a".into(), "b".into()],
            disable_views: true,
            ..Default::default()
        };
        assert!(!args.is_empty());

        let config = args.to_config(None).unwrap();
        assert_eq!(config.include_buckets(), ["a", "b"]);
        assert!(config.skips(Stage::Views));
        assert!(!config.skips(Stage::Data));
    }

    #[test]
    fn test_conflicting_selection() {
        let args = SelectionArgs {
            include_buckets: vec!["a".into()],
            exclude_buckets: vec!["b".into()],
            ..Default::default()
        };
        assert!(matches!(args.to_config(None), Err(BackupError::Config(_))));
    }

    #[test]
    fn test_transfer_options() {
        let settings = Settings::default();
        let args = TransferArgs {
            threads: Some(8),
            resume: true,
        };
        let options = args.options(&settings);
        assert_eq!(options.threads, 8);
        assert!(options.resume);
        assert_eq!(TransferArgs::default().options(&settings).threads, settings.threads);
    }
}
