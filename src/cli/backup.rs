//! Repository, backup, restore and merge commands

use clap::Args;

use super::args::{ClusterArgs, SelectionArgs, TransferArgs};
use crate::archive::Archive;
use crate::backup;
use crate::error::BackupResult;

/// Arguments of `docvault config`
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Repository to create
    #[arg(short, long)]
    pub repo: String,

    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Only back up these vbuckets (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub vbuckets: Vec<u16>,
}

/// Arguments of `docvault backup`
#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Repository to back up into
    #[arg(short, long)]
    pub repo: String,

    #[command(flatten)]
    pub cluster: ClusterArgs,

    #[command(flatten)]
    pub transfer: TransferArgs,

    /// Purge captured tombstones from the cluster
    #[arg(long)]
    pub purge: bool,
}

/// Arguments of `docvault restore`
#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Repository to restore from
    #[arg(short, long)]
    pub repo: String,

    #[command(flatten)]
    pub cluster: ClusterArgs,

    #[command(flatten)]
    pub transfer: TransferArgs,

    /// First backup to restore (default: oldest)
    #[arg(long)]
    pub start: Option<String>,

    /// Last backup to restore (default: newest)
    #[arg(long)]
    pub end: Option<String>,

    /// Overrides the repository's bucket selection and stages
    #[command(flatten)]
    pub selection: SelectionArgs,
}

/// Arguments of `docvault merge`
#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Repository to merge in
    #[arg(short, long)]
    pub repo: String,

    /// First backup of the range
    #[arg(long)]
    pub start: String,

    /// Last backup of the range
    #[arg(long)]
    pub end: String,
}

/// Handle `docvault config`
pub fn handle_config_command(archive: &Archive, args: ConfigArgs) -> BackupResult<()> {
    let vbuckets = (!args.vbuckets.is_empty()).then_some(args.vbuckets.as_slice());
    let config = args.selection.to_config(vbuckets)?;
    archive.create_repository(&args.repo, &config)?;

    // Write the defaults out so they can be tuned
    if !archive.paths().settings_file().exists() {
        archive.settings().save(archive.paths())?;
    }

    println!("Repository '{}' is ready.", args.repo);
    println!("Location: {}", archive.paths().repository_dir(&args.repo).display());
    Ok(())
}

/// Handle `docvault backup`
pub fn handle_backup_command(archive: &Archive, args: BackupArgs) -> BackupResult<()> {
    let options = args
        .transfer
        .options(archive.settings())
        .with_purge(args.purge);
    let connection = args.cluster.connect()?;

    let result = backup::backup(archive, connection.client(), &args.repo, &options);
    connection.close()?;
    let report = result?;

    println!("{}", report.summary());
    for (bucket, record) in &report.buckets {
        println!(
            "  {}: {} document(s), {} deletion(s)",
            bucket, record.num_docs, record.num_deletions
        );
    }
    for (bucket, reason) in &report.excluded {
        println!("  {}: skipped ({})", bucket, reason);
    }
    Ok(())
}

/// Handle `docvault restore`
pub fn handle_restore_command(archive: &Archive, args: RestoreArgs) -> BackupResult<()> {
    let options = args.transfer.options(archive.settings());

    let config = if args.selection.is_empty() {
        None
    } else {
        let stored = archive.repository_config(&args.repo)?;
        Some(args.selection.to_config(stored.vbuckets())?)
    };

    let connection = args.cluster.connect()?;
    let result = backup::restore(
        archive,
        connection.client(),
        &args.repo,
        args.start.as_deref(),
        args.end.as_deref(),
        &options,
        config.as_ref(),
    );
    connection.close()?;
    let report = result?;

    println!("{}", report.summary());
    for (bucket, stats) in &report.buckets {
        let created = if stats.created_bucket { " (created)" } else { "" };
        println!(
            "  {}{}: {} document(s), {} deletion(s)",
            bucket, created, stats.docs, stats.deletions
        );
    }
    Ok(())
}

/// Handle `docvault merge`
pub fn handle_merge_command(archive: &Archive, args: MergeArgs) -> BackupResult<()> {
    let merged = backup::merge(archive, &args.repo, &args.start, &args.end)?;
    let summary = archive.repository_summary(&args.repo)?;

    println!("Merged into {}", merged);
    println!("Backups remaining: {}", summary.num_incr_backups);
    Ok(())
}
