use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;

use docvault::archive::Archive;
use docvault::cli::{
    handle_backup_command, handle_config_command, handle_info_command, handle_list_command,
    handle_merge_command, handle_restore_command, BackupArgs, ConfigArgs, InfoArgs, ListArgs,
    MergeArgs, RestoreArgs,
};
use docvault::config::paths::{ArchivePaths, ARCHIVE_ENV_VAR};
use docvault::logging::init_logging;

#[derive(Parser)]
#[command(
    name = "docvault",
    version,
    about = "Incremental backup and restore for clustered document databases",
    long_about = "docvault captures the buckets of a document database cluster into \
                  repositories of incremental backups, restores any range of them, \
                  and merges old backups together to save space."
)]
struct Cli {
    /// Archive directory
    #[arg(short, long, env = ARCHIVE_ENV_VAR, global = true)]
    archive: Option<PathBuf>,

    /// More log output (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a repository (and the archive if needed)
    Config(ConfigArgs),

    /// Back up the cluster into a repository
    Backup(BackupArgs),

    /// Restore a range of backups into the cluster
    Restore(RestoreArgs),

    /// Merge a range of backups into one
    Merge(MergeArgs),

    /// Describe repositories and what they hold
    Info(InfoArgs),

    /// List the backups of a repository
    List(ListArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = match &cli.archive {
        Some(root) => ArchivePaths::with_root(root),
        None => ArchivePaths::from_env()?,
    };

    let creating = matches!(cli.command, Commands::Config(_));
    let log_file = (creating || paths.marker_file().exists()).then(|| paths.log_file());
    if creating {
        paths.ensure_root()?;
    }
    init_logging(cli.verbose, cli.quiet, log_file.as_deref())?;

    let archive = Archive::mount(paths.root(), creating)?;
    debug!(archive = %archive.paths().root().display(), "mounted archive");

    match cli.command {
        Commands::Config(args) => handle_config_command(&archive, args)?,
        Commands::Backup(args) => handle_backup_command(&archive, args)?,
        Commands::Restore(args) => handle_restore_command(&archive, args)?,
        Commands::Merge(args) => handle_merge_command(&archive, args)?,
        Commands::Info(args) => handle_info_command(&archive, args)?,
        Commands::List(args) => handle_list_command(&archive, args)?,
    }

    Ok(())
}
