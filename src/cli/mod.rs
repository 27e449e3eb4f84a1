//! CLI command handlers
//!
//! Bridges the clap argument structs with the archive and the backup
//! entry points. Each handler receives the mounted [`Archive`](crate::archive::Archive).

pub mod args;
pub mod backup;
pub mod info;

pub use args::{ClusterArgs, SelectionArgs, TransferArgs, PASSWORD_ENV_VAR};
pub use backup::{
    handle_backup_command, handle_config_command, handle_merge_command, handle_restore_command,
    BackupArgs, ConfigArgs, MergeArgs, RestoreArgs,
};
pub use info::{handle_info_command, handle_list_command, InfoArgs, ListArgs, OutputFormat};
