//! Archive inspection commands

use std::collections::BTreeMap;

use clap::{Args, ValueEnum};
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::archive::{Archive, BucketRecord, RepositorySummary};
use crate::error::{BackupError, BackupResult};

/// Output format of the inspection commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed tables
    #[default]
    Table,
    /// JSON
    Json,
    /// YAML
    Yaml,
}

/// Arguments of `docvault info`
#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Repository to describe (all repositories when omitted)
    #[arg(short, long)]
    pub repo: Option<String>,

    /// Describe the repository as of this backup
    #[arg(long, requires = "repo")]
    pub backup: Option<String>,

    /// Show only what the backup itself captured, not the cumulative state
    #[arg(long, requires = "backup")]
    pub incremental: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

/// Arguments of `docvault list`
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Repository whose backups to list
    #[arg(short, long)]
    pub repo: String,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

#[derive(Tabled)]
struct RepositoryRow {
    #[tabled(rename = "Repository")]
    name: String,
    #[tabled(rename = "Backups")]
    backups: usize,
    #[tabled(rename = "Documents")]
    docs: u64,
    #[tabled(rename = "Buckets")]
    buckets: String,
    #[tabled(rename = "Last backup")]
    last: String,
    #[tabled(rename = "Size")]
    size: String,
}

impl From<&RepositorySummary> for RepositoryRow {
    fn from(summary: &RepositorySummary) -> Self {
        Self {
            name: summary.name.clone(),
            backups: summary.num_incr_backups,
            docs: summary.total_docs,
            buckets: summary.buckets.join(", "),
            last: summary.last.clone().unwrap_or_else(|| "-".into()),
            size: format_size(summary.size_bytes),
        }
    }
}

#[derive(Tabled)]
struct BucketRow {
    #[tabled(rename = "Bucket")]
    name: String,
    #[tabled(rename = "Documents")]
    docs: u64,
    #[tabled(rename = "Deletions")]
    deletions: u64,
    #[tabled(rename = "VBuckets")]
    vbuckets: usize,
    #[tabled(rename = "Reason")]
    reason: String,
}

#[derive(Tabled, Serialize)]
struct InstanceRow {
    #[tabled(rename = "#")]
    position: usize,
    #[tabled(rename = "Backup")]
    name: String,
    #[tabled(rename = "Buckets")]
    buckets: usize,
    #[tabled(rename = "Documents")]
    docs: u64,
    #[tabled(rename = "Merged from")]
    merged_from: usize,
}

/// Handle `docvault info`
pub fn handle_info_command(archive: &Archive, args: InfoArgs) -> BackupResult<()> {
    let Some(repo) = args.repo.as_deref() else {
        let summaries = archive
            .list_repositories()?
            .iter()
            .map(|name| archive.repository_summary(name))
            .collect::<BackupResult<Vec<_>>>()?;

        return match args.format {
            OutputFormat::Table if summaries.is_empty() => {
                println!("No repositories in {}", archive.paths().root().display());
                Ok(())
            }
            OutputFormat::Table => {
                let rows: Vec<RepositoryRow> = summaries.iter().map(RepositoryRow::from).collect();
                println!("{}", render(rows));
                Ok(())
            }
            format => print_structured(&summaries, format),
        };
    };

    let buckets = match (args.backup.as_deref(), args.incremental) {
        (Some(name), true) => archive.incr_backup_info(repo, name)?,
        (name, _) => archive.backup_info(repo, name)?,
    };

    match args.format {
        OutputFormat::Table => {
            let summary = archive.repository_summary(repo)?;
            println!("Repository: {}", summary.name);
            println!("Created:    {}", summary.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("Backups:    {}", summary.num_incr_backups);
            println!("Size:       {}", format_size(summary.size_bytes));
            if let Some(name) = &args.backup {
                println!("As of:      {}", name);
            }
            println!();

            if buckets.is_empty() {
                println!("No buckets backed up.");
            } else {
                println!("{}", render(bucket_rows(&buckets)));
            }
            Ok(())
        }
        format => print_structured(&buckets, format),
    }
}

/// Handle `docvault list`
pub fn handle_list_command(archive: &Archive, args: ListArgs) -> BackupResult<()> {
    let history = archive.open_history(&args.repo)?;
    let rows: Vec<InstanceRow> = history
        .iter()
        .enumerate()
        .map(|(i, instance)| InstanceRow {
            position: i + 1,
            name: instance.name().to_string(),
            buckets: instance.meta.buckets.len(),
            docs: instance.meta.buckets.values().map(|r| r.num_docs).sum(),
            merged_from: instance.meta.merged_from.len(),
        })
        .collect();

    match args.format {
        OutputFormat::Table if rows.is_empty() => {
            println!("No backups in repository '{}'.", args.repo);
            Ok(())
        }
        OutputFormat::Table => {
            println!("{}", render(rows));
            Ok(())
        }
        format => print_structured(&rows, format),
    }
}

fn bucket_rows(buckets: &BTreeMap<String, BucketRecord>) -> Vec<BucketRow> {
    buckets
        .iter()
        .map(|(name, record)| BucketRow {
            name: name.clone(),
            docs: record.num_docs,
            deletions: record.num_deletions,
            vbuckets: record.vbuckets.len(),
            reason: record.reason.to_string(),
        })
        .collect()
}

fn render<T: Tabled>(rows: Vec<T>) -> String {
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    table.to_string()
}

fn print_structured<T: Serialize + ?Sized>(value: &T, format: OutputFormat) -> BackupResult<()> {
    let text = match format {
        OutputFormat::Yaml => serde_yaml::to_string(value)
            .map_err(|e| BackupError::Config(format!("Failed to render YAML: {}", e)))?,
        _ => serde_json::to_string_pretty(value)?,
    };
    println!("{}", text.trim_end());
    Ok(())
}

/// Format bytes as human-readable size
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
