mod vault;
mod watch;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use taskindex_config::AppConfig;
use taskindex_sync::{
    AiIndexMeta, IndexSync, LocalFileSystem, LogNotifier, SyncStats, meta_path_for,
    resolve_output_path,
};

use vault::MarkdownVault;

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Parser)]
#[command(
    name = "taskindex",
    version,
    about = "Keep an NDJSON index of the tasks in a markdown vault"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Vault root; overrides `[vault] root`.
    #[arg(long)]
    vault: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build the index once from every note and exit.
    Rebuild,
    /// Build the index, then keep it current as notes change.
    Watch,
    /// Print the body path, creating an empty index if there is none.
    Open,
    /// Show the metadata of the index on disk.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = AppConfig::load_from(&cli.config)?;
    if let Some(vault) = &cli.vault {
        config.vault.root = vault.to_string_lossy().to_string();
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let root = std::fs::canonicalize(&config.vault.root)
        .with_context(|| format!("vault root {} is not accessible", config.vault.root))?;
    let vault = Arc::new(MarkdownVault::new(root.clone()));
    let sync = IndexSync::new(
        config.index.clone(),
        vault.clone(),
        Arc::new(LocalFileSystem::new(root.clone())),
        Arc::new(LogNotifier),
    );

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Rebuild => {
            sync.rebuild_all().await?;
            print_stats(&sync.status().await, &root);
        }
        Commands::Watch => {
            if let Err(err) = sync.start().await {
                // A failed first write is retried by the scheduler.
                tracing::warn!(error = %err, "initial index build failed");
            }
            print_stats(&sync.status().await, &root);
            watch::run(sync, &vault, &root).await?;
        }
        Commands::Open => {
            let path = sync.open_index_file().await?;
            println!("{}", root.join(path).display());
        }
        Commands::Status => print_disk_status(&config, &root)?,
    }

    Ok(())
}

fn print_stats(stats: &SyncStats, root: &Path) {
    if !stats.enabled {
        println!("task index export is disabled");
        return;
    }
    println!(
        "indexed {} tasks from {} notes",
        stats.task_count, stats.file_count
    );
    if let Some(path) = &stats.output_path {
        println!("- index: {}", root.join(path).display());
    }
    if stats.consecutive_failures > 0 {
        println!("- consecutive write failures: {}", stats.consecutive_failures);
    }
}

fn print_disk_status(config: &AppConfig, root: &Path) -> Result<()> {
    let body = root.join(resolve_output_path(&config.index));
    let meta_path = meta_path_for(&body);
    println!("taskindex status");
    println!("- enabled: {}", config.index.enabled);
    println!("- index: {}", body.display());

    let raw = match std::fs::read_to_string(&meta_path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            println!("- no index written yet");
            return Ok(());
        }
        Err(err) => return Err(err).context("failed to read index metadata"),
    };
    let meta: AiIndexMeta = serde_json::from_str(&raw)
        .with_context(|| format!("invalid index metadata in {}", meta_path.display()))?;
    println!("- schema version: {}", meta.version);
    println!("- generated at: {}", meta.generated_at.to_rfc3339());
    println!("- tasks: {}", meta.task_count);
    println!("- notes: {}", meta.file_count);
    println!("- index hash: {}", meta.index_hash);
    if let Some(err) = meta.last_error {
        println!("- last error: {err}");
    }
    Ok(())
}
