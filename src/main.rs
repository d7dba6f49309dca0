// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;

use offline_vault::config::{default_data_dir, ManagerConfig};
use offline_vault::error::ErrorReport;
use offline_vault::types::sort_oldest_first;
use offline_vault::{
    format_bytes, DownloadEntry, DownloadStatus, Fs2SpaceProbe, ManagerError, MetadataStore,
    OfflineEvent, OfflineManager, StorageGuard,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    pub const SUCCESS: i32 = 0;
    /// General error
    pub const ERROR: i32 = 1;
    /// A download ended paused, failed or without space, or another
    /// process owns the data directory; try again later
    pub const TEMP_FAIL: i32 = 75;
    /// Invalid or unreadable config
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

/// offline-vault - Download media for offline playback.
#[derive(Parser)]
#[command(name = "offline-vault")]
#[command(version = VERSION)]
#[command(about = "Resumable offline downloads with a disk-space budget.")]
#[command(long_about = "offline-vault - Offline download manager\n\n\
    Download a file:     offline-vault get m1 https://cdn.example.com/m1.mp4\n\
    See what is stored:  offline-vault list\n\
    Continue later:      offline-vault resume --all\n\n\
    Ctrl+C pauses running downloads; they resume from where they stopped.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory holding config.json, downloads.json and downloads/
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Quiet mode: only warnings and errors
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose mode: debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a download and wait for it
    ///
    /// Examples:
    ///   offline-vault get m1 https://cdn.example.com/m1.mp4
    ///   offline-vault get m1 https://cdn.example.com/m1.mp4 --title "Episode 1"
    Get {
        /// Content id
        id: String,
        /// Source URL
        url: String,
        /// Display title
        #[arg(long, default_value = "")]
        title: String,
        /// Artwork URL
        #[arg(long, default_value = "")]
        icon: String,
    },

    /// Continue a paused, failed or storage-blocked download
    Resume {
        /// Content id
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        id: Option<String>,
        /// Resume every resumable download
        #[arg(long)]
        all: bool,
    },

    /// Restart a failed or cancelled download
    Retry {
        id: String,
    },

    /// Pause a download, keeping the partial file
    Pause {
        id: String,
    },

    /// Cancel a download and delete its file
    Cancel {
        id: String,
    },

    /// Forget a download and delete its file
    #[command(alias = "rm")]
    Remove {
        id: String,
    },

    /// List all downloads
    #[command(alias = "ls")]
    List,

    /// Show storage used by downloads and free space
    Usage,

    /// Show configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
}

fn init_logging(cli: &Cli) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default_level = if cli.verbose {
        "offline_vault=debug"
    } else if cli.quiet {
        "offline_vault=warn"
    } else {
        "offline_vault=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let config = match ManagerConfig::load_from(&data_dir) {
        Ok(config) => config,
        Err(e) => {
            let report = ErrorReport::new("Failed to load configuration")
                .cause(format!("{:#}", e))
                .fix(format!(
                    "Fix or delete {}",
                    ManagerConfig::config_path(&data_dir).display()
                ));
            eprintln!("{}", report.to_string().red());
            std::process::exit(CONFIG);
        }
    };

    let code = match cli.command {
        Commands::Config { command } => handle_config(command, &config, &data_dir),
        command => run_async(command, config),
    };
    std::process::exit(code);
}

fn run_async(command: Commands, config: ManagerConfig) -> i32 {
    let runtime = match tokio::runtime::Runtime::new().context("Failed to create Tokio runtime") {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{} {:#}", "[✗]".red(), e);
            return ERROR;
        }
    };

    runtime.block_on(async move {
        match dispatch(command, config).await {
            Ok(code) => code,
            Err(e) => match e.downcast_ref::<ManagerError>() {
                Some(err) => {
                    eprintln!("{}", ErrorReport::for_command(err).to_string().red());
                    match err {
                        ManagerError::Busy { .. } => TEMP_FAIL,
                        _ => ERROR,
                    }
                }
                None => {
                    eprintln!("{} {:#}", "[✗]".red(), e);
                    ERROR
                }
            },
        }
    })
}

async fn dispatch(command: Commands, config: ManagerConfig) -> Result<i32> {
    match command {
        Commands::List => {
            print_list(&overview_entries(&config)?);
            return Ok(SUCCESS);
        }
        Commands::Usage => {
            print_usage(&config, &overview_entries(&config)?);
            return Ok(SUCCESS);
        }
        _ => {}
    }

    let manager = OfflineManager::new(config)?;

    match command {
        Commands::Get { id, url, title, icon } => {
            let events = manager.subscribe();
            manager.add(&id, &url, &title, &icon).await?;
            Ok(watch(&manager, events, vec![id]).await)
        }
        Commands::Resume { id: Some(id), .. } => {
            let events = manager.subscribe();
            manager.resume(&id).await?;
            Ok(watch(&manager, events, vec![id]).await)
        }
        Commands::Resume { id: None, .. } => {
            let events = manager.subscribe();
            let ids: Vec<String> = manager
                .all_entries()
                .into_iter()
                .filter(|e| e.status.is_resumable())
                .map(|e| e.id)
                .collect();
            if ids.is_empty() {
                println!("Nothing to resume.");
                return Ok(SUCCESS);
            }
            for id in &ids {
                manager.resume(id).await?;
            }
            Ok(watch(&manager, events, ids).await)
        }
        Commands::Retry { id } => {
            let events = manager.subscribe();
            manager.retry(&id).await?;
            Ok(watch(&manager, events, vec![id]).await)
        }
        Commands::Pause { id } => {
            manager.pause(&id)?;
            println!("{} Paused {}", "[✓]".green(), id);
            Ok(SUCCESS)
        }
        Commands::Cancel { id } => {
            manager.cancel(&id)?;
            println!("{} Cancelled {}", "[✓]".green(), id);
            Ok(SUCCESS)
        }
        Commands::Remove { id } => {
            manager.remove(&id)?;
            println!("{} Removed {}", "[✓]".green(), id);
            Ok(SUCCESS)
        }
        Commands::List | Commands::Usage | Commands::Config { .. } => Ok(SUCCESS),
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {prefix:<12} [{bar:40.cyan/blue}] {pos:>3}% | {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░")
}

/// Render progress for `ids` until no transfer is running.
///
/// Ctrl+C pauses everything so the next `resume` continues from disk.
async fn watch(
    manager: &OfflineManager,
    mut events: tokio::sync::broadcast::Receiver<OfflineEvent>,
    ids: Vec<String>,
) -> i32 {
    let multi = MultiProgress::new();
    let mut bars: HashMap<String, ProgressBar> = HashMap::new();
    for id in &ids {
        let bar = multi.add(ProgressBar::new(100));
        bar.set_style(bar_style());
        bar.set_prefix(id.clone());
        if let Some(pct) = manager.progress(id).and_then(|p| p.percent()) {
            bar.set_position(u64::from(pct));
        }
        bar.enable_steady_tick(Duration::from_millis(120));
        bars.insert(id.clone(), bar);
    }

    let idle = manager.wait_all_idle();
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = &mut idle => break,
            _ = tokio::signal::ctrl_c() => {
                multi.suspend(|| println!("{} Pausing downloads...", "[!]".yellow()));
                manager.stop_all(false).await;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    let Some(bar) = event.id().and_then(|id| bars.get(id)) else {
                        continue;
                    };
                    match event {
                        OfflineEvent::Progress { percent, .. } if percent >= 0 => {
                            bar.set_position(percent as u64);
                        }
                        OfflineEvent::Progress { id, .. } => {
                            let bytes = manager.entry(&id).map(|e| e.actual_size_bytes).unwrap_or(0);
                            bar.set_message(format!("{} (size unknown)", format_bytes(bytes)));
                        }
                        OfflineEvent::StatusChanged { status, .. } => {
                            bar.set_message(status.to_string());
                        }
                        OfflineEvent::Error { message, .. } => {
                            bar.set_message(message);
                        }
                        OfflineEvent::Completed { .. } => {
                            bar.set_position(100);
                        }
                        OfflineEvent::ListChanged | OfflineEvent::StorageUsage { .. } => {}
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Progress display fell behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    for bar in bars.values() {
        bar.finish_and_clear();
    }

    let mut code = SUCCESS;
    for id in &ids {
        let Some(entry) = manager.entry(id) else {
            continue;
        };
        match entry.status {
            DownloadStatus::Completed => {
                println!(
                    "{} {} ready ({}) -> {}",
                    "[✓]".green(),
                    id,
                    format_bytes(entry.actual_size_bytes),
                    entry.file_path.display()
                );
            }
            _ => {
                code = TEMP_FAIL;
                match ErrorReport::for_entry(&entry) {
                    Some(report) => eprintln!("{}", report.to_string().yellow()),
                    None => eprintln!("{} {} is {}", "[!]".yellow(), id, entry.status),
                }
            }
        }
    }
    code
}

fn colored_status(status: DownloadStatus) -> colored::ColoredString {
    let text = format!("{:<12}", status.as_str());
    match status {
        DownloadStatus::Completed => text.green(),
        DownloadStatus::Downloading | DownloadStatus::Pending => text.cyan(),
        DownloadStatus::Paused => text.yellow(),
        DownloadStatus::Error | DownloadStatus::StorageFull => text.red(),
        DownloadStatus::Cancelled => text.dimmed(),
    }
}

/// Entries for `list` and `usage`.
///
/// While another process owns the data directory, its last saved table is
/// shown as is, so its running downloads still read as downloading.
fn overview_entries(config: &ManagerConfig) -> Result<Vec<DownloadEntry>> {
    let err = match OfflineManager::new(config.clone()) {
        Ok(manager) => return Ok(manager.all_entries()),
        Err(err) => err,
    };
    if !matches!(err.downcast_ref::<ManagerError>(), Some(ManagerError::Busy { .. })) {
        return Err(err);
    }

    let mut entries: Vec<DownloadEntry> = MetadataStore::new(&config.metadata_file)
        .snapshot()?
        .into_values()
        .collect();
    sort_oldest_first(&mut entries);

    let running = entries.iter().filter(|e| e.status.is_active()).count();
    eprintln!(
        "{} Another offline-vault process is using this data directory ({} running); showing its last saved state.",
        "[i]".cyan(),
        running
    );
    Ok(entries)
}

fn print_list(entries: &[DownloadEntry]) {
    if entries.is_empty() {
        println!("No downloads yet. Add one with: offline-vault get <id> <url>");
        return;
    }

    println!();
    println!(
        "  {:<16} {:<12} {:>5}  {:>21}  {}",
        "ID".bold(),
        "STATUS".bold(),
        "DONE".bold(),
        "SIZE".bold(),
        "TITLE".bold()
    );
    for entry in entries {
        let size = if entry.expected_size_bytes > 0 {
            format!(
                "{} / {}",
                format_bytes(entry.actual_size_bytes),
                format_bytes(entry.expected_size_bytes)
            )
        } else {
            format_bytes(entry.actual_size_bytes)
        };
        println!(
            "  {:<16} {} {:>5}  {:>21}  {}",
            entry.id,
            colored_status(entry.status),
            entry.progress.to_string(),
            size,
            entry.title.dimmed()
        );
    }
    println!();
}

fn print_usage(config: &ManagerConfig, entries: &[DownloadEntry]) {
    let guard = StorageGuard::new(
        Arc::new(Fs2SpaceProbe),
        &config.downloads_dir,
        config.storage_buffer_bytes,
    );
    let used: u64 = entries.iter().map(DownloadEntry::stored_bytes).sum();

    println!();
    println!("  Used by downloads: {}", format_bytes(used).bold());
    match guard.free_space() {
        Some(free) => println!("  Free space:        {}", format_bytes(free)),
        None => println!("  Free space:        {}", "(unavailable)".dimmed()),
    }
    println!("  Safety buffer:     {}", format_bytes(guard.buffer()));
    println!("  Downloads folder:  {}", config.downloads_dir.display());
    println!();
}

fn handle_config(command: Option<ConfigCommands>, config: &ManagerConfig, data_dir: &std::path::Path) -> i32 {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", "=== offline-vault Configuration ===".bright_cyan().bold());
            println!();
            match serde_json::to_string_pretty(config) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("{} {}", "[✗]".red(), e);
                    return ERROR;
                }
            }
            println!();
            println!("Config file: {}", ManagerConfig::config_path(data_dir).display());
            println!();
        }
        Some(ConfigCommands::Path) => {
            println!("{}", ManagerConfig::config_path(data_dir).display());
        }
    }
    SUCCESS
}
