//! Relaydl CLI
//!
//! Runs the Telegram media relay bot and offers offline admin commands on its
//! database.

mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relaydl_config::{Config, VipMode};
use relaydl_core::{db_path, messages, RelayRuntime};
use relaydl_storage::{Storage, UserRecord};
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "relaydl")]
#[command(about = "Telegram media relay bot backed by yt-dlp", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot in the foreground (polling, or webhook when configured)
    Start,

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Usage statistics from the database
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Grant VIP to a user
    Vip {
        user_id: i64,
        days: u32,
        /// Add the days to a running VIP period instead of restarting it today
        #[arg(long)]
        extend: bool,
    },

    /// List known users
    Users {
        #[arg(long)]
        json: bool,
    },

    /// Log commands
    Logs {
        #[command(subcommand)]
        action: LogCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write the example configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show current configuration (bot token redacted)
    Show,
    /// Validate configuration
    Validate,
}

#[derive(Subcommand)]
enum LogCommands {
    /// List log files
    List,
    /// Show the last lines of today's log
    Tail {
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
    /// Delete logs past the retention window
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = load_config(cli.config.clone())?;
            let data_dir = get_data_dir(&config);
            fs::create_dir_all(&data_dir)?;

            let log_level = config
                .core
                .log_level
                .clone()
                .filter(|_| cli.log_level == "info")
                .unwrap_or(cli.log_level);
            let _logging_guard = logging::init_logging(&data_dir.join("logs"), &log_level)?;

            info!(data_dir = %data_dir.display(), "Starting relaydl in foreground...");
            let runtime = RelayRuntime::new(config, data_dir)?;
            runtime.run().await?;
        }

        Commands::Config { action } => match action {
            ConfigCommands::Init { force } => {
                create_default_config(cli.config, force)?;
            }
            ConfigCommands::Show => match load_config(cli.config) {
                Ok(config) => {
                    println!("Current configuration:");
                    println!("{}", serde_json::to_string_pretty(&redacted_config(&config)?)?);
                }
                Err(e) => eprintln!("Error loading config: {}", e),
            },
            ConfigCommands::Validate => match load_config(cli.config) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => eprintln!("Configuration is invalid: {}", e),
            },
        },

        Commands::Stats { json } => {
            let config = load_config(cli.config)?;
            let storage = open_storage(&config)?;
            let stats = storage.stats(today())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{}", messages::stats(&stats));
            }
        }

        Commands::Vip {
            user_id,
            days,
            extend,
        } => {
            if days == 0 {
                anyhow::bail!("days must be at least 1");
            }
            let config = load_config(cli.config)?;
            let mode = if extend {
                VipMode::Extend
            } else {
                config.quota.vip_mode
            };
            let storage = open_storage(&config)?;
            let today = today();
            storage.ensure_user(user_id, today)?;
            match storage.activate_vip(user_id, days, today, mode)? {
                Some(until) => println!("{}", messages::vip_granted(user_id, until)),
                None => anyhow::bail!("user {} not found", user_id),
            }
        }

        Commands::Users { json } => {
            let config = load_config(cli.config)?;
            let storage = open_storage(&config)?;
            let users = storage.list_users()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&users)?);
            } else {
                print_users(&users);
            }
        }

        Commands::Logs { action } => {
            let config = load_config(cli.config)?;
            let manager = logging::LogManager::new(get_data_dir(&config).join("logs"));
            match action {
                LogCommands::List => {
                    let files = manager.log_files()?;
                    println!(
                        "Log files ({} total):\n",
                        logging::LogManager::format_size(manager.total_size()?)
                    );
                    for file in files {
                        let metadata = fs::metadata(&file)?;
                        let modified: chrono::DateTime<chrono::Local> = metadata.modified()?.into();
                        println!(
                            "  {} ({}, modified {})",
                            file.file_name()
                                .map(|n| n.to_string_lossy().to_string())
                                .unwrap_or_default(),
                            logging::LogManager::format_size(metadata.len()),
                            modified.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
                LogCommands::Tail { lines } => match manager.tail(lines)? {
                    Some(lines) => {
                        for line in lines {
                            println!("{}", line);
                        }
                    }
                    None => println!(
                        "No log file found at {}",
                        manager.current_log_path().display()
                    ),
                },
                LogCommands::Clean => {
                    let removed = manager.cleanup_old_logs()?;
                    println!("Cleaned {} old log file(s)", removed);
                }
            }
        }
    }

    Ok(())
}

fn today() -> chrono::NaiveDate {
    chrono::Local::now().date_naive()
}

fn load_config(config_path: Option<String>) -> Result<Config> {
    if let Some(path) = config_path {
        Config::load(&path).with_context(|| format!("cannot load config {}", path))
    } else if let Some(default_path) = Config::default_path() {
        Config::load(&default_path)
            .with_context(|| format!("cannot load config {}", default_path.display()))
    } else {
        anyhow::bail!("No config file found")
    }
}

fn get_config_path(config_path: Option<String>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(PathBuf::from(path)),
        None => Config::default_path()
            .ok_or_else(|| anyhow::anyhow!("cannot determine the config directory")),
    }
}

fn get_data_dir(config: &Config) -> PathBuf {
    let home = || dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    match config.core.data_dir.as_deref() {
        Some("~") => home(),
        Some(dir) if dir.starts_with("~/") => home().join(dir.trim_start_matches("~/")),
        Some(dir) => PathBuf::from(dir),
        None => home().join(".relaydl"),
    }
}

fn open_storage(config: &Config) -> Result<Storage> {
    let path = db_path(&get_data_dir(config));
    if !path.exists() {
        anyhow::bail!("no database at {} (has the bot run yet?)", path.display());
    }
    Storage::new(&path)
}

fn create_default_config(config_path: Option<String>, force: bool) -> Result<()> {
    let config_path = get_config_path(config_path)?;
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let config_content = include_str!("../../../config/config.example.toml");
    fs::write(&config_path, config_content)?;

    println!("Configuration created at: {}", config_path.display());
    println!("\nEdit the file to set the bot token and required channels, then run:");
    println!("  relaydl config validate");
    println!("  relaydl start");

    Ok(())
}

fn redacted_config(config: &Config) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(config)?;
    if let Some(telegram) = value.get_mut("telegram") {
        if let Some(token) = telegram.get_mut("bot_token") {
            *token = json!("***REDACTED***");
        }
        if let Some(secret) = telegram
            .get_mut("webhook")
            .and_then(|w| w.get_mut("secret_token"))
            .filter(|s| !s.is_null())
        {
            *secret = json!("***REDACTED***");
        }
    }
    Ok(value)
}

fn print_users(users: &[UserRecord]) {
    let today = today();
    println!(
        "{:>14}  {:>6}  {:>8}  {:<10}  {:<20}",
        "user_id", "today", "total", "since", "vip_until"
    );
    for user in users {
        let vip = match user.vip_until {
            Some(until) if user.is_vip(today) => until.to_string(),
            Some(until) => format!("{} (expired)", until),
            None => "-".to_string(),
        };
        let since = user
            .created_on
            .map(|day| day.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>14}  {:>6}  {:>8}  {:<10}  {:<20}",
            user.user_id, user.downloads_today, user.downloads_total, since, vip
        );
    }
    println!("\n{} user(s)", users.len());
}
