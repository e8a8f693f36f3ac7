#[cfg(any(target_os = "linux", target_os = "macos"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod agent;
mod channels;
mod config;
mod connection;
mod core;
mod daemon;
mod db;
mod events;
mod handlers;
mod scheduler;
pub mod utils;
mod worker;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cc-discord-bot")]
#[command(about = "Discord DM bridge to a local Claude Code CLI running in a sandbox")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline (default when no subcommand is given)
    Daemon,
    /// Enqueue a one-off outbound DM for the running daemon to deliver
    Send {
        /// Recipient's Discord user id
        user_id: u64,
        /// Attach a file (repeatable)
        #[arg(long = "file", value_name = "PATH")]
        files: Vec<PathBuf>,
        /// Message text
        #[arg(trailing_var_arg = true)]
        message: Vec<String>,
    },
    /// Run a named schedule once and print the agent's output
    Schedule {
        /// Schedule name from the settings file
        name: String,
    },
    /// Install as a system service (launchd/systemd)
    InstallService,
}

fn main() {
    // Load environment file.
    // - Default: .env discovered from the working directory and parents.
    // - Override: CCDB_ENV_FILE=/absolute/path/to/envfile
    if let Ok(path) = std::env::var("CCDB_ENV_FILE") {
        if !path.trim().is_empty() {
            if let Err(e) = dotenvy::from_path(&path) {
                eprintln!("Warning: failed to load CCDB_ENV_FILE '{}': {}", path, e);
            }
        } else {
            let _ = dotenvy::dotenv();
        }
    } else {
        let _ = dotenvy::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Input/validation errors exit 1; help and version exit 0.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let _ = e.print();
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                std::process::exit(0);
            }
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Some(Command::InstallService) => daemon::install_service(),
        Some(Command::Send {
            user_id,
            files,
            message,
        }) => runtime.block_on(crate::core::run_send(user_id, files, message)),
        Some(Command::Schedule { name }) => {
            runtime.block_on(crate::core::run_schedule_once(&name))
        }
        Some(Command::Daemon) | None => {
            let bot_config = config::BotConfig::from_env()?;
            let settings_path = config::settings_path();
            let settings = config::Settings::load(&settings_path)?;
            runtime.block_on(crate::core::run_daemon(bot_config, settings, settings_path))
        }
    }
}
