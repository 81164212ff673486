mod countdown;
mod idle;
mod session;
mod utils;

use crate::countdown::{CountdownArgs, handle_countdown_command};
use crate::idle::handle_idle_command;
use crate::session::{
    handle_lock_command, handle_logout_command, handle_passwd_command, handle_reset_attempts_command,
    handle_status_command, handle_unlock_command,
};
use crate::utils::resolve_data_dir;
use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use reqguard_session::{CONFIG_FILE_NAME, ConsoleConfig};
use std::path::{Path, PathBuf};

pub use crate::session::TerminalLogout;
pub use crate::utils::init_tracing;

#[derive(Parser, Debug)]
#[command(
    name = "reqguard",
    about = "Inactivity lock and deadline countdowns for the requirements console",
    long_about = "reqguard guards a shared requirements console. It locks the screen after a period \
                  of inactivity, asks for the password of the person who was signed in, and signs \
                  everyone out after too many failed attempts. It also shows how much processing \
                  time a requirement item has left.\n\n\
                  Quick start:\n\
                  1. reqguard passwd --user alice          # Enroll a user\n\
                  2. reqguard idle --user alice            # Interactive session with auto-lock\n\
                  3. reqguard countdown --since \"3 days ago\" --days 10"
)]
pub struct Cli {
    /// Directory holding the configuration, lock state and credentials
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the remaining processing time of a requirement item
    Countdown {
        /// When processing started: "3 days ago", "2025-01-15" or an RFC 3339 timestamp
        #[arg(short, long)]
        since: String,
        /// Processing time in days (wins over --months)
        #[arg(short, long)]
        days: Option<u32>,
        /// Processing time in average months
        #[arg(short, long)]
        months: Option<u32>,
        /// Lifecycle status of the item
        #[arg(long, default_value = "in_progress")]
        status: String,
        #[arg(short, long, help = "Keep updating until interrupted")]
        watch: bool,
        #[arg(long, help = "Print each sample as JSON")]
        json: bool,
    },

    /// Show whether the console is locked
    Status,

    /// Lock the console now
    Lock {
        #[arg(short, long, help = "Sign in as this user first when nobody is on record")]
        user: Option<String>,
    },

    /// Unlock the console with the locked user's password
    Unlock,

    /// Clear the failed unlock attempt counter
    ResetAttempts,

    /// Sign out and clear the lock
    Logout,

    /// Set or change a user's password
    Passwd {
        #[arg(short, long)]
        user: String,
    },

    /// Show or create the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Interactive session: sign in and let inactivity lock the console
    Idle {
        #[arg(short, long)]
        user: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Write the default configuration
    Init {
        #[arg(long, help = "Overwrite an existing configuration file")]
        force: bool,
    },
}

pub async fn handle_command(cmd: Commands, data_dir: Option<PathBuf>) -> Result<()> {
    let data_dir = resolve_data_dir(data_dir)?;

    match cmd {
        Commands::Countdown {
            since,
            days,
            months,
            status,
            watch,
            json,
        } => {
            let args = CountdownArgs {
                since,
                days,
                months,
                status,
                watch,
                json,
            };
            handle_countdown_command(&data_dir, args).await
        }
        Commands::Status => handle_status_command(&data_dir),
        Commands::Lock { user } => handle_lock_command(&data_dir, user).await,
        Commands::Unlock => handle_unlock_command(&data_dir).await,
        Commands::ResetAttempts => handle_reset_attempts_command(&data_dir),
        Commands::Logout => handle_logout_command(&data_dir).await,
        Commands::Passwd { user } => handle_passwd_command(&data_dir, &user),
        Commands::Config { command } => handle_config_command(&data_dir, command),
        Commands::Idle { user } => handle_idle_command(&data_dir, &user).await,
    }
}

fn handle_config_command(data_dir: &Path, command: ConfigCommand) -> Result<()> {
    let path = data_dir.join(CONFIG_FILE_NAME);
    match command {
        ConfigCommand::Show => {
            let config = ConsoleConfig::load_or_default(&path)?;
            println!("# {}", path.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                return Err(eyre!(
                    "Configuration already exists at {}. Use --force to overwrite.",
                    path.display()
                ));
            }
            ConsoleConfig::default().save(&path)?;
            println!("✅ Configuration written to {}", path.display());
        }
    }
    Ok(())
}
