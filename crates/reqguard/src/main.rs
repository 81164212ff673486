use clap::Parser;
use color_eyre::Result;
#[cfg(not(windows))]
use jemallocator::Jemalloc;
#[cfg(windows)]
use mimalloc::MiMalloc;
use reqguard_cli::{Cli, Commands, handle_command, init_tracing};

#[cfg(windows)]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = Cli::parse();
    // Without a subcommand, report the lock status.
    let cmd = cli.command.unwrap_or(Commands::Status);
    if let Err(err) = handle_command(cmd, cli.data_dir).await {
        eprintln!("❌ Error: {err}");
        std::process::exit(1);
    }
    Ok(())
}
