use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mountdb::commands::{self, Command};
use mountdb::{boot, BootConfig, BootError, DefaultFactory};

/// mountdb - inspect a mounted object namespace
#[derive(Parser, Debug)]
#[command(name = "mountdb")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Boot configuration file (JSON)
    #[arg(long, conflicts_with = "host")]
    config: Option<PathBuf>,

    /// Host directory mounted at /Volumes/Host under an in-memory root
    #[arg(long)]
    host: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

fn run(args: Args) -> Result<(), BootError> {
    let config = match (&args.config, args.host) {
        (Some(file), _) => BootConfig::load(file)?,
        (None, Some(dir)) => BootConfig::default_layout(dir),
        (None, None) => BootConfig::default_layout("."),
    };
    let manager = boot(&config, DefaultFactory::new())?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let result = commands::execute(&manager, &args.command, &mut out);
    // Flush snapshots and release handles even when the command failed.
    let closed = manager.close();
    out.flush().map_err(mountdb::Error::from)?;
    result?;
    closed?;
    Ok(())
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env("MOUNTDB_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
