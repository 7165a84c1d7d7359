//! `capline` — record a synthetic source to Matroska, play it back, or
//! list the devices the engine can use.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{CmdDevices, CmdPlay, CmdRecord};

#[derive(Parser, Debug)]
#[command(name = "capline")]
#[command(version)]
#[command(about = "Capture, encode and play back audio/video streams")]
struct Cli {
    /// JSON file with `pipeline`, `encoder`, `player` and `generator` sections
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encode the test-pattern source into a file
    Record(CmdRecord),
    /// Play the test-pattern source through the audio-clocked player
    Play(CmdPlay),
    /// List acceleration devices and audio outputs
    Devices(CmdDevices),
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = config::CliConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Record(cmd) => cmd.run(config),
        Command::Play(cmd) => cmd.run(config),
        Command::Devices(cmd) => cmd.run(),
    }
}
