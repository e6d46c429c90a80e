//! meshbridge command line.
//!
//! Offline tooling around the engine: decode tunnel frames, replay
//! recorded device traffic and print time-sync answers.

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use meshbridge_core::logging::{init_logging, LogOptions};
use meshbridge_core::time::SyncEpoch;
use meshbridge_core::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "meshbridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Engine config file (TOML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Print compact JSON instead of pretty JSON.
    #[arg(long, global = true)]
    compact: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a datapoint tunnel payload given as hex.
    Decode {
        /// Payload bytes, e.g. "0001 01 01 0001 01".
        #[arg(required = true)]
        hex: String,
        /// The payload has no sequence header.
        #[arg(long)]
        bare: bool,
    },
    /// Replay a recorded inbound trace through a device session.
    Replay {
        /// JSON trace: an event array or {device_id, vendor, model, events}.
        #[arg(required = true)]
        trace: PathBuf,
    },
    /// Print the current time answer and sync payloads.
    Time {
        /// Fixed UTC offset in minutes instead of the local zone.
        #[arg(long, allow_hyphen_values = true)]
        offset_minutes: Option<i32>,
        /// Epoch of the proprietary sync payload.
        #[arg(long, value_enum, default_value = "unix")]
        epoch: EpochArg,
        /// Sequence number echoed in the sync response.
        #[arg(long, default_value_t = 0)]
        seq: u16,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum EpochArg {
    Unix,
    Y2000,
}

impl From<EpochArg> for SyncEpoch {
    fn from(arg: EpochArg) -> Self {
        match arg {
            EpochArg::Unix => SyncEpoch::Unix,
            EpochArg::Y2000 => SyncEpoch::Y2000,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let env_options = LogOptions::from_env();
    init_logging(&LogOptions {
        json: args.json_logs || env_options.json,
        verbose: args.verbose,
    });

    let output = match args.command {
        Command::Decode { hex, bare } => commands::decode(&hex, bare)?,
        Command::Replay { trace } => {
            let config = EngineConfig::load(args.config.as_deref())
                .context("failed to load engine config")?;
            let trace = commands::Trace::from_file(&trace)?;
            commands::replay(trace, &config)?
        }
        Command::Time {
            offset_minutes,
            epoch,
            seq,
        } => commands::time(offset_minutes, epoch.into(), seq, chrono::Utc::now())?,
    };

    let rendered = if args.compact {
        serde_json::to_string(&output)?
    } else {
        serde_json::to_string_pretty(&output)?
    };
    println!("{}", rendered);
    Ok(())
}
