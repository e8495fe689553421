//! Command line argument parsing
//!
//! Subcommands:
//! - `run`: start the coordinator loop against a device inventory file
//! - `show-config`: print the effective configuration as TOML
//! - `validate`: parse and validate a configuration file

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "oltpoll")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Coordinates periodic polling of OLT fleets")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the coordinator loop
    Run {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Device inventory file (JSON list of device refs)
        #[arg(short = 'd', long = "devices")]
        devices: Option<PathBuf>,
        /// Start in simulation mode (mock polling client)
        #[arg(long = "simulate")]
        simulate: bool,
        /// Flush the event log to this JSONL file on shutdown
        #[arg(long = "event-log", value_name = "FILE")]
        event_log: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML
    ShowConfig {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
    /// Parse and validate a configuration file
    Validate {
        /// Configuration file path
        config: PathBuf,
    },
}
