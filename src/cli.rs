//! Command-line interface definition using clap
//!
//! Provides structured argument parsing with automatic help generation.
//! Flags are the standard clap double-dash long form (`--config`,
//! `--debug`); this is the idiomatic spelling for a Rust CLI and is kept
//! over a single-dash convention borrowed from daemons in other
//! ecosystems.

use clap::Parser;
use std::path::PathBuf;

/// Multi-channel CDR ingest daemon
#[derive(Parser, Debug)]
#[command(name = "cdr-ingestd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, value_name = "PATH", default_value = "./config.toml")]
    pub config: PathBuf,

    /// Enable debug-level logging regardless of logging.level in config
    #[arg(long)]
    pub debug: bool,

    /// Validate the configuration file and exit without starting any channel
    #[arg(long)]
    pub check_config: bool,
}
