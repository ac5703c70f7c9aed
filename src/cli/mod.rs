//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{BarriersCommand, HistoryCommand, RunCommand, ValidateCommand};
use std::ffi::OsString;

/// Execution engine for compiled pipeline plans
#[derive(Debug, Parser, Clone)]
#[command(name = "pipeline-engine")]
#[command(version = "0.1.0")]
#[command(about = "Run and inspect compiled pipeline plans", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Dry-run a plan with the built-in step types
    Run(RunCommand),

    /// Validate a plan document
    Validate(ValidateCommand),

    /// Show the barriers of a plan and the nodes taking part
    Barriers(BarriersCommand),

    /// Show run history
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
