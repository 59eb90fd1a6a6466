// ABOUTME: Command implementations for the CLI
// ABOUTME: Each command validates its arguments, runs its sequence and prints the run summary

pub mod install;
pub mod test_replication;

pub use install::{install, InstallArgs};
pub use test_replication::{test_replication, TestArgs};

use anyhow::Result;

use crate::outcome::RunSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

pub fn print_summary(summary: &RunSummary, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{}", summary),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(summary)?),
    }
    Ok(())
}
