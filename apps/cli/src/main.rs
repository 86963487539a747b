//! assetcat CLI: versioned asset catalog.
//!
//! Scans configured sources, runs processing units over what they find, and
//! records every observation as an append-only fact.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
