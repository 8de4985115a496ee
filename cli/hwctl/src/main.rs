//! hwctl - operator CLI for the hardware manager
//!
//! Reads and writes the controller's local state database directly: the
//! hardware inventory, NodePool requests and the Nodes allocated to them.

use anyhow::Result;
use clap::Parser;

mod commands;
mod error;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
