//! CLI commands.

mod inventory;
mod nodes;
mod pools;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hwmgr::allocation::AllocationStore;
use hwmgr::config::{DEFAULT_NAMESPACE, DEFAULT_STATE_PATH};
use hwmgr::store::{Client, SqliteStore};

use crate::output::OutputFormat;

/// hwctl - inspect and drive the hardware manager's state.
#[derive(Debug, Parser)]
#[command(name = "hwctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    /// Path to the controller's state database.
    #[arg(long, global = true, env = "HWMGR_STATE_PATH", default_value = DEFAULT_STATE_PATH)]
    state_path: PathBuf,

    /// Namespace holding the inventory record, pools and nodes.
    #[arg(long, global = true, env = "HWMGR_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage the hardware inventory.
    Inventory(inventory::InventoryCommand),

    /// Manage node pool requests.
    Pools(pools::PoolsCommand),

    /// Inspect allocated nodes.
    Nodes(nodes::NodesCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let ctx = CommandContext {
            format: OutputFormat::parse(&self.format),
            state_path: self.state_path,
            namespace: self.namespace,
        };

        match self.command {
            Commands::Inventory(cmd) => cmd.run(ctx).await,
            Commands::Pools(cmd) => cmd.run(ctx).await,
            Commands::Nodes(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("hwctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub format: OutputFormat,
    pub state_path: PathBuf,
    pub namespace: String,
}

impl CommandContext {
    /// Open a client on the state database.
    pub fn client(&self) -> Result<Client> {
        let store = SqliteStore::open(&self.state_path).with_context(|| {
            format!("Failed to open state database {}", self.state_path.display())
        })?;
        Ok(Client::new(Arc::new(store)))
    }

    pub fn allocation_store(&self) -> Result<AllocationStore> {
        Ok(AllocationStore::new(self.client()?, self.namespace.clone()))
    }
}

/// Read a YAML file into `T`.
pub(crate) fn read_yaml<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Result<T> {
    use crate::error::CliError;

    let text = std::fs::read_to_string(path).map_err(|source| CliError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    let value = serde_yaml::from_str(&text).map_err(|source| CliError::Manifest {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(value)
}
