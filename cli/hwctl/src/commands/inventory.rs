//! Inventory commands: the hardware catalog and its allocation.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};
use hwmgr::allocation::{free_nodes, HardwareCatalog, Inventory};
use serde::Serialize;
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{print_output, print_success};

use super::{read_yaml, CommandContext};

/// Inventory commands.
#[derive(Debug, Args)]
pub struct InventoryCommand {
    #[command(subcommand)]
    command: InventorySubcommand,
}

#[derive(Debug, Subcommand)]
enum InventorySubcommand {
    /// Load the hardware catalog from a YAML file, replacing the current one.
    ///
    /// Existing allocations are kept.
    Load(LoadArgs),

    /// Show hardware profiles with their assigned and free node counts.
    Show,
}

#[derive(Debug, Args)]
struct LoadArgs {
    /// Catalog file (a `profiles` list of `name` and `nodes`).
    file: PathBuf,
}

impl InventoryCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            InventorySubcommand::Load(args) => load(ctx, args).await,
            InventorySubcommand::Show => show(ctx).await,
        }
    }
}

#[derive(Debug, Clone, Serialize, Tabled)]
struct ProfileRow {
    #[tabled(rename = "Profile")]
    profile: String,

    #[tabled(rename = "Nodes")]
    nodes: usize,

    #[tabled(rename = "Assigned")]
    assigned: usize,

    #[tabled(rename = "Free")]
    free: usize,
}

fn profile_rows(inventory: &Inventory) -> Vec<ProfileRow> {
    inventory
        .catalog
        .profiles
        .iter()
        .map(|profile| {
            let declared: HashSet<_> = profile.nodes.iter().collect();
            let free = free_nodes(&inventory.catalog, &inventory.allocations, &profile.name).len();
            ProfileRow {
                profile: profile.name.to_string(),
                nodes: declared.len(),
                assigned: declared.len().saturating_sub(free),
                free,
            }
        })
        .collect()
}

async fn load(ctx: CommandContext, args: LoadArgs) -> Result<()> {
    let catalog: HardwareCatalog = read_yaml(&args.file)?;
    let nodes: usize = catalog.profiles.iter().map(|p| p.nodes.len()).sum();

    ctx.allocation_store()?
        .save_catalog(&catalog)
        .await
        .map_err(CliError::from)?;

    print_success(&format!(
        "Loaded {} profile(s) with {} node(s) into {}",
        catalog.profiles.len(),
        nodes,
        ctx.namespace
    ));
    Ok(())
}

async fn show(ctx: CommandContext) -> Result<()> {
    let inventory = ctx
        .allocation_store()?
        .load()
        .await
        .map_err(CliError::from)?;

    let json = serde_json::json!({
        "hwprofiles": inventory.catalog,
        "allocated": inventory.allocations,
    });
    print_output(&profile_rows(&inventory), &json, ctx.format);
    Ok(())
}
