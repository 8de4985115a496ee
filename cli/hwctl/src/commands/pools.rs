//! NodePool commands.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};
use hwmgr::controller::PoolState;
use hwmgr::resources::{NodePool, ObjectKey};
use hwmgr::store::WriteMode;
use serde::Serialize;
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{print_info, print_output, print_single, print_success};

use super::{read_yaml, CommandContext};

/// NodePool commands.
#[derive(Debug, Args)]
pub struct PoolsCommand {
    #[command(subcommand)]
    command: PoolsSubcommand,
}

#[derive(Debug, Subcommand)]
enum PoolsSubcommand {
    /// Create or update a NodePool from a YAML file.
    Apply(ApplyArgs),

    /// List NodePools.
    List,

    /// Get NodePool details.
    Get(PoolArgs),

    /// Request deletion of a NodePool.
    ///
    /// The controller releases its nodes before the pool disappears.
    Delete(PoolArgs),
}

#[derive(Debug, Args)]
struct ApplyArgs {
    /// NodePool manifest (`metadata` and `spec`).
    file: PathBuf,
}

#[derive(Debug, Args)]
struct PoolArgs {
    /// NodePool name.
    name: String,
}

impl PoolsCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            PoolsSubcommand::Apply(args) => apply(ctx, args).await,
            PoolsSubcommand::List => list(ctx).await,
            PoolsSubcommand::Get(args) => get(ctx, args).await,
            PoolsSubcommand::Delete(args) => delete(ctx, args).await,
        }
    }
}

#[derive(Debug, Clone, Serialize, Tabled)]
struct PoolRow {
    #[tabled(rename = "Name")]
    name: String,

    #[tabled(rename = "Cloud ID")]
    cloud_id: String,

    #[tabled(rename = "State")]
    state: String,

    #[tabled(rename = "Groups")]
    groups: String,

    #[tabled(rename = "Nodes")]
    nodes: usize,
}

impl From<&NodePool> for PoolRow {
    fn from(pool: &NodePool) -> Self {
        let mut state = format!("{:?}", PoolState::from_conditions(&pool.status.conditions));
        if pool.metadata.is_deleting() {
            state.push_str(" (deleting)");
        }
        let groups = pool
            .spec
            .node_group
            .iter()
            .map(|g| format!("{}={}x{}", g.name, g.hw_profile, g.size))
            .collect::<Vec<_>>()
            .join(",");
        Self {
            name: pool.metadata.name.clone(),
            cloud_id: pool.spec.cloud_id.to_string(),
            state,
            groups,
            nodes: pool.status.properties.node_names.len(),
        }
    }
}

async fn apply(ctx: CommandContext, args: ApplyArgs) -> Result<()> {
    let mut pool: NodePool = read_yaml(&args.file)?;
    if pool.metadata.namespace.is_empty() {
        pool.metadata.namespace = ctx.namespace.clone();
    }

    let client = ctx.client()?;
    let existed = client.get_opt::<NodePool>(&pool.metadata.key()).await?.is_some();
    let written = client
        .create_or_update(&pool, None, WriteMode::Patch)
        .await
        .map_err(CliError::from)?;

    let verb = if existed { "Updated" } else { "Created" };
    print_success(&format!(
        "{verb} NodePool {} (generation {})",
        written.metadata.key(),
        written.metadata.generation
    ));
    Ok(())
}

async fn list(ctx: CommandContext) -> Result<()> {
    let pools: Vec<NodePool> = ctx
        .client()?
        .list(&ctx.namespace)
        .await
        .map_err(CliError::from)?;
    let rows: Vec<PoolRow> = pools.iter().map(PoolRow::from).collect();
    print_output(&rows, &pools, ctx.format);
    Ok(())
}

async fn get(ctx: CommandContext, args: PoolArgs) -> Result<()> {
    let key = ObjectKey::new(ctx.namespace.clone(), args.name.clone());
    let pool: NodePool = ctx
        .client()?
        .get_opt(&key)
        .await
        .map_err(CliError::from)?
        .ok_or_else(|| CliError::NotFound(format!("NodePool '{}'", args.name)))?;

    print_single(&pool, ctx.format);
    Ok(())
}

async fn delete(ctx: CommandContext, args: PoolArgs) -> Result<()> {
    let key = ObjectKey::new(ctx.namespace.clone(), args.name.clone());
    let client = ctx.client()?;

    if !client.delete::<NodePool>(&key).await.map_err(CliError::from)? {
        return Err(CliError::NotFound(format!("NodePool '{}'", args.name)).into());
    }

    match client.get_opt::<NodePool>(&key).await.map_err(CliError::from)? {
        Some(_) => {
            print_success(&format!("Deletion of NodePool {key} requested"));
            print_info("Nodes are released on the controller's next pass");
        }
        None => print_success(&format!("Deleted NodePool {key}")),
    }
    Ok(())
}
