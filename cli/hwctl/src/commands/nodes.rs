//! Node commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use hwmgr::resources::Node;
use serde::Serialize;
use tabled::Tabled;

use crate::error::CliError;
use crate::output::print_output;

use super::CommandContext;

/// Node commands.
#[derive(Debug, Args)]
pub struct NodesCommand {
    #[command(subcommand)]
    command: NodesSubcommand,
}

#[derive(Debug, Subcommand)]
enum NodesSubcommand {
    /// List allocated nodes.
    List(ListNodesArgs),
}

#[derive(Debug, Args)]
struct ListNodesArgs {
    /// Only nodes of this pool (cloud ID).
    #[arg(long)]
    pool: Option<String>,
}

impl NodesCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            NodesSubcommand::List(args) => list_nodes(ctx, args).await,
        }
    }
}

#[derive(Debug, Clone, Serialize, Tabled)]
struct NodeRow {
    #[tabled(rename = "Name")]
    name: String,

    #[tabled(rename = "Pool")]
    pool: String,

    #[tabled(rename = "Group")]
    group: String,

    #[tabled(rename = "Profile")]
    profile: String,

    #[tabled(rename = "Owner", display = "display_option")]
    owner: Option<String>,
}

fn display_option(opt: &Option<String>) -> String {
    opt.as_deref().unwrap_or("-").to_string()
}

impl From<&Node> for NodeRow {
    fn from(node: &Node) -> Self {
        Self {
            name: node.metadata.name.clone(),
            pool: node.spec.node_pool.to_string(),
            group: node.spec.group_name.to_string(),
            profile: node.spec.hw_profile.to_string(),
            owner: node
                .metadata
                .owner_references
                .iter()
                .find(|r| r.controller)
                .map(|r| format!("{}/{}", r.kind, r.name)),
        }
    }
}

async fn list_nodes(ctx: CommandContext, args: ListNodesArgs) -> Result<()> {
    let mut nodes: Vec<Node> = ctx
        .client()?
        .list(&ctx.namespace)
        .await
        .map_err(CliError::from)?;
    if let Some(pool) = args.pool.as_deref() {
        nodes.retain(|n| n.spec.node_pool.as_str() == pool);
    }

    let rows: Vec<NodeRow> = nodes.iter().map(NodeRow::from).collect();
    print_output(&rows, &nodes, ctx.format);
    Ok(())
}
