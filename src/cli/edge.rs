use clap::{Args, Subcommand};

use super::CliContext;
use flow_studio::flow::Connection;

#[derive(Args, Debug)]
pub struct EdgeArgs {
    #[command(subcommand)]
    pub command: EdgeCommands,
}

#[derive(Subcommand, Debug)]
pub enum EdgeCommands {
    /// Connect two nodes. Edges leaving a condition need `--source-handle true|false`.
    Add {
        flow: String,
        source: String,
        target: String,
        #[arg(long)]
        source_handle: Option<String>,
        #[arg(long)]
        target_handle: Option<String>,
    },
    Remove { flow: String, edge: String },
}

pub async fn execute(args: EdgeArgs, context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        EdgeCommands::Add {
            flow,
            source,
            target,
            source_handle,
            target_handle,
        } => {
            let connection = Connection {
                source,
                target,
                source_handle,
                target_handle,
            };
            let edge = context
                .edit(&flow, |session| session.add_edge(connection))
                .await?;
            println!("✅ Edge {} connects {} to {}.", edge.id, edge.source, edge.target);
            Ok(())
        }
        EdgeCommands::Remove { flow, edge } => {
            context
                .edit(&flow, |session| session.delete_edge(&edge))
                .await?;
            println!("✅ Edge {edge} removed.");
            Ok(())
        }
    }
}
