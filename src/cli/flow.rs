use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Subcommand};

use super::CliContext;
use flow_studio::flow::FlowStatus;
use flow_studio::flow::store::FlowStore;

#[derive(Args, Debug)]
pub struct FlowArgs {
    #[command(subcommand)]
    pub command: FlowCommands,
}

#[derive(Subcommand, Debug)]
pub enum FlowCommands {
    /// Create an empty draft flow
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    List,
    /// Print the whole flow document
    Show { id: String },
    Delete { id: String },
    Rename { id: String, name: String },
    /// Set the status to draft, active or inactive
    Status { id: String, status: FlowStatus },
    /// Replace nodes and edges with a JSON or YAML graph document
    Import { id: String, file: PathBuf },
    /// Print nodes, edges and settings as JSON
    Export {
        id: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

pub async fn execute(args: FlowArgs, context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        FlowCommands::Create { name, description } => {
            let flow = context.flows.create_flow(&name, description).await?;
            println!("✅ Flow `{}` created with id {}", flow.name, flow.id);
            Ok(())
        }
        FlowCommands::List => {
            let flows = context.flows.list_flows().await?;
            if flows.is_empty() {
                println!("No flows yet. Create one with `flow-studio flow create <name>`.");
            }
            for flow in flows {
                println!(
                    "{}  {:<8}  v{:<4}  {}",
                    flow.id,
                    format!("{:?}", flow.status).to_lowercase(),
                    flow.version,
                    flow.name
                );
            }
            Ok(())
        }
        FlowCommands::Show { id } => {
            let flow = context.flows.store().get_flow(&id).await?;
            println!("{}", serde_json::to_string_pretty(&flow)?);
            Ok(())
        }
        FlowCommands::Delete { id } => {
            context.flows.delete_flow(&id).await?;
            println!("✅ Flow {id} deleted.");
            Ok(())
        }
        FlowCommands::Rename { id, name } => {
            context.edit(&id, |session| session.rename(name)).await?;
            println!("✅ Flow {id} renamed.");
            Ok(())
        }
        FlowCommands::Status { id, status } => {
            context.edit(&id, |session| session.set_status(status)).await?;
            println!("✅ Flow {id} is now {status:?}.");
            Ok(())
        }
        FlowCommands::Import { id, file } => {
            let text = fs::read_to_string(&file)
                .with_context(|| format!("could not read {}", file.display()))?;
            context
                .edit(&id, |session| session.import_graph(&text))
                .await?;
            println!("✅ Graph from {} imported into {id}.", file.display());
            Ok(())
        }
        FlowCommands::Export { id, out } => {
            let session = context.flows.open(&id).await?;
            let text = session.export_graph()?;
            context.flows.close(&id).await?;
            match out {
                Some(path) => {
                    fs::write(&path, text)?;
                    println!("✅ Graph written to {}", path.display());
                }
                None => println!("{text}"),
            }
            Ok(())
        }
    }
}
