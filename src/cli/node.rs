use clap::{Args, Subcommand};

use super::CliContext;
use flow_studio::factory::{NodeFactory, ViewportTransform};
use flow_studio::flow::Position;
use flow_studio::registry::{ActionCategory, ActionDefinitionRegistry};

#[derive(Args, Debug)]
pub struct NodeArgs {
    #[command(subcommand)]
    pub command: NodeCommands,
}

#[derive(Subcommand, Debug)]
pub enum NodeCommands {
    /// Add a node from the catalog, e.g. `node add <flow> app send_message --subcategory whatsapp`
    Add {
        flow: String,
        category: ActionCategory,
        key: String,
        #[arg(long)]
        subcategory: Option<String>,
        #[arg(long, requires = "y")]
        x: Option<f64>,
        #[arg(long, requires = "x")]
        y: Option<f64>,
    },
    /// Remove a node together with its edges
    Remove { flow: String, node: String },
    Move {
        flow: String,
        node: String,
        x: f64,
        y: f64,
    },
    /// Mark a node as the end of the conversation, or clear the mark
    Stop {
        flow: String,
        node: String,
        #[arg(long)]
        clear: bool,
    },
}

pub async fn execute(args: NodeArgs, context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        NodeCommands::Add {
            flow,
            category,
            key,
            subcategory,
            x,
            y,
        } => {
            let position = x.zip(y).map(|(x, y)| Position::new(x, y));
            let node = NodeFactory::create_from_registry(
                ActionDefinitionRegistry::builtin(),
                category,
                subcategory.as_deref(),
                &key,
                position,
                &ViewportTransform::default(),
            )?;
            let id = node.id.clone();
            context.edit(&flow, |session| session.add_node(node)).await?;
            println!("✅ Node {id} added.");
            Ok(())
        }
        NodeCommands::Remove { flow, node } => {
            context
                .edit(&flow, |session| session.delete_node(&node))
                .await?;
            println!("✅ Node {node} and its edges removed.");
            Ok(())
        }
        NodeCommands::Move { flow, node, x, y } => {
            context
                .edit(&flow, |session| session.move_node(&node, Position::new(x, y)))
                .await?;
            println!("✅ Node {node} moved to ({x}, {y}).");
            Ok(())
        }
        NodeCommands::Stop { flow, node, clear } => {
            context
                .edit(&flow, |session| {
                    session.apply_node_change(flow_studio::flow::graph::NodeChange::SetStop {
                        id: node.clone(),
                        stop: !clear,
                    })
                })
                .await?;
            println!("✅ Node {node} updated.");
            Ok(())
        }
    }
}
