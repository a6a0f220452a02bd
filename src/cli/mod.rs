use std::env;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod catalog;
pub mod config;
pub mod edge;
pub mod flow;
pub mod instance;
pub mod node;
pub mod schema;

use catalog::CatalogArgs;
use config::ConfigArgs;
use edge::EdgeArgs;
use flow::FlowArgs;
use instance::InstanceArgs;
use node::NodeArgs;
use schema::SchemaArgs;

use flow_studio::config::{ConfigManager, STUDIO_ROOT, SessionConfig};
use flow_studio::error::FlowResult;
use flow_studio::flow::manager::FlowManager;
use flow_studio::flow::session::FlowEditingSession;
use flow_studio::flow::store::FileFlowStore;

#[derive(Parser, Debug)]
#[command(
    name = "flow-studio",
    about = "Edit conversational automation flows from the terminal",
    version
)]
pub struct Cli {
    /// Log level for stderr and the log file (e.g. error, warn, info, debug)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Write the log file as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create, list and move whole flows
    Flow(FlowArgs),

    /// Add, move and remove nodes
    Node(NodeArgs),

    /// Connect and disconnect nodes
    Edge(EdgeArgs),

    /// Manage provider instances in the flow settings
    Instance(InstanceArgs),

    /// Browse the action catalog
    Catalog(CatalogArgs),

    /// Emit JSON-Schema
    Schema(SchemaArgs),

    /// Handle configuration
    Config(ConfigArgs),
}

#[derive(Clone)]
pub struct CliContext {
    pub root: PathBuf,
    pub config_manager: ConfigManager,
    pub flows: FlowManager,
}

impl CliContext {
    pub async fn new(root: PathBuf, config_manager: ConfigManager) -> anyhow::Result<Self> {
        let store = FileFlowStore::open(root.join("flows")).await?;
        let session_config = SessionConfig::from_config(&config_manager).await;
        Ok(Self {
            flows: FlowManager::new(store, session_config),
            root,
            config_manager,
        })
    }

    /// Opens the flow, applies `edit`, writes the result and closes the session.
    pub async fn edit<T>(
        &self,
        flow_id: &str,
        edit: impl FnOnce(&FlowEditingSession) -> FlowResult<T>,
    ) -> anyhow::Result<T> {
        let session = self.flows.open(flow_id).await?;
        let out = edit(&session);
        let out = match out {
            Ok(out) => out,
            Err(err) => {
                self.flows.close(flow_id).await?;
                return Err(err.into());
            }
        };
        session.flush().await?;
        self.flows.close(flow_id).await?;
        Ok(out)
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Flow(args) => flow::execute(args, context).await,
        Commands::Node(args) => node::execute(args, context).await,
        Commands::Edge(args) => edge::execute(args, context).await,
        Commands::Instance(args) => instance::execute(args, context).await,
        Commands::Catalog(args) => catalog::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
        Commands::Config(args) => config::execute(args, context).await,
    }
}

/// Resolve the studio root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var(STUDIO_ROOT) {
        PathBuf::from(path)
    } else {
        PathBuf::from("./flow-studio")
    }
}
