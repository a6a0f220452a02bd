mod cli;

use std::path::PathBuf;

use clap::Parser;
use cli::{Cli, CliContext, execute, resolve_root_dir};
use flow_studio::config::{ConfigManager, EnvConfigManager};
use flow_studio::logger::{LogConfig, init_tracing};
use tracing::{error, info};

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // .env next to the working directory may point FLOW_STUDIO_ROOT elsewhere
    let config_manager = ConfigManager(EnvConfigManager::new(PathBuf::from(".env")));
    let root = resolve_root_dir();

    let _log = init_tracing(
        &root,
        &LogConfig {
            log_level: cli.log_level.clone(),
            json: cli.log_json,
            ..LogConfig::default()
        },
    )?;
    info!(root = %root.display(), "flow-studio starting");

    let context = CliContext::new(root, config_manager).await?;
    let result = execute(&context, cli.command).await;
    context.flows.shutdown().await;

    if let Err(err) = &result {
        error!("{err:#}");
    }
    result
}
