use clap::{Args, Subcommand};

use super::CliContext;
use flow_studio::config::SessionConfig;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Set a key in the process environment and the `.env` file
    Set { key: String, value: String },
    Delete { key: String },
    /// Print the effective save settings
    Show,
}

pub async fn execute(args: ConfigArgs, context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        ConfigCommands::Set { key, value } => {
            match context.config_manager.0.set(&key, &value).await {
                Ok(_) => println!("✅ Config updated."),
                Err(err) => eprintln!("❌ Config could not be updated: {err}"),
            }
            Ok(())
        }
        ConfigCommands::Delete { key } => {
            context.config_manager.0.del(&key).await;
            println!("✅ Config {key} deleted.");
            Ok(())
        }
        ConfigCommands::Show => {
            let session = SessionConfig::from_config(&context.config_manager).await;
            println!("root:             {}", context.root.display());
            println!("save debounce:    {} ms", session.debounce.as_millis());
            println!("save attempts:    {}", session.retry.max_attempts);
            println!(
                "backoff:          {} ms, up to {} ms",
                session.retry.initial_backoff.as_millis(),
                session.retry.max_backoff.as_millis()
            );
            Ok(())
        }
    }
}
