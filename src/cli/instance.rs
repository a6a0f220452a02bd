use clap::{Args, Subcommand};

use super::CliContext;
use flow_studio::instance::{
    AssistantCredentials, Credentials, Instance, ModelSettings, Provider, WhatsAppCredentials,
};

#[derive(Args, Debug)]
pub struct InstanceArgs {
    #[command(subcommand)]
    pub command: InstanceCommands,
}

#[derive(Subcommand, Debug)]
pub enum InstanceCommands {
    List { flow: String },
    /// Add a WhatsApp number
    AddWhatsapp {
        flow: String,
        name: String,
        #[arg(long, default_value = "")]
        api_key: String,
        /// Sender phone number
        #[arg(long, default_value = "")]
        source: String,
        #[arg(long, default_value = "")]
        app_name: String,
        #[arg(long, default_value = "")]
        webhook: String,
    },
    /// Add an AI assistant
    AddAssistant {
        flow: String,
        name: String,
        #[arg(long, default_value = "")]
        app: String,
        #[arg(long, default_value = "")]
        assistant_id: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        temperature: Option<f64>,
    },
    /// Remove the instance at `index` (see `instance list`)
    Remove { flow: String, index: usize },
    /// Switch an instance to another provider, resetting its credentials
    Provider {
        flow: String,
        index: usize,
        provider: Provider,
    },
}

pub async fn execute(args: InstanceArgs, context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        InstanceCommands::List { flow } => {
            let session = context.flows.open(&flow).await?;
            let instances = session.instances();
            context.flows.close(&flow).await?;
            if instances.is_empty() {
                println!("No instances configured.");
            }
            for (index, instance) in instances.iter().enumerate() {
                let status = instance
                    .status
                    .map(|s| format!("{s:?}").to_lowercase())
                    .unwrap_or_else(|| "-".to_string());
                println!("{index:>3}  {:<10}  {:<10}  {}", instance.provider(), status, instance.name);
            }
            Ok(())
        }
        InstanceCommands::AddWhatsapp {
            flow,
            name,
            api_key,
            source,
            app_name,
            webhook,
        } => {
            let credentials = Credentials::Whatsapp(WhatsAppCredentials {
                api_key,
                source,
                app_name,
                webhook,
                ..Default::default()
            });
            add(context, &flow, Instance::new(name, credentials)).await
        }
        InstanceCommands::AddAssistant {
            flow,
            name,
            app,
            assistant_id,
            model,
            temperature,
        } => {
            let defaults = ModelSettings::default();
            let credentials = Credentials::Assistant(AssistantCredentials {
                app,
                idassistente: assistant_id,
                model: ModelSettings {
                    name: model.unwrap_or(defaults.name),
                    temperature: temperature.unwrap_or(defaults.temperature),
                },
                ..Default::default()
            });
            add(context, &flow, Instance::new(name, credentials)).await
        }
        InstanceCommands::Remove { flow, index } => {
            let removed = context
                .edit(&flow, |session| session.remove_instance_at(index))
                .await?;
            println!("✅ Instance `{}` removed.", removed.name);
            Ok(())
        }
        InstanceCommands::Provider {
            flow,
            index,
            provider,
        } => {
            context
                .edit(&flow, |session| session.change_instance_provider(index, provider))
                .await?;
            println!("✅ Instance {index} now uses {provider} with default credentials.");
            Ok(())
        }
    }
}

async fn add(context: &CliContext, flow: &str, instance: Instance) -> anyhow::Result<()> {
    let label = format!("{} ({})", instance.name, instance.provider());
    context
        .edit(flow, |session| session.add_instance(instance))
        .await?;
    println!("✅ Instance {label} added.");
    Ok(())
}
