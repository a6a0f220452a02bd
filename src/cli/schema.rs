use std::path::PathBuf;

use clap::Args;

use super::CliContext;
use flow_studio::schema::write_schema;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Output directory. Default: `<root>/schemas`
    #[arg(long)]
    pub out: Option<PathBuf>,
}

pub async fn execute(args: SchemaArgs, context: &CliContext) -> anyhow::Result<()> {
    let out_dir = args.out.unwrap_or_else(|| context.root.join("schemas"));
    write_schema(&out_dir)?;
    println!("Schemas written to {}", out_dir.display());
    Ok(())
}
