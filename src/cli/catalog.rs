use clap::Args;

use super::CliContext;
use flow_studio::registry::{ActionCategory, ActionDefinitionRegistry};

#[derive(Args, Debug)]
pub struct CatalogArgs {
    /// Only show `app` or `internal` actions
    #[arg(long)]
    pub category: Option<ActionCategory>,

    /// Case-insensitive filter on id, name and key
    #[arg(long)]
    pub search: Option<String>,
}

pub async fn execute(args: CatalogArgs, _context: &CliContext) -> anyhow::Result<()> {
    let registry = ActionDefinitionRegistry::builtin();
    let definitions = registry
        .search(args.search.as_deref().unwrap_or_default())
        .into_iter()
        .filter(|d| args.category.is_none_or(|c| d.category == c));

    for def in definitions {
        println!(
            "{:<9} {:<10} {:<18} {:<10} {}",
            def.category,
            def.subcategory.as_deref().unwrap_or("-"),
            def.key,
            format!("{:?}", def.kind).to_lowercase(),
            def.name
        );
    }
    Ok(())
}
