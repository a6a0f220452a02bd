// src/schema.rs

use std::{fs, path::Path};

use anyhow::Error;
use schemars::schema_for;
use tracing::info;

use crate::flow::Flow;
use crate::registry::ActionDefinition;

pub const FLOW_SCHEMA_FILE: &str = "flow.schema.json";
pub const ACTION_DEFINITION_SCHEMA_FILE: &str = "action-definition.schema.json";

/// Writes the JSON schemas of the flow document and of catalog entries into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(out_dir)?;

    let flow_schema = schema_for!(Flow);
    fs::write(
        out_dir.join(FLOW_SCHEMA_FILE),
        serde_json::to_string_pretty(&flow_schema)?,
    )?;

    let definition_schema = schema_for!(ActionDefinition);
    fs::write(
        out_dir.join(ACTION_DEFINITION_SCHEMA_FILE),
        serde_json::to_string_pretty(&definition_schema)?,
    )?;

    info!(out_dir = %out_dir.display(), "schemas written");
    Ok(())
}
