//! `reelflow workflows`: list workflow templates.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use reelflow_core::workflow::definition::discover_workflows;

use super::truncate;
use crate::state::AppState;

pub fn list_workflows(state: &AppState, json: bool) -> Result<()> {
    let workflows = discover_workflows(&state.workflows_dir).with_context(|| {
        format!("Failed to read workflows in {}", state.workflows_dir.display())
    })?;

    if json {
        let out: Vec<serde_json::Value> = workflows
            .iter()
            .map(|(path, def)| {
                serde_json::json!({
                    "name": def.name,
                    "path": path,
                    "description": def.description,
                    "key_inputs": def.key_inputs,
                    "steps": def.steps.iter().map(|s| &s.id).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if workflows.is_empty() {
        println!();
        println!(
            "  No workflows in {}",
            style(state.workflows_dir.display()).dim()
        );
        println!("  Add a YAML template there, or pass a file path to `reelflow create`.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Name").fg(Color::White),
        Cell::new("Steps").fg(Color::White),
        Cell::new("Key Inputs").fg(Color::White),
        Cell::new("Description").fg(Color::White),
    ]);

    for (_, def) in &workflows {
        table.add_row(vec![
            Cell::new(&def.name).fg(Color::Cyan),
            Cell::new(def.steps.len()),
            Cell::new(def.key_inputs.join(", ")),
            Cell::new(truncate(def.description.as_deref().unwrap_or_default(), 60)),
        ]);
    }

    println!("{table}");
    Ok(())
}
