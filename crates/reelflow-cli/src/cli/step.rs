//! `reelflow steps`: list registered steps.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use crate::state::AppState;

pub fn list_steps(state: &AppState, json: bool) -> Result<()> {
    let steps = state.executor.registry().list();

    if json {
        println!("{}", serde_json::to_string_pretty(&steps)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Step").fg(Color::White),
        Cell::new("Source").fg(Color::White),
        Cell::new("Idempotent").fg(Color::White),
    ]);

    for step in &steps {
        let command = state
            .config
            .steps
            .iter()
            .find(|c| c.name == step.name)
            .map(|c| c.program.as_str());
        let idempotent = if step.idempotent {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::Yellow)
        };
        table.add_row(vec![
            Cell::new(&step.name),
            Cell::new(command.unwrap_or("built-in")),
            idempotent,
        ]);
    }

    println!("{table}");
    println!(
        "  Command steps are declared in {}",
        style(state.data_dir.join("config.toml").display()).dim()
    );
    Ok(())
}
