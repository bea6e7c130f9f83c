//! `steps`: print per-profile step tables

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use stepflow::{Profile, StepTable};

use crate::Context;
use crate::ui;

#[derive(Serialize)]
struct Row {
    position: u32,
    step: &'static str,
    tool_index: u32,
    description: &'static str,
}

fn rows(table: &StepTable) -> Vec<Row> {
    table
        .entries()
        .iter()
        .map(|e| Row {
            position: e.position,
            step: e.kind.as_str(),
            tool_index: e.tool_index,
            description: e.description,
        })
        .collect()
}

fn selected(profile: Option<&str>) -> Result<Vec<Profile>> {
    Ok(match profile {
        Some(name) => vec![name.parse::<Profile>()?],
        None => Profile::ALL.to_vec(),
    })
}

pub fn run(ctx: &Context, profile: Option<&str>, json: bool) -> Result<()> {
    let registry = provision::registry()?;
    let profiles = selected(profile)?;

    if json {
        let mut tables = serde_json::Map::new();
        for p in &profiles {
            let rows = rows(registry.table(*p)?);
            tables.insert(p.to_string(), serde_json::to_value(rows)?);
        }
        println!("{}", serde_json::to_string_pretty(&tables)?);
        return Ok(());
    }

    for p in profiles {
        let table = registry.table(p)?;
        ui::section(&format!("{} ({} steps)", p, table.len()));
        for row in rows(table) {
            println!(
                "  {:>2}  {:<26} {}  {}",
                row.position,
                row.step.bold(),
                format!("#{}", row.tool_index).dimmed(),
                if ctx.verbose > 0 { row.description } else { "" }
            );
        }
    }
    Ok(())
}
