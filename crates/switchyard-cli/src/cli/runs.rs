//! `syard runs` and `syard show`.

use anyhow::{Result, anyhow};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use super::graph::print_run;
use super::{parse_run_id, run_status_color};
use crate::state::AppState;

pub async fn handle_list(limit: usize, state: &AppState, json: bool) -> Result<()> {
    let runs = state
        .engine
        .runs()
        .list_boxed(limit)
        .await
        .map_err(|e| anyhow!("Failed to list runs: {e}"))?;

    if json {
        let out: Vec<_> = runs
            .iter()
            .map(|r| {
                serde_json::json!({
                    "run_id": r.run_id.to_string(),
                    "graph": r.graph_name,
                    "status": r.status.as_str(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs recorded.");
        println!("  Start one with: {}", style("syard run <graph.json>").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run").fg(Color::Cyan),
            Cell::new("Graph"),
            Cell::new("Status"),
        ]);
    for r in &runs {
        table.add_row(vec![
            Cell::new(r.run_id),
            Cell::new(&r.graph_name),
            Cell::new(r.status.as_str()).fg(run_status_color(r.status)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn handle_show(run_id: &str, state: &AppState, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let run = state
        .engine
        .run_state(run_id)
        .await?
        .ok_or_else(|| anyhow!("Run {run_id} not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&run);
        if let Some(failure) = &run.failure {
            println!(
                "  Failed at '{}': {}",
                style(&failure.step_id).yellow(),
                failure.error
            );
            println!(
                "  Analyze with: {}",
                style(format!("syard recover analyze {run_id}")).dim()
            );
            println!();
        }
    }
    Ok(())
}
