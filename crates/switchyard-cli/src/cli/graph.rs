//! `syard validate` and `syard run`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use switchyard_core::graph::validate;
use switchyard_infra::sandbox::output::into_items;
use switchyard_types::config::EngineConfig;
use switchyard_types::graph::Graph;
use switchyard_types::item::Item;
use switchyard_types::run::{RunState, RunStatus};
use switchyard_types::trigger::TriggerEvent;

use super::step_status_label;
use crate::state::{AppState, build_registry};

// ---------------------------------------------------------------------------
// File loading
// ---------------------------------------------------------------------------

pub async fn load_graph(path: &Path) -> Result<Graph> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read graph file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid graph JSON in {}", path.display()))
}

/// Seed items from a JSON file. Without a file the run gets one empty item.
pub async fn load_items(path: Option<&Path>) -> Result<Vec<Item>> {
    let Some(path) = path else {
        return Ok(vec![Item::empty()]);
    };
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read input file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid input JSON in {}", path.display()))?;
    Ok(into_items(value))
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub async fn handle_validate(file: &Path, config: &EngineConfig, json: bool) -> Result<()> {
    let graph = load_graph(file).await?;
    let registry = build_registry(config)?;
    let result = validate(&graph, &registry);

    if json {
        let issues: Vec<_> = result
            .issues
            .iter()
            .map(|i| serde_json::json!({ "step_id": i.step_id, "reason": i.reason }))
            .collect();
        let out = serde_json::json!({
            "graph": graph.name,
            "valid": result.is_valid(),
            "issues": issues,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if result.is_valid() {
        println!();
        println!(
            "  {} Graph '{}' is valid ({} steps, {} connections)",
            style("*").green().bold(),
            style(&graph.name).cyan(),
            graph.steps.len(),
            graph.connections.len()
        );
        println!();
    } else {
        println!();
        println!(
            "  {} Graph '{}' has {} issue(s):",
            style("x").red().bold(),
            style(&graph.name).cyan(),
            result.issues.len()
        );
        for issue in &result.issues {
            match &issue.step_id {
                Some(step) => println!("    - [{}] {}", style(step).yellow(), issue.reason),
                None => println!("    - {}", issue.reason),
            }
        }
        println!();
    }

    if !result.is_valid() {
        bail!("graph validation failed");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(
    file: &Path,
    input: Option<&Path>,
    start_step: Option<String>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let graph = load_graph(file).await?;
    let items = load_items(input).await?;

    let mut event = TriggerEvent::manual(items);
    if let Some(step) = start_step {
        event = event.starting_at(step);
    }

    tracing::debug!(
        database = %state.database_path.display(),
        max_in_flight = state.config.max_in_flight,
        "starting run"
    );
    let handle = state
        .engine
        .start_run(graph, event)
        .await
        .context("failed to start run")?;
    let run_id = handle.run_id();

    // Ctrl+C cancels the run; the engine still records a final snapshot.
    let engine = state.engine.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Err(e) = engine.cancel_run(run_id) {
                tracing::debug!(run_id = %run_id, error = %e, "cancel after completion");
            }
        }
    });

    let finished = handle.wait().await?;
    interrupt.abort();

    if json {
        println!("{}", serde_json::to_string_pretty(&finished)?);
    } else {
        print_run(&finished);
    }

    match finished.status {
        RunStatus::Succeeded => Ok(()),
        RunStatus::Failed => {
            let detail = finished
                .failure
                .as_ref()
                .map(|f| format!(" at step '{}': {}", f.step_id, f.error))
                .unwrap_or_default();
            bail!("run {run_id} failed{detail}")
        }
        other => bail!("run {run_id} ended {}", other.as_str()),
    }
}

/// Styled summary of one run: header plus a per-step table in launch order.
pub fn print_run(state: &RunState) {
    println!();
    println!(
        "  Run {} of '{}': {}",
        style(state.run_id).dim(),
        style(&state.graph.name).cyan(),
        style(state.status.as_str()).bold()
    );
    if state.awaiting_manual {
        println!("  {}", style("Awaiting manual intervention").yellow());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Items"),
            Cell::new("Attempts"),
            Cell::new("Detail"),
        ]);

    // Launched steps first, then the ones that never ran.
    let mut ordered: Vec<&str> = Vec::new();
    for id in &state.execution_order {
        if !ordered.contains(&id.as_str()) {
            ordered.push(id);
        }
    }
    for step in &state.graph.steps {
        if !ordered.contains(&step.id.as_str()) {
            ordered.push(&step.id);
        }
    }

    for id in ordered {
        let Some(record) = state.record(id) else {
            continue;
        };
        let step_type = state
            .graph
            .step(id)
            .map(|s| s.step_type.as_str())
            .unwrap_or("?");
        let items = record.output.as_ref().map_or(0, |o| o.item_count());
        let detail = match (&record.error, record.skip_reason) {
            (Some(err), _) => err.to_string(),
            (None, Some(reason)) => format!("{reason:?}"),
            (None, None) => String::new(),
        };
        table.add_row(vec![
            Cell::new(id),
            Cell::new(step_type),
            Cell::new(step_status_label(record.status)),
            Cell::new(items),
            Cell::new(record.attempts),
            Cell::new(detail),
        ]);
    }

    println!("{table}");
    println!();
}
