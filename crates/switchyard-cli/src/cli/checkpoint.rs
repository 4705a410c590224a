//! `syard checkpoints list|clean`.

use anyhow::{Result, anyhow};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use super::parse_run_id;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum CheckpointCommand {
    /// List the checkpoints of a run, oldest first.
    List {
        /// Run UUID.
        run_id: String,
    },

    /// Delete every checkpoint of a run.
    Clean {
        /// Run UUID.
        run_id: String,
    },
}

pub async fn handle_checkpoint_command(
    cmd: CheckpointCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let recovery = state.engine.recovery();
    match cmd {
        CheckpointCommand::List { run_id } => {
            let run_id = parse_run_id(&run_id)?;
            let checkpoints = recovery
                .list_checkpoints(run_id)
                .await
                .map_err(|e| anyhow!("Failed to list checkpoints: {e}"))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&checkpoints)?);
                return Ok(());
            }
            if checkpoints.is_empty() {
                println!();
                println!("  No checkpoints for run {run_id}.");
                println!();
                return Ok(());
            }

            let mut table = Table::new();
            table
                .load_preset(presets::UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    Cell::new("Step").fg(Color::Cyan),
                    Cell::new("Checkpoint"),
                    Cell::new("Created"),
                    Cell::new("Size"),
                ]);
            for cp in &checkpoints {
                let size = serde_json::to_string(&cp.state).map_or(0, |s| s.len());
                table.add_row(vec![
                    Cell::new(&cp.step_id),
                    Cell::new(cp.id),
                    Cell::new(cp.created_at.format("%Y-%m-%d %H:%M:%S%.3f")),
                    Cell::new(format!("{size} B")),
                ]);
            }
            println!();
            println!("{table}");
            println!();
        }

        CheckpointCommand::Clean { run_id } => {
            let run_id = parse_run_id(&run_id)?;
            let removed = recovery
                .cleanup(run_id)
                .await
                .map_err(|e| anyhow!("Failed to clean checkpoints: {e}"))?;

            if json {
                let out = serde_json::json!({ "run_id": run_id.to_string(), "removed": removed });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!();
                println!(
                    "  {} Removed {removed} checkpoint(s) for run {}",
                    style("*").green().bold(),
                    style(run_id).dim()
                );
                println!();
            }
        }
    }
    Ok(())
}
