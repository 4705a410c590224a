//! `syard recover analyze|apply`.

use anyhow::{Context, Result, anyhow};
use clap::Subcommand;
use console::style;

use switchyard_types::checkpoint::{RecoveryRecommendation, RecoveryStrategy};

use super::graph::print_run;
use super::parse_run_id;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum RecoverCommand {
    /// Classify a failed run's error and recommend a strategy.
    Analyze {
        /// Run UUID.
        run_id: String,
    },

    /// Apply a recovery strategy to a failed run.
    Apply {
        /// Run UUID.
        run_id: String,

        /// retry, skip, restart or manual.
        #[arg(long)]
        strategy: RecoveryStrategy,
    },
}

pub async fn handle_recover_command(
    cmd: RecoverCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let recovery = state.engine.recovery();
    match cmd {
        RecoverCommand::Analyze { run_id } => {
            let run_id = parse_run_id(&run_id)?;
            let recommendation = recovery
                .analyze_run(run_id)
                .await
                .with_context(|| format!("Failed to analyze run {run_id}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&recommendation)?);
            } else {
                print_recommendation(run_id, &recommendation);
            }
        }

        RecoverCommand::Apply { run_id, strategy } => {
            let run_id = parse_run_id(&run_id)?;
            let succeeded = recovery
                .recover(run_id, strategy)
                .await
                .with_context(|| format!("Failed to recover run {run_id}"))?;
            let run = state
                .engine
                .run_state(run_id)
                .await?
                .ok_or_else(|| anyhow!("Run {run_id} disappeared from the store"))?;

            if json {
                let out = serde_json::json!({
                    "run_id": run_id.to_string(),
                    "strategy": strategy.as_str(),
                    "succeeded": succeeded,
                    "status": run.status.as_str(),
                    "awaiting_manual": run.awaiting_manual,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else if strategy == RecoveryStrategy::Manual {
                println!();
                println!(
                    "  {} Run {} marked for manual intervention",
                    style("!").yellow().bold(),
                    style(run_id).dim()
                );
                println!();
            } else {
                print_run(&run);
                let marker = if succeeded {
                    style("*").green().bold()
                } else {
                    style("x").red().bold()
                };
                println!(
                    "  {marker} Recovery with '{}' finished: {}",
                    strategy.as_str(),
                    run.status.as_str()
                );
                println!();
            }
        }
    }
    Ok(())
}

fn print_recommendation(run_id: uuid::Uuid, rec: &RecoveryRecommendation) {
    println!();
    println!("  Run {}", style(run_id).dim());
    println!("  Category:  {}", style(format!("{:?}", rec.category)).cyan());
    println!("  Strategy:  {}", style(rec.strategy.as_str()).bold());
    println!("  Reason:    {}", rec.reason);
    if let Some(ms) = rec.retry_after_ms {
        println!("  Retry after: {ms} ms");
    }
    if let Some(cp) = rec.latest_checkpoint {
        println!("  Latest checkpoint: {cp}");
    }
    println!();
    println!(
        "  Apply with: {}",
        style(format!(
            "syard recover apply {run_id} --strategy {}",
            cli_spelling(rec.strategy)
        ))
        .dim()
    );
    println!();
}

fn cli_spelling(strategy: RecoveryStrategy) -> &'static str {
    match strategy {
        RecoveryStrategy::RestartFromCheckpoint => "restart",
        other => other.as_str(),
    }
}
