//! Switchyard command-line entry point.
//!
//! Binary name: `syard`
//!
//! Parses arguments, sets up tracing, wires the engine to its SQLite stores
//! and dispatches to the command handlers.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use switchyard_infra::config::load_config;
use switchyard_observe::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions {
        default_filter: cli.log_filter().to_string(),
        format: if cli.log_json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
        enable_otel: cli.otel,
    };
    if let Err(e) = init_tracing(&options) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        // Neither needs the database.
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "syard", &mut std::io::stdout());
            Ok(())
        }
        Commands::Validate { file } => {
            let config = load_config(&cli.config).await;
            cli::graph::handle_validate(&file, &config, cli.json).await
        }

        command => {
            let state = AppState::init(&cli.config).await?;
            match command {
                Commands::Run {
                    file,
                    input,
                    start_step,
                } => {
                    cli::graph::handle_run(&file, input.as_deref(), start_step, &state, cli.json)
                        .await
                }
                Commands::Runs { limit } => cli::runs::handle_list(limit, &state, cli.json).await,
                Commands::Show { run_id } => {
                    cli::runs::handle_show(&run_id, &state, cli.json).await
                }
                Commands::Checkpoints { action } => {
                    cli::checkpoint::handle_checkpoint_command(action, &state, cli.json).await
                }
                Commands::Recover { action } => {
                    cli::recover::handle_recover_command(action, &state, cli.json).await
                }
                Commands::Completions { .. } | Commands::Validate { .. } => {
                    unreachable!("handled above")
                }
            }
        }
    }
}
