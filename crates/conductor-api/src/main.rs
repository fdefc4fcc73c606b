//! Conductor CLI entry point.
//!
//! Binary name: `conductor`
//!
//! Parses CLI arguments, opens the database under the data directory, wires
//! the workflow engine, then dispatches to the command handler or serves the
//! event bridge and deadline sweeper.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use console::style;

use conductor_core::workflow::sweeper::DeadlineSweeper;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,conductor_core=debug,conductor_infra=debug",
        _ => "trace",
    };
    conductor_observe::tracing_setup::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "conductor", &mut std::io::stdout());
        return Ok(());
    }

    let long_running = matches!(cli.command, Commands::Serve { .. });
    let state = AppState::init(long_running).await?;

    let result = match cli.command {
        Commands::Definition { action } => {
            cli::definition::handle_definition_command(action, &state, &cli.actor, cli.json).await
        }
        Commands::Run { action } => cli::run::handle_run_command(action, &state, &cli.actor, cli.json).await,
        Commands::Serve { no_stdin } => cli::serve::serve(state, !no_stdin).await,
        Commands::Sweep => sweep(&state, cli.json).await,
        Commands::Completions { .. } => Ok(()),
    };

    conductor_observe::tracing_setup::shutdown_tracing();
    if long_running && result.is_ok() {
        // The stdin reader can stay parked on a blocking read, which the
        // runtime would wait on during drop.
        std::process::exit(0);
    }
    result
}

async fn sweep(state: &AppState, json: bool) -> anyhow::Result<()> {
    let report = DeadlineSweeper::new(state.engine.clone()).sweep_once().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} expired: {}  aged out: {}  recovered: {}  errors: {}",
        style("Sweep:").bold(),
        report.expired,
        report.aged_out,
        report.recovered,
        report.errors
    );
    println!();
    Ok(())
}
