//! CLI command definitions and dispatch for the `conductor` binary.
//!
//! Uses clap derive macros. Commands are grouped by noun
//! (`conductor definition publish`, `conductor run start`).

pub mod definition;
pub mod run;
pub mod serve;

use std::path::Path;

use anyhow::Context;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use serde_json::Value;

use conductor_types::run::RunStatus;

/// Durable workflow orchestration.
#[derive(Parser)]
#[command(name = "conductor", version, about, long_about = None)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Recorded as the author of definition changes and started runs.
    #[arg(long, global = true, env = "CONDUCTOR_ACTOR", default_value = "cli")]
    pub actor: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage workflow definitions and their versions.
    #[command(alias = "def")]
    Definition {
        #[command(subcommand)]
        action: definition::DefinitionCommand,
    },

    /// Start, signal and inspect workflow runs.
    Run {
        #[command(subcommand)]
        action: run::RunCommand,
    },

    /// Host the event bridge and deadline sweeper until interrupted.
    ///
    /// Inbound integration events are read as JSON lines from stdin;
    /// outbound events are written as JSON lines to stdout.
    Serve {
        /// Do not read inbound events from stdin.
        #[arg(long)]
        no_stdin: bool,
    },

    /// Run one deadline sweep and exit.
    Sweep,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Parse an inline JSON argument, defaulting to an empty object.
pub fn parse_json_arg(raw: Option<&str>, what: &str) -> anyhow::Result<Value> {
    match raw {
        None => Ok(Value::Object(Default::default())),
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("Invalid {what} JSON: '{raw}'")),
    }
}

/// Read a JSON object from a file, or `-` for stdin.
pub async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let content = if path == Path::new("-") {
        let mut buf = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut tokio::io::stdin(), &mut buf).await?;
        buf
    } else {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?
    };
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

/// Colored status cell for run tables.
pub fn status_cell(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Completed => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::Waiting => Color::Yellow,
        RunStatus::Compensating | RunStatus::Compensated => Color::Magenta,
        RunStatus::Cancelled => Color::DarkGrey,
        RunStatus::Pending | RunStatus::Running => Color::Blue,
    };
    Cell::new(status.as_str()).fg(color)
}

/// First eight characters of an id, for tables.
pub fn short_id(id: &uuid::Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

/// `YYYY-MM-DD HH:MM:SS`, or `-`.
pub fn format_time(ts: Option<chrono::DateTime<chrono::Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}
