//! Run commands.
//!
//! Provides `conductor run` subcommands: start, signal, resume, cancel,
//! compensate, show, list, history.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use conductor_core::workflow::engine::StartRequest;
use conductor_core::workflow::signal::{SignalDelivery, SignalOutcome};
use conductor_types::run::{RunFilter, RunHistory, RunStatus, StepStatus, WorkflowRun};

use crate::state::AppState;

use super::{format_time, parse_json_arg, read_json_file, short_id, status_cell};

#[derive(Subcommand)]
pub enum RunCommand {
    /// Start a run of the latest published version (or --version).
    Start {
        /// Definition code.
        code: String,

        #[arg(long)]
        version: Option<u32>,

        /// Input context as a JSON object.
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read the input context from a JSON file (`-` for stdin).
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Business correlation id (e.g. an order id).
        #[arg(long)]
        correlation: Option<String>,

        /// Idempotency key; repeating the same request returns the same run.
        #[arg(long)]
        key: Option<String>,
    },

    /// Deliver a signal to a run, or to the runs sharing a correlation id.
    Signal {
        /// Signal name (e.g. PaymentConfirmed).
        name: String,

        /// Target run id.
        #[arg(long, conflicts_with = "correlation")]
        run: Option<String>,

        /// Target correlation id.
        #[arg(long)]
        correlation: Option<String>,

        /// Signal payload as a JSON object.
        #[arg(long)]
        payload: Option<String>,
    },

    /// Continue a paused or stalled run, merging a context delta.
    Resume {
        run_id: String,

        /// Context delta as a JSON object.
        #[arg(long)]
        context: Option<String>,
    },

    /// Cancel an unfinished run.
    Cancel {
        run_id: String,

        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },

    /// Run (or continue) compensation for a failed or cancelled run.
    Compensate { run_id: String },

    /// Show one run.
    Show { run_id: String },

    /// List runs, newest first.
    #[command(alias = "ls")]
    List {
        /// Filter by definition code.
        #[arg(long)]
        code: Option<String>,

        /// Filter by status (pending, running, waiting, completed, ...).
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        correlation: Option<String>,

        /// Maximum number of runs to show.
        #[arg(long, short = 'n', default_value_t = 20)]
        limit: u32,
    },

    /// Show a run's steps, signals, transitions and compensation log.
    History { run_id: String },
}

/// Dispatch a run subcommand.
pub async fn handle_run_command(cmd: RunCommand, state: &AppState, actor: &str, json: bool) -> Result<()> {
    match cmd {
        RunCommand::Start {
            code,
            version,
            input,
            input_file,
            correlation,
            key,
        } => {
            let input = match input_file {
                Some(path) => read_json_file(&path).await?,
                None => parse_json_arg(input.as_deref(), "input")?,
            };
            let mut request = StartRequest::new(code, input).initiated_by(actor);
            if let Some(version) = version {
                request = request.with_version(version);
            }
            if let Some(correlation) = correlation {
                request = request.with_correlation(correlation);
            }
            handle_start(state, request, key.as_deref(), json).await
        }
        RunCommand::Signal {
            name,
            run,
            correlation,
            payload,
        } => {
            let payload = parse_json_arg(payload.as_deref(), "payload")?;
            match (run, correlation) {
                (Some(run), None) => {
                    let run_id = parse_run_id(&run)?;
                    let outcome = state.engine.signal(run_id, &name, payload).await?;
                    print_deliveries(&name, &[SignalDelivery { run_id, outcome }], json)
                }
                (None, Some(correlation)) => {
                    let deliveries = state
                        .engine
                        .signal_by_correlation(&correlation, &name, payload)
                        .await?;
                    print_deliveries(&name, &deliveries, json)
                }
                _ => bail!("Specify exactly one of --run or --correlation"),
            }
        }
        RunCommand::Resume { run_id, context } => {
            let delta = parse_json_arg(context.as_deref(), "context")?;
            let run = state.engine.resume(parse_run_id(&run_id)?, delta).await?;
            display_run(&run, json)
        }
        RunCommand::Cancel { run_id, reason } => {
            let run = state.engine.cancel(parse_run_id(&run_id)?, &reason).await?;
            display_run(&run, json)
        }
        RunCommand::Compensate { run_id } => handle_compensate(state, &run_id, json).await,
        RunCommand::Show { run_id } => {
            let run = state.engine.get_run(parse_run_id(&run_id)?).await?;
            display_run(&run, json)
        }
        RunCommand::List {
            code,
            status,
            correlation,
            limit,
        } => {
            let status = status
                .as_deref()
                .map(|s| s.parse::<RunStatus>().map_err(anyhow::Error::msg))
                .transpose()?;
            let filter = RunFilter {
                definition_code: code,
                status,
                correlation_id: correlation,
                limit: Some(limit),
            };
            handle_list(state, &filter, json).await
        }
        RunCommand::History { run_id } => {
            let history = state.engine.get_history(parse_run_id(&run_id)?).await?;
            display_history(&history, json)
        }
    }
}

fn parse_run_id(raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("Invalid run ID: '{raw}'"))
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

async fn handle_start(state: &AppState, request: StartRequest, key: Option<&str>, json: bool) -> Result<()> {
    let code = request.definition_code.clone();
    let run = match key {
        Some(key) => state.engine.start_idempotent(key, request).await,
        None => state.engine.start(request).await,
    }
    .with_context(|| format!("Failed to start '{code}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Started {} v{} as run {}",
        style("✓").green().bold(),
        style(&run.definition_code).cyan(),
        run.version_number,
        style(run.id).bold()
    );
    print_run_position(&run);
    println!();
    Ok(())
}

fn print_run_position(run: &WorkflowRun) {
    println!("  Status: {}", run.status);
    if let Some(ref waiting) = run.waiting {
        println!(
            "  Waiting at '{}' for {}",
            waiting.step_key,
            style(&waiting.signal).yellow()
        );
        if let Some(deadline) = waiting.deadline {
            println!("  Deadline: {}", format_time(Some(deadline)));
        }
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

fn print_deliveries(name: &str, deliveries: &[SignalDelivery], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(deliveries)?);
        return Ok(());
    }

    println!();
    if deliveries.is_empty() {
        println!("  No run matched signal {}.", style(name).yellow());
        println!();
        return Ok(());
    }
    for delivery in deliveries {
        let outcome = match &delivery.outcome {
            SignalOutcome::Accepted { status } => {
                format!("{} (run is now {status})", style("accepted").green())
            }
            SignalOutcome::Mismatched { waiting_for } => {
                format!("{} (waiting for {waiting_for})", style("mismatched").yellow())
            }
            SignalOutcome::Stale { status } => {
                format!("{} (run is {status})", style("stale").dim())
            }
        };
        println!("  {} → {}: {}", style(name).cyan(), short_id(&delivery.run_id), outcome);
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Compensate
// ---------------------------------------------------------------------------

async fn handle_compensate(state: &AppState, run_id: &str, json: bool) -> Result<()> {
    let summary = state.engine.compensate(parse_run_id(run_id)?).await?;

    if json {
        let out = serde_json::json!({
            "run_id": summary.run.id,
            "status": summary.run.status,
            "invoked": summary.invoked,
            "skipped": summary.skipped,
            "pending": summary.pending,
            "failures": summary.failures,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Run {} is {}",
        style("Compensation:").bold(),
        short_id(&summary.run.id),
        summary.run.status
    );
    println!(
        "  Invoked: {}  Skipped: {}  Pending: {}",
        summary.invoked, summary.skipped, summary.pending
    );
    for failure in &summary.failures {
        println!("  {} {}", style("✗").red(), failure);
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show / List
// ---------------------------------------------------------------------------

fn display_run(run: &WorkflowRun, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style("Run:").bold(), style(run.id).cyan());
    println!("  Definition: {} v{}", run.definition_code, run.version_number);
    print_run_position(run);
    if let Some(ref step) = run.current_step {
        println!("  Current step: {step}");
    }
    if let Some(ref correlation) = run.correlation_id {
        println!("  Correlation: {correlation}");
    }
    if let Some(parent) = run.parent_run_id {
        println!("  Parent run: {parent}");
    }
    println!("  Initiated by: {}", run.initiated_by);
    println!("  Started: {}", format_time(run.started_at));
    println!("  Ended: {}", format_time(run.ended_at));
    if let Some(ref err) = run.last_error {
        println!("  Error: {}", style(err).red());
    }
    if let Some(ref output) = run.output_context {
        println!("  Output: {}", serde_json::to_string(output)?);
    }
    println!();
    Ok(())
}

async fn handle_list(state: &AppState, filter: &RunFilter, json: bool) -> Result<()> {
    let runs = state.engine.list_runs(filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs found.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Definition"),
            Cell::new("Status"),
            Cell::new("Step"),
            Cell::new("Correlation"),
            Cell::new("Started"),
        ]);

    for r in &runs {
        table.add_row(vec![
            Cell::new(short_id(&r.id)),
            Cell::new(format!("{} v{}", r.definition_code, r.version_number)),
            status_cell(r.status),
            Cell::new(r.current_step.as_deref().unwrap_or("-")),
            Cell::new(r.correlation_id.as_deref().unwrap_or("-")),
            Cell::new(format_time(r.started_at)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

fn condensed_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.into_iter().map(Cell::new).collect::<Vec<_>>());
    table
}

fn display_history(history: &RunHistory, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(history)?);
        return Ok(());
    }

    display_run(&history.run, false)?;

    let mut steps = condensed_table(vec!["Step", "Type", "Attempt", "Status", "Started", "Error"]);
    for s in &history.steps {
        let status = match s.status {
            StepStatus::Completed => Cell::new(s.status.as_str()).fg(Color::Green),
            StepStatus::Failed => Cell::new(s.status.as_str()).fg(Color::Red),
            StepStatus::Running | StepStatus::Skipped => Cell::new(s.status.as_str()),
        };
        steps.add_row(vec![
            Cell::new(&s.step_key),
            Cell::new(s.step_type.as_str()),
            Cell::new(s.attempt),
            status,
            Cell::new(format_time(Some(s.started_at))),
            Cell::new(s.error.as_deref().unwrap_or("")),
        ]);
    }
    println!("  {}", style("Steps").bold());
    println!("{steps}");

    if !history.transitions.is_empty() {
        let mut transitions = condensed_table(vec!["From", "To", "Condition", "At"]);
        for t in &history.transitions {
            transitions.add_row(vec![
                Cell::new(t.from_step.as_deref().unwrap_or("(start)")),
                Cell::new(t.to_step.as_deref().unwrap_or("(end)")),
                Cell::new(t.condition.as_deref().unwrap_or("")),
                Cell::new(format_time(Some(t.created_at))),
            ]);
        }
        println!();
        println!("  {}", style("Transitions").bold());
        println!("{transitions}");
    }

    if !history.signals.is_empty() {
        let mut signals = condensed_table(vec!["Signal", "Disposition", "Received"]);
        for s in &history.signals {
            signals.add_row(vec![
                Cell::new(&s.name),
                Cell::new(s.disposition.as_str()),
                Cell::new(format_time(Some(s.received_at))),
            ]);
        }
        println!();
        println!("  {}", style("Signals").bold());
        println!("{signals}");
    }

    if !history.compensations.is_empty() {
        let mut compensations = condensed_table(vec!["Step", "Action", "Kind", "Status", "Attempts", "Error"]);
        for c in &history.compensations {
            compensations.add_row(vec![
                Cell::new(&c.step_key),
                Cell::new(format!("#{}", c.action_index)),
                Cell::new(&c.kind),
                Cell::new(c.status.as_str()),
                Cell::new(c.attempts),
                Cell::new(c.error.as_deref().unwrap_or("")),
            ]);
        }
        println!();
        println!("  {}", style("Compensation").bold());
        println!("{compensations}");
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use conductor_core::workflow::definition::parse_dsl_yaml;

    const CHECKOUT: &str = r#"
start_at: await-payment
steps:
  - id: await-payment
    type: wait_for_signal
    config: { type: wait_for_signal, signal: PaymentConfirmed, fail_on: [PaymentFailed] }
    next: done
  - id: done
    type: assign
    config: { type: assign, values: { paid: true } }
"#;

    async fn published_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::init_at(dir.path(), false).await.unwrap();
        state
            .definitions
            .create_definition("Checkout", "Checkout", None, "tester")
            .await
            .unwrap();
        state
            .definitions
            .create_version("Checkout", parse_dsl_yaml(CHECKOUT).unwrap(), None, "tester")
            .await
            .unwrap();
        state.definitions.publish("Checkout", 1, "tester").await.unwrap();
        (dir, state)
    }

    fn start(key: Option<&str>) -> RunCommand {
        RunCommand::Start {
            code: "Checkout".into(),
            version: None,
            input: Some(r#"{"order_id":"A1"}"#.into()),
            input_file: None,
            correlation: Some("A1".into()),
            key: key.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_start_then_signal_by_correlation() {
        let (_dir, state) = published_state().await;
        handle_run_command(start(None), &state, "tester", true).await.unwrap();

        let waiting = state.engine.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].status, RunStatus::Waiting);
        assert_eq!(waiting[0].initiated_by, "tester");

        handle_run_command(
            RunCommand::Signal {
                name: "PaymentConfirmed".into(),
                run: None,
                correlation: Some("A1".into()),
                payload: Some(r#"{"amount":10}"#.into()),
            },
            &state,
            "tester",
            true,
        )
        .await
        .unwrap();

        let run = state.engine.get_run(waiting[0].id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        handle_run_command(
            RunCommand::History {
                run_id: run.id.to_string(),
            },
            &state,
            "tester",
            false,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_idempotent_start_reuses_run() {
        let (_dir, state) = published_state().await;
        handle_run_command(start(Some("req-1")), &state, "tester", true).await.unwrap();
        handle_run_command(start(Some("req-1")), &state, "tester", true).await.unwrap();
        let runs = state.engine.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_and_bad_arguments() {
        let (_dir, state) = published_state().await;
        handle_run_command(start(None), &state, "tester", true).await.unwrap();
        let run = &state.engine.list_runs(&RunFilter::default()).await.unwrap()[0];

        handle_run_command(
            RunCommand::Cancel {
                run_id: run.id.to_string(),
                reason: "customer request".into(),
            },
            &state,
            "tester",
            true,
        )
        .await
        .unwrap();
        assert_eq!(state.engine.get_run(run.id).await.unwrap().status, RunStatus::Cancelled);

        let missing_target = handle_run_command(
            RunCommand::Signal {
                name: "PaymentConfirmed".into(),
                run: None,
                correlation: None,
                payload: None,
            },
            &state,
            "tester",
            true,
        )
        .await;
        assert!(missing_target.is_err());

        let bad_status = handle_run_command(
            RunCommand::List {
                code: None,
                status: Some("sleeping".into()),
                correlation: None,
                limit: 5,
            },
            &state,
            "tester",
            true,
        )
        .await;
        assert!(bad_status.is_err());
    }
}
