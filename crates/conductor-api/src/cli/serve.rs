//! Long-running host for the event bridge and the deadline sweeper.
//!
//! Two buses keep traffic apart: inbound integration events (read as JSON
//! lines from stdin) feed the bridge, while events the engine publishes go
//! out on `AppState::outbound` and are written to stdout. Events the engine
//! emits never loop back into the bridge as signals.

use anyhow::Result;
use console::style;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use conductor_core::event::EventBus;
use conductor_core::workflow::bridge::EventBridge;
use conductor_core::workflow::sweeper::DeadlineSweeper;
use conductor_infra::adapter::BusTaskGateway;
use conductor_types::event::IntegrationEvent;

use crate::state::AppState;

/// Serve until Ctrl+C / SIGTERM.
pub async fn serve(state: AppState, read_stdin: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    let inbound: EventBus<IntegrationEvent> = EventBus::new(state.config.event_bus_capacity);
    let mut tasks = JoinSet::new();

    let bridge = EventBridge::new(state.engine.clone());
    let bridge_rx = inbound.subscribe();
    let token = cancel.clone();
    tasks.spawn(async move { bridge.run(bridge_rx, token).await });

    let sweeper = DeadlineSweeper::new(state.engine.clone());
    let token = cancel.clone();
    tasks.spawn(async move { sweeper.run(token).await });

    let outbound_rx = state.outbound.subscribe();
    let token = cancel.clone();
    tasks.spawn(async move { write_outbound(outbound_rx, token).await });

    let mut engine_rx = state.engine.events();
    let token = cancel.clone();
    tasks.spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = engine_rx.recv() => match received {
                    Ok(event) => tracing::info!(?event, "engine event"),
                    Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "engine event log lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    });

    if read_stdin {
        let gateway = state.tasks.clone();
        let inbound = inbound.clone();
        let token = cancel.clone();
        tasks.spawn(async move {
            let reader = BufReader::new(tokio::io::stdin());
            pump_events(reader, &inbound, &gateway, token).await;
        });
    }

    eprintln!();
    eprintln!(
        "  {} Conductor serving from {}",
        style("▶").green().bold(),
        style(state.data_dir.display()).cyan()
    );
    if read_stdin {
        eprintln!("  Reading integration events as JSON lines from stdin");
    }
    eprintln!("  Press Ctrl+C to stop");
    eprintln!();

    shutdown_signal().await;
    tracing::info!("shutdown requested");
    cancel.cancel();

    // The stdin reader may be parked in a blocking read; don't wait on it.
    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(std::time::Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("background tasks did not stop in time");
    }

    let open = state.tasks.open_tasks();
    if !open.is_empty() {
        tracing::warn!(count = open.len(), "open human tasks are not persisted across restarts");
    }
    state.db_pool.writer.close().await;
    state.db_pool.reader.close().await;
    Ok(())
}

/// Publish each JSON line from `reader` onto `inbound` until EOF or cancel.
///
/// Completed human tasks are closed in the local gateway before routing.
/// Malformed lines are logged and skipped.
pub async fn pump_events<R: AsyncBufRead + Unpin>(
    reader: R,
    inbound: &EventBus<IntegrationEvent>,
    gateway: &BusTaskGateway,
    cancel: CancellationToken,
) -> u64 {
    let mut lines = reader.lines();
    let mut published = 0;
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!(published, "inbound stream closed");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to read inbound event");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let event: IntegrationEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed inbound event");
                continue;
            }
        };
        if let IntegrationEvent::HumanTaskCompleted { task_id, outcome, .. } = &event {
            if let Err(e) = gateway.complete_task(task_id, outcome.clone()) {
                tracing::debug!(task_id, error = %e, "task not tracked locally");
            }
        }
        tracing::debug!(event = event.name(), "inbound event");
        inbound.publish(event);
        published += 1;
    }
    published
}

async fn write_outbound(mut events: tokio::sync::broadcast::Receiver<IntegrationEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::error!(error = %e, "failed to encode outbound event"),
                },
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "outbound writer lagged, events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
