//! Periodic sweep over runs that need the engine's attention without an
//! external trigger.
//!
//! Each pass:
//! - resolves Waiting runs whose deadline has passed (timers fire, waits time out)
//! - cancels Waiting runs older than `waiting.max_age_secs`
//! - picks up Pending, Running and Compensating runs nobody touched for
//!   `sweeper.stale_run_secs` (a process died while driving them)

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use conductor_types::run::RunStatus;

use crate::repository::WorkflowStore;

use super::engine::WorkflowEngine;
use super::error::EngineError;

/// Counts for one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: u32,
    pub aged_out: u32,
    pub recovered: u32,
    pub errors: u32,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

pub struct DeadlineSweeper<S> {
    engine: WorkflowEngine<S>,
}

impl<S: WorkflowStore + 'static> DeadlineSweeper<S> {
    pub fn new(engine: WorkflowEngine<S>) -> Self {
        Self { engine }
    }

    /// Sweep every `sweeper.interval_secs` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.engine.config().sweeper.interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = period.as_secs(), "deadline sweeper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report.is_empty() => {}
                        Ok(report) => tracing::info!(?report, "sweep finished"),
                        Err(e) => tracing::error!(error = %e, "sweep failed"),
                    }
                }
            }
        }
        tracing::info!("deadline sweeper stopped");
    }

    /// One pass over due, aged and orphaned runs.
    pub async fn sweep_once(&self) -> Result<SweepReport, EngineError> {
        let config = self.engine.config().clone();
        let batch = config.sweeper.batch_size.max(1);
        let store = self.engine.store();
        let now = Utc::now();
        let mut report = SweepReport::default();

        for run in store.due_waits(now, batch).await? {
            match self.engine.expire_wait(run.id).await {
                Ok(Some(_)) => report.expired += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(run_id = %run.id, error = %e, "failed to expire wait");
                    report.errors += 1;
                }
            }
        }

        if let Some(max_age) = config.waiting.max_age_secs {
            let before = now - chrono::Duration::seconds(max_age as i64);
            for run in store.runs_idle_since(RunStatus::Waiting, before, batch).await? {
                let reason = format!("waiting longer than {max_age}s");
                match self.engine.cancel(run.id, &reason).await {
                    Ok(_) => report.aged_out += 1,
                    Err(e) => {
                        tracing::warn!(run_id = %run.id, error = %e, "failed to cancel aged run");
                        report.errors += 1;
                    }
                }
            }
        }

        let stale_before = now - chrono::Duration::seconds(config.sweeper.stale_run_secs as i64);
        for status in [RunStatus::Pending, RunStatus::Running, RunStatus::Compensating] {
            for run in store.runs_idle_since(status, stale_before, batch).await? {
                if self.engine.is_driving(run.id) {
                    continue;
                }
                tracing::info!(run_id = %run.id, status = %status, "recovering orphaned run");
                match self.engine.recover(run.id).await {
                    Ok(after) if after.row_version == run.row_version => {
                        tracing::debug!(run_id = %run.id, "orphaned run still held, left for a later sweep");
                    }
                    Ok(_) => report.recovered += 1,
                    // A run failing on recovery has been recorded as failed.
                    Err(EngineError::StepExecutionFailed { .. }) => report.recovered += 1,
                    Err(e) => {
                        tracing::warn!(run_id = %run.id, error = %e, "failed to recover run");
                        report.errors += 1;
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use conductor_types::definition::VersionStatus;
    use conductor_types::run::WorkflowRun;

    use crate::repository::{IdempotencyRepository, RunRepository};
    use crate::service::hash::BodyHasher;
    use crate::testing::{test_config, EngineHarness, PlainHasher};
    use crate::workflow::definition::parse_dsl_yaml;
    use crate::workflow::engine::StartRequest;
    use crate::workflow::interpreter::execution_key;

    const DELAYED: &str = r#"
start_at: pause
steps:
  - id: pause
    type: timer
    config: { type: timer, duration_secs: 30 }
    next: ship
  - id: ship
    type: service_task
    config: { type: service_task, method_id: shipping.dispatch }
"#;

    fn harness(config: conductor_types::config::EngineConfig) -> EngineHarness {
        let h = EngineHarness::new(config);
        h.store.seed_version(
            "Delayed",
            1,
            VersionStatus::Published,
            parse_dsl_yaml(DELAYED).unwrap(),
        );
        h
    }

    async fn backdate(h: &EngineHarness, run: &WorkflowRun) {
        let mut stored = h.store.get_run(&run.id).await.unwrap().unwrap();
        if let Some(wait) = stored.waiting.as_mut() {
            wait.deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        }
        h.store.update_run(&stored).await.unwrap();
    }

    #[tokio::test]
    async fn test_elapsed_timer_continues_run() {
        let h = harness(test_config());
        let sweeper = DeadlineSweeper::new(h.engine.clone());
        let run = h
            .engine
            .start(StartRequest::new("Delayed", json!({})))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Waiting);

        // Not yet due.
        assert!(sweeper.sweep_once().await.unwrap().is_empty());
        assert!(h.proxy.calls().is_empty());

        backdate(&h, &run).await;
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.expired, 1);

        let run = h.engine.get_run(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.output_context.unwrap()["signals"].get("TimerElapsed").is_some());
        assert_eq!(h.proxy.calls_to("shipping.dispatch").len(), 1);
    }

    #[tokio::test]
    async fn test_old_waiting_runs_are_cancelled() {
        let mut config = test_config();
        config.waiting.max_age_secs = Some(0);
        let h = harness(config);
        let sweeper = DeadlineSweeper::new(h.engine.clone());
        let run = h
            .engine
            .start(StartRequest::new("Delayed", json!({})))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.aged_out, 1);

        let run = h.engine.get_run(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Compensated);
        assert!(run.last_error.unwrap().contains("waiting longer than 0s"));
    }

    #[tokio::test]
    async fn test_orphaned_pending_run_is_recovered() {
        let mut config = test_config();
        config.sweeper.stale_run_secs = 0;
        let h = harness(config);
        let sweeper = DeadlineSweeper::new(h.engine.clone());

        // Created by a process that died before driving it.
        let orphan = WorkflowRun::new("Delayed", 1, json!({}), None, "tester");
        h.store.create_run(&orphan).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.recovered, 1);
        let run = h.engine.get_run(orphan.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Waiting);
        assert_eq!(run.current_step.as_deref(), Some("pause"));
    }

    #[tokio::test]
    async fn test_step_held_by_another_process_is_not_redispatched() {
        let mut config = test_config();
        config.sweeper.stale_run_secs = 0;
        let h = harness(config);
        let sweeper = DeadlineSweeper::new(h.engine.clone());

        // Another process is still inside `ship` and holds its slot.
        let mut run = WorkflowRun::new("Delayed", 1, json!({}), None, "tester");
        run.status = RunStatus::Running;
        run.current_step = Some("ship".to_string());
        h.store.create_run(&run).await.unwrap();
        let dsl = parse_dsl_yaml(DELAYED).unwrap();
        let ship = dsl.step("ship").unwrap();
        let route = format!("step.{}", ship.step_type);
        let key = execution_key(run.id, "ship", 1);
        let hash = PlainHasher.hash_value(&serde_json::to_value(&ship.config).unwrap());
        h.store.try_reserve(&route, &key, &hash, Utc::now()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.recovered, 0);
        assert_eq!(report.errors, 0);
        assert!(h.proxy.calls_to("shipping.dispatch").is_empty());
        assert_eq!(h.engine.get_run(run.id).await.unwrap().status, RunStatus::Running);

        // The holder died: its reservation is now older than the TTL.
        let ttl = h.engine.config().idempotency.reservation_ttl_secs as i64;
        h.store.release_slot(&route, &key, &hash).await.unwrap();
        h.store
            .try_reserve(&route, &key, &hash, Utc::now() - chrono::Duration::seconds(ttl + 60))
            .await
            .unwrap();

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(h.proxy.calls_to("shipping.dispatch").len(), 1);
        assert_eq!(h.engine.get_run(run.id).await.unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let h = harness(test_config());
        let sweeper = DeadlineSweeper::new(h.engine.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), sweeper.run(cancel))
            .await
            .unwrap();
    }
}
