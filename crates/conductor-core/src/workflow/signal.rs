//! Signal routing: delivers named signals to Waiting runs.
//!
//! A Waiting run accepts exactly the signal its paused step declared, plus
//! the step's `fail_on` signals. Anything else is recorded as mismatched and
//! leaves the run Waiting; a signal for a run that is no longer Waiting is
//! recorded as stale. Neither is an error for the sender, because inbound
//! delivery is at-least-once and races with run progress.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use conductor_types::run::{RunStatus, SignalDisposition, SignalRecord, WorkflowRun};

use crate::event::EngineEvent;
use crate::repository::WorkflowStore;

use super::error::EngineError;
use super::interpreter::{Advance, Interpreter, WaitResolution};

/// What happened to one delivered signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SignalOutcome {
    /// The paused step was resolved; `status` is the run's status afterwards.
    Accepted { status: RunStatus },
    /// The run is Waiting for a different signal and stays Waiting.
    Mismatched { waiting_for: String },
    /// The run is not Waiting.
    Stale { status: RunStatus },
}

impl SignalOutcome {
    pub fn disposition(&self) -> SignalDisposition {
        match self {
            SignalOutcome::Accepted { .. } => SignalDisposition::Accepted,
            SignalOutcome::Mismatched { .. } => SignalDisposition::Mismatched,
            SignalOutcome::Stale { .. } => SignalDisposition::Stale,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, SignalOutcome::Accepted { .. })
    }
}

/// One signal delivery to one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDelivery {
    pub run_id: Uuid,
    #[serde(flatten)]
    pub outcome: SignalOutcome,
}

pub struct SignalRouter<S> {
    interpreter: Interpreter<S>,
}

impl<S> Clone for SignalRouter<S> {
    fn clone(&self) -> Self {
        Self {
            interpreter: self.interpreter.clone(),
        }
    }
}

impl<S: WorkflowStore + 'static> SignalRouter<S> {
    pub fn new(interpreter: Interpreter<S>) -> Self {
        Self { interpreter }
    }

    /// Deliver `name` to one run and record the delivery.
    pub async fn deliver(
        &self,
        run_id: Uuid,
        name: &str,
        payload: Value,
    ) -> Result<SignalOutcome, EngineError> {
        let run = self.interpreter.load_run(run_id).await?;
        let outcome = self.route(run, name, &payload).await?;

        self.interpreter
            .store()
            .record_signal(&SignalRecord {
                id: Uuid::now_v7(),
                run_id,
                name: name.to_string(),
                payload,
                disposition: outcome.disposition(),
                received_at: Utc::now(),
            })
            .await?;

        match &outcome {
            SignalOutcome::Accepted { status } => {
                tracing::info!(run_id = %run_id, signal = name, status = %status, "signal accepted");
            }
            SignalOutcome::Mismatched { waiting_for } => {
                tracing::warn!(run_id = %run_id, signal = name, waiting_for = %waiting_for, "mismatched signal ignored");
                self.ignored(run_id, name, format!("waiting for {waiting_for}"));
            }
            SignalOutcome::Stale { status } => {
                tracing::warn!(run_id = %run_id, signal = name, status = %status, "stale signal ignored");
                self.ignored(run_id, name, format!("run is {status}"));
            }
        }
        Ok(outcome)
    }

    async fn route(
        &self,
        run: WorkflowRun,
        name: &str,
        payload: &Value,
    ) -> Result<SignalOutcome, EngineError> {
        let run_id = run.id;
        let Some(wait) = run.waiting.as_ref().filter(|_| run.status == RunStatus::Waiting) else {
            return Ok(SignalOutcome::Stale { status: run.status });
        };
        if !wait.accepts(name) {
            return Ok(SignalOutcome::Mismatched {
                waiting_for: wait.signal.clone(),
            });
        }

        let resolution = WaitResolution::Signal {
            name: name.to_string(),
            payload: payload.clone(),
        };
        let advance = self.interpreter.resolve_wait(run, resolution).await?;
        let status = match advance {
            Advance::Finished(status) => status,
            Advance::Continue => RunStatus::Running,
            _ => {
                // Resolved concurrently by someone else.
                let current = self.interpreter.load_run(run_id).await?;
                return Ok(SignalOutcome::Stale {
                    status: current.status,
                });
            }
        };
        Ok(SignalOutcome::Accepted { status })
    }

    /// Deliver `name` to the runs carrying `correlation_id`.
    ///
    /// Every Waiting run that reacts to `name` receives it. When none does,
    /// the newest correlated run receives it and records it as mismatched or
    /// stale. No correlated run at all is a no-op.
    pub async fn deliver_by_correlation(
        &self,
        correlation_id: &str,
        name: &str,
        payload: Value,
    ) -> Result<Vec<SignalDelivery>, EngineError> {
        let runs = self
            .interpreter
            .store()
            .find_by_correlation(correlation_id)
            .await?;

        let mut targets: Vec<Uuid> = runs
            .iter()
            .filter(|r| {
                r.status == RunStatus::Waiting
                    && r.waiting.as_ref().is_some_and(|w| w.accepts(name))
            })
            .map(|r| r.id)
            .collect();
        if targets.is_empty() {
            targets.extend(runs.first().map(|r| r.id));
        }
        if targets.is_empty() {
            tracing::info!(correlation_id, signal = name, "no run matches correlation id, signal dropped");
            return Ok(Vec::new());
        }

        let mut deliveries = Vec::with_capacity(targets.len());
        for run_id in targets {
            let outcome = self.deliver(run_id, name, payload.clone()).await?;
            deliveries.push(SignalDelivery { run_id, outcome });
        }
        Ok(deliveries)
    }

    fn ignored(&self, run_id: Uuid, signal: &str, reason: String) {
        self.interpreter.events().publish(EngineEvent::SignalIgnored {
            run_id,
            signal: signal.to_string(),
            reason,
        });
    }
}
