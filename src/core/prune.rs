//! Prune Controller: deferred, verified deletion of copies.
//!
//! Scheduling records the task in the [`PruneLedger`] and registers a timer
//! with the [`Scheduler`]. Execution re-reads the ledger, so a task cancelled
//! or executed by another process is not run twice.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use super::clock::Clock;
use super::ledger::{LedgerError, PruneLedger, PruneTaskState, ScheduleResult};
use super::safety::{require_capability, PathViolation, RelativePath};
use super::scheduler::{ScheduleHandle, Scheduler};
use crate::adapters::EndpointStorage;
use crate::domain::{
    Capability, Endpoint, PruneOutcome, PruneReport, PruneTask, PruneTaskHandle, RetentionPolicies,
};

/// Errors that stop a prune operation before it reaches storage
#[derive(Debug, Error)]
pub enum PruneError {
    #[error(transparent)]
    Path(#[from] PathViolation),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Endpoint {endpoint} is a tape archive; tape copies are never pruned")]
    TapeArchive { endpoint: String },
}

fn refuse_tape(endpoint: &Endpoint) -> Result<(), PruneError> {
    if endpoint.is_tape() {
        return Err(PruneError::TapeArchive {
            endpoint: endpoint.name.clone(),
        });
    }
    Ok(())
}

/// Schedules and executes prune tasks
pub struct PruneController {
    storage: Arc<dyn EndpointStorage>,
    ledger: PruneLedger,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    policies: RetentionPolicies,
}

impl PruneController {
    /// Create a new controller
    pub fn new(
        storage: Arc<dyn EndpointStorage>,
        ledger: PruneLedger,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        policies: RetentionPolicies,
    ) -> Self {
        Self {
            storage,
            ledger,
            scheduler,
            clock,
            policies,
        }
    }

    pub fn policies(&self) -> &RetentionPolicies {
        &self.policies
    }

    pub fn ledger(&self) -> &PruneLedger {
        &self.ledger
    }

    /// Schedule deletion of `path` on `endpoint` after `after_days`.
    ///
    /// Idempotent: a live task for the same endpoint and path is returned
    /// unchanged, keeping its original eligible time.
    #[instrument(skip_all, fields(endpoint = %endpoint.name, path = %path))]
    pub async fn schedule_prune(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        path: &str,
        after_days: u32,
        verify_exists_at: Option<&Endpoint>,
    ) -> Result<PruneTaskHandle, PruneError> {
        let path = RelativePath::parse(path)?;
        refuse_tape(endpoint)?;
        require_capability(endpoint, Capability::Deletable)?;

        let task = PruneTask::new(
            endpoint.clone(),
            path,
            after_days,
            verify_exists_at.cloned(),
            self.clock.now(),
        );

        let task = match self.ledger.schedule(task).await? {
            ScheduleResult::AlreadyScheduled(task) => {
                debug!(task_id = %task.id, "Prune already scheduled");
                task
            }
            ScheduleResult::Scheduled(task) | ScheduleResult::Rescheduled(task) => {
                info!(
                    task_id = %task.id,
                    eligible_at = %task.eligible_at,
                    verify = task.verify_exists_at.as_ref().map(|e| e.name.as_str()).unwrap_or("-"),
                    "Prune scheduled"
                );
                task
            }
        };

        let handle = PruneTaskHandle {
            task_id: task.id.clone(),
            eligible_at: task.eligible_at,
        };
        self.register(task);
        Ok(handle)
    }

    /// Register a ledger task with the scheduler
    fn register(self: &Arc<Self>, task: PruneTask) -> ScheduleHandle {
        let controller = Arc::clone(self);
        let key = task.id.clone();
        let run_at = task.eligible_at;

        self.scheduler.schedule(
            &key,
            run_at,
            Box::pin(async move {
                if let Err(e) = controller.execute_prune(&task).await {
                    error!(task_id = %task.id, error = %e, "Scheduled prune failed");
                }
            }),
        )
    }

    /// Register every live ledger task with the scheduler, e.g. after a
    /// restart. Returns how many were registered.
    pub async fn restore(self: &Arc<Self>) -> Result<usize, PruneError> {
        let mut restored = 0;
        for entry in self.ledger.entries().await? {
            if entry.state == PruneTaskState::Scheduled {
                self.register(entry.task);
                restored += 1;
            }
        }
        if restored > 0 {
            info!(restored, "Restored scheduled prunes from ledger");
        }
        Ok(restored)
    }

    /// Execute a prune task, re-checking everything at execution time
    #[instrument(skip_all, fields(task_id = %task.id, endpoint = %task.endpoint.name, path = %task.path))]
    pub async fn execute_prune(&self, task: &PruneTask) -> Result<PruneReport, PruneError> {
        // The ledger's copy wins: the task may have been cancelled or
        // rescheduled since this one was captured
        let task = match self.ledger.get(&task.id).await? {
            Some(entry) => match entry.state {
                PruneTaskState::Cancelled => {
                    debug!("Prune task was cancelled");
                    return Ok(self.report(&entry.task, PruneOutcome::Cancelled));
                }
                PruneTaskState::Executed => {
                    let outcome = entry.last_outcome.clone().unwrap_or(PruneOutcome::Deleted);
                    debug!(%outcome, "Prune task already executed");
                    return Ok(self.report(&entry.task, outcome));
                }
                PruneTaskState::Scheduled => entry.task,
            },
            None => task.clone(),
        };

        let now = self.clock.now();
        if !task.is_eligible(now) {
            debug!(eligible_at = %task.eligible_at, "Prune task not yet eligible");
            return Ok(self.report(&task, PruneOutcome::NotYetEligible));
        }

        refuse_tape(&task.endpoint)?;
        require_capability(&task.endpoint, Capability::Deletable)?;

        let outcome = self.prune(&task).await;
        self.ledger.record_outcome(&task.id, &outcome).await?;

        Ok(self.report(&task, outcome))
    }

    async fn prune(&self, task: &PruneTask) -> PruneOutcome {
        if let Some(ref verify) = task.verify_exists_at {
            match self.storage.exists(verify, &task.path).await {
                Ok(true) => debug!(verify = %verify.name, "Copy verified"),
                Ok(false) => {
                    error!(
                        verify = %verify.name,
                        "Copy missing at verification endpoint; keeping source"
                    );
                    return PruneOutcome::VerificationFailed {
                        endpoint: verify.name.clone(),
                    };
                }
                Err(e) => {
                    warn!(verify = %verify.name, error = %e, "Verification check failed");
                    return PruneOutcome::Failed {
                        error: format!("verification at {} failed: {}", verify.name, e),
                    };
                }
            }
        }

        match self.storage.exists(&task.endpoint, &task.path).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Already absent at source");
                return PruneOutcome::AlreadyAbsent;
            }
            Err(e) => {
                warn!(error = %e, "Existence check failed");
                return PruneOutcome::Failed { error: e.to_string() };
            }
        }

        match self.storage.delete(&task.endpoint, &task.path).await {
            Ok(()) => {
                info!("Pruned");
                PruneOutcome::Deleted
            }
            Err(e) => {
                error!(error = %e, "Delete failed");
                PruneOutcome::Failed { error: e.to_string() }
            }
        }
    }

    /// Cancel a scheduled prune. False if it had already run, was already
    /// cancelled, or is unknown.
    pub async fn cancel_prune(&self, handle: &PruneTaskHandle) -> Result<bool, PruneError> {
        self.scheduler.cancel(&ScheduleHandle {
            key: handle.task_id.clone(),
            run_at: handle.eligible_at,
        });

        match self.ledger.cancel(&handle.task_id).await {
            Ok(cancelled) => {
                if cancelled {
                    info!(task_id = %handle.task_id, "Prune cancelled");
                }
                Ok(cancelled)
            }
            Err(LedgerError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Execute every live task whose eligible time has passed
    pub async fn run_due(&self) -> Result<Vec<PruneReport>, PruneError> {
        let due = self.ledger.due(self.clock.now()).await?;
        debug!(count = due.len(), "Running due prunes");

        let mut reports = Vec::with_capacity(due.len());
        for task in due {
            self.scheduler.cancel(&ScheduleHandle {
                key: task.id.clone(),
                run_at: task.eligible_at,
            });
            reports.push(self.execute_prune(&task).await?);
        }
        Ok(reports)
    }

    fn report(&self, task: &PruneTask, outcome: PruneOutcome) -> PruneReport {
        PruneReport {
            task_id: task.id.clone(),
            endpoint: task.endpoint.name.clone(),
            path: task.path.to_string(),
            outcome,
            executed_at: self.clock.now(),
        }
    }
}
