//! Core orchestration logic.
//!
//! This module contains:
//! - EventStore: Append-only journey event logs
//! - Plan: Journey plan definitions
//! - Safety: Relative path and capability guards
//! - TransferController: One hop of data movement, with optional metrics
//! - PruneController and PruneLedger: Deferred, verified deletion
//! - Scheduler and Clock: Time-based execution
//! - Dispatcher: Main journey engine

pub mod clock;
pub mod dispatcher;
pub mod event_store;
pub mod ledger;
pub mod metrics;
pub mod plan;
pub mod prune;
pub mod safety;
pub mod scheduler;
pub mod transfer;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{CancelFlag, DatasetRequest, Dispatcher};
pub use event_store::{dataset_id, generate_idempotency_key, hash_input, EventStore};
pub use metrics::{MetricsConfig, TransferMetrics};
pub use ledger::{LedgerEntry, LedgerError, PruneLedger, PruneTaskState, ScheduleResult};
pub use plan::{EnabledStages, Hop, JourneyPlan, ReconstructionPlan};
pub use prune::{PruneController, PruneError};
pub use safety::{PathViolation, RelativePath};
pub use scheduler::{ManualScheduler, ScheduleHandle, ScheduledJob, Scheduler, TokioScheduler};
pub use transfer::{RetryPolicy, TransferController, TransferError, TransferSettings};
