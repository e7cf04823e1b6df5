//! JSONL prune ledger: scheduled deletions that survive restarts.
//!
//! Follows the EventStore pattern: append-only JSONL with state derived from
//! replay. Appends take an exclusive file lock so a `prune run-due` sweep and
//! a running watcher never interleave writes or both schedule the same task.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{PruneOutcome, PruneTask};

/// Errors that can occur with the prune ledger
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Prune task not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Ledger task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// An event in the ledger log (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub event_type: LedgerEventType,

    /// The task for `scheduled`, the outcome for `executed`/`attempted`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Types of ledger events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventType {
    Scheduled,
    /// The file is gone from the source (deleted or already absent)
    Executed,
    /// Execution ran but did not delete; the task stays live
    Attempted,
    Cancelled,
}

/// Lifecycle of a prune task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneTaskState {
    Scheduled,
    Executed,
    Cancelled,
}

impl PruneTaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Scheduled)
    }
}

/// A prune task with current state (derived from replaying events)
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub task: PruneTask,
    pub state: PruneTaskState,

    /// Executions that did not delete (verification failed, storage error)
    pub attempts: u32,

    pub last_outcome: Option<PruneOutcome>,
    pub updated_at: DateTime<Utc>,
}

/// Result of recording a task
#[derive(Debug, Clone)]
pub enum ScheduleResult {
    /// New task recorded
    Scheduled(PruneTask),

    /// A live task for the same endpoint and path already exists
    AlreadyScheduled(PruneTask),

    /// The previous task was terminal; a fresh one replaced it
    Rescheduled(PruneTask),
}

impl ScheduleResult {
    /// The live task regardless of result type
    pub fn task(&self) -> &PruneTask {
        match self {
            Self::Scheduled(task) | Self::AlreadyScheduled(task) | Self::Rescheduled(task) => task,
        }
    }
}

/// JSONL-based prune ledger
#[derive(Debug, Clone)]
pub struct PruneLedger {
    ledger_path: PathBuf,
}

impl PruneLedger {
    /// Create a ledger at a path (the file is created on first append)
    pub fn new(ledger_path: PathBuf) -> Self {
        Self { ledger_path }
    }

    /// Ledger inside a state directory
    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join("prune_ledger.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.ledger_path
    }

    /// Run `f` on the ledger file under an exclusive lock
    async fn locked<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut File) -> Result<T, LedgerError> + Send + 'static,
    {
        let path = self.ledger_path.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)?;
            file.lock_exclusive()?;
            // Lock is released when file is dropped
            f(&mut file)
        })
        .await?
    }

    /// Replay all events to build current state
    pub async fn replay(&self) -> Result<HashMap<String, LedgerEntry>, LedgerError> {
        if !tokio::fs::try_exists(&self.ledger_path).await.unwrap_or(false) {
            return Ok(HashMap::new());
        }
        self.locked(|file| read_entries(file)).await
    }

    /// Record a task (idempotent: a live task for the same id is returned)
    pub async fn schedule(&self, task: PruneTask) -> Result<ScheduleResult, LedgerError> {
        self.locked(move |file| {
            let entries = read_entries(file)?;
            let result = match entries.get(&task.id) {
                Some(existing) if !existing.state.is_terminal() => {
                    return Ok(ScheduleResult::AlreadyScheduled(existing.task.clone()));
                }
                Some(_) => ScheduleResult::Rescheduled(task),
                None => ScheduleResult::Scheduled(task),
            };

            let event = LedgerEvent {
                timestamp: Utc::now(),
                task_id: result.task().id.clone(),
                event_type: LedgerEventType::Scheduled,
                data: Some(serde_json::to_value(result.task())?),
            };
            write_event(file, &event)?;
            Ok(result)
        })
        .await
    }

    /// Record the outcome of an execution
    pub async fn record_outcome(&self, task_id: &str, outcome: &PruneOutcome) -> Result<(), LedgerError> {
        let event_type = match outcome {
            PruneOutcome::Deleted | PruneOutcome::AlreadyAbsent => LedgerEventType::Executed,
            PruneOutcome::VerificationFailed { .. } | PruneOutcome::Failed { .. } => {
                LedgerEventType::Attempted
            }
            PruneOutcome::NotYetEligible | PruneOutcome::Cancelled => return Ok(()),
        };

        let event = LedgerEvent {
            timestamp: Utc::now(),
            task_id: task_id.to_string(),
            event_type,
            data: Some(serde_json::to_value(outcome)?),
        };
        self.locked(move |file| write_event(file, &event)).await
    }

    /// Cancel a live task. Returns false if it was already terminal.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, LedgerError> {
        let task_id = task_id.to_string();
        self.locked(move |file| {
            let entries = read_entries(file)?;
            let entry = entries
                .get(&task_id)
                .ok_or_else(|| LedgerError::NotFound(task_id.clone()))?;

            if entry.state.is_terminal() {
                return Ok(false);
            }

            let event = LedgerEvent {
                timestamp: Utc::now(),
                task_id: task_id.clone(),
                event_type: LedgerEventType::Cancelled,
                data: None,
            };
            write_event(file, &event)?;
            Ok(true)
        })
        .await
    }

    /// Get a specific task by id
    pub async fn get(&self, task_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let entries = self.replay().await?;
        Ok(entries.get(task_id).cloned())
    }

    /// All tasks, soonest eligible first
    pub async fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut entries: Vec<LedgerEntry> = self.replay().await?.into_values().collect();
        entries.sort_by(|a, b| {
            a.task
                .eligible_at
                .cmp(&b.task.eligible_at)
                .then_with(|| a.task.id.cmp(&b.task.id))
        });
        Ok(entries)
    }

    /// Live tasks whose eligible time has passed
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<PruneTask>, LedgerError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.state == PruneTaskState::Scheduled && e.task.is_eligible(now))
            .map(|e| e.task)
            .collect())
    }
}

fn read_entries(file: &mut File) -> Result<HashMap<String, LedgerEntry>, LedgerError> {
    let mut entries = HashMap::new();
    file.seek(SeekFrom::Start(0))?;

    for line in BufReader::new(&*file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: LedgerEvent = serde_json::from_str(&line)?;
        apply_event(&mut entries, event);
    }

    Ok(entries)
}

fn write_event(file: &mut File, event: &LedgerEvent) -> Result<(), LedgerError> {
    let json = serde_json::to_string(event)?;
    writeln!(file, "{}", json)?;
    file.flush()?;
    Ok(())
}

/// Apply a single event to the state
fn apply_event(entries: &mut HashMap<String, LedgerEntry>, event: LedgerEvent) {
    match event.event_type {
        LedgerEventType::Scheduled => {
            if let Some(task) = event
                .data
                .and_then(|d| serde_json::from_value::<PruneTask>(d).ok())
            {
                entries.insert(
                    event.task_id,
                    LedgerEntry {
                        task,
                        state: PruneTaskState::Scheduled,
                        attempts: 0,
                        last_outcome: None,
                        updated_at: event.timestamp,
                    },
                );
            }
        }
        LedgerEventType::Executed | LedgerEventType::Attempted => {
            if let Some(entry) = entries.get_mut(&event.task_id) {
                if event.event_type == LedgerEventType::Executed {
                    entry.state = PruneTaskState::Executed;
                } else {
                    entry.attempts += 1;
                }
                entry.last_outcome = event
                    .data
                    .and_then(|d| serde_json::from_value::<PruneOutcome>(d).ok());
                entry.updated_at = event.timestamp;
            }
        }
        LedgerEventType::Cancelled => {
            if let Some(entry) = entries.get_mut(&event.task_id) {
                entry.state = PruneTaskState::Cancelled;
                entry.updated_at = event.timestamp;
            }
        }
    }
}
