//! Journey state and reconstruction from events.
//!
//! A Journey is the path one dataset takes through the facility: transfers,
//! optional reconstruction, catalog ingest and prune scheduling.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::events::{Event, EventType, StageStatus};
use super::retention::DataCategory;

/// Stages of a journey, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    TransferLocal,
    TransferRemote,
    Reconstruct,
    BuildDerived,
    Ingest,
    SchedulePrune,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::TransferLocal,
        Stage::TransferRemote,
        Stage::Reconstruct,
        Stage::BuildDerived,
        Stage::Ingest,
        Stage::SchedulePrune,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransferLocal => "transfer_local",
            Self::TransferRemote => "transfer_remote",
            Self::Reconstruct => "reconstruct",
            Self::BuildDerived => "build_derived",
            Self::Ingest => "ingest",
            Self::SchedulePrune => "schedule_prune",
        }
    }

    /// State a journey is in once this stage has completed
    pub fn reached_state(&self) -> JourneyState {
        match self {
            Self::TransferLocal => JourneyState::TransferredLocal,
            Self::TransferRemote => JourneyState::TransferredRemote,
            Self::Reconstruct => JourneyState::ReconstructionSubmitted,
            Self::BuildDerived => JourneyState::ReconstructionDone,
            Self::Ingest => JourneyState::Ingested,
            Self::SchedulePrune => JourneyState::PruneScheduled,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of a journey
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JourneyState {
    Received,
    TransferredLocal,
    TransferredRemote,
    ReconstructionSubmitted,
    ReconstructionDone,
    Ingested,
    PruneScheduled,
    Done,

    /// Halted by a failed stage; resumable
    Failed {
        stage: Stage,
        endpoint: Option<String>,
        error: String,
    },

    /// Halted at a stage boundary by cancellation; resumable
    Cancelled { before: Stage },
}

impl fmt::Display for JourneyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => f.write_str("received"),
            Self::TransferredLocal => f.write_str("transferred_local"),
            Self::TransferredRemote => f.write_str("transferred_remote"),
            Self::ReconstructionSubmitted => f.write_str("reconstruction_submitted"),
            Self::ReconstructionDone => f.write_str("reconstruction_done"),
            Self::Ingested => f.write_str("ingested"),
            Self::PruneScheduled => f.write_str("prune_scheduled"),
            Self::Done => f.write_str("done"),
            Self::Failed { stage, endpoint, error } => match endpoint {
                Some(endpoint) => write!(f, "failed at {} ({}): {}", stage, endpoint, error),
                None => write!(f, "failed at {}: {}", stage, error),
            },
            Self::Cancelled { before } => write!(f, "cancelled before {}", before),
        }
    }
}

/// Parameters a journey was started with, recorded on `JourneyStarted`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyParams {
    pub plan: String,
    pub path: String,
    #[serde(default)]
    pub export_controlled: bool,
}

/// A completed hop, recorded on `HopCompleted`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopRecord {
    pub source: String,
    pub destination: String,
    pub path: String,
    pub category: DataCategory,
    pub bytes: u64,

    /// The destination already held the file; nothing was moved
    #[serde(default)]
    pub already_present: bool,
}

/// One dataset's journey, rebuilt from its event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journey {
    pub dataset_id: String,
    pub plan: String,
    pub path: String,
    pub export_controlled: bool,
    pub state: JourneyState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Status of each stage
    pub stage_statuses: BTreeMap<Stage, StageStatus>,

    /// Hops confirmed succeeded, in order
    pub hops: Vec<HopRecord>,

    /// Prune tasks scheduled for this journey's copies
    pub prune_tasks: Vec<String>,

    /// Non-fatal problems (e.g. catalog ingest failures)
    pub warnings: Vec<String>,
}

impl Journey {
    /// Create a journey that has just been received
    pub fn new(dataset_id: String, params: JourneyParams) -> Self {
        Self {
            dataset_id,
            plan: params.plan,
            path: params.path,
            export_controlled: params.export_controlled,
            state: JourneyState::Received,
            started_at: Utc::now(),
            completed_at: None,
            stage_statuses: BTreeMap::new(),
            hops: Vec::new(),
            prune_tasks: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Reconstruct journey state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut journey = Self::new(
            first_event.dataset_id.clone(),
            JourneyParams {
                plan: String::new(),
                path: String::new(),
                export_controlled: false,
            },
        );
        journey.started_at = first_event.timestamp;

        for event in events {
            journey.apply_event(event);
        }

        Some(journey)
    }

    /// Apply a single event to update journey state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::JourneyStarted => {
                self.started_at = event.timestamp;
                if let Some(params) = parse_details::<JourneyParams>(event) {
                    self.plan = params.plan;
                    self.path = params.path;
                    self.export_controlled = params.export_controlled;
                }
            }
            EventType::JourneyResumed => {
                self.state = self.progress_state();
                self.completed_at = None;
            }
            EventType::JourneyCompleted => {
                self.state = JourneyState::Done;
                self.completed_at = Some(event.timestamp);
            }
            EventType::JourneyFailed => {
                if let Some(stage) = event.stage {
                    self.state = JourneyState::Failed {
                        stage,
                        endpoint: event.endpoint.clone(),
                        error: event.error.clone().unwrap_or_default(),
                    };
                }
                self.completed_at = Some(event.timestamp);
            }
            EventType::JourneyCancelled => {
                if let Some(stage) = event.stage {
                    self.state = JourneyState::Cancelled { before: stage };
                }
            }
            EventType::StageStarted => self.set_status(event, StageStatus::Running),
            EventType::StageCompleted => {
                self.set_status(event, StageStatus::Completed);
                self.state = self.progress_state();
            }
            EventType::StageFailed => self.set_status(event, StageStatus::Failed),
            EventType::StageSkipped => self.set_status(event, StageStatus::Skipped),
            EventType::StageWarning => {
                if let Some(ref error) = event.error {
                    self.warnings.push(error.clone());
                }
            }
            EventType::HopCompleted => {
                if let Some(hop) = parse_details::<HopRecord>(event) {
                    self.hops.push(hop);
                }
            }
            EventType::PruneScheduled => {
                if let Some(task_id) = event
                    .details
                    .as_ref()
                    .and_then(|d| d.get("task_id"))
                    .and_then(|v| v.as_str())
                {
                    if !self.prune_tasks.iter().any(|t| t == task_id) {
                        self.prune_tasks.push(task_id.to_string());
                    }
                }
            }
        }
    }

    fn set_status(&mut self, event: &Event, status: StageStatus) {
        if let Some(stage) = event.stage {
            self.stage_statuses.insert(stage, status);
        }
    }

    /// State implied by the furthest completed stage
    fn progress_state(&self) -> JourneyState {
        Stage::ALL
            .iter()
            .rev()
            .find(|s| self.stage_status(**s) == StageStatus::Completed)
            .map(|s| s.reached_state())
            .unwrap_or(JourneyState::Received)
    }

    /// Status of a stage (pending if never started)
    pub fn stage_status(&self, stage: Stage) -> StageStatus {
        self.stage_statuses.get(&stage).copied().unwrap_or_default()
    }

    /// Completed or skipped: nothing left to do for this stage
    pub fn is_stage_settled(&self, stage: Stage) -> bool {
        matches!(
            self.stage_status(stage),
            StageStatus::Completed | StageStatus::Skipped
        )
    }

    /// Whether a hop has been confirmed for this journey
    pub fn has_hop(&self, source: &str, destination: &str, path: &str) -> bool {
        self.hops
            .iter()
            .any(|h| h.source == source && h.destination == destination && h.path == path)
    }

    pub fn is_done(&self) -> bool {
        self.state == JourneyState::Done
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, JourneyState::Failed { .. })
    }
}

fn parse_details<T: serde::de::DeserializeOwned>(event: &Event) -> Option<T> {
    let details = event.details.clone()?;
    match serde_json::from_value(details) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(event_id = %event.id, error = %e, "Ignoring malformed event details");
            None
        }
    }
}
