//! Event types for the event-sourced journey log.
//!
//! Every stage transition of a dataset journey is recorded as an immutable
//! event in an append-only log; the journey state is rebuilt by replaying it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::journey::Stage;

/// A single event in the append-only journey log.
///
/// Events are the source of truth for journey state. The current state of any
/// journey can be reconstructed by replaying its events in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// Dataset the journey belongs to
    pub dataset_id: String,

    /// Dispatcher invocation that wrote the event; a resumed journey has
    /// several
    pub run_id: Uuid,

    /// Stage the event refers to (if applicable)
    pub stage: Option<Stage>,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key format: "{dataset_id}:{stage}:{input_hash}"
    pub idempotency_key: String,

    /// Human-readable summary
    pub payload_summary: String,

    /// Current status of the stage/journey
    pub status: StageStatus,

    /// Endpoint involved, for failure attribution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Time taken in milliseconds (for completed stages)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,

    /// Structured payload (journey parameters, completed hops, prune task ids)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        dataset_id: &str,
        run_id: Uuid,
        stage: Option<Stage>,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
        status: StageStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            dataset_id: dataset_id.to_string(),
            run_id,
            stage,
            event_type,
            idempotency_key,
            payload_summary,
            status,
            endpoint: None,
            duration_ms: None,
            error: None,
            details: None,
        }
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    /// Attribute the event to an endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Attach a structured payload
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Types of events that can occur during a journey
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new journey has started
    JourneyStarted,

    /// A journey was picked up again by a later dispatcher invocation
    JourneyResumed,

    /// All stages completed
    JourneyCompleted,

    /// A stage failed and halted the journey
    JourneyFailed,

    /// Cancellation was observed at a stage boundary
    JourneyCancelled,

    /// A stage has started execution
    StageStarted,

    /// One hop of a transfer stage completed (or was found already present)
    HopCompleted,

    /// A stage completed successfully
    StageCompleted,

    /// A stage failed
    StageFailed,

    /// A stage was skipped (disabled or not configured)
    StageSkipped,

    /// A stage completed with a non-fatal problem
    StageWarning,

    /// A prune task was scheduled for a copy made by this journey
    PruneScheduled,
}

/// Status of a stage or journey
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not yet started
    #[default]
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully
    Completed,

    /// Failed (with error)
    Failed,

    /// Skipped (disabled, or nothing to do)
    Skipped,
}
