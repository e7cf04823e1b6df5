//! Domain types for the beamflow orchestrator.
//!
//! This module contains the core data structures:
//! - Endpoint: Named storage locations and their registry
//! - Events: Immutable records of journey state changes
//! - Journey: Per-dataset state rebuilt from events
//! - Transfer: Requests and results for one hop
//! - Retention: Policies and prune tasks

pub mod endpoint;
pub mod events;
pub mod journey;
pub mod retention;
pub mod transfer;

// Re-export commonly used types
pub use endpoint::{Capability, Endpoint, EndpointKind, EndpointRegistry, UnknownEndpoint};
pub use events::{Event, EventType, StageStatus};
pub use journey::{HopRecord, Journey, JourneyParams, JourneyState, Stage};
pub use retention::{
    CategoryRules, DataCategory, PruneOutcome, PruneReport, PruneTask, PruneTaskHandle,
    RetentionPolicies, RetentionPolicy,
};
pub use transfer::{TransferOutcome, TransferRequest, TransferResult};
