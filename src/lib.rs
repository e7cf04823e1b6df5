//! beamflow - Event-sourced beamline data orchestrator
//!
//! Moves detector files from a beamline through a facility data cache to
//! HPC storage, launches reconstruction, registers datasets in a metadata
//! catalog and deletes stale copies once their retention period expires.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - Every journey step is recorded as an immutable event
//! - Current state is derived by replaying events
//! - Failed or interrupted journeys resume at the first unfinished stage
//! - Scheduled prunes live in their own ledger and survive restarts
//!
//! # Modules
//!
//! - `adapters`: Movement service, storage, compute and catalog integrations
//! - `core`: Controllers (Transfer, Prune, Dispatcher), EventStore, Scheduler
//! - `domain`: Data structures (Endpoint, Event, Journey, PruneTask)
//! - `ingest`: Beamline directory watcher
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Move one file through the bl832 plan
//! beamflow run bl832 user/2024/scan_001.h5
//!
//! # Check journey status
//! beamflow status <dataset-id>
//!
//! # Resume a failed journey
//! beamflow resume <dataset-id>
//!
//! # Delete copies whose retention has expired
//! beamflow prune run-due
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod ingest;
pub mod services;

// Re-export main types at crate root for convenience
pub use config::{ConfigError, Settings};
pub use core::{Dispatcher, PruneController, TransferController};
pub use domain::{Endpoint, EndpointRegistry, Event, EventType, Journey, JourneyState, Stage};
pub use services::{Services, Timers};
