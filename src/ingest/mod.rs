//! Detector file ingestion.
//!
//! The watcher finds new, stable files on a beamline endpoint and hands
//! their relative paths to the dispatcher:
//!
//! ```text
//! detector -> beamline endpoint -> Watcher -> Dispatcher -> journeys/{id}/events.jsonl
//! ```

pub mod watcher;

pub use watcher::{BeamlineWatcher, DatasetFile, WatchHandle, WatcherConfig, WatcherError};
