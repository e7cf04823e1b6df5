//! Append-only journey event store with file-based persistence.
//!
//! Each dataset gets its own directory under `{home}/journeys/{dataset_id}/`
//! holding an `events.jsonl` log. Events are stored as newline-delimited JSON
//! for easy inspection.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::domain::{Event, EventType, Journey, Stage};

/// File-based event store for one dataset journey
pub struct EventStore {
    /// Directory containing the journey
    journey_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,
}

impl EventStore {
    /// Create or open the event store for a dataset
    pub async fn open(state_dir: &Path, dataset_id: &str) -> Result<Self> {
        let journey_dir = Self::journeys_dir(state_dir).join(dataset_id);

        fs::create_dir_all(&journey_dir)
            .await
            .with_context(|| format!("Failed to create journey directory: {}", journey_dir.display()))?;

        let events_path = journey_dir.join("events.jsonl");

        Ok(Self {
            journey_dir,
            events_path,
        })
    }

    /// Directory holding all journeys under a state directory
    pub fn journeys_dir(state_dir: &Path) -> PathBuf {
        state_dir.join("journeys")
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the journey directory
    pub fn journey_dir(&self) -> &Path {
        &self.journey_dir
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !fs::try_exists(&self.events_path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Rebuild the journey from its log (None if nothing was recorded yet)
    pub async fn load_journey(&self) -> Result<Option<Journey>> {
        let events = self.replay().await?;
        Ok(Journey::from_events(&events))
    }

    /// List all dataset ids that have a journey directory
    pub async fn list_datasets(state_dir: &Path) -> Result<Vec<String>> {
        let base_dir = Self::journeys_dir(state_dir);

        if !fs::try_exists(&base_dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut datasets = Vec::new();
        let mut entries = fs::read_dir(&base_dir)
            .await
            .with_context(|| format!("Failed to read journeys directory: {}", base_dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    datasets.push(name.to_string());
                }
            }
        }

        datasets.sort();
        Ok(datasets)
    }
}

/// Deterministic dataset id for a file under a plan
pub fn dataset_id(plan: &str, path: &str) -> String {
    hash_input(&format!("{}:{}", plan, path))
}

/// Generate an idempotency key for a stage
pub fn generate_idempotency_key(dataset_id: &str, stage: Stage, input: &str) -> String {
    let input_hash = hash_input(input);
    format!("{}:{}:{}", dataset_id, stage, input_hash)
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8]) // First 16 hex chars (8 bytes)
}
