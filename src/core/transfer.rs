//! Transfer Controller: one hop of data movement.
//!
//! Validates the path and endpoint capabilities, submits to the movement
//! service with retry on transient errors, then polls the remote task until
//! it finishes or the deadline passes. A timed-out task is left running.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use super::metrics::TransferMetrics;
use super::safety::{require_capability, PathViolation, RelativePath};
use crate::adapters::{TransferService, TransferStatus, TransportError};
use crate::domain::{Capability, Endpoint, TransferOutcome, TransferRequest, TransferResult};

/// Service status texts that will not resolve on their own
const FATAL_STATUSES: [&str; 2] = ["FILE_NOT_FOUND", "PERMISSION_DENIED"];

/// Retry policy for transfer submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Polling and retry settings for the controller
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub retry: RetryPolicy,
}

impl TransferSettings {
    pub fn from_secs(poll_interval_secs: u64, max_wait_secs: u64, retry: RetryPolicy) -> Self {
        Self {
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_wait: Duration::from_secs(max_wait_secs),
            retry,
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from_secs(5, 600, RetryPolicy::default())
    }
}

/// Permanent errors raised before any I/O
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error(transparent)]
    Path(#[from] PathViolation),

    #[error("Source and destination are the same endpoint: {0}")]
    SameEndpoint(String),
}

/// Moves one path between two endpoints
pub struct TransferController {
    service: Arc<dyn TransferService>,
    settings: TransferSettings,
    metrics: Option<Arc<TransferMetrics>>,
}

impl TransferController {
    /// Create a new controller over a movement service
    pub fn new(service: Arc<dyn TransferService>, settings: TransferSettings) -> Self {
        Self {
            service,
            settings,
            metrics: None,
        }
    }

    /// Record every finished transfer in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<TransferMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Transfer `path` from `source` to `destination`.
    ///
    /// Validation failures are returned as errors. Everything that happens
    /// after validation (failed submission, remote failure, timeout) is
    /// reported through [`TransferResult::outcome`].
    #[instrument(skip_all, fields(source = %source.name, destination = %destination.name, path = %path))]
    pub async fn transfer(
        &self,
        source: &Arc<Endpoint>,
        destination: &Arc<Endpoint>,
        path: &str,
    ) -> Result<TransferResult, TransferError> {
        let path = RelativePath::parse(path)?;
        if source.name == destination.name {
            return Err(TransferError::SameEndpoint(source.name.clone()));
        }
        require_capability(source, Capability::Readable)?;
        require_capability(destination, Capability::Writable)?;

        let request = TransferRequest::new(Arc::clone(source), Arc::clone(destination), path);
        Ok(self.execute(&request).await)
    }

    async fn execute(&self, request: &TransferRequest) -> TransferResult {
        let started = Instant::now();
        let mut result = TransferResult::from_request(request, TransferOutcome::Failed);

        info!(
            correlation_id = %request.correlation_id,
            service = self.service.name(),
            "Starting transfer {}",
            request.describe()
        );

        match self.submit_with_retry(request, &mut result).await {
            Ok(transfer_id) => {
                result.transfer_id = Some(transfer_id.clone());
                self.await_completion(&transfer_id, &mut result).await;
            }
            Err(e) => result.error = Some(e.to_string()),
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        log_result(&result);
        if let Some(ref metrics) = self.metrics {
            metrics.record(&result);
            metrics.push().await;
        }
        result
    }

    async fn submit_with_retry(
        &self,
        request: &TransferRequest,
        result: &mut TransferResult,
    ) -> Result<String, TransportError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            result.attempts = attempt;

            match self.service.submit(request).await {
                Ok(transfer_id) => {
                    info!(attempt, transfer_id = %transfer_id, "Transfer submitted");
                    return Ok(transfer_id);
                }
                Err(e) if e.is_transient() && self.settings.retry.should_retry(attempt) => {
                    let delay = self.settings.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transfer submission failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(attempt, error = %e, "Transfer submission failed permanently");
                    return Err(e);
                }
            }
        }
    }

    /// Poll until the task is terminal or `max_wait` has passed
    async fn await_completion(&self, transfer_id: &str, result: &mut TransferResult) {
        let started = Instant::now();
        let mut last_detail: Option<String> = None;

        loop {
            match self.service.status(transfer_id).await {
                Ok(TransferStatus::Succeeded { bytes }) => {
                    result.outcome = TransferOutcome::Succeeded;
                    result.bytes_moved = bytes;
                    return;
                }
                Ok(TransferStatus::Failed { reason }) => {
                    result.outcome = TransferOutcome::Failed;
                    result.error = Some(reason);
                    return;
                }
                Ok(TransferStatus::Pending { detail }) => {
                    if let Some(ref status) = detail {
                        if FATAL_STATUSES.iter().any(|fatal| status.starts_with(fatal)) {
                            error!(transfer_id, status = %status, "Transfer cannot complete, cancelling");
                            if let Err(e) = self.service.cancel(transfer_id).await {
                                warn!(transfer_id, error = %e, "Cancel request failed");
                            }
                            result.outcome = TransferOutcome::Failed;
                            result.error = Some(status.clone());
                            return;
                        }
                    }
                    if detail != last_detail {
                        debug!(transfer_id, status = ?detail, "Transfer in progress");
                        last_detail = detail;
                    }
                }
                Err(e) => warn!(transfer_id, error = %e, "Transfer status check failed"),
            }

            let elapsed = started.elapsed();
            if elapsed >= self.settings.max_wait {
                warn!(
                    transfer_id,
                    max_wait_secs = self.settings.max_wait.as_secs(),
                    "Stopped waiting for transfer; it may complete in background"
                );
                result.outcome = TransferOutcome::TimedOut;
                result.error = Some(format!(
                    "transfer {} did not finish within {:?}",
                    transfer_id, self.settings.max_wait
                ));
                return;
            }

            tokio::time::sleep(self.settings.poll_interval.min(self.settings.max_wait - elapsed)).await;
        }
    }
}

fn log_result(result: &TransferResult) {
    match result.outcome {
        TransferOutcome::Succeeded => info!(
            bytes = result.bytes_moved,
            duration_ms = result.duration_ms,
            throughput_mb_s = result.throughput_mb_s().unwrap_or(0.0),
            attempts = result.attempts,
            "Transfer succeeded"
        ),
        TransferOutcome::Failed | TransferOutcome::TimedOut => error!(
            outcome = ?result.outcome,
            duration_ms = result.duration_ms,
            attempts = result.attempts,
            error = result.error.as_deref().unwrap_or(""),
            "Transfer did not succeed"
        ),
    }
}
