//! Transfer requests and results.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::endpoint::Endpoint;
use crate::core::safety::RelativePath;

/// One hop of data movement, consumed once
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub source: Arc<Endpoint>,
    pub destination: Arc<Endpoint>,
    pub path: RelativePath,

    /// Ties log lines and the result back to this request
    pub correlation_id: Uuid,
}

impl TransferRequest {
    /// Create a new request with a fresh correlation id
    pub fn new(source: Arc<Endpoint>, destination: Arc<Endpoint>, path: RelativePath) -> Self {
        Self {
            source,
            destination,
            path,
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Short description for logs and event summaries
    pub fn describe(&self) -> String {
        format!("{} -> {}: {}", self.source.name, self.destination.name, self.path)
    }
}

/// How a transfer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    Succeeded,
    Failed,
    /// The deadline passed while the remote task was still running. The task
    /// was not cancelled and may still complete in the background.
    TimedOut,
}

/// Result of one [`TransferRequest`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub correlation_id: Uuid,
    pub source: String,
    pub destination: String,
    pub path: String,
    pub outcome: TransferOutcome,
    pub bytes_moved: u64,
    pub duration_ms: u64,

    /// Submission attempts made (at least 1)
    pub attempts: u32,

    /// Id issued by the movement service, when submission got that far
    pub transfer_id: Option<String>,

    pub error: Option<String>,
}

impl TransferResult {
    pub(crate) fn from_request(request: &TransferRequest, outcome: TransferOutcome) -> Self {
        Self {
            correlation_id: request.correlation_id,
            source: request.source.name.clone(),
            destination: request.destination.name.clone(),
            path: request.path.to_string(),
            outcome,
            bytes_moved: 0,
            duration_ms: 0,
            attempts: 0,
            transfer_id: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == TransferOutcome::Succeeded
    }

    /// Throughput in MB/s, when anything was moved
    pub fn throughput_mb_s(&self) -> Option<f64> {
        if self.bytes_moved == 0 || self.duration_ms == 0 {
            return None;
        }
        Some(self.bytes_moved as f64 / 1_000_000.0 / (self.duration_ms as f64 / 1000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EndpointKind;

    fn request() -> TransferRequest {
        TransferRequest::new(
            Arc::new(Endpoint::new("spot832", "/raw", EndpointKind::Filesystem)),
            Arc::new(Endpoint::new("data832", "/data", EndpointKind::Filesystem)),
            RelativePath::parse("user/scan.h5").unwrap(),
        )
    }

    #[test]
    fn test_describe() {
        assert_eq!(request().describe(), "spot832 -> data832: user/scan.h5");
    }

    #[test]
    fn test_throughput() {
        let mut result = TransferResult::from_request(&request(), TransferOutcome::Succeeded);
        assert!(result.throughput_mb_s().is_none());

        result.bytes_moved = 50_000_000;
        result.duration_ms = 2_000;
        assert_eq!(result.throughput_mb_s(), Some(25.0));
        assert!(result.is_success());
    }
}
