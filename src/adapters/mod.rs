//! Adapter interfaces for external systems.
//!
//! The controllers only talk to the outside world through these traits:
//! - TransferService: the data movement service (Globus or a local copy)
//! - EndpointStorage: existence, size and deletion on an endpoint
//! - ComputeService: batch job submission at an HPC facility
//!   (reconstruction, and tape archive copies through [`hpss`])
//! - MetadataCatalog: dataset registration (SciCat)

pub mod compute;
pub mod globus;
pub mod hpss;
pub mod local;
pub mod scicat;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::safety::RelativePath;
use crate::domain::{Endpoint, TransferRequest};

pub use compute::{AlcfBackend, HpcSite, NerscBackend, ReconstructionBackend, RestComputeService};
pub use globus::GlobusClient;
pub use hpss::{HpssSettings, TapeArchiver, TapeRouter};
pub use local::LocalFilesystem;
pub use scicat::ScicatCatalog;

/// Failure talking to an external service
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection problems, timeouts, 5xx and throttling; worth retrying
    #[error("Network error: {0}")]
    Network(String),

    /// The service refused the request; retrying will not help
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Local I/O failure on a mounted endpoint
    #[error("IO error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status.is_client_error() && status.as_u16() != 429 => {
                Self::Rejected(e.to_string())
            }
            _ if e.is_decode() => Self::Rejected(e.to_string()),
            _ => Self::Network(e.to_string()),
        }
    }
}

/// Reported state of a submitted transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferStatus {
    /// Still running; `detail` carries the service's own status text
    /// (e.g. Globus `nice_status`)
    Pending { detail: Option<String> },
    Succeeded { bytes: u64 },
    Failed { reason: String },
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending { .. })
    }
}

/// Data movement service
#[async_trait]
pub trait TransferService: Send + Sync {
    /// Human-readable service name
    fn name(&self) -> &str;

    /// Submit a transfer and return the service's transfer id
    async fn submit(&self, request: &TransferRequest) -> Result<String, TransportError>;

    async fn status(&self, transfer_id: &str) -> Result<TransferStatus, TransportError>;

    /// Best-effort cancellation
    async fn cancel(&self, transfer_id: &str) -> Result<(), TransportError>;
}

/// File operations on an endpoint
#[async_trait]
pub trait EndpointStorage: Send + Sync {
    async fn exists(&self, endpoint: &Endpoint, path: &RelativePath) -> Result<bool, TransportError>;

    /// Size in bytes (directories: total of their files), None if absent
    async fn size(&self, endpoint: &Endpoint, path: &RelativePath) -> Result<Option<u64>, TransportError>;

    /// Delete a file or directory tree; deleting an absent path succeeds
    async fn delete(&self, endpoint: &Endpoint, path: &RelativePath) -> Result<(), TransportError>;
}

/// Batch job description handed to the compute service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    pub site: HpcSite,

    /// Site-specific body (flow input for ALCF, batch script for NERSC)
    pub payload: serde_json::Value,
}

/// Reported state of a compute job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Batch job submission at an HPC facility
#[async_trait]
pub trait ComputeService: Send + Sync {
    async fn submit_job(&self, descriptor: &JobDescriptor) -> Result<String, TransportError>;

    async fn status(&self, job_id: &str) -> Result<JobStatus, TransportError>;
}

/// What the catalog is told about a finished dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// Journey dataset id
    pub dataset_id: String,
    pub beamline: String,
    pub path: String,

    /// Endpoints holding a copy, in journey order
    pub locations: Vec<String>,

    /// Derived outputs, when reconstruction ran
    #[serde(default)]
    pub derived: Vec<String>,
}

/// Dataset catalog
#[async_trait]
pub trait MetadataCatalog: Send + Sync {
    /// Register a dataset and return the catalog's id for it
    async fn ingest(&self, descriptor: &DatasetDescriptor) -> Result<String, TransportError>;
}
