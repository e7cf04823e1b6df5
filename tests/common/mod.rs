//! Shared fixtures for the integration tests.
//!
//! Endpoints are directories under a temp dir, moved between with the local
//! filesystem service. External services are replaced by recording fakes.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use beamflow::adapters::compute::{AlcfBackend, AlcfSettings, JobPolling, ReconstructionBackend};
use beamflow::adapters::{
    ComputeService, DatasetDescriptor, EndpointStorage, JobDescriptor, JobStatus, LocalFilesystem,
    MetadataCatalog, TransferService, TransferStatus, TransportError,
};
use beamflow::core::{
    Clock, Dispatcher, ManualClock, ManualScheduler, PruneController, PruneLedger, RetryPolicy,
    Scheduler, TransferController, TransferSettings,
};
use beamflow::domain::{
    DataCategory, Endpoint, EndpointKind, EndpointRegistry, RetentionPolicies, RetentionPolicy,
    TransferRequest,
};

/// Fast polling and near-zero backoff, so tests finish quickly
pub fn fast_settings() -> TransferSettings {
    TransferSettings {
        poll_interval: Duration::from_millis(10),
        max_wait: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        },
    }
}

pub fn policy(endpoint: &str, applies_to: DataCategory, delete_after_days: u32) -> RetentionPolicy {
    RetentionPolicy {
        endpoint: endpoint.to_string(),
        applies_to,
        delete_after_days,
    }
}

/// Local copies, failing the first `failures` submissions with a network error
pub struct FlakyMover {
    inner: LocalFilesystem,
    failures: AtomicU32,
    submits: AtomicU32,
}

impl FlakyMover {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: LocalFilesystem::new(),
            failures: AtomicU32::new(failures),
            submits: AtomicU32::new(0),
        }
    }

    pub fn submits(&self) -> u32 {
        self.submits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferService for FlakyMover {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn submit(&self, request: &TransferRequest) -> Result<String, TransportError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Network("connection reset by peer".to_string()));
        }
        self.inner.submit(request).await
    }

    async fn status(&self, transfer_id: &str) -> Result<TransferStatus, TransportError> {
        self.inner.status(transfer_id).await
    }

    async fn cancel(&self, transfer_id: &str) -> Result<(), TransportError> {
        self.inner.cancel(transfer_id).await
    }
}

/// Accepts every submission and replays a fixed status sequence; the last
/// status repeats
pub struct ScriptedMover {
    statuses: Mutex<VecDeque<TransferStatus>>,
    cancelled: Mutex<Vec<String>>,
}

impl ScriptedMover {
    pub fn new(statuses: impl IntoIterator<Item = TransferStatus>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into_iter().collect()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransferService for ScriptedMover {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, _request: &TransferRequest) -> Result<String, TransportError> {
        Ok("task-1".to_string())
    }

    async fn status(&self, _transfer_id: &str) -> Result<TransferStatus, TransportError> {
        let mut statuses = self.statuses.lock().unwrap();
        if statuses.len() > 1 {
            return Ok(statuses.pop_front().unwrap());
        }
        Ok(statuses
            .front()
            .cloned()
            .unwrap_or(TransferStatus::Pending { detail: None }))
    }

    async fn cancel(&self, transfer_id: &str) -> Result<(), TransportError> {
        self.cancelled.lock().unwrap().push(transfer_id.to_string());
        Ok(())
    }
}

/// Compute service whose jobs all end the same way
pub struct RecordingCompute {
    succeed: bool,
    jobs: Mutex<Vec<JobDescriptor>>,
}

impl RecordingCompute {
    pub fn new(succeed: bool) -> Self {
        Self {
            succeed,
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.lock().unwrap().iter().map(|j| j.name.clone()).collect()
    }
}

#[async_trait]
impl ComputeService for RecordingCompute {
    async fn submit_job(&self, descriptor: &JobDescriptor) -> Result<String, TransportError> {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.push(descriptor.clone());
        Ok(format!("job-{}", jobs.len()))
    }

    async fn status(&self, _job_id: &str) -> Result<JobStatus, TransportError> {
        Ok(if self.succeed {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        })
    }
}

/// Catalog that records what it is sent, or refuses everything
pub struct RecordingCatalog {
    reachable: bool,
    ingested: Mutex<Vec<DatasetDescriptor>>,
}

impl RecordingCatalog {
    pub fn new() -> Self {
        Self {
            reachable: true,
            ingested: Mutex::new(Vec::new()),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ingested: Mutex::new(Vec::new()),
        }
    }

    pub fn ingested(&self) -> Vec<DatasetDescriptor> {
        self.ingested.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetadataCatalog for RecordingCatalog {
    async fn ingest(&self, descriptor: &DatasetDescriptor) -> Result<String, TransportError> {
        if !self.reachable {
            return Err(TransportError::Network("catalog unreachable".to_string()));
        }
        self.ingested.lock().unwrap().push(descriptor.clone());
        Ok(format!("pid/{}", descriptor.dataset_id))
    }
}

/// A set of directory-backed endpoints with a frozen clock and manual timers
pub struct Facility {
    pub temp: TempDir,
    pub registry: EndpointRegistry,
    pub clock: Arc<ManualClock>,
    pub scheduler: Arc<ManualScheduler>,
    pub storage: Arc<LocalFilesystem>,
    pub mover: Arc<FlakyMover>,
    pub prunes: Arc<PruneController>,
}

impl Facility {
    pub fn new(endpoints: &[&str], policies: Vec<RetentionPolicy>) -> Self {
        Self::with_endpoints(
            endpoints
                .iter()
                .map(|name| (name.to_string(), EndpointKind::Filesystem))
                .collect(),
            policies,
            0,
        )
    }

    /// Like [`Facility::new`], failing the first `failures` submissions
    pub fn flaky(endpoints: &[&str], policies: Vec<RetentionPolicy>, failures: u32) -> Self {
        Self::with_endpoints(
            endpoints
                .iter()
                .map(|name| (name.to_string(), EndpointKind::Filesystem))
                .collect(),
            policies,
            failures,
        )
    }

    fn with_endpoints(endpoints: Vec<(String, EndpointKind)>, policies: Vec<RetentionPolicy>, failures: u32) -> Self {
        let temp = TempDir::new().unwrap();
        let registry = EndpointRegistry::new(endpoints.into_iter().map(|(name, kind)| {
            let root = temp.path().join("endpoints").join(&name);
            std::fs::create_dir_all(&root).unwrap();
            Endpoint::new(name, root.to_string_lossy(), kind)
        }));

        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()));
        let scheduler = Arc::new(ManualScheduler::new());
        let storage = Arc::new(LocalFilesystem::new());
        let prunes = Arc::new(PruneController::new(
            Arc::clone(&storage) as Arc<dyn EndpointStorage>,
            PruneLedger::in_state_dir(&temp.path().join("state")),
            Arc::clone(&scheduler) as Arc<dyn Scheduler>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            RetentionPolicies::new(policies),
        ));

        Self {
            temp,
            registry,
            clock,
            scheduler,
            storage,
            mover: Arc::new(FlakyMover::new(failures)),
            prunes,
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.temp.path().join("state")
    }

    pub fn endpoint(&self, name: &str) -> Arc<Endpoint> {
        self.registry.get(name).unwrap()
    }

    pub fn file(&self, endpoint: &str, path: &str) -> PathBuf {
        Path::new(&self.endpoint(endpoint).root_path).join(path)
    }

    pub fn write(&self, endpoint: &str, path: &str, contents: &[u8]) {
        let file = self.file(endpoint, path);
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(file, contents).unwrap();
    }

    pub fn exists(&self, endpoint: &str, path: &str) -> bool {
        self.file(endpoint, path).exists()
    }

    pub fn transfers(&self) -> Arc<TransferController> {
        Arc::new(TransferController::new(
            Arc::clone(&self.mover) as Arc<dyn TransferService>,
            fast_settings(),
        ))
    }

    /// Dispatcher over this facility with no compute or catalog
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.registry.clone(),
            self.transfers(),
            Arc::clone(&self.storage) as Arc<dyn EndpointStorage>,
            Arc::clone(&self.prunes),
            self.state_dir(),
        )
    }
}

/// ALCF backend over a fake compute service
pub fn alcf_backend(service: Arc<RecordingCompute>) -> ReconstructionBackend {
    let settings = AlcfSettings {
        endpoint_id: "polaris-endpoint".to_string(),
        allocation_root: "/eagle/IRIProd/ALS".to_string(),
        reconstruct_command: "recon {name}".to_string(),
        derived_command: "zarr {stem}".to_string(),
    };
    let polling = JobPolling {
        poll_interval: Duration::from_millis(10),
        max_wait: Duration::from_secs(5),
    };
    ReconstructionBackend::Alcf(AlcfBackend::new(service as Arc<dyn ComputeService>, settings, polling))
}
