//! Remote reconstruction backends and the REST compute-job gateway.
//!
//! Both facilities are driven through the same [`ComputeService`]; they
//! differ only in the job descriptors they build. ALCF jobs are command
//! invocations on a Globus Compute endpoint, NERSC jobs are Slurm batch
//! scripts running the reconstruction container.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, instrument, warn};

use super::{ComputeService, JobDescriptor, JobStatus, TransportError};
use crate::core::safety::RelativePath;

/// HPC facility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HpcSite {
    Alcf,
    Nersc,
}

impl std::fmt::Display for HpcSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alcf => f.write_str("alcf"),
            Self::Nersc => f.write_str("nersc"),
        }
    }
}

/// How long to wait for a job and how often to ask
#[derive(Debug, Clone, Copy)]
pub struct JobPolling {
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl JobPolling {
    pub fn from_secs(poll_interval_secs: u64, max_wait_secs: u64) -> Self {
        Self {
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_wait: Duration::from_secs(max_wait_secs),
        }
    }
}

/// ALCF (Polaris via Globus Compute) job settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlcfSettings {
    /// Globus Compute endpoint the commands run on
    pub endpoint_id: String,

    /// Allocation root on the Eagle filesystem
    pub allocation_root: String,

    #[serde(default = "default_alcf_reconstruct")]
    pub reconstruct_command: String,

    #[serde(default = "default_alcf_derived")]
    pub derived_command: String,
}

fn default_alcf_reconstruct() -> String {
    "python {root}/scripts/globus_reconstruction.py {name} {folder}".to_string()
}
fn default_alcf_derived() -> String {
    "python {root}/scripts/tiff_to_zarr.py {root}/data/scratch/{folder}/rec{stem}/ --raw_directory {root}/data/raw/{folder}/{name}"
        .to_string()
}

/// NERSC (Perlmutter via Slurm) job settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NerscSettings {
    #[serde(default = "default_machine")]
    pub machine: String,

    #[serde(default = "default_account")]
    pub account: String,

    #[serde(default = "default_qos")]
    pub qos: String,

    #[serde(default = "default_walltime")]
    pub walltime: String,

    /// Container image holding the reconstruction code
    pub image: String,

    /// Scratch directory for job logs and outputs
    pub scratch_path: String,

    #[serde(default = "default_nersc_reconstruct")]
    pub reconstruct_command: String,

    #[serde(default = "default_nersc_derived")]
    pub derived_command: String,
}

fn default_machine() -> String {
    "perlmutter".to_string()
}
fn default_account() -> String {
    "als".to_string()
}
fn default_qos() -> String {
    "preempt".to_string()
}
fn default_walltime() -> String {
    "00:15:00".to_string()
}
fn default_nersc_reconstruct() -> String {
    "python sfapi_reconstruction.py {name} {folder}".to_string()
}
fn default_nersc_derived() -> String {
    "python tiff_to_zarr.py {root}/{folder}/rec{stem}/ --raw_directory {root}/{folder}/{name}".to_string()
}

/// Substitute `{root}`, `{folder}`, `{name}`, `{stem}` in a command template
fn render_command(template: &str, root: &str, path: &RelativePath) -> String {
    template
        .replace("{root}", root.trim_end_matches('/'))
        .replace("{folder}", path.folder())
        .replace("{name}", path.file_name())
        .replace("{stem}", path.file_stem())
}

/// Reconstruction at ALCF
pub struct AlcfBackend {
    service: Arc<dyn ComputeService>,
    settings: AlcfSettings,
    polling: JobPolling,
}

impl AlcfBackend {
    pub fn new(service: Arc<dyn ComputeService>, settings: AlcfSettings, polling: JobPolling) -> Self {
        Self {
            service,
            settings,
            polling,
        }
    }

    fn job(&self, kind: &str, template: &str, path: &RelativePath) -> JobDescriptor {
        let root = &self.settings.allocation_root;
        JobDescriptor {
            name: format!("{}_{}", kind, path.file_stem()),
            site: HpcSite::Alcf,
            payload: json!({
                "endpoint_id": self.settings.endpoint_id,
                "rundir": format!("{}/data/raw", root.trim_end_matches('/')),
                "command": render_command(template, root, path),
            }),
        }
    }

    pub fn reconstruction_job(&self, path: &RelativePath) -> JobDescriptor {
        self.job("tomo_recon", &self.settings.reconstruct_command, path)
    }

    pub fn derived_job(&self, path: &RelativePath) -> JobDescriptor {
        self.job("tiff_to_zarr", &self.settings.derived_command, path)
    }
}

/// Reconstruction at NERSC
pub struct NerscBackend {
    service: Arc<dyn ComputeService>,
    settings: NerscSettings,
    polling: JobPolling,
}

impl NerscBackend {
    pub fn new(service: Arc<dyn ComputeService>, settings: NerscSettings, polling: JobPolling) -> Self {
        Self {
            service,
            settings,
            polling,
        }
    }

    fn batch_script(&self, job_name: &str, command: &str) -> String {
        let s = &self.settings;
        format!(
            "#!/bin/bash\n\
             #SBATCH -q {qos}\n\
             #SBATCH -A {account}\n\
             #SBATCH -C cpu\n\
             #SBATCH --job-name={job_name}\n\
             #SBATCH --output={scratch}/logs/%x_%j.out\n\
             #SBATCH --error={scratch}/logs/%x_%j.err\n\
             #SBATCH -N 1\n\
             #SBATCH --ntasks-per-node 1\n\
             #SBATCH --cpus-per-task 64\n\
             #SBATCH --time={walltime}\n\
             #SBATCH --exclusive\n\
             \n\
             srun podman-hpc run --volume {scratch}:/alsdata {image} {command}\n",
            qos = s.qos,
            account = s.account,
            job_name = job_name,
            scratch = s.scratch_path.trim_end_matches('/'),
            walltime = s.walltime,
            image = s.image,
            command = command,
        )
    }

    fn job(&self, kind: &str, template: &str, path: &RelativePath) -> JobDescriptor {
        let name = format!("{}_{}", kind, path.file_stem());
        let command = render_command(template, &self.settings.scratch_path, path);
        JobDescriptor {
            payload: json!({
                "machine": self.settings.machine,
                "script": self.batch_script(&name, &command),
            }),
            name,
            site: HpcSite::Nersc,
        }
    }

    pub fn reconstruction_job(&self, path: &RelativePath) -> JobDescriptor {
        self.job("tomo_recon", &self.settings.reconstruct_command, path)
    }

    pub fn derived_job(&self, path: &RelativePath) -> JobDescriptor {
        self.job("tiff_to_zarr", &self.settings.derived_command, path)
    }
}

/// Reconstruction backend selected by configuration
pub enum ReconstructionBackend {
    Alcf(AlcfBackend),
    Nersc(NerscBackend),
}

impl ReconstructionBackend {
    pub fn site(&self) -> HpcSite {
        match self {
            Self::Alcf(_) => HpcSite::Alcf,
            Self::Nersc(_) => HpcSite::Nersc,
        }
    }

    /// Run the reconstruction job for a raw file; true if it succeeded
    pub async fn reconstruct(&self, path: &RelativePath) -> bool {
        match self {
            Self::Alcf(b) => run_job(b.service.as_ref(), &b.reconstruction_job(path), b.polling).await,
            Self::Nersc(b) => run_job(b.service.as_ref(), &b.reconstruction_job(path), b.polling).await,
        }
    }

    /// Build multi-resolution derived outputs; true if it succeeded
    pub async fn build_derived(&self, path: &RelativePath) -> bool {
        match self {
            Self::Alcf(b) => run_job(b.service.as_ref(), &b.derived_job(path), b.polling).await,
            Self::Nersc(b) => run_job(b.service.as_ref(), &b.derived_job(path), b.polling).await,
        }
    }
}

/// Submit a job and poll it to a terminal state or the deadline
#[instrument(skip_all, fields(job = %descriptor.name, site = %descriptor.site))]
async fn run_job(service: &dyn ComputeService, descriptor: &JobDescriptor, polling: JobPolling) -> bool {
    let started = Instant::now();

    let job_id = match service.submit_job(descriptor).await {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "Job submission failed");
            return false;
        }
    };
    info!(job_id = %job_id, "Job submitted");

    let mut last_status = None;
    loop {
        match service.status(&job_id).await {
            Ok(JobStatus::Succeeded) => {
                info!(job_id = %job_id, elapsed_secs = started.elapsed().as_secs(), "Job succeeded");
                return true;
            }
            Ok(JobStatus::Failed) => {
                error!(job_id = %job_id, elapsed_secs = started.elapsed().as_secs(), "Job failed");
                return false;
            }
            Ok(status) => {
                if last_status.as_ref() != Some(&status) {
                    info!(job_id = %job_id, status = ?status, "Job in progress");
                    last_status = Some(status);
                }
            }
            Err(e) => warn!(job_id = %job_id, error = %e, "Job status check failed"),
        }

        let elapsed = started.elapsed();
        if elapsed >= polling.max_wait {
            warn!(
                job_id = %job_id,
                max_wait_secs = polling.max_wait.as_secs(),
                "Stopped waiting for job; it may still complete"
            );
            return false;
        }
        tokio::time::sleep(polling.poll_interval.min(polling.max_wait - elapsed)).await;
    }
}

/// Compute-job gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub base_url: String,

    /// Environment variable holding the bearer token
    #[serde(default = "default_gateway_token_env")]
    pub token_env: String,
}

fn default_gateway_token_env() -> String {
    "BEAMFLOW_COMPUTE_TOKEN".to_string()
}

/// [`ComputeService`] over a REST job gateway (`POST /jobs`, `GET /jobs/{id}`)
pub struct RestComputeService {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct JobCreated {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct JobState {
    status: JobStatus,
}

impl RestComputeService {
    pub fn new(base_url: &str, token: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ComputeService for RestComputeService {
    async fn submit_job(&self, descriptor: &JobDescriptor) -> Result<String, TransportError> {
        let created: JobCreated = self
            .client
            .post(format!("{}/jobs", self.base_url))
            .bearer_auth(&self.token)
            .json(descriptor)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(created.job_id)
    }

    async fn status(&self, job_id: &str) -> Result<JobStatus, TransportError> {
        let state: JobState = self
            .client
            .get(format!("{}/jobs/{}", self.base_url, job_id))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(state.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    struct ScriptedCompute {
        statuses: Mutex<VecDeque<JobStatus>>,
        submitted: Mutex<Vec<JobDescriptor>>,
    }

    impl ScriptedCompute {
        fn new(statuses: Vec<JobStatus>) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses.into()),
                submitted: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ComputeService for ScriptedCompute {
        async fn submit_job(&self, descriptor: &JobDescriptor) -> Result<String, TransportError> {
            self.submitted.lock().await.push(descriptor.clone());
            Ok("job-1".to_string())
        }

        async fn status(&self, _job_id: &str) -> Result<JobStatus, TransportError> {
            Ok(self.statuses.lock().await.pop_front().unwrap_or(JobStatus::Running))
        }
    }

    fn fast() -> JobPolling {
        JobPolling {
            poll_interval: Duration::from_millis(1),
            max_wait: Duration::from_millis(50),
        }
    }

    fn alcf(service: Arc<ScriptedCompute>) -> ReconstructionBackend {
        ReconstructionBackend::Alcf(AlcfBackend::new(
            service,
            AlcfSettings {
                endpoint_id: "compute-endpoint".to_string(),
                allocation_root: "/eagle/IRIProd/ALS/".to_string(),
                reconstruct_command: default_alcf_reconstruct(),
                derived_command: default_alcf_derived(),
            },
            fast(),
        ))
    }

    #[tokio::test]
    async fn test_reconstruct_succeeds_after_polling() {
        let service = ScriptedCompute::new(vec![JobStatus::Pending, JobStatus::Running, JobStatus::Succeeded]);
        let backend = alcf(service.clone());
        let path = RelativePath::parse("bl832/scan_001.h5").unwrap();

        assert!(backend.reconstruct(&path).await);

        let submitted = service.submitted.lock().await;
        assert_eq!(submitted[0].name, "tomo_recon_scan_001");
        assert_eq!(
            submitted[0].payload["command"],
            "python /eagle/IRIProd/ALS/scripts/globus_reconstruction.py scan_001.h5 bl832"
        );
    }

    #[tokio::test]
    async fn test_failed_job_is_false() {
        let service = ScriptedCompute::new(vec![JobStatus::Running, JobStatus::Failed]);
        let backend = alcf(service);
        let path = RelativePath::parse("bl832/scan_001.h5").unwrap();
        assert!(!backend.build_derived(&path).await);
    }

    #[tokio::test]
    async fn test_job_timeout_is_false() {
        let service = ScriptedCompute::new(vec![]);
        let backend = alcf(service);
        let path = RelativePath::parse("bl832/scan_001.h5").unwrap();
        assert!(!backend.reconstruct(&path).await);
    }

    #[test]
    fn test_nersc_batch_script() {
        let backend = NerscBackend::new(
            ScriptedCompute::new(vec![]),
            NerscSettings {
                machine: default_machine(),
                account: default_account(),
                qos: default_qos(),
                walltime: default_walltime(),
                image: "registry.nersc.gov/als/tomo:latest".to_string(),
                scratch_path: "/pscratch/sd/a/alsdev".to_string(),
                reconstruct_command: default_nersc_reconstruct(),
                derived_command: default_nersc_derived(),
            },
            fast(),
        );
        let path = RelativePath::parse("bl832/scan_001.h5").unwrap();
        let job = backend.reconstruction_job(&path);

        assert_eq!(job.site, HpcSite::Nersc);
        let script = job.payload["script"].as_str().unwrap();
        assert!(script.starts_with("#!/bin/bash\n#SBATCH -q preempt\n"));
        assert!(script.contains("#SBATCH --job-name=tomo_recon_scan_001\n"));
        assert!(script.contains("registry.nersc.gov/als/tomo:latest python sfapi_reconstruction.py scan_001.h5 bl832"));
    }

    #[test]
    fn test_site_serde() {
        assert_eq!(serde_json::to_string(&HpcSite::Alcf).unwrap(), "\"alcf\"");
        let site: HpcSite = serde_yaml::from_str("nersc").unwrap();
        assert_eq!(site, HpcSite::Nersc);
    }
}
