//! Tape archive (HPSS) movement through batch jobs.
//!
//! HPSS is not reachable by the movement service. Copies to and from it run
//! as Slurm jobs on the NERSC transfer queue, submitted through the same
//! [`ComputeService`] used for reconstruction:
//! - archive: `hsi cput` for a file, `htar -cvf` of the folder for a
//!   directory (stored as `<name>.tar`)
//! - retrieve: `hsi get` for a file, `htar -xvf` for a directory
//!
//! [`TapeRouter`] sends hops touching a tape archive to the [`TapeArchiver`]
//! and everything else to the regular mover.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::compute::HpcSite;
use super::{ComputeService, JobDescriptor, JobStatus, TransferService, TransferStatus, TransportError};
use crate::domain::TransferRequest;

/// Prefix marking transfer ids that belong to tape jobs
const TAPE_ID_PREFIX: &str = "hpss-";

/// Slurm settings for tape jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HpssSettings {
    #[serde(default = "default_machine")]
    pub machine: String,

    #[serde(default = "default_account")]
    pub account: String,

    #[serde(default = "default_qos")]
    pub qos: String,

    #[serde(default = "default_walltime")]
    pub walltime: String,

    /// Directory for job stdout/stderr
    pub logs_path: String,
}

fn default_machine() -> String {
    "perlmutter".to_string()
}
fn default_account() -> String {
    "als".to_string()
}
fn default_qos() -> String {
    "xfer".to_string()
}
fn default_walltime() -> String {
    "12:00:00".to_string()
}

/// Moves data onto and off tape with hsi/htar jobs
pub struct TapeArchiver {
    service: Arc<dyn ComputeService>,
    settings: HpssSettings,
}

impl TapeArchiver {
    pub fn new(service: Arc<dyn ComputeService>, settings: HpssSettings) -> Self {
        Self { service, settings }
    }

    /// Whether a transfer id was issued by this archiver
    pub fn owns(transfer_id: &str) -> bool {
        transfer_id.starts_with(TAPE_ID_PREFIX)
    }

    /// Build the Slurm job for a hop with a tape archive on one side
    pub fn job(&self, request: &TransferRequest) -> Result<JobDescriptor, TransportError> {
        let source = request.source.full_path(&request.path);
        let destination = request.destination.full_path(&request.path);
        let source = source.trim_end_matches('/');
        let destination = destination.trim_end_matches('/');
        let name = request.path.file_name();
        let directory = request.path.is_directory();

        let (kind, commands) = match (request.source.is_tape(), request.destination.is_tape()) {
            (false, true) => {
                let dest_folder = parent(destination);
                let commands = if directory {
                    format!(
                        "hsi \"mkdir -p {dest_folder}\"\n\
                         htar -cvf {destination}.tar -C {src_folder} {name}\n",
                        dest_folder = dest_folder,
                        destination = destination,
                        src_folder = parent(source),
                        name = name,
                    )
                } else {
                    format!(
                        "hsi \"mkdir -p {dest_folder}\"\n\
                         hsi cput {source} : {destination}\n",
                        dest_folder = dest_folder,
                        source = source,
                        destination = destination,
                    )
                };
                ("archive", commands)
            }
            (true, false) => {
                let dest_folder = parent(destination);
                let commands = if directory {
                    format!(
                        "mkdir -p {dest_folder}\n\
                         cd {dest_folder}\n\
                         htar -xvf {source}.tar\n",
                        dest_folder = dest_folder,
                        source = source,
                    )
                } else {
                    format!(
                        "mkdir -p {dest_folder}\n\
                         hsi get {destination} : {source}\n",
                        dest_folder = dest_folder,
                        source = source,
                        destination = destination,
                    )
                };
                ("retrieve", commands)
            }
            _ => {
                return Err(TransportError::Rejected(format!(
                    "{} is not a tape hop",
                    request.describe()
                )))
            }
        };

        let job_name = format!("{}_{}", kind, request.path.file_stem());
        Ok(JobDescriptor {
            payload: json!({
                "machine": self.settings.machine,
                "script": self.batch_script(&job_name, &commands),
            }),
            name: job_name,
            site: HpcSite::Nersc,
        })
    }

    fn batch_script(&self, job_name: &str, commands: &str) -> String {
        let s = &self.settings;
        format!(
            "#!/bin/bash\n\
             #SBATCH -q {qos}\n\
             #SBATCH -A {account}\n\
             #SBATCH -C cron\n\
             #SBATCH --time={walltime}\n\
             #SBATCH --job-name={job_name}\n\
             #SBATCH --output={logs}/{job_name}_%j.out\n\
             #SBATCH --error={logs}/{job_name}_%j.err\n\
             #SBATCH --licenses=SCRATCH\n\
             #SBATCH --mem=20GB\n\
             \n\
             set -euo pipefail\n\
             {commands}",
            qos = s.qos,
            account = s.account,
            walltime = s.walltime,
            job_name = job_name,
            logs = s.logs_path.trim_end_matches('/'),
            commands = commands,
        )
    }
}

/// Parent directory of an absolute path
fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

#[async_trait]
impl TransferService for TapeArchiver {
    fn name(&self) -> &str {
        "hpss"
    }

    async fn submit(&self, request: &TransferRequest) -> Result<String, TransportError> {
        let job = self.job(request)?;
        let job_id = self.service.submit_job(&job).await?;
        info!(job = %job.name, job_id = %job_id, "Tape job submitted");
        Ok(format!("{}{}", TAPE_ID_PREFIX, job_id))
    }

    async fn status(&self, transfer_id: &str) -> Result<TransferStatus, TransportError> {
        let job_id = transfer_id.strip_prefix(TAPE_ID_PREFIX).unwrap_or(transfer_id);
        let status = match self.service.status(job_id).await? {
            JobStatus::Pending => TransferStatus::Pending {
                detail: Some("QUEUED".to_string()),
            },
            JobStatus::Running => TransferStatus::Pending {
                detail: Some("ACTIVE".to_string()),
            },
            // The job log has the sizes; the gateway only reports state
            JobStatus::Succeeded => TransferStatus::Succeeded { bytes: 0 },
            JobStatus::Failed => TransferStatus::Failed {
                reason: format!("tape job {} failed", job_id),
            },
        };
        Ok(status)
    }

    async fn cancel(&self, transfer_id: &str) -> Result<(), TransportError> {
        warn!(transfer_id, "Tape jobs cannot be cancelled through the gateway; leaving it to finish");
        Ok(())
    }
}

/// Sends tape hops to the archiver and all other hops to the regular mover
pub struct TapeRouter {
    mover: Arc<dyn TransferService>,
    tape: Option<Arc<TapeArchiver>>,
}

impl TapeRouter {
    pub fn new(mover: Arc<dyn TransferService>, tape: Option<Arc<TapeArchiver>>) -> Self {
        Self { mover, tape }
    }

    fn tape(&self) -> Result<&TapeArchiver, TransportError> {
        self.tape
            .as_deref()
            .ok_or_else(|| TransportError::Rejected("no tape archive service configured".to_string()))
    }
}

#[async_trait]
impl TransferService for TapeRouter {
    fn name(&self) -> &str {
        self.mover.name()
    }

    async fn submit(&self, request: &TransferRequest) -> Result<String, TransportError> {
        if request.source.is_tape() || request.destination.is_tape() {
            debug!(hop = %request.describe(), "Routing to tape archiver");
            return self.tape()?.submit(request).await;
        }
        self.mover.submit(request).await
    }

    async fn status(&self, transfer_id: &str) -> Result<TransferStatus, TransportError> {
        if TapeArchiver::owns(transfer_id) {
            return self.tape()?.status(transfer_id).await;
        }
        self.mover.status(transfer_id).await
    }

    async fn cancel(&self, transfer_id: &str) -> Result<(), TransportError> {
        if TapeArchiver::owns(transfer_id) {
            return self.tape()?.cancel(transfer_id).await;
        }
        self.mover.cancel(transfer_id).await
    }
}
