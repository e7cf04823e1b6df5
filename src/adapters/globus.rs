//! Globus Transfer REST client.
//!
//! Submits transfers and deletions between registered collections and polls
//! their tasks. Endpoints must carry the collection UUID.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{EndpointStorage, TransferService, TransferStatus, TransportError};
use crate::core::safety::RelativePath;
use crate::domain::{Endpoint, TransferRequest};

/// Connection settings for the Globus Transfer API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobusSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// How long a deletion may take before it is reported as transient
    #[serde(default = "default_delete_max_wait")]
    pub delete_max_wait_secs: u64,
}

fn default_base_url() -> String {
    "https://transfer.api.globus.org/v0.10".to_string()
}
fn default_token_env() -> String {
    "GLOBUS_TRANSFER_TOKEN".to_string()
}
fn default_delete_max_wait() -> u64 {
    120
}

impl Default for GlobusSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token_env: default_token_env(),
            delete_max_wait_secs: default_delete_max_wait(),
        }
    }
}

/// Globus Transfer API client
pub struct GlobusClient {
    base_url: String,
    token: String,
    delete_max_wait: Duration,
    client: reqwest::Client,
}

/// `GET /task/{id}` response (fields we use)
#[derive(Debug, Deserialize)]
struct TaskDocument {
    status: String,
    nice_status: Option<String>,
    #[serde(default)]
    bytes_transferred: u64,
    fatal_error: Option<FatalError>,
}

#[derive(Debug, Deserialize)]
struct FatalError {
    code: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct ValueDocument {
    value: String,
}

#[derive(Debug, Deserialize)]
struct TaskIdDocument {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct LsDocument {
    #[serde(rename = "DATA", default)]
    data: Vec<LsEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct LsEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: u64,
}

impl GlobusClient {
    /// Create a new client with a bearer token
    pub fn new(settings: &GlobusSettings, token: String) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            token,
            delete_max_wait: Duration::from_secs(settings.delete_max_wait_secs),
            client: reqwest::Client::new(),
        }
    }

    /// Build API URL
    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
        let response = self
            .client
            .get(self.api_url(path))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, TransportError> {
        let response = self
            .client
            .post(self.api_url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn submission_id(&self) -> Result<String, TransportError> {
        let doc: ValueDocument = self.get_json("submission_id").await?;
        Ok(doc.value)
    }

    /// List a directory; None if it does not exist
    async fn ls(&self, uuid: &str, dir: &str) -> Result<Option<Vec<LsEntry>>, TransportError> {
        let response = self
            .client
            .get(self.api_url(&format!("operation/endpoint/{}/ls", uuid)))
            .query(&[("path", dir)])
            .bearer_auth(&self.token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let doc: LsDocument = response.error_for_status()?.json().await?;
        Ok(Some(doc.data))
    }

    /// Find the listing entry for a path by listing its parent
    async fn lookup(&self, endpoint: &Endpoint, path: &RelativePath) -> Result<Option<(String, LsEntry)>, TransportError> {
        let uuid = collection_uuid(endpoint)?;
        let full = endpoint.full_path(path);
        let trimmed = full.trim_end_matches('/');
        let (parent, name) = match trimmed.rsplit_once('/') {
            Some(("", name)) => ("/", name),
            Some((parent, name)) => (parent, name),
            None => ("/", trimmed),
        };

        let entries = self.ls(uuid, parent).await?.unwrap_or_default();
        Ok(entries
            .into_iter()
            .find(|e| e.name == name)
            .map(|e| (trimmed.to_string(), e)))
    }

    /// Total size of the files under a directory
    async fn tree_size(&self, uuid: &str, root: String) -> Result<u64, TransportError> {
        let mut total = 0;
        let mut pending = vec![root];
        while let Some(dir) = pending.pop() {
            for entry in self.ls(uuid, &dir).await?.unwrap_or_default() {
                if entry.kind == "dir" {
                    pending.push(format!("{}/{}", dir, entry.name));
                } else {
                    total += entry.size;
                }
            }
        }
        Ok(total)
    }

    async fn task(&self, task_id: &str) -> Result<TaskDocument, TransportError> {
        self.get_json(&format!("task/{}", task_id)).await
    }
}

fn collection_uuid(endpoint: &Endpoint) -> Result<&str, TransportError> {
    endpoint
        .uuid
        .as_deref()
        .ok_or_else(|| TransportError::Rejected(format!("endpoint {} has no collection uuid", endpoint.name)))
}

#[async_trait]
impl TransferService for GlobusClient {
    fn name(&self) -> &str {
        "globus"
    }

    async fn submit(&self, request: &TransferRequest) -> Result<String, TransportError> {
        let source_uuid = collection_uuid(&request.source)?;
        let destination_uuid = collection_uuid(&request.destination)?;
        let submission_id = self.submission_id().await?;

        let body = json!({
            "DATA_TYPE": "transfer",
            "submission_id": submission_id,
            "source_endpoint": source_uuid,
            "destination_endpoint": destination_uuid,
            "label": request.path.file_stem(),
            "sync_level": "checksum",
            "DATA": [{
                "DATA_TYPE": "transfer_item",
                "source_path": request.source.full_path(&request.path),
                "destination_path": request.destination.full_path(&request.path),
                "recursive": request.path.is_directory(),
            }],
        });

        info!(
            source = %request.source.address,
            destination = %request.destination.address,
            path = %request.path,
            "Starting Globus transfer"
        );
        let doc: TaskIdDocument = self.post_json("transfer", &body).await?;
        Ok(doc.task_id)
    }

    async fn status(&self, transfer_id: &str) -> Result<TransferStatus, TransportError> {
        let task = self.task(transfer_id).await?;
        let status = match task.status.as_str() {
            "SUCCEEDED" => TransferStatus::Succeeded {
                bytes: task.bytes_transferred,
            },
            "FAILED" => TransferStatus::Failed {
                reason: match task.fatal_error {
                    Some(fatal) => format!("{}: {}", fatal.code, fatal.description),
                    None => task.nice_status.unwrap_or_else(|| "FAILED".to_string()),
                },
            },
            _ => TransferStatus::Pending {
                detail: task.nice_status,
            },
        };
        Ok(status)
    }

    async fn cancel(&self, transfer_id: &str) -> Result<(), TransportError> {
        let _: serde_json::Value = self
            .post_json(&format!("task/{}/cancel", transfer_id), &json!({}))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EndpointStorage for GlobusClient {
    async fn exists(&self, endpoint: &Endpoint, path: &RelativePath) -> Result<bool, TransportError> {
        Ok(self.lookup(endpoint, path).await?.is_some())
    }

    async fn size(&self, endpoint: &Endpoint, path: &RelativePath) -> Result<Option<u64>, TransportError> {
        match self.lookup(endpoint, path).await? {
            Some((full, entry)) if entry.kind == "dir" => {
                Ok(Some(self.tree_size(collection_uuid(endpoint)?, full).await?))
            }
            Some((_, entry)) => Ok(Some(entry.size)),
            None => Ok(None),
        }
    }

    async fn delete(&self, endpoint: &Endpoint, path: &RelativePath) -> Result<(), TransportError> {
        let uuid = collection_uuid(endpoint)?;
        let submission_id = self.submission_id().await?;
        let body = json!({
            "DATA_TYPE": "delete",
            "submission_id": submission_id,
            "endpoint": uuid,
            "recursive": true,
            "DATA": [{
                "DATA_TYPE": "delete_item",
                "path": endpoint.full_path(path),
            }],
        });

        let doc: TaskIdDocument = self.post_json("delete", &body).await?;
        debug!(task_id = %doc.task_id, endpoint = %endpoint.name, path = %path, "Delete submitted");

        let started = Instant::now();
        loop {
            let task = self.task(&doc.task_id).await?;
            match task.status.as_str() {
                "SUCCEEDED" => return Ok(()),
                "FAILED" => {
                    let reason = task
                        .fatal_error
                        .map(|f| f.code)
                        .or(task.nice_status)
                        .unwrap_or_else(|| "FAILED".to_string());
                    return Err(TransportError::Rejected(format!(
                        "delete task {} failed: {}",
                        doc.task_id, reason
                    )));
                }
                _ => {}
            }

            if started.elapsed() >= self.delete_max_wait {
                warn!(task_id = %doc.task_id, "Delete task still running; it may complete in background");
                return Err(TransportError::Network(format!(
                    "delete task {} did not finish within {}s",
                    doc.task_id,
                    self.delete_max_wait.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_secs(5).min(self.delete_max_wait)).await;
        }
    }
}
