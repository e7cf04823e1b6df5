//! SciCat catalog client.
//!
//! Registers a raw dataset record once its copies are in place. Only the
//! location metadata the orchestrator knows is sent; detector metadata
//! extraction happens in the catalog's own ingestor.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::{DatasetDescriptor, MetadataCatalog, TransportError};

/// Catalog connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSettings {
    pub base_url: String,

    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default = "default_owner_group")]
    pub owner_group: String,

    #[serde(default)]
    pub access_groups: Vec<String>,
}

fn default_token_env() -> String {
    "SCICAT_TOKEN".to_string()
}
fn default_owner_group() -> String {
    "ingestor".to_string()
}

/// SciCat REST client
pub struct ScicatCatalog {
    base_url: String,
    token: String,
    owner_group: String,
    access_groups: Vec<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct DatasetCreated {
    pid: String,
}

impl ScicatCatalog {
    /// Create a new client with a bearer token
    pub fn new(settings: &CatalogSettings, token: String) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            token,
            owner_group: settings.owner_group.clone(),
            access_groups: settings.access_groups.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// Raw dataset document for a journey
    fn dataset_body(&self, descriptor: &DatasetDescriptor) -> serde_json::Value {
        let name = descriptor
            .path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&descriptor.path);

        json!({
            "type": "raw",
            "datasetName": name,
            "sourceFolder": descriptor.path,
            "owner": descriptor.beamline,
            "ownerGroup": self.owner_group,
            "accessGroups": self.access_groups,
            "creationTime": Utc::now().to_rfc3339(),
            "creationLocation": descriptor.beamline,
            "scientificMetadata": {
                "beamflow_dataset_id": descriptor.dataset_id,
                "locations": descriptor.locations,
                "derived": descriptor.derived,
            },
        })
    }
}

#[async_trait]
impl MetadataCatalog for ScicatCatalog {
    async fn ingest(&self, descriptor: &DatasetDescriptor) -> Result<String, TransportError> {
        let created: DatasetCreated = self
            .client
            .post(format!("{}/api/v3/datasets", self.base_url))
            .bearer_auth(&self.token)
            .json(&self.dataset_body(descriptor))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        info!(pid = %created.pid, path = %descriptor.path, "Dataset registered in SciCat");
        Ok(created.pid)
    }
}
