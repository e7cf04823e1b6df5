//! Storage endpoints and the registry that names them.
//!
//! An endpoint is a named, addressable storage location: the beamline
//! acquisition disk, the local data cache, an HPC filesystem or a tape
//! archive. Endpoints are built once from configuration and never mutated.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::safety::RelativePath;

/// Kind of storage behind an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// Local or network-mounted POSIX filesystem
    Filesystem,

    /// Filesystem reachable only through the movement service (HPC storage)
    RemoteFilesystem,

    /// Tape archive (HPSS); written and read through batch jobs, never pruned
    TapeArchive,
}

impl EndpointKind {
    /// Capabilities an endpoint of this kind gets when none are configured
    pub fn default_capabilities(&self) -> BTreeSet<Capability> {
        match self {
            Self::TapeArchive => [Capability::Readable, Capability::Writable].into_iter().collect(),
            Self::Filesystem | Self::RemoteFilesystem => {
                [Capability::Readable, Capability::Writable, Capability::Deletable]
                    .into_iter()
                    .collect()
            }
        }
    }
}

/// Operations an endpoint permits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Readable,
    Writable,
    Deletable,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Readable => "readable",
            Self::Writable => "writable",
            Self::Deletable => "deletable",
        };
        f.write_str(name)
    }
}

/// A named storage location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Registry name (e.g. "spot832", "data832", "nersc832")
    pub name: String,

    /// Identifier at the movement service (Globus collection UUID)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    /// Human-readable address (hostname or URI)
    #[serde(default)]
    pub address: String,

    /// Root directory all relative paths are resolved against
    pub root_path: String,

    /// Storage kind
    pub kind: EndpointKind,

    /// Permitted operations
    pub capabilities: BTreeSet<Capability>,

    /// Name of the environment variable holding credentials, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

impl Endpoint {
    /// Create an endpoint with its kind's default capabilities
    pub fn new(name: impl Into<String>, root_path: impl Into<String>, kind: EndpointKind) -> Self {
        Self {
            name: name.into(),
            uuid: None,
            address: String::new(),
            root_path: root_path.into(),
            kind,
            capabilities: kind.default_capabilities(),
            credentials: None,
        }
    }

    /// Replace the capability set
    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    /// Set the movement-service identifier
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn is_tape(&self) -> bool {
        self.kind == EndpointKind::TapeArchive
    }

    /// Check whether the endpoint permits an operation
    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Absolute path of a relative path on this endpoint, as the movement
    /// service addresses it
    pub fn full_path(&self, path: &RelativePath) -> String {
        format!("{}/{}", self.root_path.trim_end_matches('/'), path.as_str())
    }

    /// Same as [`Endpoint::full_path`], as a local filesystem path
    pub fn local_path(&self, path: &RelativePath) -> PathBuf {
        PathBuf::from(&self.root_path).join(path.as_str())
    }
}

/// Lookup of an endpoint name that is not configured
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown endpoint: {0}")]
pub struct UnknownEndpoint(pub String);

/// Read-only set of configured endpoints
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    endpoints: BTreeMap<String, Arc<Endpoint>>,
}

impl EndpointRegistry {
    /// Build a registry from endpoints (later duplicates replace earlier ones)
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        Self {
            endpoints: endpoints
                .into_iter()
                .map(|e| (e.name.clone(), Arc::new(e)))
                .collect(),
        }
    }

    /// Resolve an endpoint by name
    pub fn get(&self, name: &str) -> Result<Arc<Endpoint>, UnknownEndpoint> {
        self.endpoints
            .get(name)
            .cloned()
            .ok_or_else(|| UnknownEndpoint(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.endpoints.contains_key(name)
    }

    /// Iterate endpoints in name order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        self.endpoints.values()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
