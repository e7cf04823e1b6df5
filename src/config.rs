//! Configuration for beamflow.
//!
//! Configuration sources (highest priority first):
//! 1. Explicit file (`--config` or BEAMFLOW_CONFIG)
//! 2. Config file discovered as `.beamflow/config.yaml` in the current
//!    directory or a parent
//! 3. Defaults (no endpoints, state in ~/.beamflow)
//!
//! BEAMFLOW_HOME overrides the state directory wherever it is configured.
//! `$VAR` and `${VAR}` references in string values are expanded from the
//! environment before parsing. The resolved [`Settings`] are built once and
//! passed down; nothing here is global.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapters::compute::{AlcfSettings, GatewaySettings, HpcSite, JobPolling, NerscSettings};
use crate::adapters::globus::GlobusSettings;
use crate::adapters::hpss::HpssSettings;
use crate::adapters::scicat::CatalogSettings;
use crate::core::metrics::MetricsConfig;
use crate::core::plan::JourneyPlan;
use crate::core::transfer::{RetryPolicy, TransferSettings};
use crate::domain::{
    Capability, CategoryRules, Endpoint, EndpointKind, EndpointRegistry, RetentionPolicies,
    RetentionPolicy, UnknownEndpoint,
};
use crate::ingest::WatcherConfig;

/// Configuration errors: permanent, reported before any I/O
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error(transparent)]
    UnknownEndpoint(#[from] UnknownEndpoint),

    #[error("Unknown journey plan: {0}")]
    UnknownPlan(String),

    #[error("Invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Invalid journey plan {plan}: {reason}")]
    InvalidPlan { plan: String, reason: String },

    #[error("Invalid retention policy for {endpoint}: {reason}")]
    InvalidPolicy { endpoint: String, reason: String },

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("Missing credential: environment variable {variable} is not set")]
    MissingCredential { variable: String },

    #[error("Failed to determine home directory")]
    NoHomeDirectory,
}

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointConfig>,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub retention: Vec<RetentionPolicy>,
    #[serde(default)]
    pub categories: CategoryRules,
    #[serde(default)]
    pub compute: ComputeConfig,
    #[serde(default)]
    pub catalog: Option<CatalogSettings>,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub journeys: BTreeMap<String, JourneyPlan>,
    #[serde(default)]
    pub watch: Option<WatcherConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to the `.beamflow` directory)
    pub home: Option<String>,
}

/// One endpoint entry; the map key is its name
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub address: String,
    pub root_path: String,
    #[serde(default = "default_kind")]
    pub kind: EndpointKind,
    /// Defaults to the kind's capabilities
    #[serde(default)]
    pub capabilities: Option<Vec<Capability>>,
    #[serde(default)]
    pub credentials: Option<String>,
}

fn default_kind() -> EndpointKind {
    EndpointKind::Filesystem
}

impl EndpointConfig {
    fn into_endpoint(self, name: &str) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            uuid: self.uuid,
            address: self.address,
            root_path: self.root_path,
            kind: self.kind,
            capabilities: match self.capabilities {
                Some(capabilities) => capabilities.into_iter().collect(),
                None => self.kind.default_capabilities(),
            },
            credentials: self.credentials,
        }
    }
}

/// Which movement service carries transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMethod {
    Globus,
    /// Direct copies between locally mounted endpoints
    #[default]
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default)]
    pub method: TransferMethod,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub globus: GlobusSettings,
}

fn default_poll_interval() -> u64 {
    5
}
fn default_max_wait() -> u64 {
    600
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            method: TransferMethod::default(),
            poll_interval_secs: default_poll_interval(),
            max_wait_secs: default_max_wait(),
            retry: RetryPolicy::default(),
            globus: GlobusSettings::default(),
        }
    }
}

impl TransferConfig {
    pub fn settings(&self) -> TransferSettings {
        TransferSettings::from_secs(self.poll_interval_secs, self.max_wait_secs, self.retry.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeConfig {
    #[serde(default)]
    pub gateway: Option<GatewaySettings>,
    #[serde(default = "default_job_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_job_max_wait")]
    pub max_wait_secs: u64,
    #[serde(default)]
    pub alcf: Option<AlcfSettings>,
    #[serde(default)]
    pub nersc: Option<NerscSettings>,
    /// Slurm settings for tape archive jobs
    #[serde(default)]
    pub hpss: Option<HpssSettings>,
}

fn default_job_poll_interval() -> u64 {
    10
}
fn default_job_max_wait() -> u64 {
    7200
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            gateway: None,
            poll_interval_secs: default_job_poll_interval(),
            max_wait_secs: default_job_max_wait(),
            alcf: None,
            nersc: None,
            hpss: None,
        }
    }
}

impl ComputeConfig {
    pub fn polling(&self) -> JobPolling {
        JobPolling::from_secs(self.poll_interval_secs, self.max_wait_secs)
    }

    pub fn has_site(&self, site: HpcSite) -> bool {
        match site {
            HpcSite::Alcf => self.alcf.is_some(),
            HpcSite::Nersc => self.nersc.is_some(),
        }
    }
}

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Settings {
    /// State directory (journeys, prune ledger)
    pub home: PathBuf,
    /// Path to config file (if one was used)
    pub config_file: Option<PathBuf>,
    pub registry: EndpointRegistry,
    pub transfer: TransferConfig,
    pub retention: RetentionPolicies,
    pub categories: CategoryRules,
    pub compute: ComputeConfig,
    pub catalog: Option<CatalogSettings>,
    pub metrics: Option<MetricsConfig>,
    pub journeys: BTreeMap<String, JourneyPlan>,
    pub watch: Option<WatcherConfig>,
}

impl Settings {
    /// Load from an explicit file, or discover one, and validate
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config_file = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => find_config_file(),
        };

        let settings = match config_file {
            Some(ref path) => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_yaml(&content, Some(path))?
            }
            None => Self::from_file(ConfigFile::default(), None)?,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Parse YAML content; `config_path` anchors relative paths
    pub fn from_yaml(content: &str, config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let source = config_path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<inline>".to_string());
        let parse_error = |e: serde_yaml::Error| ConfigError::Parse {
            path: source.clone(),
            reason: e.to_string(),
        };

        let mut value: serde_yaml::Value = serde_yaml::from_str(content).map_err(parse_error)?;
        expand_environment_variables(&mut value);
        let file: ConfigFile = serde_yaml::from_value(value).map_err(parse_error)?;

        Self::from_file(file, config_path)
    }

    fn from_file(file: ConfigFile, config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let home = resolve_home(file.paths.home.as_deref(), config_path)?;

        let registry = EndpointRegistry::new(
            file.endpoints
                .into_iter()
                .map(|(name, endpoint)| endpoint.into_endpoint(&name)),
        );

        let journeys = file
            .journeys
            .into_iter()
            .map(|(name, mut plan)| {
                plan.name = name.clone();
                (name, plan)
            })
            .collect();

        Ok(Self {
            home,
            config_file: config_path.map(Path::to_path_buf),
            registry,
            transfer: file.transfer,
            retention: RetentionPolicies::new(file.retention),
            categories: file.categories,
            compute: file.compute,
            catalog: file.catalog,
            metrics: file.metrics,
            journeys,
            watch: file.watch,
        })
    }

    /// Reject references to unknown endpoints and capability mismatches
    pub fn validate(&self) -> Result<(), ConfigError> {
        for endpoint in self.registry.iter() {
            if endpoint.root_path.trim().is_empty() {
                return Err(ConfigError::InvalidEndpoint {
                    endpoint: endpoint.name.clone(),
                    reason: "root_path is empty".to_string(),
                });
            }
            if endpoint.is_tape() && endpoint.can(Capability::Deletable) {
                return Err(ConfigError::InvalidEndpoint {
                    endpoint: endpoint.name.clone(),
                    reason: "tape archives are never pruned".to_string(),
                });
            }
            if self.transfer.method == TransferMethod::Globus && !endpoint.is_tape() && endpoint.uuid.is_none() {
                return Err(ConfigError::InvalidEndpoint {
                    endpoint: endpoint.name.clone(),
                    reason: "globus transfers need a collection uuid".to_string(),
                });
            }
        }

        for (key, secs) in [
            ("transfer.poll_interval_secs", self.transfer.poll_interval_secs),
            ("compute.poll_interval_secs", self.compute.poll_interval_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::InvalidSetting {
                    key: key.to_string(),
                    reason: "must be at least 1 second".to_string(),
                });
            }
        }

        for policy in self.retention.iter() {
            let endpoint = self.registry.get(&policy.endpoint)?;
            if !endpoint.can(Capability::Deletable) {
                return Err(ConfigError::InvalidPolicy {
                    endpoint: policy.endpoint.clone(),
                    reason: "endpoint is not deletable".to_string(),
                });
            }
        }

        for plan in self.journeys.values() {
            plan.validate(&self.registry)?;
            if let Some(ref reconstruction) = plan.reconstruction {
                if !self.compute.has_site(reconstruction.backend) || self.compute.gateway.is_none() {
                    return Err(ConfigError::InvalidPlan {
                        plan: plan.name.clone(),
                        reason: format!("no compute settings for {}", reconstruction.backend),
                    });
                }
            }
            if self.compute.hpss.is_none() || self.compute.gateway.is_none() {
                let returns = plan.reconstruction.iter().flat_map(|r| &r.return_hops);
                for hop in plan.local.iter().chain(&plan.remote).chain(returns) {
                    let touches_tape = [&hop.from, &hop.to]
                        .into_iter()
                        .any(|name| self.registry.get(name).map(|e| e.is_tape()).unwrap_or(false));
                    if touches_tape {
                        return Err(ConfigError::InvalidPlan {
                            plan: plan.name.clone(),
                            reason: format!("hop {} -> {} needs compute.hpss and a gateway", hop.from, hop.to),
                        });
                    }
                }
            }
        }

        if let Some(ref watch) = self.watch {
            self.registry.get(&watch.endpoint)?;
            self.plan(&watch.plan)?;
        }

        Ok(())
    }

    /// Look up a journey plan by name
    pub fn plan(&self, name: &str) -> Result<&JourneyPlan, ConfigError> {
        self.journeys
            .get(name)
            .ok_or_else(|| ConfigError::UnknownPlan(name.to_string()))
    }

    /// Fail fast if an endpoint's credential variable is not set
    pub fn check_credentials(&self) -> Result<(), ConfigError> {
        for endpoint in self.registry.iter() {
            if let Some(ref variable) = endpoint.credentials {
                credential(variable)?;
            }
        }
        Ok(())
    }

    /// Path of the prune ledger
    pub fn ledger_path(&self) -> PathBuf {
        self.home.join("prune_ledger.jsonl")
    }
}

/// Read a credential from the environment
pub fn credential(variable: &str) -> Result<String, ConfigError> {
    match std::env::var(variable) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingCredential {
            variable: variable.to_string(),
        }),
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".beamflow").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// BEAMFLOW_HOME, else `paths.home` relative to the config's directory,
/// else ~/.beamflow
fn resolve_home(configured: Option<&str>, config_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Ok(env_home) = std::env::var("BEAMFLOW_HOME") {
        return Ok(PathBuf::from(env_home));
    }

    if let Some(home) = configured {
        let base = config_path
            .and_then(Path::parent)
            .unwrap_or_else(|| Path::new("."));
        return Ok(resolve_path(base, home));
    }

    Ok(dirs::home_dir()
        .ok_or(ConfigError::NoHomeDirectory)?
        .join(".beamflow"))
}

/// Resolve a path that may be relative to a base directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Expand `$VAR` and `${VAR}` in every string of a YAML tree. Unset
/// variables are left as written.
pub fn expand_environment_variables(value: &mut serde_yaml::Value) {
    match value {
        serde_yaml::Value::String(s) => {
            if s.contains('$') {
                *s = expand_str(s);
            }
        }
        serde_yaml::Value::Sequence(items) => items.iter_mut().for_each(expand_environment_variables),
        serde_yaml::Value::Mapping(map) => map.values_mut().for_each(expand_environment_variables),
        serde_yaml::Value::Tagged(tagged) => expand_environment_variables(&mut tagged.value),
        _ => {}
    }
}

fn expand_str(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(idx) = rest.find('$') {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match std::env::var(name) {
            Ok(val) if !name.is_empty() => out.push_str(&val),
            _ => out.push_str(&rest[idx..idx + 1 + consumed]),
        }
        rest = &after[consumed..];
    }

    out.push_str(rest);
    out
}
