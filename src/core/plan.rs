//! Journey plans: the per-beamline description of where data goes.
//!
//! Plans are defined in the `journeys` section of the configuration and name
//! ordered hops between registry endpoints, an optional reconstruction step
//! with its derived outputs, and the set of enabled stages.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::safety::{require_capability, PathViolation, RelativePath};
use crate::adapters::compute::HpcSite;
use crate::config::ConfigError;
use crate::domain::{Capability, EndpointRegistry, Stage};

/// One hop between two registry endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub from: String,
    pub to: String,
}

impl Hop {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Remote reconstruction and the derived outputs it produces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructionPlan {
    /// Facility whose backend runs the jobs
    pub backend: HpcSite,

    /// Derived output paths, as templates over the raw path:
    /// `{folder}`, `{stem}`, `{name}`, `{path}`
    #[serde(default = "default_derived_outputs")]
    pub derived: Vec<String>,

    /// Hops that bring derived outputs back (e.g. HPC scratch -> cache)
    #[serde(default, rename = "return")]
    pub return_hops: Vec<Hop>,
}

fn default_derived_outputs() -> Vec<String> {
    vec![
        "{folder}/rec{stem}/".to_string(),
        "{folder}/rec{stem}.zarr/".to_string(),
    ]
}

impl ReconstructionPlan {
    /// Resolve the derived output paths for a raw file
    pub fn derived_paths(&self, path: &RelativePath) -> Result<Vec<RelativePath>, PathViolation> {
        self.derived
            .iter()
            .map(|template| render_template(template, path))
            .collect()
    }
}

/// Substitute path placeholders in a template and validate the result
pub fn render_template(template: &str, path: &RelativePath) -> Result<RelativePath, PathViolation> {
    let rendered = template
        .replace("{folder}", path.folder())
        .replace("{stem}", path.file_stem())
        .replace("{name}", path.file_name())
        .replace("{path}", path.as_str());

    RelativePath::parse(&rendered)
}

/// Set of stages a journey may run, consulted at every transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnabledStages(BTreeSet<Stage>);

impl Default for EnabledStages {
    fn default() -> Self {
        Self(Stage::ALL.into_iter().collect())
    }
}

impl EnabledStages {
    pub fn new(stages: impl IntoIterator<Item = Stage>) -> Self {
        Self(stages.into_iter().collect())
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.0.contains(&stage)
    }

    pub fn disable(&mut self, stage: Stage) {
        self.0.remove(&stage);
    }

    /// Stages for one dataset: export-controlled data never leaves the
    /// facility and is not published to the catalog
    pub fn for_dataset(&self, export_controlled: bool) -> Self {
        let mut stages = self.clone();
        if export_controlled {
            for stage in [
                Stage::TransferRemote,
                Stage::Reconstruct,
                Stage::BuildDerived,
                Stage::Ingest,
            ] {
                stages.disable(stage);
            }
        }
        stages
    }
}

/// A complete journey plan for one beamline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyPlan {
    /// Plan name (the key under `journeys`)
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Hops run by the `transfer_local` stage
    #[serde(default)]
    pub local: Vec<Hop>,

    /// Hops run by the `transfer_remote` stage
    #[serde(default)]
    pub remote: Vec<Hop>,

    #[serde(default)]
    pub reconstruction: Option<ReconstructionPlan>,

    #[serde(default)]
    pub stages: EnabledStages,
}

impl JourneyPlan {
    /// Parse a plan from YAML content
    pub fn from_yaml(name: &str, content: &str) -> Result<Self, ConfigError> {
        let mut plan: Self = serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            path: name.to_string(),
            reason: e.to_string(),
        })?;
        plan.name = name.to_string();
        Ok(plan)
    }

    /// Hops a transfer stage runs; empty for non-transfer stages
    pub fn hops_for(&self, stage: Stage) -> &[Hop] {
        match stage {
            Stage::TransferLocal => &self.local,
            Stage::TransferRemote => &self.remote,
            _ => &[],
        }
    }

    /// Validate the plan against the endpoint registry
    pub fn validate(&self, registry: &EndpointRegistry) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidPlan {
            plan: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(invalid("plan name cannot be empty".to_string()));
        }

        if self.local.is_empty() && self.remote.is_empty() && self.reconstruction.is_none() {
            return Err(invalid("plan has no hops and no reconstruction".to_string()));
        }

        let return_hops = self
            .reconstruction
            .as_ref()
            .map(|r| r.return_hops.as_slice())
            .unwrap_or_default();

        for hop in self.local.iter().chain(&self.remote).chain(return_hops) {
            let source = registry.get(&hop.from)?;
            let destination = registry.get(&hop.to)?;
            require_capability(&source, Capability::Readable).map_err(|e| invalid(e.to_string()))?;
            require_capability(&destination, Capability::Writable)
                .map_err(|e| invalid(e.to_string()))?;
        }

        // Raw data must already be where each hop reads it from
        let mut holders: Vec<&str> = Vec::new();
        for (i, hop) in self.local.iter().chain(&self.remote).enumerate() {
            if i > 0 && !holders.contains(&hop.from.as_str()) {
                return Err(invalid(format!(
                    "hop {} -> {} reads from an endpoint no earlier hop wrote to",
                    hop.from, hop.to
                )));
            }
            if i == 0 {
                holders.push(hop.from.as_str());
            }
            holders.push(hop.to.as_str());
        }

        if let Some(ref reconstruction) = self.reconstruction {
            let sample = RelativePath::parse("folder/file.h5").map_err(|e| invalid(e.to_string()))?;
            reconstruction
                .derived_paths(&sample)
                .map_err(|e| invalid(format!("bad derived template: {}", e)))?;
        }

        Ok(())
    }
}
