//! Job Dispatcher: drives one dataset through its journey.
//!
//! Stages run strictly in order. Every transition is appended to the
//! dataset's event log first, so a re-invocation replays the log and skips
//! what is already done. A failed stage halts only its own journey, which
//! stays resumable.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::event_store::{dataset_id, generate_idempotency_key, EventStore};
use super::plan::{EnabledStages, Hop, JourneyPlan};
use super::prune::PruneController;
use super::safety::RelativePath;
use super::transfer::TransferController;
use crate::adapters::{DatasetDescriptor, EndpointStorage, HpcSite, MetadataCatalog, ReconstructionBackend};
use crate::domain::{
    Capability, CategoryRules, DataCategory, Endpoint, EndpointRegistry, Event, EventType,
    HopRecord, Journey, JourneyParams, Stage, StageStatus,
};

/// One dataset to dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRequest {
    /// Path relative to the first hop's source endpoint
    pub path: String,

    /// Export-controlled data stays at the facility
    pub export_controlled: bool,
}

impl DatasetRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            export_controlled: false,
        }
    }

    pub fn export_controlled(mut self, export_controlled: bool) -> Self {
        self.export_controlled = export_controlled;
        self
    }
}

/// Cooperative cancellation, checked at stage boundaries
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a stage ended
enum StageOutcome {
    Completed(String),
    Failed { endpoint: Option<String>, error: String },
}

impl StageOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            endpoint: None,
            error: error.into(),
        }
    }

    fn failed_at(endpoint: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Failed {
            endpoint: Some(endpoint.into()),
            error: error.into(),
        }
    }
}

/// One invocation of a journey: its log and the state rebuilt from it
struct JourneyRun<'a> {
    store: EventStore,
    journey: Journey,
    run_id: Uuid,
    plan: &'a JourneyPlan,
    path: RelativePath,
}

impl JourneyRun<'_> {
    fn event(
        &self,
        stage: Option<Stage>,
        event_type: EventType,
        idempotency_key: String,
        summary: String,
        status: StageStatus,
    ) -> Event {
        Event::new(
            &self.journey.dataset_id,
            self.run_id,
            stage,
            event_type,
            idempotency_key,
            summary,
            status,
        )
    }

    fn stage_event(&self, stage: Stage, event_type: EventType, summary: String, status: StageStatus) -> Event {
        let key = generate_idempotency_key(&self.journey.dataset_id, stage, self.path.as_str());
        self.event(Some(stage), event_type, key, summary, status)
    }

    fn journey_event(&self, event_type: EventType, suffix: &str, summary: String, status: StageStatus) -> Event {
        let key = format!("{}:{}", self.journey.dataset_id, suffix);
        self.event(None, event_type, key, summary, status)
    }

    /// Append to the log, then apply to the in-memory journey
    async fn record(&mut self, event: Event) -> Result<()> {
        self.store.append(&event).await?;
        self.journey.apply_event(&event);
        Ok(())
    }
}

/// Sequences hops, compute and prune scheduling for datasets
pub struct Dispatcher {
    registry: EndpointRegistry,
    transfers: Arc<TransferController>,
    storage: Arc<dyn EndpointStorage>,
    prunes: Arc<PruneController>,
    categories: CategoryRules,
    backends: HashMap<HpcSite, ReconstructionBackend>,
    catalog: Option<Arc<dyn MetadataCatalog>>,
    state_dir: PathBuf,
}

impl Dispatcher {
    /// Create a new dispatcher
    pub fn new(
        registry: EndpointRegistry,
        transfers: Arc<TransferController>,
        storage: Arc<dyn EndpointStorage>,
        prunes: Arc<PruneController>,
        state_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            transfers,
            storage,
            prunes,
            categories: CategoryRules::default(),
            backends: HashMap::new(),
            catalog: None,
            state_dir,
        }
    }

    pub fn with_categories(mut self, categories: CategoryRules) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_backend(mut self, backend: ReconstructionBackend) -> Self {
        self.backends.insert(backend.site(), backend);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn MetadataCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn prunes(&self) -> &Arc<PruneController> {
        &self.prunes
    }

    /// Run (or continue) the journey for one dataset
    pub async fn dispatch(&self, plan: &JourneyPlan, request: &DatasetRequest) -> Result<Journey> {
        self.dispatch_with_cancel(plan, request, &CancelFlag::new()).await
    }

    /// Run (or continue) a journey, stopping at the next stage boundary
    /// once `cancel` is set
    #[instrument(skip_all, fields(plan = %plan.name, path = %request.path))]
    pub async fn dispatch_with_cancel(
        &self,
        plan: &JourneyPlan,
        request: &DatasetRequest,
        cancel: &CancelFlag,
    ) -> Result<Journey> {
        let path = RelativePath::parse(&request.path)
            .with_context(|| format!("Invalid dataset path: {}", request.path))?;
        let dataset = dataset_id(&plan.name, path.as_str());
        let store = EventStore::open(&self.state_dir, &dataset).await?;

        let existing = store.load_journey().await?;
        if let Some(ref journey) = existing {
            if journey.is_done() {
                info!(dataset = %dataset, "Journey already done");
                return Ok(journey.clone());
            }
        }

        let resuming = existing.is_some();
        let journey = existing.unwrap_or_else(|| {
            Journey::new(
                dataset.clone(),
                JourneyParams {
                    plan: plan.name.clone(),
                    path: path.to_string(),
                    export_controlled: request.export_controlled,
                },
            )
        });

        let mut run = JourneyRun {
            store,
            journey,
            run_id: Uuid::new_v4(),
            plan,
            path,
        };

        if resuming {
            info!(dataset = %dataset, state = %run.journey.state, "Resuming journey");
            let event = run.journey_event(
                EventType::JourneyResumed,
                &format!("resume:{}", run.run_id),
                format!("Journey resumed from {}", run.journey.state),
                StageStatus::Running,
            );
            run.record(event).await?;
        } else {
            info!(dataset = %dataset, "Starting journey");
            let params = JourneyParams {
                plan: plan.name.clone(),
                path: run.path.to_string(),
                export_controlled: request.export_controlled,
            };
            let event = run
                .journey_event(
                    EventType::JourneyStarted,
                    "start",
                    format!("Journey '{}' started for {}", plan.name, run.path),
                    StageStatus::Running,
                )
                .with_details(serde_json::to_value(params)?);
            run.record(event).await?;
        }

        let stages = plan
            .stages
            .for_dataset(run.journey.export_controlled || request.export_controlled);

        for stage in Stage::ALL {
            if cancel.is_cancelled() {
                warn!(dataset = %dataset, stage = %stage, "Journey cancelled");
                let event = run.event(
                    Some(stage),
                    EventType::JourneyCancelled,
                    format!("{}:cancel:{}", dataset, run.run_id),
                    format!("Journey cancelled before {}", stage),
                    StageStatus::Pending,
                );
                run.record(event).await?;
                return Ok(run.journey);
            }

            if run.journey.is_stage_settled(stage) {
                debug!(stage = %stage, "Stage already settled, skipping");
                continue;
            }

            if let Some(reason) = self.skip_reason(plan, &stages, stage) {
                debug!(stage = %stage, reason, "Skipping stage");
                let event = run.stage_event(stage, EventType::StageSkipped, reason.to_string(), StageStatus::Skipped);
                run.record(event).await?;
                continue;
            }

            let event = run.stage_event(
                stage,
                EventType::StageStarted,
                format!("Stage '{}' started", stage),
                StageStatus::Running,
            );
            run.record(event).await?;

            let started = Instant::now();
            let outcome = self.run_stage(&mut run, stage).await?;
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                StageOutcome::Completed(summary) => {
                    info!(dataset = %dataset, stage = %stage, duration_ms, "{}", summary);
                    let event = run
                        .stage_event(stage, EventType::StageCompleted, summary, StageStatus::Completed)
                        .with_duration(duration_ms);
                    run.record(event).await?;
                }
                StageOutcome::Failed { endpoint, error } => {
                    return self.fail(run, stage, endpoint, error, duration_ms).await;
                }
            }
        }

        info!(dataset = %dataset, "Journey completed");
        let event = run.journey_event(
            EventType::JourneyCompleted,
            "complete",
            format!("Journey '{}' completed for {}", plan.name, run.path),
            StageStatus::Completed,
        );
        run.record(event).await?;

        Ok(run.journey)
    }

    /// Why a stage does not run for this journey, if it does not
    fn skip_reason(&self, plan: &JourneyPlan, stages: &EnabledStages, stage: Stage) -> Option<&'static str> {
        if !stages.contains(stage) {
            return Some("stage disabled");
        }

        let configured = match stage {
            Stage::TransferLocal | Stage::TransferRemote => !plan.hops_for(stage).is_empty(),
            Stage::Reconstruct | Stage::BuildDerived => plan.reconstruction.is_some(),
            Stage::Ingest => self.catalog.is_some(),
            Stage::SchedulePrune => true,
        };
        (!configured).then_some("not configured")
    }

    async fn run_stage(&self, run: &mut JourneyRun<'_>, stage: Stage) -> Result<StageOutcome> {
        match stage {
            Stage::TransferLocal | Stage::TransferRemote => {
                let plan = run.plan;
                let path = run.path.clone();
                let category = self.categories.classify(&path);
                self.transfer_hops(run, stage, plan.hops_for(stage), &path, category)
                    .await
            }
            Stage::Reconstruct => self.reconstruct(run).await,
            Stage::BuildDerived => self.build_derived(run).await,
            Stage::Ingest => self.ingest(run).await,
            Stage::SchedulePrune => self.schedule_prunes(run).await,
        }
    }

    /// Run hops in order; each must be confirmed before the next starts
    async fn transfer_hops(
        &self,
        run: &mut JourneyRun<'_>,
        stage: Stage,
        hops: &[Hop],
        path: &RelativePath,
        category: DataCategory,
    ) -> Result<StageOutcome> {
        let mut moved = 0u64;

        for hop in hops {
            if run.journey.has_hop(&hop.from, &hop.to, path.as_str()) {
                debug!(from = %hop.from, to = %hop.to, "Hop already confirmed");
                continue;
            }

            let source = self.registry.get(&hop.from)?;
            let destination = self.registry.get(&hop.to)?;

            let mut record = HopRecord {
                source: hop.from.clone(),
                destination: hop.to.clone(),
                path: path.to_string(),
                category,
                bytes: 0,
                already_present: false,
            };

            if let Some(bytes) = self.already_present(&source, &destination, path).await {
                info!(from = %hop.from, to = %hop.to, path = %path, "Destination already has the file");
                record.bytes = bytes;
                record.already_present = true;
            } else {
                match self.transfers.transfer(&source, &destination, path.as_str()).await {
                    Ok(result) if result.is_success() => {
                        record.bytes = result.bytes_moved;
                        moved += result.bytes_moved;
                    }
                    Ok(result) => {
                        let error = format!(
                            "{} -> {} {:?} after {} attempt(s): {}",
                            hop.from,
                            hop.to,
                            result.outcome,
                            result.attempts,
                            result.error.unwrap_or_default()
                        );
                        return Ok(StageOutcome::failed_at(&hop.to, error));
                    }
                    Err(e) => return Ok(StageOutcome::failed_at(&hop.to, e.to_string())),
                }
            }

            let event = run
                .stage_event(
                    stage,
                    EventType::HopCompleted,
                    format!("{} -> {}: {}", hop.from, hop.to, path),
                    StageStatus::Running,
                )
                .with_endpoint(hop.to.clone())
                .with_details(serde_json::to_value(&record)?);
            run.record(event).await?;
        }

        Ok(StageOutcome::Completed(format!(
            "{} hop(s) confirmed, {} bytes moved",
            hops.len(),
            moved
        )))
    }

    /// The destination holds the file with the source's size, or the
    /// source is already gone and only the destination copy remains.
    /// Tape archives are not visible to the storage service; a tape hop
    /// is only skipped when the journey log records it.
    async fn already_present(&self, source: &Endpoint, destination: &Endpoint, path: &RelativePath) -> Option<u64> {
        if destination.is_tape() {
            return None;
        }
        let at_destination = match self.storage.size(destination, path).await {
            Ok(Some(size)) => size,
            Ok(None) => return None,
            Err(e) => {
                debug!(endpoint = %destination.name, error = %e, "Destination check failed");
                return None;
            }
        };

        match self.storage.size(source, path).await {
            Ok(Some(size)) if size == at_destination => Some(at_destination),
            Ok(None) => Some(at_destination),
            _ => None,
        }
    }

    fn backend(&self, run: &JourneyRun<'_>) -> Result<&ReconstructionBackend, StageOutcome> {
        let site = match run.plan.reconstruction {
            Some(ref reconstruction) => reconstruction.backend,
            None => return Err(StageOutcome::failed("plan has no reconstruction")),
        };
        self.backends
            .get(&site)
            .ok_or_else(|| StageOutcome::failed_at(site.to_string(), format!("no {} backend configured", site)))
    }

    async fn reconstruct(&self, run: &mut JourneyRun<'_>) -> Result<StageOutcome> {
        let backend = match self.backend(run) {
            Ok(backend) => backend,
            Err(outcome) => return Ok(outcome),
        };

        if backend.reconstruct(&run.path).await {
            Ok(StageOutcome::Completed(format!("Reconstruction done at {}", backend.site())))
        } else {
            Ok(StageOutcome::failed_at(
                backend.site().to_string(),
                "reconstruction job failed or timed out",
            ))
        }
    }

    /// Build derived outputs, then bring them back over the return hops
    async fn build_derived(&self, run: &mut JourneyRun<'_>) -> Result<StageOutcome> {
        let backend = match self.backend(run) {
            Ok(backend) => backend,
            Err(outcome) => return Ok(outcome),
        };
        let plan = run.plan;
        let Some(reconstruction) = plan.reconstruction.as_ref() else {
            return Ok(StageOutcome::failed("plan has no reconstruction"));
        };

        // A rerun after a failed return hop does not rebuild
        let derived_built = run
            .journey
            .hops
            .iter()
            .any(|h| h.category == DataCategory::Derived);
        if !derived_built && !backend.build_derived(&run.path).await {
            return Ok(StageOutcome::failed_at(
                backend.site().to_string(),
                "derived output job failed or timed out",
            ));
        }

        let derived = match reconstruction.derived_paths(&run.path) {
            Ok(paths) => paths,
            Err(e) => return Ok(StageOutcome::failed(e.to_string())),
        };

        for path in &derived {
            let outcome = self
                .transfer_hops(run, Stage::BuildDerived, &reconstruction.return_hops, path, DataCategory::Derived)
                .await?;
            if let StageOutcome::Failed { .. } = outcome {
                return Ok(outcome);
            }
        }

        Ok(StageOutcome::Completed(format!(
            "{} derived output(s) in place",
            derived.len()
        )))
    }

    /// Register the dataset; failures become warnings
    async fn ingest(&self, run: &mut JourneyRun<'_>) -> Result<StageOutcome> {
        let Some(ref catalog) = self.catalog else {
            return Ok(StageOutcome::Completed("No catalog configured".to_string()));
        };

        let mut locations = Vec::new();
        let mut derived = Vec::new();
        for hop in &run.journey.hops {
            match hop.category {
                DataCategory::Raw => {
                    for name in [&hop.source, &hop.destination] {
                        if !locations.contains(name) {
                            locations.push(name.clone());
                        }
                    }
                }
                DataCategory::Derived => {
                    if !derived.contains(&hop.path) {
                        derived.push(hop.path.clone());
                    }
                }
            }
        }

        let descriptor = DatasetDescriptor {
            dataset_id: run.journey.dataset_id.clone(),
            beamline: run.plan.name.clone(),
            path: run.path.to_string(),
            locations,
            derived,
        };

        match catalog.ingest(&descriptor).await {
            Ok(catalog_id) => Ok(StageOutcome::Completed(format!("Registered as {}", catalog_id))),
            Err(e) => {
                warn!(dataset = %run.journey.dataset_id, error = %e, "Catalog ingest failed; continuing");
                let event = run
                    .stage_event(
                        Stage::Ingest,
                        EventType::StageWarning,
                        "Catalog ingest failed".to_string(),
                        StageStatus::Running,
                    )
                    .with_error(format!("ingest failed: {}", e));
                run.record(event).await?;
                Ok(StageOutcome::Completed("Ingest failed; recorded as warning".to_string()))
            }
        }
    }

    /// One prune task per hop source (verified against the first hop that
    /// copied from it), plus sinks that carry an explicit policy
    async fn schedule_prunes(&self, run: &mut JourneyRun<'_>) -> Result<StageOutcome> {
        let hops = run.journey.hops.clone();
        let sources: BTreeSet<&str> = hops.iter().map(|h| h.source.as_str()).collect();

        let mut candidates: Vec<(&str, &HopRecord, Option<&str>)> = Vec::new();
        let mut seen = BTreeSet::new();
        for hop in &hops {
            if seen.insert((hop.source.as_str(), hop.path.as_str())) {
                candidates.push((hop.source.as_str(), hop, Some(hop.destination.as_str())));
            }
        }
        for hop in &hops {
            if !sources.contains(hop.destination.as_str()) && seen.insert((hop.destination.as_str(), hop.path.as_str())) {
                candidates.push((hop.destination.as_str(), hop, None));
            }
        }

        let mut scheduled = 0;
        for (name, hop, verify) in candidates {
            let endpoint = self.registry.get(name)?;
            let Some(policy) = self.prunes.policies().lookup(name, hop.category) else {
                debug!(endpoint = name, category = %hop.category, "No retention policy");
                continue;
            };
            if !endpoint.can(Capability::Deletable) {
                debug!(endpoint = name, "Endpoint is not deletable");
                continue;
            }
            let mut verify = verify.map(|v| self.registry.get(v)).transpose()?;
            if verify.as_ref().is_some_and(|v| v.is_tape()) {
                // the archive job's success, already in the log, stands in for the check
                debug!(endpoint = name, "Copy is on tape; verified by the completed hop");
                verify = None;
            }

            let handle = match self
                .prunes
                .schedule_prune(&endpoint, &hop.path, policy.delete_after_days, verify.as_deref())
                .await
            {
                Ok(handle) => handle,
                Err(e) => return Ok(StageOutcome::failed_at(name, e.to_string())),
            };

            let event = run
                .stage_event(
                    Stage::SchedulePrune,
                    EventType::PruneScheduled,
                    format!("Prune of {} on {} at {}", hop.path, name, handle.eligible_at),
                    StageStatus::Running,
                )
                .with_endpoint(name)
                .with_details(serde_json::json!({
                    "task_id": handle.task_id,
                    "path": hop.path,
                    "eligible_at": handle.eligible_at,
                }));
            run.record(event).await?;
            scheduled += 1;
        }

        Ok(StageOutcome::Completed(format!("{} prune task(s) scheduled", scheduled)))
    }

    /// Halt the journey with (dataset, stage, endpoint) attribution
    async fn fail(
        &self,
        mut run: JourneyRun<'_>,
        stage: Stage,
        endpoint: Option<String>,
        error: String,
        duration_ms: u64,
    ) -> Result<Journey> {
        error!(
            dataset = %run.journey.dataset_id,
            stage = %stage,
            endpoint = endpoint.as_deref().unwrap_or("-"),
            error = %error,
            "Stage failed; journey halted"
        );

        let mut failed = run
            .stage_event(stage, EventType::StageFailed, format!("Stage '{}' failed", stage), StageStatus::Failed)
            .with_duration(duration_ms)
            .with_error(error.clone());
        let mut halted = run
            .stage_event(
                stage,
                EventType::JourneyFailed,
                format!("Journey failed at {}", stage),
                StageStatus::Failed,
            )
            .with_error(error);
        if let Some(endpoint) = endpoint {
            failed = failed.with_endpoint(endpoint.clone());
            halted = halted.with_endpoint(endpoint);
        }

        run.record(failed).await?;
        run.record(halted).await?;
        Ok(run.journey)
    }

    /// Run journeys for several datasets concurrently; results are in
    /// request order
    pub async fn dispatch_all(
        self: Arc<Self>,
        plan: Arc<JourneyPlan>,
        requests: Vec<DatasetRequest>,
        cancel: CancelFlag,
    ) -> Vec<Result<Journey>> {
        let mut set = JoinSet::new();
        let count = requests.len();

        for (index, request) in requests.into_iter().enumerate() {
            let dispatcher = Arc::clone(&self);
            let plan = Arc::clone(&plan);
            let cancel = cancel.clone();
            set.spawn(async move {
                let result = dispatcher.dispatch_with_cancel(&plan, &request, &cancel).await;
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<Journey>>> = (0..count).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => error!(error = %e, "Journey task panicked"),
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(anyhow::anyhow!("journey task did not finish"))))
            .collect()
    }

    /// Get the journey for a dataset
    pub async fn status(&self, dataset_id: &str) -> Result<Journey> {
        let store = EventStore::open(&self.state_dir, dataset_id).await?;
        store
            .load_journey()
            .await?
            .with_context(|| format!("Journey {} not found", dataset_id))
    }

    /// Continue a journey from its log
    pub async fn resume(&self, dataset_id: &str, plan: &JourneyPlan) -> Result<Journey> {
        let journey = self.status(dataset_id).await?;
        if journey.plan != plan.name {
            anyhow::bail!(
                "Journey {} belongs to plan '{}', not '{}'",
                dataset_id,
                journey.plan,
                plan.name
            );
        }

        let request = DatasetRequest::new(journey.path).export_controlled(journey.export_controlled);
        self.dispatch(plan, &request).await
    }

    /// List journeys, most recent first
    pub async fn list(&self, limit: usize) -> Result<Vec<Journey>> {
        let mut journeys = Vec::new();
        for id in EventStore::list_datasets(&self.state_dir).await? {
            match self.status(&id).await {
                Ok(journey) => journeys.push(journey),
                Err(e) => warn!(dataset = %id, error = %e, "Skipping unreadable journey"),
            }
        }

        journeys.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        journeys.truncate(limit);
        Ok(journeys)
    }
}
