//! Command-line interface for beamflow.
//!
//! Provides commands for dispatching journeys, checking status, listing
//! and resuming journeys, watching a beamline directory, and managing
//! scheduled prunes.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::core::{CancelFlag, DatasetRequest};
use crate::domain::{Capability, Journey, JourneyState, Stage};
use crate::ingest::{BeamlineWatcher, DatasetFile};
use crate::services::{Services, Timers};
use crate::config::Settings;

pub mod prune;

/// beamflow - Beamline data transfer and retention orchestrator
#[derive(Parser, Debug)]
#[command(name = "beamflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: .beamflow/config.yaml in this or a parent directory)
    #[arg(long, global = true, env = "BEAMFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Dispatch journeys for one or more files
    Run {
        /// Journey plan name (a key under `journeys`)
        plan: String,

        /// Paths relative to the plan's first source endpoint
        #[arg(required = true)]
        paths: Vec<String>,

        /// Keep the data at the facility (no remote transfer, compute or ingest)
        #[arg(long)]
        export_controlled: bool,
    },

    /// Show the journey of a dataset
    Status {
        /// Dataset ID
        dataset_id: String,
    },

    /// List recent journeys
    Journeys {
        /// Maximum number of journeys to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Resume a failed or cancelled journey
    Resume {
        /// Dataset ID to resume
        dataset_id: String,
    },

    /// Watch the configured beamline endpoint and dispatch new files
    Watch {
        /// Dispatch files already present and exit
        #[arg(long)]
        once: bool,
    },

    /// List configured endpoints
    Endpoints,

    /// Show resolved configuration (debug)
    Config,

    /// Manage scheduled prunes
    Prune {
        #[command(subcommand)]
        command: prune::PruneCommands,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let settings = Settings::load(self.config.as_deref()).context("Failed to load configuration")?;

        match self.command {
            Commands::Run {
                plan,
                paths,
                export_controlled,
            } => run_journeys(settings, &plan, paths, export_controlled).await,
            Commands::Status { dataset_id } => show_status(settings, &dataset_id).await,
            Commands::Journeys { limit } => list_journeys(settings, limit).await,
            Commands::Resume { dataset_id } => resume_journey(settings, &dataset_id).await,
            Commands::Watch { once } => watch(settings, once).await,
            Commands::Endpoints => {
                list_endpoints(&settings);
                Ok(())
            }
            Commands::Config => {
                show_config(&settings);
                Ok(())
            }
            Commands::Prune { command } => prune::execute(settings, command).await,
        }
    }
}

/// Dispatch journeys for the given paths
async fn run_journeys(settings: Settings, plan_name: &str, paths: Vec<String>, export_controlled: bool) -> Result<()> {
    let plan = Arc::new(settings.plan(plan_name)?.clone());
    let services = Services::build(settings, Timers::Manual)?;

    let requests: Vec<DatasetRequest> = paths
        .into_iter()
        .map(|path| DatasetRequest::new(path).export_controlled(export_controlled))
        .collect();

    let results = Arc::clone(&services.dispatcher)
        .dispatch_all(plan, requests, CancelFlag::new())
        .await;

    let mut failed = 0;
    for result in results {
        match result {
            Ok(journey) => {
                if !journey.is_done() {
                    failed += 1;
                }
                eprintln!("[{} {}: {}]", journey.dataset_id, journey.path, journey.state);
            }
            Err(e) => {
                failed += 1;
                eprintln!("[error: {:#}]", e);
            }
        }
    }

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Show the journey of a dataset
async fn show_status(settings: Settings, dataset_id: &str) -> Result<()> {
    let services = Services::build(settings, Timers::Manual)?;
    let journey = services.dispatcher.status(dataset_id).await?;
    print_journey(&journey);
    Ok(())
}

fn print_journey(journey: &Journey) {
    println!("Dataset ID: {}", journey.dataset_id);
    println!("Plan: {}", journey.plan);
    println!("Path: {}", journey.path);
    if journey.export_controlled {
        println!("Export controlled: yes");
    }
    println!("State: {}", journey.state);
    println!("Started: {}", journey.started_at);
    if let Some(completed) = journey.completed_at {
        println!("Completed: {}", completed);
    }

    println!("\nStages:");
    for stage in Stage::ALL {
        println!("  {:<16} {:?}", stage.as_str(), journey.stage_status(stage));
    }

    if !journey.hops.is_empty() {
        println!("\nHops:");
        for hop in &journey.hops {
            let note = if hop.already_present { " (already present)" } else { "" };
            println!(
                "  {} -> {}: {} [{}, {} bytes]{}",
                hop.source, hop.destination, hop.path, hop.category, hop.bytes, note
            );
        }
    }

    if !journey.prune_tasks.is_empty() {
        println!("\nPrune tasks:");
        for task_id in &journey.prune_tasks {
            println!("  {}", task_id);
        }
    }

    if !journey.warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &journey.warnings {
            println!("  {}", warning);
        }
    }
}

/// List recent journeys
async fn list_journeys(settings: Settings, limit: usize) -> Result<()> {
    let services = Services::build(settings, Timers::Manual)?;
    let journeys = services.dispatcher.list(limit).await?;

    if journeys.is_empty() {
        println!("No journeys found");
        return Ok(());
    }

    println!("{:<18} {:<12} {:<26} {}", "DATASET ID", "PLAN", "STATE", "PATH");
    println!("{}", "-".repeat(90));

    for journey in journeys {
        let state = match &journey.state {
            JourneyState::Failed { stage, .. } => format!("failed ({})", stage),
            JourneyState::Cancelled { before } => format!("cancelled ({})", before),
            other => other.to_string(),
        };
        println!(
            "{:<18} {:<12} {:<26} {}",
            journey.dataset_id, journey.plan, state, journey.path
        );
    }

    Ok(())
}

/// Resume a failed or cancelled journey
async fn resume_journey(settings: Settings, dataset_id: &str) -> Result<()> {
    let services = Services::build(settings, Timers::Manual)?;

    // First get the journey to find out which plan it ran with
    let existing = services.dispatcher.status(dataset_id).await?;
    let plan = services.settings.plan(&existing.plan)?;

    let journey = services.dispatcher.resume(dataset_id, plan).await?;

    match &journey.state {
        JourneyState::Done => eprintln!("\n[Journey {} resumed and completed]", journey.dataset_id),
        JourneyState::Failed { .. } => {
            eprintln!("\n[Journey {} failed again: {}]", journey.dataset_id, journey.state);
            std::process::exit(1);
        }
        state => eprintln!("\n[Journey {} in state: {}]", journey.dataset_id, state),
    }

    Ok(())
}

/// Watch the beamline endpoint and dispatch every new stable file
async fn watch(settings: Settings, once: bool) -> Result<()> {
    let config = settings
        .watch
        .clone()
        .context("No `watch` section in the configuration")?;
    let plan = Arc::new(settings.plan(&config.plan)?.clone());
    let endpoint = settings.registry.get(&config.endpoint)?;

    let timers = if once { Timers::Manual } else { Timers::Tokio };
    let services = Services::build(settings, timers)?;
    let watcher = BeamlineWatcher::new(config, &endpoint);

    let existing: Vec<DatasetRequest> = watcher
        .scan_once()
        .await?
        .into_iter()
        .map(|file| DatasetRequest::new(file.path.to_string()))
        .collect();
    eprintln!("Found {} existing file(s) under {}", existing.len(), watcher.root().display());

    let cancel = CancelFlag::new();
    for result in Arc::clone(&services.dispatcher)
        .dispatch_all(Arc::clone(&plan), existing, cancel.clone())
        .await
    {
        if let Err(e) = result {
            tracing::error!("Journey error: {:#}", e);
        }
    }

    if once {
        return Ok(());
    }

    services.prunes.restore().await?;
    let (mut files, handle) = watcher.watch()?;
    eprintln!("Watching for new files (Ctrl-C to stop)");

    let dispatcher = Arc::clone(&services.dispatcher);
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let finished = supervise(&mut files, ctrl_c, &cancel, |file| {
        let dispatcher = Arc::clone(&dispatcher);
        let plan = Arc::clone(&plan);
        let cancel = cancel.clone();
        async move {
            let request = DatasetRequest::new(file.path.to_string());
            match dispatcher.dispatch_with_cancel(&plan, &request, &cancel).await {
                Ok(journey) => tracing::info!(dataset = %journey.dataset_id, state = %journey.state, "Journey finished"),
                Err(e) => tracing::error!("Journey error for {}: {:#}", request.path, e),
            }
        }
    })
    .await;
    tracing::info!(journeys = finished, "Watch stopped");

    // unblocks a watcher waiting on a full channel
    drop(files);
    handle.stop().await?;
    Ok(())
}

/// Start a journey per watched file until the channel closes or `shutdown`
/// resolves, then wait for every journey still in flight. Returns how many
/// journeys ran.
async fn supervise<F, Fut>(
    files: &mut mpsc::Receiver<DatasetFile>,
    shutdown: impl Future<Output = ()>,
    cancel: &CancelFlag,
    mut start: F,
) -> usize
where
    F: FnMut(DatasetFile) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut journeys = JoinSet::new();
    let mut finished = 0;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            file = files.recv() => {
                let Some(file) = file else { break };
                journeys.spawn(start(file));
            }
            Some(joined) = journeys.join_next(), if !journeys.is_empty() => {
                finished += 1;
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Journey task aborted");
                }
            }
            _ = &mut shutdown => {
                eprintln!("Stopping; waiting for {} running journey(s) to halt at their next stage", journeys.len());
                cancel.cancel();
                break;
            }
        }
    }

    while let Some(joined) = journeys.join_next().await {
        finished += 1;
        if let Err(e) = joined {
            tracing::error!(error = %e, "Journey task aborted");
        }
    }
    finished
}

/// List configured endpoints
fn list_endpoints(settings: &Settings) {
    if settings.registry.is_empty() {
        println!("No endpoints configured");
        return;
    }

    println!("{:<18} {:<18} {:<6} {}", "NAME", "KIND", "CAPS", "ROOT");
    println!("{}", "-".repeat(80));

    for endpoint in settings.registry.iter() {
        let caps: String = [
            (Capability::Readable, 'r'),
            (Capability::Writable, 'w'),
            (Capability::Deletable, 'd'),
        ]
        .iter()
        .map(|(cap, c)| if endpoint.can(*cap) { *c } else { '-' })
        .collect();
        let kind = serde_json::to_value(endpoint.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        println!("{:<18} {:<18} {:<6} {}", endpoint.name, kind, caps, endpoint.root_path);
    }
}

/// Show resolved configuration
fn show_config(settings: &Settings) {
    println!("beamflow configuration");
    println!("======================");
    println!();

    match &settings.config_file {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: (none found, using defaults)"),
    }
    println!();

    println!("State directory: {}", settings.home.display());
    println!("Prune ledger:    {}", settings.ledger_path().display());
    println!();

    println!(
        "Transfer: {:?}, poll every {}s, give up after {}s, {} submission attempt(s)",
        settings.transfer.method,
        settings.transfer.poll_interval_secs,
        settings.transfer.max_wait_secs,
        settings.transfer.retry.max_attempts
    );
    println!("Endpoints: {}", settings.registry.len());

    println!("\nRetention:");
    for policy in settings.retention.iter() {
        println!(
            "  {:<18} {:<8} after {} day(s)",
            policy.endpoint, policy.applies_to, policy.delete_after_days
        );
    }

    println!("\nJourney plans:");
    for plan in settings.journeys.values() {
        let hops: Vec<String> = plan
            .local
            .iter()
            .chain(&plan.remote)
            .map(|h| format!("{} -> {}", h.from, h.to))
            .collect();
        println!("  {}: {}", plan.name, hops.join(", "));
        if let Some(ref reconstruction) = plan.reconstruction {
            println!("    reconstruction at {}", reconstruction.backend);
        }
    }

    if let Some(ref catalog) = settings.catalog {
        println!("\nCatalog: {}", catalog.base_url);
    }
    if let Some(ref watch) = settings.watch {
        println!("\nWatch: {} with plan {}", watch.endpoint, watch.plan);
    }
}
