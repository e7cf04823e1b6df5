//! Builds the controllers and adapters described by [`Settings`].

use std::sync::Arc;

use tracing::debug;

use crate::adapters::compute::{AlcfBackend, NerscBackend, ReconstructionBackend, RestComputeService};
use crate::adapters::{
    ComputeService, EndpointStorage, GlobusClient, LocalFilesystem, ScicatCatalog, TapeArchiver, TapeRouter,
    TransferService,
};
use crate::config::{credential, ConfigError, Settings, TransferMethod};
use crate::core::{
    Clock, Dispatcher, ManualScheduler, PruneController, PruneLedger, Scheduler, SystemClock,
    TokioScheduler, TransferController, TransferMetrics,
};

/// How scheduled prunes are fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timers {
    /// In-process tokio timers (long-running `watch`)
    Tokio,
    /// Held until an explicit sweep (one-shot commands)
    Manual,
}

/// Everything a command needs, wired once from the settings
pub struct Services {
    pub settings: Settings,
    pub dispatcher: Arc<Dispatcher>,
    pub prunes: Arc<PruneController>,
}

impl Services {
    /// Wire services; missing credentials fail here, before any work
    pub fn build(settings: Settings, timers: Timers) -> Result<Self, ConfigError> {
        settings.check_credentials()?;

        let (mover, storage): (Arc<dyn TransferService>, Arc<dyn EndpointStorage>) = match settings.transfer.method {
            TransferMethod::Local => {
                let local = Arc::new(LocalFilesystem::new());
                (local.clone() as Arc<dyn TransferService>, local as Arc<dyn EndpointStorage>)
            }
            TransferMethod::Globus => {
                let globus = &settings.transfer.globus;
                let client = Arc::new(GlobusClient::new(globus, credential(&globus.token_env)?));
                (client.clone() as Arc<dyn TransferService>, client as Arc<dyn EndpointStorage>)
            }
        };
        debug!(service = mover.name(), "Transfer service ready");

        let compute = compute_service(&settings)?;
        let tape = match (&compute, &settings.compute.hpss) {
            (Some(service), Some(hpss)) => Some(Arc::new(TapeArchiver::new(Arc::clone(service), hpss.clone()))),
            _ => None,
        };
        let mover: Arc<dyn TransferService> = Arc::new(TapeRouter::new(mover, tape));

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let scheduler: Arc<dyn Scheduler> = match timers {
            Timers::Tokio => Arc::new(TokioScheduler::new(Arc::clone(&clock))),
            Timers::Manual => Arc::new(ManualScheduler::new()),
        };

        let prunes = Arc::new(PruneController::new(
            Arc::clone(&storage),
            PruneLedger::new(settings.ledger_path()),
            scheduler,
            clock,
            settings.retention.clone(),
        ));

        let mut transfers = TransferController::new(mover, settings.transfer.settings());
        if let Some(ref metrics) = settings.metrics {
            let metrics = TransferMetrics::new(metrics).map_err(|e| ConfigError::InvalidSetting {
                key: "metrics".to_string(),
                reason: e.to_string(),
            })?;
            transfers = transfers.with_metrics(Arc::new(metrics));
        }
        let transfers = Arc::new(transfers);

        let mut dispatcher = Dispatcher::new(
            settings.registry.clone(),
            transfers,
            storage,
            Arc::clone(&prunes),
            settings.home.clone(),
        )
        .with_categories(settings.categories.clone());

        for backend in build_backends(&settings, compute) {
            dispatcher = dispatcher.with_backend(backend);
        }

        if let Some(ref catalog) = settings.catalog {
            let token = credential(&catalog.token_env)?;
            dispatcher = dispatcher.with_catalog(Arc::new(ScicatCatalog::new(catalog, token)));
        }

        Ok(Self {
            settings,
            dispatcher: Arc::new(dispatcher),
            prunes,
        })
    }
}

/// The gateway client, when anything needs it
fn compute_service(settings: &Settings) -> Result<Option<Arc<dyn ComputeService>>, ConfigError> {
    let compute = &settings.compute;
    let Some(ref gateway) = compute.gateway else {
        return Ok(None);
    };
    if compute.alcf.is_none() && compute.nersc.is_none() && compute.hpss.is_none() {
        return Ok(None);
    }

    let service: Arc<dyn ComputeService> = Arc::new(RestComputeService::new(
        &gateway.base_url,
        credential(&gateway.token_env)?,
    ));
    Ok(Some(service))
}

fn build_backends(settings: &Settings, service: Option<Arc<dyn ComputeService>>) -> Vec<ReconstructionBackend> {
    let Some(service) = service else {
        return Vec::new();
    };
    let compute = &settings.compute;
    let polling = compute.polling();

    let mut backends = Vec::new();
    if let Some(ref alcf) = compute.alcf {
        backends.push(ReconstructionBackend::Alcf(AlcfBackend::new(
            Arc::clone(&service),
            alcf.clone(),
            polling,
        )));
    }
    if let Some(ref nersc) = compute.nersc {
        backends.push(ReconstructionBackend::Nersc(NerscBackend::new(
            Arc::clone(&service),
            nersc.clone(),
            polling,
        )));
    }
    backends
}
