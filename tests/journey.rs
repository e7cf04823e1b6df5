//! Journey Integration Tests
//!
//! End-to-end dispatch of detector files through local endpoints: hops,
//! reconstruction, catalog ingest, prune scheduling, resume and
//! cancellation.

mod common;

use std::sync::Arc;

use chrono::Duration;

use beamflow::core::{CancelFlag, Clock, DatasetRequest, EventStore, JourneyPlan};
use beamflow::domain::{DataCategory, EventType, JourneyState, PruneOutcome, Stage, StageStatus};

use common::{alcf_backend, policy, Facility, RecordingCatalog, RecordingCompute};

const SCAN: &str = "user/2024/scan_001.h5";

const BL832: &str = r#"
description: Beamline 8.3.2 microtomography
local:
  - { from: spot832, to: data832 }
remote:
  - { from: data832, to: nersc832 }
"#;

const BL832_ALCF: &str = r#"
local:
  - { from: spot832, to: data832 }
remote:
  - { from: data832, to: alcf_raw }
reconstruction:
  backend: alcf
  derived: ["{folder}/rec{stem}/"]
  return:
    - { from: alcf_scratch, to: data832_scratch }
"#;

fn bl832() -> JourneyPlan {
    JourneyPlan::from_yaml("bl832", BL832).unwrap()
}

fn bl832_facility() -> Facility {
    let facility = Facility::new(
        &["spot832", "data832", "nersc832"],
        vec![
            policy("spot832", DataCategory::Raw, 2),
            policy("data832", DataCategory::Raw, 30),
        ],
    );
    facility.write("spot832", SCAN, b"raw projections");
    facility
}

#[tokio::test]
async fn test_journey_moves_file_and_schedules_prunes() {
    let facility = bl832_facility();
    let dispatcher = facility.dispatcher();

    let journey = dispatcher.dispatch(&bl832(), &DatasetRequest::new(SCAN)).await.unwrap();

    assert_eq!(journey.state, JourneyState::Done);
    assert!(journey.completed_at.is_some());
    assert!(facility.exists("data832", SCAN));
    assert!(facility.exists("nersc832", SCAN));

    let hops: Vec<(&str, &str)> = journey
        .hops
        .iter()
        .map(|h| (h.source.as_str(), h.destination.as_str()))
        .collect();
    assert_eq!(hops, vec![("spot832", "data832"), ("data832", "nersc832")]);
    assert!(journey.hops.iter().all(|h| h.bytes == 15 && !h.already_present));

    assert_eq!(journey.stage_status(Stage::TransferLocal), StageStatus::Completed);
    assert_eq!(journey.stage_status(Stage::Reconstruct), StageStatus::Skipped);
    assert_eq!(journey.stage_status(Stage::Ingest), StageStatus::Skipped);
    assert_eq!(journey.stage_status(Stage::SchedulePrune), StageStatus::Completed);

    // spot832 (2 days) and data832 (30 days); nersc832 has no policy
    assert_eq!(journey.prune_tasks.len(), 2);
    let entries = facility.prunes.ledger().entries().await.unwrap();
    assert_eq!(entries[0].task.endpoint.name, "spot832");
    assert_eq!(
        entries[0].task.verify_exists_at.as_ref().map(|e| e.name.as_str()),
        Some("data832")
    );
    assert_eq!(entries[1].task.endpoint.name, "data832");
    assert_eq!(
        entries[1].task.verify_exists_at.as_ref().map(|e| e.name.as_str()),
        Some("nersc832")
    );

    // Only the beamline copy expires after two days
    facility.clock.advance(Duration::days(2) + Duration::minutes(1));
    assert_eq!(facility.scheduler.run_due(facility.clock.now()).await, 1);
    assert!(!facility.exists("spot832", SCAN));
    assert!(facility.exists("data832", SCAN));
}

#[tokio::test]
async fn test_lost_copy_keeps_beamline_file() {
    let facility = Facility::new(
        &["spot832", "data832"],
        vec![policy("spot832", DataCategory::Raw, 2)],
    );
    facility.write("spot832", SCAN, b"raw projections");
    let plan = JourneyPlan::from_yaml("spot_to_data", "local:\n  - { from: spot832, to: data832 }\n").unwrap();

    let journey = facility
        .dispatcher()
        .dispatch(&plan, &DatasetRequest::new(SCAN))
        .await
        .unwrap();
    assert_eq!(journey.state, JourneyState::Done);
    assert_eq!(journey.prune_tasks.len(), 1);

    // The only copy disappears before the beamline file expires
    std::fs::remove_file(facility.file("data832", SCAN)).unwrap();
    facility.clock.advance(Duration::days(2) + Duration::minutes(1));

    let reports = facility.prunes.run_due().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].outcome,
        PruneOutcome::VerificationFailed {
            endpoint: "data832".to_string()
        }
    );
    assert!(facility.exists("spot832", SCAN));
    assert_eq!(std::fs::read(facility.file("spot832", SCAN)).unwrap(), b"raw projections");
}

#[tokio::test]
async fn test_done_journey_is_not_repeated() {
    let facility = bl832_facility();
    let dispatcher = facility.dispatcher();
    let plan = bl832();

    let first = dispatcher.dispatch(&plan, &DatasetRequest::new(SCAN)).await.unwrap();
    let submits = facility.mover.submits();

    let second = dispatcher.dispatch(&plan, &DatasetRequest::new(SCAN)).await.unwrap();

    assert_eq!(second.dataset_id, first.dataset_id);
    assert!(second.is_done());
    assert_eq!(facility.mover.submits(), submits);

    let events = EventStore::open(&facility.state_dir(), &first.dataset_id)
        .await
        .unwrap()
        .replay()
        .await
        .unwrap();
    let completions = events
        .iter()
        .filter(|e| e.event_type == EventType::JourneyCompleted)
        .count();
    assert_eq!(completions, 1);
}

#[tokio::test]
async fn test_existing_copy_is_not_transferred_again() {
    let facility = bl832_facility();
    facility.write("data832", SCAN, b"raw projections");

    let journey = facility
        .dispatcher()
        .dispatch(&bl832(), &DatasetRequest::new(SCAN))
        .await
        .unwrap();

    assert!(journey.is_done());
    assert!(journey.hops[0].already_present);
    assert!(!journey.hops[1].already_present);
    assert_eq!(facility.mover.submits(), 1);
}

#[tokio::test]
async fn test_failed_hop_halts_and_resume_continues() {
    let facility = bl832_facility();
    let dispatcher = facility.dispatcher();
    let plan = bl832();

    // Make the remote root unusable: a file where the directory should be
    let remote_root = std::path::PathBuf::from(&facility.endpoint("nersc832").root_path);
    std::fs::remove_dir(&remote_root).unwrap();
    std::fs::write(&remote_root, b"not a directory").unwrap();

    let journey = dispatcher.dispatch(&plan, &DatasetRequest::new(SCAN)).await.unwrap();

    match &journey.state {
        JourneyState::Failed { stage, endpoint, .. } => {
            assert_eq!(*stage, Stage::TransferRemote);
            assert_eq!(endpoint.as_deref(), Some("nersc832"));
        }
        other => panic!("expected failure, got {}", other),
    }
    assert_eq!(journey.stage_status(Stage::TransferLocal), StageStatus::Completed);
    assert!(journey.prune_tasks.is_empty());
    assert!(facility.prunes.ledger().entries().await.unwrap().is_empty());

    std::fs::remove_file(&remote_root).unwrap();
    std::fs::create_dir_all(&remote_root).unwrap();
    let submits = facility.mover.submits();

    let resumed = dispatcher.resume(&journey.dataset_id, &plan).await.unwrap();

    assert!(resumed.is_done());
    assert!(facility.exists("nersc832", SCAN));
    // The local hop was not repeated
    assert_eq!(facility.mover.submits(), submits + 1);
    assert_eq!(resumed.hops.len(), 2);
    assert_eq!(resumed.prune_tasks.len(), 2);
}

#[tokio::test]
async fn test_resume_rejects_other_plan() {
    let facility = bl832_facility();
    let dispatcher = facility.dispatcher();
    let journey = dispatcher.dispatch(&bl832(), &DatasetRequest::new(SCAN)).await.unwrap();

    let other = JourneyPlan::from_yaml("bl733", BL832).unwrap();
    assert!(dispatcher.resume(&journey.dataset_id, &other).await.is_err());
}

#[tokio::test]
async fn test_export_controlled_data_stays_local() {
    let facility = Facility::new(
        &["spot832", "data832", "alcf_raw", "alcf_scratch", "data832_scratch"],
        vec![policy("spot832", DataCategory::Raw, 2)],
    );
    facility.write("spot832", SCAN, b"raw projections");
    let compute = Arc::new(RecordingCompute::new(true));
    let catalog = Arc::new(RecordingCatalog::new());
    let dispatcher = facility
        .dispatcher()
        .with_backend(alcf_backend(Arc::clone(&compute)))
        .with_catalog(catalog.clone());
    let plan = JourneyPlan::from_yaml("bl832", BL832_ALCF).unwrap();

    let journey = dispatcher
        .dispatch(&plan, &DatasetRequest::new(SCAN).export_controlled(true))
        .await
        .unwrap();

    assert!(journey.is_done());
    assert!(journey.export_controlled);
    assert!(facility.exists("data832", SCAN));
    assert!(!facility.exists("alcf_raw", SCAN));
    for stage in [Stage::TransferRemote, Stage::Reconstruct, Stage::BuildDerived, Stage::Ingest] {
        assert_eq!(journey.stage_status(stage), StageStatus::Skipped, "{}", stage);
    }
    assert!(compute.job_names().is_empty());
    assert!(catalog.ingested().is_empty());
    assert_eq!(journey.prune_tasks.len(), 1);
}

#[tokio::test]
async fn test_reconstruction_brings_back_derived_outputs() {
    let facility = Facility::new(
        &["spot832", "data832", "alcf_raw", "alcf_scratch", "data832_scratch"],
        vec![policy("data832_scratch", DataCategory::Derived, 7)],
    );
    facility.write("spot832", SCAN, b"raw projections");
    facility.write("alcf_scratch", "user/2024/recscan_001/slice_0000.tiff", b"slice");
    facility.write("alcf_scratch", "user/2024/recscan_001/slice_0001.tiff", b"slice");

    let compute = Arc::new(RecordingCompute::new(true));
    let catalog = Arc::new(RecordingCatalog::new());
    let dispatcher = facility
        .dispatcher()
        .with_backend(alcf_backend(Arc::clone(&compute)))
        .with_catalog(catalog.clone());
    let plan = JourneyPlan::from_yaml("bl832", BL832_ALCF).unwrap();

    let journey = dispatcher.dispatch(&plan, &DatasetRequest::new(SCAN)).await.unwrap();

    assert!(journey.is_done(), "journey ended as {}", journey.state);
    assert_eq!(
        compute.job_names(),
        vec!["tomo_recon_scan_001".to_string(), "tiff_to_zarr_scan_001".to_string()]
    );
    assert!(facility.exists("data832_scratch", "user/2024/recscan_001/slice_0001.tiff"));

    let derived = journey.hops.iter().find(|h| h.category == DataCategory::Derived).unwrap();
    assert_eq!(derived.path, "user/2024/recscan_001/");
    assert_eq!(derived.bytes, 10);

    let ingested = catalog.ingested();
    assert_eq!(ingested.len(), 1);
    assert_eq!(ingested[0].locations, vec!["spot832", "data832", "alcf_raw"]);
    assert_eq!(ingested[0].derived, vec!["user/2024/recscan_001/"]);

    // Only data832_scratch carries a derived policy
    assert_eq!(journey.prune_tasks.len(), 1);
}

#[tokio::test]
async fn test_failed_reconstruction_is_attributed_to_site() {
    let facility = Facility::new(
        &["spot832", "data832", "alcf_raw", "alcf_scratch", "data832_scratch"],
        vec![],
    );
    facility.write("spot832", SCAN, b"raw projections");
    let dispatcher = facility
        .dispatcher()
        .with_backend(alcf_backend(Arc::new(RecordingCompute::new(false))));
    let plan = JourneyPlan::from_yaml("bl832", BL832_ALCF).unwrap();

    let journey = dispatcher.dispatch(&plan, &DatasetRequest::new(SCAN)).await.unwrap();

    assert!(journey.is_failed());
    assert_eq!(
        journey.state,
        JourneyState::Failed {
            stage: Stage::Reconstruct,
            endpoint: Some("alcf".to_string()),
            error: "reconstruction job failed or timed out".to_string(),
        }
    );
    assert_eq!(journey.stage_status(Stage::TransferRemote), StageStatus::Completed);
}

#[tokio::test]
async fn test_catalog_failure_is_a_warning() {
    let facility = bl832_facility();
    let dispatcher = facility
        .dispatcher()
        .with_catalog(Arc::new(RecordingCatalog::unreachable()));

    let journey = dispatcher.dispatch(&bl832(), &DatasetRequest::new(SCAN)).await.unwrap();

    assert!(journey.is_done());
    assert_eq!(journey.stage_status(Stage::Ingest), StageStatus::Completed);
    assert_eq!(journey.warnings.len(), 1);
    assert!(journey.warnings[0].contains("catalog unreachable"));
    assert_eq!(journey.prune_tasks.len(), 2);
}

#[tokio::test]
async fn test_cancelled_journey_resumes() {
    let facility = bl832_facility();
    let dispatcher = facility.dispatcher();
    let plan = bl832();

    let cancel = CancelFlag::new();
    cancel.cancel();
    let journey = dispatcher
        .dispatch_with_cancel(&plan, &DatasetRequest::new(SCAN), &cancel)
        .await
        .unwrap();

    assert_eq!(journey.state, JourneyState::Cancelled { before: Stage::TransferLocal });
    assert_eq!(facility.mover.submits(), 0);

    let journey = dispatcher.dispatch(&plan, &DatasetRequest::new(SCAN)).await.unwrap();
    assert!(journey.is_done());
}

#[tokio::test]
async fn test_invalid_path_is_rejected() {
    let facility = bl832_facility();

    let result = facility
        .dispatcher()
        .dispatch(&bl832(), &DatasetRequest::new("../outside.h5"))
        .await;

    assert!(result.is_err());
    assert_eq!(facility.mover.submits(), 0);
}

#[tokio::test]
async fn test_dispatch_all_runs_journeys_independently() {
    let facility = bl832_facility();
    facility.write("spot832", "user/2024/scan_002.h5", b"more projections");
    let dispatcher = Arc::new(facility.dispatcher());

    let results = Arc::clone(&dispatcher)
        .dispatch_all(
            Arc::new(bl832()),
            vec![
                DatasetRequest::new(SCAN),
                DatasetRequest::new("user/2024/missing.h5"),
                DatasetRequest::new("user/2024/scan_002.h5"),
            ],
            CancelFlag::new(),
        )
        .await;

    let journeys: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
    assert!(journeys[0].is_done());
    assert!(journeys[1].is_failed());
    assert!(journeys[2].is_done());
    assert_eq!(journeys[2].path, "user/2024/scan_002.h5");

    let listed = dispatcher.list(10).await.unwrap();
    assert_eq!(listed.len(), 3);
    let status = dispatcher.status(&journeys[1].dataset_id).await.unwrap();
    assert_eq!(status.state, journeys[1].state);
}
