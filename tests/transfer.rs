//! Transfer Controller Integration Tests
//!
//! Tests for retry, validation, polling, timeout and cancellation of
//! single-hop transfers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use beamflow::adapters::{TransferService, TransferStatus};
use beamflow::core::{
    MetricsConfig, PathViolation, TransferController, TransferError, TransferMetrics, TransferSettings,
};
use beamflow::domain::{Capability, Endpoint, EndpointKind, TransferOutcome};

use common::{fast_settings, Facility, ScriptedMover};

fn scripted(mover: &Arc<ScriptedMover>, settings: TransferSettings) -> TransferController {
    TransferController::new(Arc::clone(mover) as Arc<dyn TransferService>, settings)
}

fn remote_pair() -> (Arc<Endpoint>, Arc<Endpoint>) {
    (
        Arc::new(Endpoint::new("data832", "/data/raw", EndpointKind::Filesystem)),
        Arc::new(Endpoint::new("nersc832", "/global/cfs/als", EndpointKind::RemoteFilesystem)),
    )
}

#[tokio::test]
async fn test_transient_submission_failures_are_retried() {
    let facility = Facility::flaky(&["spot832", "data832"], vec![], 2);
    facility.write("spot832", "user/scan_001.h5", b"projection data");

    let result = facility
        .transfers()
        .transfer(
            &facility.endpoint("spot832"),
            &facility.endpoint("data832"),
            "user/scan_001.h5",
        )
        .await
        .unwrap();

    assert!(result.is_success(), "transfer failed: {:?}", result.error);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.bytes_moved, 15);
    assert_eq!(facility.mover.submits(), 3);
    assert_eq!(
        std::fs::read(facility.file("data832", "user/scan_001.h5")).unwrap(),
        b"projection data"
    );
}

#[tokio::test]
async fn test_finished_transfers_are_counted() {
    let mover = Arc::new(ScriptedMover::new([
        TransferStatus::Pending { detail: Some("ACTIVE".to_string()) },
        TransferStatus::Succeeded { bytes: 2048 },
    ]));
    let metrics = Arc::new(
        TransferMetrics::new(&MetricsConfig {
            pushgateway_url: None,
            job: "beamflow_transfer".to_string(),
            instance: "data_transfer".to_string(),
        })
        .unwrap(),
    );
    let controller = scripted(&mover, fast_settings()).with_metrics(Arc::clone(&metrics));
    let (data832, nersc832) = remote_pair();

    let result = controller.transfer(&data832, &nersc832, "user/scan_001.h5").await.unwrap();
    assert!(result.is_success());

    let text = metrics.encode();
    assert!(text.contains("beamflow_transfers_total{outcome=\"succeeded\"} 1"));
    assert!(text.contains("beamflow_transfer_bytes_total{destination=\"nersc832\"} 2048"));
}

#[tokio::test]
async fn test_retries_stop_at_max_attempts() {
    let facility = Facility::flaky(&["spot832", "data832"], vec![], 5);
    facility.write("spot832", "scan.h5", b"x");

    let result = facility
        .transfers()
        .transfer(&facility.endpoint("spot832"), &facility.endpoint("data832"), "scan.h5")
        .await
        .unwrap();

    assert_eq!(result.outcome, TransferOutcome::Failed);
    assert_eq!(result.attempts, 3);
    assert!(result.transfer_id.is_none());
    assert!(result.error.unwrap().contains("connection reset"));
    assert!(!facility.exists("data832", "scan.h5"));
}

#[tokio::test]
async fn test_traversal_is_rejected_before_io() {
    let facility = Facility::new(&["spot832", "data832"], vec![]);

    let err = facility
        .transfers()
        .transfer(
            &facility.endpoint("spot832"),
            &facility.endpoint("data832"),
            "user/../../etc/passwd",
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::Path(PathViolation::Traversal { .. })));
    assert_eq!(facility.mover.submits(), 0);
}

#[tokio::test]
async fn test_capabilities_are_enforced() {
    let facility = Facility::new(&["spot832"], vec![]);
    let archive = Arc::new(
        Endpoint::new("hpss", "/home/a/alsdev", EndpointKind::TapeArchive)
            .with_capabilities([Capability::Readable]),
    );

    let err = facility
        .transfers()
        .transfer(&facility.endpoint("spot832"), &archive, "scan.h5")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TransferError::Path(PathViolation::MissingCapability { .. })
    ));
    assert_eq!(facility.mover.submits(), 0);
}

#[tokio::test]
async fn test_same_endpoint_is_rejected() {
    let facility = Facility::new(&["data832"], vec![]);
    let data832 = facility.endpoint("data832");

    let err = facility
        .transfers()
        .transfer(&data832, &data832, "scan.h5")
        .await
        .unwrap_err();

    assert_eq!(err, TransferError::SameEndpoint("data832".to_string()));
}

#[tokio::test]
async fn test_missing_source_fails_without_retry() {
    let facility = Facility::new(&["spot832", "data832"], vec![]);

    let result = facility
        .transfers()
        .transfer(&facility.endpoint("spot832"), &facility.endpoint("data832"), "absent.h5")
        .await
        .unwrap();

    assert_eq!(result.outcome, TransferOutcome::Failed);
    assert_eq!(result.attempts, 1);
    assert!(result.error.unwrap().starts_with("FILE_NOT_FOUND"));
}

#[tokio::test]
async fn test_pending_transfer_times_out_without_cancel() {
    let mover = Arc::new(ScriptedMover::new([TransferStatus::Pending {
        detail: Some("QUEUED".to_string()),
    }]));
    let mut settings = fast_settings();
    settings.max_wait = Duration::from_millis(60);
    let (source, destination) = remote_pair();

    let result = scripted(&mover, settings)
        .transfer(&source, &destination, "user/scan.h5")
        .await
        .unwrap();

    assert_eq!(result.outcome, TransferOutcome::TimedOut);
    assert_eq!(result.transfer_id.as_deref(), Some("task-1"));
    assert!(result.error.unwrap().contains("did not finish"));
    assert!(mover.cancelled().is_empty());
}

#[tokio::test]
async fn test_fatal_remote_status_cancels_task() {
    let mover = Arc::new(ScriptedMover::new([
        TransferStatus::Pending { detail: Some("QUEUED".to_string()) },
        TransferStatus::Pending { detail: Some("PERMISSION_DENIED".to_string()) },
    ]));
    let (source, destination) = remote_pair();

    let result = scripted(&mover, fast_settings())
        .transfer(&source, &destination, "user/scan.h5")
        .await
        .unwrap();

    assert_eq!(result.outcome, TransferOutcome::Failed);
    assert_eq!(result.error.as_deref(), Some("PERMISSION_DENIED"));
    assert_eq!(mover.cancelled(), vec!["task-1".to_string()]);
}

#[tokio::test]
async fn test_remote_success_reports_bytes() {
    let mover = Arc::new(ScriptedMover::new([
        TransferStatus::Pending { detail: Some("ACTIVE".to_string()) },
        TransferStatus::Succeeded { bytes: 4096 },
    ]));
    let (source, destination) = remote_pair();

    let result = scripted(&mover, fast_settings())
        .transfer(&source, &destination, "/user/scan.h5")
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.bytes_moved, 4096);
    assert_eq!(result.path, "user/scan.h5");
    assert_eq!(result.source, "data832");
}
