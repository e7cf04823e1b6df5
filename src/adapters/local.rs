//! Local filesystem mover for endpoints mounted on this host.
//!
//! Implements both [`TransferService`] and [`EndpointStorage`] by resolving
//! endpoint root paths locally. Copies run on the blocking pool and report
//! through the same submit/poll protocol as the remote service. Each file is
//! staged in a temporary file next to its destination and renamed into place,
//! so a partially copied file is never visible under its final name.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{EndpointStorage, TransferService, TransferStatus, TransportError};
use crate::core::safety::RelativePath;
use crate::domain::{Endpoint, TransferRequest};

/// Copy-based transfer service and storage for local mounts.
///
/// A finished copy's status is handed out once and then forgotten, as is a
/// cancelled copy, so the table only holds copies still in flight.
#[derive(Debug, Clone, Default)]
pub struct LocalFilesystem {
    transfers: Arc<RwLock<HashMap<String, TransferStatus>>>,
}

impl LocalFilesystem {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransferService for LocalFilesystem {
    fn name(&self) -> &str {
        "local"
    }

    async fn submit(&self, request: &TransferRequest) -> Result<String, TransportError> {
        let source = request.source.local_path(&request.path);
        let destination = request.destination.local_path(&request.path);
        let transfer_id = Uuid::new_v4().to_string();

        self.transfers.write().await.insert(
            transfer_id.clone(),
            TransferStatus::Pending {
                detail: Some("QUEUED".to_string()),
            },
        );

        let transfers = Arc::clone(&self.transfers);
        let id = transfer_id.clone();
        tokio::spawn(async move {
            let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &destination)).await;
            let status = match copied {
                Ok(Ok(bytes)) => TransferStatus::Succeeded { bytes },
                Ok(Err(e)) => TransferStatus::Failed {
                    reason: failure_reason(&e),
                },
                Err(e) => TransferStatus::Failed {
                    reason: format!("copy task panicked: {}", e),
                },
            };

            let mut transfers = transfers.write().await;
            // A cancelled transfer keeps its cancelled status
            if matches!(transfers.get(&id), Some(TransferStatus::Pending { .. })) {
                transfers.insert(id, status);
            }
        });

        debug!(transfer_id = %transfer_id, "Local copy submitted");
        Ok(transfer_id)
    }

    async fn status(&self, transfer_id: &str) -> Result<TransferStatus, TransportError> {
        let mut transfers = self.transfers.write().await;
        let status = transfers
            .get(transfer_id)
            .cloned()
            .ok_or_else(|| TransportError::Rejected(format!("unknown transfer id {}", transfer_id)))?;
        if status.is_terminal() {
            transfers.remove(transfer_id);
        }
        Ok(status)
    }

    async fn cancel(&self, transfer_id: &str) -> Result<(), TransportError> {
        let mut transfers = self.transfers.write().await;
        // The copy task only records a result for an entry still pending
        if let Some(TransferStatus::Pending { .. }) = transfers.remove(transfer_id) {
            warn!(transfer_id, "Cancelling local copy; bytes already written stay staged");
        }
        Ok(())
    }
}

#[async_trait]
impl EndpointStorage for LocalFilesystem {
    async fn exists(&self, endpoint: &Endpoint, path: &RelativePath) -> Result<bool, TransportError> {
        Ok(tokio::fs::try_exists(endpoint.local_path(path)).await?)
    }

    async fn size(&self, endpoint: &Endpoint, path: &RelativePath) -> Result<Option<u64>, TransportError> {
        let local = endpoint.local_path(path);
        let size = tokio::task::spawn_blocking(move || match tree_size(&local) {
            Ok(size) => Ok(Some(size)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })
        .await
        .map_err(|e| TransportError::Io(e.to_string()))??;
        Ok(size)
    }

    async fn delete(&self, endpoint: &Endpoint, path: &RelativePath) -> Result<(), TransportError> {
        let local = endpoint.local_path(path);
        tokio::task::spawn_blocking(move || match remove_path(&local) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        })
        .await
        .map_err(|e| TransportError::Io(e.to_string()))??;
        Ok(())
    }
}

/// Status text in the movement service's vocabulary
fn failure_reason(e: &io::Error) -> String {
    match e.kind() {
        io::ErrorKind::NotFound => format!("FILE_NOT_FOUND: {}", e),
        io::ErrorKind::PermissionDenied => format!("PERMISSION_DENIED: {}", e),
        _ => e.to_string(),
    }
}

/// Copy a file or directory tree, returning bytes copied
fn copy_tree(source: &Path, destination: &Path) -> io::Result<u64> {
    let metadata = std::fs::metadata(source)?;
    if !metadata.is_dir() {
        return copy_file(source, destination);
    }

    std::fs::create_dir_all(destination)?;
    let mut total = 0;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        total += copy_tree(&entry.path(), &destination.join(entry.file_name()))?;
    }
    Ok(total)
}

fn copy_file(source: &Path, destination: &Path) -> io::Result<u64> {
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut reader = BufReader::new(File::open(source)?);
    let mut staged = NamedTempFile::new_in(parent)?;
    let bytes = io::copy(&mut reader, &mut staged)?;
    staged.as_file().sync_all()?;
    staged.persist(destination).map_err(|e| e.error)?;

    Ok(bytes)
}

fn tree_size(path: &Path) -> io::Result<u64> {
    let metadata = std::fs::metadata(path)?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }

    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        total += tree_size(&entry?.path())?;
    }
    Ok(total)
}

fn remove_path(path: &Path) -> io::Result<()> {
    if std::fs::symlink_metadata(path)?.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EndpointKind;
    use std::time::Duration;
    use tempfile::TempDir;

    fn endpoint(name: &str, dir: &TempDir) -> Arc<Endpoint> {
        Arc::new(Endpoint::new(
            name,
            dir.path().to_string_lossy(),
            EndpointKind::Filesystem,
        ))
    }

    async fn wait(service: &LocalFilesystem, id: &str) -> TransferStatus {
        for _ in 0..200 {
            let status = service.status(id).await.unwrap();
            if !matches!(status, TransferStatus::Pending { .. }) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transfer {} did not finish", id);
    }

    #[tokio::test]
    async fn test_copy_file_creates_parents() {
        let (src_dir, dst_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        std::fs::create_dir_all(src_dir.path().join("user")).unwrap();
        std::fs::write(src_dir.path().join("user/scan.h5"), b"0123456789").unwrap();

        let service = LocalFilesystem::new();
        let request = TransferRequest::new(
            endpoint("spot832", &src_dir),
            endpoint("data832", &dst_dir),
            RelativePath::parse("user/scan.h5").unwrap(),
        );

        let id = service.submit(&request).await.unwrap();
        assert_eq!(wait(&service, &id).await, TransferStatus::Succeeded { bytes: 10 });
        assert_eq!(
            std::fs::read(dst_dir.path().join("user/scan.h5")).unwrap(),
            b"0123456789"
        );
    }

    #[tokio::test]
    async fn test_copy_directory_tree() {
        let (src_dir, dst_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        std::fs::create_dir_all(src_dir.path().join("user/recscan/sub")).unwrap();
        std::fs::write(src_dir.path().join("user/recscan/a.tiff"), b"aaaa").unwrap();
        std::fs::write(src_dir.path().join("user/recscan/sub/b.tiff"), b"bb").unwrap();

        let service = LocalFilesystem::new();
        let request = TransferRequest::new(
            endpoint("scratch", &src_dir),
            endpoint("data832", &dst_dir),
            RelativePath::parse("user/recscan/").unwrap(),
        );

        let id = service.submit(&request).await.unwrap();
        assert_eq!(wait(&service, &id).await, TransferStatus::Succeeded { bytes: 6 });

        let dst = endpoint("data832", &dst_dir);
        let path = RelativePath::parse("user/recscan/").unwrap();
        assert_eq!(service.size(&dst, &path).await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn test_missing_source_reports_file_not_found() {
        let (src_dir, dst_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let service = LocalFilesystem::new();
        let request = TransferRequest::new(
            endpoint("spot832", &src_dir),
            endpoint("data832", &dst_dir),
            RelativePath::parse("missing.h5").unwrap(),
        );

        let id = service.submit(&request).await.unwrap();
        match wait(&service, &id).await {
            TransferStatus::Failed { reason } => assert!(reason.starts_with("FILE_NOT_FOUND")),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_storage_exists_size_delete() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("scan.h5"), b"abc").unwrap();

        let service = LocalFilesystem::new();
        let ep = endpoint("data832", &dir);
        let path = RelativePath::parse("scan.h5").unwrap();

        assert!(service.exists(&ep, &path).await.unwrap());
        assert_eq!(service.size(&ep, &path).await.unwrap(), Some(3));

        service.delete(&ep, &path).await.unwrap();
        assert!(!service.exists(&ep, &path).await.unwrap());
        assert_eq!(service.size(&ep, &path).await.unwrap(), None);

        // Deleting again is a no-op
        service.delete(&ep, &path).await.unwrap();
    }

    #[tokio::test]
    async fn test_finished_transfers_are_forgotten() {
        let (src_dir, dst_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        std::fs::write(src_dir.path().join("scan.h5"), b"abc").unwrap();

        let service = LocalFilesystem::new();
        let request = TransferRequest::new(
            endpoint("spot832", &src_dir),
            endpoint("data832", &dst_dir),
            RelativePath::parse("scan.h5").unwrap(),
        );

        for _ in 0..3 {
            let id = service.submit(&request).await.unwrap();
            assert_eq!(wait(&service, &id).await, TransferStatus::Succeeded { bytes: 3 });
            assert!(matches!(service.status(&id).await, Err(TransportError::Rejected(_))));
        }
        assert!(service.transfers.read().await.is_empty());

        let id = service.submit(&request).await.unwrap();
        service.cancel(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(service.transfers.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_transfer_id_rejected() {
        let service = LocalFilesystem::new();
        assert!(matches!(
            service.status("nope").await,
            Err(TransportError::Rejected(_))
        ));
    }
}
