//! Durable board snapshots.
//!
//! The durable remote store is the source of truth at startup; the local
//! cache file is a fallback for when the remote is unavailable and gets
//! rewritten whenever a remote snapshot is adopted. At runtime the server
//! keeps a dirty flag and flushes on a timer; an upload failure leaves the
//! flag set so the next tick retries, and uploads are single-flight. None of
//! this ever blocks edit processing, and none of it is fatal: the worst case
//! is a board that keeps retrying its upload.

use crate::board::{Board, SnapshotFit};
use async_trait::async_trait;
use log::{info, warn};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),
}

/// A durable home for the raw board buffer, keyed implicitly by the store
/// itself (one board per store).
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Fetches the stored snapshot; `None` when nothing has been stored yet.
    async fn download(&self) -> Result<Option<Vec<u8>>, SnapshotError>;
    async fn upload(&self, bytes: &[u8]) -> Result<(), SnapshotError>;
}

/// File-backed store, used for the local cache and as a stand-in for an
/// external durable store.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotStore for FileStore {
    async fn download(&self) -> Result<Option<Vec<u8>>, SnapshotError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload(&self, bytes: &[u8]) -> Result<(), SnapshotError> {
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}

/// Observable flush state, for external monitoring of degraded persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushState {
    /// An accepted mutation has not been durably stored yet.
    pub dirty: bool,
    /// An upload is running; ticks firing meanwhile do nothing.
    pub in_flight: bool,
    pub last_error: Option<String>,
}

fn describe_fit(source: &str, fit: SnapshotFit) {
    match fit {
        SnapshotFit::Exact => info!("Board loaded from {}", source),
        SnapshotFit::Migrated {
            from_width,
            from_height,
        } => info!(
            "Board migrated from legacy {}x{} snapshot in {}",
            from_width, from_height, source
        ),
        SnapshotFit::Corrupt => {
            warn!("Snapshot in {} has an unrecognized size, ignoring it", source)
        }
    }
}

/// Startup load: remote store first, local cache as fallback, fresh board as
/// the last resort. A corrupt remote snapshot falls through to the cache;
/// a snapshot adopted from the remote rewrites the cache.
pub async fn load_board(
    remote: Option<&dyn SnapshotStore>,
    cache_path: &Path,
    width: u32,
    height: u32,
) -> Board {
    if let Some(store) = remote {
        match store.download().await {
            Ok(Some(bytes)) => {
                let (board, fit) = Board::from_snapshot(width, height, bytes);
                describe_fit("remote store", fit);
                if fit != SnapshotFit::Corrupt {
                    if let Err(e) = tokio::fs::write(cache_path, board.as_bytes()).await {
                        warn!("Failed to warm local cache {}: {}", cache_path.display(), e);
                    }
                    return board;
                }
            }
            Ok(None) => info!("No remote snapshot yet"),
            Err(e) => warn!("Remote store unavailable, trying local cache: {}", e),
        }
    }

    match tokio::fs::read(cache_path).await {
        Ok(bytes) => {
            let (board, fit) = Board::from_snapshot(width, height, bytes);
            describe_fit("local cache", fit);
            if fit != SnapshotFit::Corrupt {
                return board;
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!("No local cache, starting with a blank board")
        }
        Err(e) => warn!("Failed to read local cache {}: {}", cache_path.display(), e),
    }

    Board::new(width, height)
}

/// One flush attempt: write the local cache, then the remote store. The
/// remote result decides success, so a failed upload keeps the dirty flag
/// set at the caller and is retried on the next tick; a cache write failure
/// alongside a configured remote is only logged.
pub async fn flush_snapshot(
    remote: Option<Arc<dyn SnapshotStore>>,
    cache_path: PathBuf,
    bytes: Vec<u8>,
) -> Result<(), SnapshotError> {
    let cache_result = tokio::fs::write(&cache_path, &bytes).await;
    match remote {
        Some(store) => {
            if let Err(e) = &cache_result {
                warn!("Failed to write local cache {}: {}", cache_path.display(), e);
            }
            store.upload(&bytes).await
        }
        None => cache_result.map_err(Into::into),
    }
}
