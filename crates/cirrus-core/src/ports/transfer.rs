//! Transfer engine port (driven/secondary port)
//!
//! Uploads and downloads are owned by a collaborator transfer engine; the
//! sync core only starts them, cancels them, and consumes completions on its
//! next tick.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::{FileFingerprint, NodeHandle, TransferId};

/// Completion delivered by the transfer engine.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// An upload finished; `handle` is the freshly created file node.
    UploadCompleted {
        id: TransferId,
        handle: NodeHandle,
        fingerprint: FileFingerprint,
    },
    /// A download finished and the file is in place at `local_path`.
    DownloadCompleted {
        id: TransferId,
        local_path: PathBuf,
    },
    /// A transfer failed terminally (after the engine's own retries).
    Terminated {
        id: TransferId,
        reason: String,
    },
}

impl TransferEvent {
    #[must_use]
    pub fn id(&self) -> TransferId {
        match self {
            TransferEvent::UploadCompleted { id, .. } => *id,
            TransferEvent::DownloadCompleted { id, .. } => *id,
            TransferEvent::Terminated { id, .. } => *id,
        }
    }
}

/// Contract with the transfer engine.
#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Starts uploading `local_path` as a child of `parent` named `name`.
    ///
    /// The fingerprint is the version the engine observed; the transfer
    /// engine re-checks it before completing so a file modified mid-flight
    /// terminates instead of uploading torn content.
    async fn start_upload(
        &self,
        local_path: &Path,
        parent: NodeHandle,
        name: &str,
        fingerprint: FileFingerprint,
    ) -> anyhow::Result<TransferId>;

    /// Starts downloading the file node `handle` to `local_path`.
    async fn start_download(
        &self,
        handle: NodeHandle,
        local_path: &Path,
    ) -> anyhow::Result<TransferId>;

    /// Cancels an in-flight transfer. Cancelling an unknown id is a no-op.
    async fn cancel(&self, id: TransferId) -> anyhow::Result<()>;

    /// Drains completions accumulated since the last poll.
    async fn poll_completions(&self) -> Vec<TransferEvent>;
}
