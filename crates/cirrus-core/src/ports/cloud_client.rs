//! Cloud RPC port (driven/secondary port)
//!
//! Thin asynchronous facade over the node service. The engine issues writes
//! through this trait and refreshes its read-mostly snapshots with
//! `fetch_children`. Errors are adapter-specific, so the seam uses
//! `anyhow::Result` like the other ports.

use async_trait::async_trait;

use crate::domain::{CloudNode, NodeHandle, NodeKind};

/// Operations the engine needs from the cloud node service.
///
/// All calls are asynchronous; the adapter correlates request and completion.
/// Implementations must be safe to call from the single client task.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Creates a node under `parent` and returns its handle.
    ///
    /// For folders this is the complete operation; file content arrives
    /// through the transfer engine instead.
    async fn create_node(
        &self,
        parent: NodeHandle,
        kind: NodeKind,
        name: &str,
    ) -> anyhow::Result<NodeHandle>;

    /// Renames a node in place.
    async fn rename_node(&self, handle: NodeHandle, new_name: &str) -> anyhow::Result<()>;

    /// Moves a node under a new parent, keeping its name.
    async fn move_node(&self, handle: NodeHandle, new_parent: NodeHandle) -> anyhow::Result<()>;

    /// Deletes a node outright. The engine prefers `move_to_debris`; this is
    /// reserved for nodes already inside the debris folder.
    async fn delete_node(&self, handle: NodeHandle) -> anyhow::Result<()>;

    /// Lists the children of a folder node.
    async fn fetch_children(&self, handle: NodeHandle) -> anyhow::Result<Vec<CloudNode>>;

    /// Resolves a single node by handle, if it still exists.
    async fn fetch_node(&self, handle: NodeHandle) -> anyhow::Result<Option<CloudNode>>;

    /// Handle of the server-side `SyncDebris` folder.
    async fn debris_folder(&self) -> anyhow::Result<NodeHandle>;

    /// Moves a node into the server-side debris folder.
    async fn move_to_debris(&self, handle: NodeHandle) -> anyhow::Result<()>;
}
