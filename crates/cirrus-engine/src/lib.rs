//! Cirrus reconciliation engine
//!
//! The core of the sync client: for every configured sync it keeps a mirror
//! tree of the last reconciled state, aligns the cloud, mirror, and
//! filesystem child sets into triplets at each folder, and resolves each
//! triplet into at most one action. The [`syncs::Syncs`] container drives
//! the whole set of syncs from the single client task.
//!
//! Layering:
//!
//! ```text
//! notifier / scanner          cloud client / transfer engine (ports)
//!        │                                   ▲
//!        ▼                                   │ actions
//!  [`sync::Sync::tick`] ── triplets ── resolvers ── state cache queues
//!        │
//!  [`mirror::MirrorTree`]  (persisted via cirrus-store)
//! ```

pub mod actions;
pub mod cloud_cache;
pub mod flags;
pub mod mirror;
pub mod sync;
pub mod syncs;
pub mod triplet;

pub use actions::{SyncAction, TickOutput};
pub use cloud_cache::CloudCache;
pub use flags::{SyncFlags, SyncWaitReason};
pub use mirror::{MirrorId, MirrorNode, MirrorTree, TreeStateEvent};
pub use sync::{Sync, SyncState};
pub use syncs::{HeartbeatStatus, OpResult, Syncs, UnifiedSync};
pub use triplet::{compute_sync_triplets, SyncRow};
