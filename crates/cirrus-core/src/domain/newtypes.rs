//! Strongly-typed identifiers
//!
//! Handles in the cloud node service are opaque 64-bit values; filesystem
//! identifiers are whatever the platform reports as a stable inode-like id.
//! Wrapping them keeps the two address spaces from being mixed up and gives
//! serde a transparent representation for the config database.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

// ============================================================================
// BackupId
// ============================================================================

/// Unique identifier of a configured sync, assigned at registration time.
///
/// Any other config field can change (even the remote handle), so this is the
/// only stable key for a sync. It doubles as the heartbeat id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupId(u64);

impl BackupId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for BackupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// ============================================================================
// NodeHandle
// ============================================================================

/// Handle of a node in the cloud tree.
///
/// Opaque to the client; comparisons and hashing are all the engine ever does
/// with it. Absence is modelled with `Option<NodeHandle>` rather than a
/// sentinel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHandle(u64);

impl NodeHandle {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for NodeHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

// ============================================================================
// Fsid
// ============================================================================

/// Stable filesystem identifier of a local entity (inode number on Unix).
///
/// Filesystems without stable ids (FAT) make move detection unreliable; the
/// engine degrades to name matching there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fsid(u64);

impl Fsid {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for Fsid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// TransferId
// ============================================================================

/// Identifier of an in-flight upload or download owned by the transfer engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(u64);

impl TransferId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for TransferId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

// ============================================================================
// VolumeFingerprint
// ============================================================================

/// Fingerprint of the volume containing a sync root.
///
/// Combines the root directory's fsid with a volume signature so that a sync
/// whose local folder was relocated (or whose drive was swapped) can be
/// detected at startup instead of silently mirroring the wrong tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeFingerprint {
    pub root_fsid: u64,
    pub volume_signature: u64,
}

impl VolumeFingerprint {
    #[must_use]
    pub const fn new(root_fsid: u64, volume_signature: u64) -> Self {
        Self {
            root_fsid,
            volume_signature,
        }
    }

    /// A zero fingerprint means "never captured".
    #[must_use]
    pub fn is_unset(&self) -> bool {
        self.root_fsid == 0 && self.volume_signature == 0
    }
}

impl Display for VolumeFingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.root_fsid, self.volume_signature)
    }
}
